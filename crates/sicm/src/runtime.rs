//! The process-wide handle consumer code actually holds: a [`sicm_core::Context`]
//! plus whichever optional profiling/placement actors `SH_*` configuration
//! turned on. One `Runtime` is normally created per process via [`init`],
//! but nothing here prevents more than one coexisting in a test binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sicm_core::config::OnlineStrategy;
use sicm_core::{Arena, ArenaFlags, Context, DeviceTable, Result, SicmError};
use sicm_placement::PlacementEngine;
use sicm_profile::{Aggregator, BandwidthEstimator, ProfileTimeline, Sampler};

/// Owns the arena/device core plus, when configured, the sampler,
/// profile aggregator and placement engine threads. Dropping this (or
/// calling [`Runtime::fini`] explicitly) signals every background
/// thread to shut down at its next interval boundary.
pub struct Runtime {
    ctx: Arc<Context>,
    sampler: Option<Arc<Sampler>>,
    timeline: Option<Arc<ProfileTimeline>>,
    engine: Option<Arc<PlacementEngine>>,
    background_shutdown: Arc<AtomicBool>,
}

impl Runtime {
    /// Enumerate devices, read `SH_*` configuration, create the default
    /// arena, and — if `SH_PROFILE_PEBS_EVENTS` names at least one event —
    /// start the sampler, profile aggregator and placement engine threads.
    pub fn init() -> Result<Arc<Self>> {
        Self::init_with_devices(DeviceTable::from_numa_nodes()?)
    }

    pub fn init_with_devices(device_table: DeviceTable) -> Result<Arc<Self>> {
        install_tracing();
        let ctx = Context::init_with_devices(device_table)?;
        Self::start_background_actors(ctx)
    }

    fn start_background_actors(ctx: Arc<Context>) -> Result<Arc<Self>> {
        let config = ctx.config().clone();
        let background_shutdown = Arc::new(AtomicBool::new(false));

        if config.pebs_events.is_empty() {
            tracing::info!("SH_PROFILE_PEBS_EVENTS unset: sampler and placement engine disabled");
            return Ok(Arc::new(Self {
                ctx,
                sampler: None,
                timeline: None,
                engine: None,
                background_shutdown,
            }));
        }

        let event_configs = resolve_event_configs(&config.pebs_events)?;
        let cadence = std::time::Duration::from_millis(config.profile_interval_ms.max(1));
        let cpus = sicm_profile::default_cpus();

        let sampler = Sampler::start(
            ctx.clone(),
            &event_configs,
            &cpus,
            config.sample_freq.max(1),
            config.max_sample_pages,
            cadence,
        )?;

        let bandwidth = if config.bw_events.is_empty() {
            None
        } else {
            match resolve_event_configs(&config.bw_events) {
                Ok(configs) => {
                    let counters = configs
                        .iter()
                        .filter_map(|&(cfg, raw)| {
                            sicm_profile::bandwidth::BandwidthCounter::open(cfg, raw, -1)
                                .ok()
                                .map(|c| (0u32, c))
                        })
                        .collect::<Vec<_>>();
                    if counters.is_empty() {
                        None
                    } else {
                        Some(BandwidthEstimator::new(counters, 64))
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to resolve bandwidth events, disabling bandwidth estimation");
                    None
                }
            }
        };

        let timeline = Arc::new(ProfileTimeline::new());
        let page_size = ctx
            .device_table()
            .get(config.default_device)
            .map(|d| d.page_size())
            .unwrap_or(4096);

        let aggregator = Aggregator::new(ctx.clone(), sampler.clone(), timeline.clone(), bandwidth, page_size)
            .map_err(SicmError::OsMappingFailed)?;
        Arc::new(aggregator).spawn(cadence, background_shutdown.clone());

        let engine = PlacementEngine::new(ctx.clone(), timeline.clone(), &config)?;
        engine.clone().spawn(cadence);

        tracing::info!(
            strategy = ?config.online_strategy,
            events = config.pebs_events.len(),
            "sampler, aggregator and placement engine started"
        );

        Ok(Arc::new(Self {
            ctx,
            sampler: Some(sampler),
            timeline: Some(timeline),
            engine: Some(engine),
            background_shutdown,
        }))
    }

    pub fn device_table(&self) -> &Arc<DeviceTable> {
        self.ctx.device_table()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn default_arena_id(&self) -> u32 {
        self.ctx.default_arena_id()
    }

    pub fn default_arena(&self) -> Result<Arc<Arena>> {
        self.ctx.arena(self.default_arena_id())
    }

    pub fn arena_create(&self, max_size: usize, flags: ArenaFlags, devices: &[usize]) -> Result<u32> {
        self.ctx.arena_create(max_size, flags, devices)
    }

    /// Like [`Self::arena_create`], but the `SHARED` arena attaches to the
    /// file at `path` instead of a fresh anonymous mapping.
    pub fn arena_create_shared_at(
        &self,
        path: &std::path::Path,
        max_size: usize,
        devices: &[usize],
    ) -> Result<u32> {
        self.ctx.arena_create_shared_at(path, max_size, devices)
    }

    pub fn arena_destroy(&self, arena_id: u32) -> Result<()> {
        self.ctx.arena_destroy(arena_id)
    }

    pub fn arena(&self, arena_id: u32) -> Result<Arc<Arena>> {
        self.ctx.arena(arena_id)
    }

    pub fn arena_alloc(&self, arena_id: u32, size: usize) -> Result<usize> {
        self.ctx.arena(arena_id)?.alloc(size, std::mem::align_of::<usize>())
    }

    /// Like [`Self::arena_alloc`], but with a caller-chosen alignment —
    /// the path `posix_memalign`/`aligned_alloc`/`memalign` route through.
    pub fn arena_alloc_aligned(&self, arena_id: u32, size: usize, align: usize) -> Result<usize> {
        self.ctx.arena(arena_id)?.alloc(size, align)
    }

    pub fn arena_realloc(&self, arena_id: u32, ptr: usize, new_size: usize) -> Result<usize> {
        self.ctx.arena(arena_id)?.realloc(ptr, new_size)
    }

    /// Arena-less free: resolves the owning arena via the extent
    /// registry, per §6's `free(ptr)`. `ptr == 0` is a silent no-op, per
    /// §7's `RegistryNotFound` recovery policy.
    pub fn free(&self, ptr: usize) -> Result<()> {
        if ptr == 0 {
            return Ok(());
        }
        let arena_id = self.ctx.registry().find_containing_or_err(ptr)?;
        self.ctx.arena(arena_id)?.free(ptr)
    }

    /// Like [`Self::free`], but the caller asserts the allocation's size.
    /// Our registry lookup isn't sped up by the hint the way jemalloc's
    /// internal rtree is, so it isn't load-bearing for finding the
    /// allocation — but in debug builds we still check it against the
    /// size class we actually hold, to catch a caller passing a stale or
    /// wrong size.
    pub fn sized_free(&self, ptr: usize, size: usize) -> Result<()> {
        if ptr == 0 {
            return Ok(());
        }
        if let Ok(arena_id) = self.ctx.registry().find_containing_or_err(ptr) {
            if let Ok(arena) = self.ctx.arena(arena_id) {
                debug_assert!(
                    arena.capacity_of(ptr).map_or(true, |cap| size <= cap),
                    "sized_free size hint {size} exceeds the {:?}-byte capacity actually backing this allocation",
                    arena.capacity_of(ptr),
                );
            }
        }
        self.free(ptr)
    }

    /// Resolve the arena owning `ptr`, or `None` if it isn't a live
    /// allocation from any arena in this runtime.
    pub fn lookup(&self, ptr: usize) -> Option<u32> {
        self.ctx.lookup(ptr)
    }

    pub fn arena_set_device(&self, arena_id: u32, device: usize) -> Result<()> {
        self.ctx.arena(arena_id)?.set_device(device)
    }

    /// Disable actual rebinding (`SH_PROFILE_ONLINE_NOBIND`'s effect is
    /// read from config at startup; this additionally lets a caller flip
    /// it at runtime, e.g. in a test harness observing placement
    /// decisions without moving real pages).
    pub fn online_strategy(&self) -> Option<OnlineStrategy> {
        self.engine.is_some().then_some(self.ctx.config().online_strategy)
    }

    /// Signal the sampler, aggregator and placement engine threads to
    /// exit at their next interval boundary. Does not join them: none of
    /// the three holds a resource whose destructor matters more than
    /// process exit, matching the source's own "cooperative flag checked
    /// at interval boundaries" shutdown contract.
    pub fn fini(&self) {
        self.background_shutdown.store(true, Ordering::SeqCst);
        if let Some(sampler) = &self.sampler {
            sampler.shutdown();
        }
        if let Some(engine) = &self.engine {
            engine.shutdown();
        }
        self.ctx.fini();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.fini();
    }
}

/// Translate configured event *names* into the `(config, raw)` pairs
/// `sicm-profile`'s `PerfEventAttr` wants — `raw = false` for the
/// portable `PERF_TYPE_HARDWARE` generic counters, `raw = true` for a
/// PMU-specific raw event code. A real deployment resolves names through
/// libpfm; lacking that collaborator here, this recognises a handful of
/// portable generic hardware events and otherwise requires the name to
/// already be a `0x`-prefixed raw config.
fn resolve_event_configs(names: &[String]) -> Result<Vec<(u64, bool)>> {
    names
        .iter()
        .map(|name| {
            resolve_one_event(name).ok_or_else(|| SicmError::EventDecodeFailed(name.clone()))
        })
        .collect()
}

fn resolve_one_event(name: &str) -> Option<(u64, bool)> {
    // PERF_COUNT_HW_* generic event codes, matching <linux/perf_event.h>;
    // these are PERF_TYPE_HARDWARE, not raw, so the kernel — not us —
    // picks the right PMU encoding for the running CPU.
    match name.trim().to_ascii_lowercase().as_str() {
        "cpu-cycles" | "cycles" => Some((0, false)),
        "instructions" => Some((1, false)),
        "cache-references" => Some((2, false)),
        "cache-misses" => Some((3, false)),
        // PEBS-style raw event-select|umask encodings: always PERF_TYPE_RAW.
        "mem-loads" | "mem_trans_retired.load_latency" => Some((0x01cd, true)),
        "mem-stores" | "mem_inst_retired.all_stores" => Some((0x82d0, true)),
        other => other
            .strip_prefix("0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(|config| (config, true)),
    }
}

static TRACING_INIT: std::sync::Once = std::sync::Once::new();

/// Install a `tracing-subscriber` global default the first time any
/// `Runtime` is created in this process. Idempotent: a host application
/// that already installed its own subscriber before calling `init` keeps
/// it, since `try_init` only fails quietly in that case.
fn install_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "sicm=info".into()))
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
