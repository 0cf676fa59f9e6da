use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use sicm_core::{Context, SicmError};

use crate::sample::{PerfEventAttr, PerfRing};

/// Depth of the sampler→aggregator handoff queue. The aggregator drains
/// on the same cadence the sampler publishes at, so this only needs to
/// absorb a brief stall on the aggregator's side before the sampler
/// starts overwriting the oldest pending interval.
const PENDING_INTERVALS: usize = 4;

/// Background thread draining per-(cpu, event) perf-event ring buffers
/// and charging each sampled address to its owning arena via the extent
/// registry. Publishes one [`crate::profile::ArenaInterval`] set per
/// `cadence`.
pub struct Sampler {
    ctx: Arc<Context>,
    rings: Vec<PerfRing>,
    num_events: usize,
    cadence: Duration,
    sampler_tid: u32,
    shutdown: Arc<AtomicBool>,
    /// Padded so adjacent rings' tail cursors don't false-share a cache
    /// line while the sampler thread updates them on every drain.
    prev_tail: Vec<CachePadded<std::sync::atomic::AtomicU64>>,
    /// Per-arena, per-event access counts accumulated over the most
    /// recently completed interval; handed off to the aggregator thread.
    /// Bounded so a stalled aggregator can't grow this unboundedly: once
    /// full, the oldest pending interval is dropped in favor of the new
    /// one.
    pending: ArrayQueue<HashMap<u32, Vec<u64>>>,
}

impl Sampler {
    /// `events` names one PEBS-style config value per logical event (the
    /// PMU-specific encoding is the caller's job, matching how the
    /// original leans on libpfm to translate event names before this
    /// point); `cpus` is `-1` for thread-follow or a concrete CPU number.
    /// Each entry in `event_configs` is `(config, raw)`: `raw = true`
    /// selects `PERF_TYPE_RAW` for a PMU-specific event code, `raw =
    /// false` selects the portable `PERF_TYPE_HARDWARE` generic counters
    /// — conflating the two silently samples the wrong counter.
    pub fn start(
        ctx: Arc<Context>,
        event_configs: &[(u64, bool)],
        cpus: &[i32],
        sample_period: u64,
        max_sample_pages: u32,
        cadence: Duration,
    ) -> sicm_core::Result<Arc<Self>> {
        let mut rings = Vec::with_capacity(event_configs.len() * cpus.len());
        for &cpu in cpus {
            let pid = if cpu < 0 { 0 } else { -1 };
            for &(config, raw) in event_configs {
                let attr = PerfEventAttr::sampling(config, raw, sample_period);
                let ring = PerfRing::open(&attr, pid, cpu, max_sample_pages)
                    .map_err(|e| SicmError::EventDecodeFailed(format!("cpu {cpu} config {config:#x}: {e}")))?;
                rings.push(ring);
            }
        }

        let prev_tail = (0..rings.len())
            .map(|_| CachePadded::new(std::sync::atomic::AtomicU64::new(0)))
            .collect();
        let sampler_tid = current_tid();

        let sampler = Arc::new(Self {
            ctx,
            rings,
            num_events: event_configs.len(),
            cadence,
            sampler_tid,
            shutdown: Arc::new(AtomicBool::new(false)),
            prev_tail,
            pending: ArrayQueue::new(PENDING_INTERVALS),
        });

        let worker = sampler.clone();
        std::thread::Builder::new()
            .name("sicm-sampler".into())
            .spawn(move || worker.run())
            .map_err(|e| SicmError::InvalidConfig(format!("failed to spawn sampler thread: {e}")))?;

        Ok(sampler)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn run(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(self.cadence);
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.drain_interval();
        }
        tracing::info!("sampler thread exiting");
    }

    fn drain_interval(&self) {
        let mut accum: HashMap<u32, Vec<u64>> = HashMap::new();

        for (ring_idx, ring) in self.rings.iter().enumerate() {
            let event_idx = ring_idx % self.num_events;
            let prev = self.prev_tail[ring_idx].load(Ordering::SeqCst);
            if ring.data_head() == prev {
                continue; // unchanged since last interval: skip, per the no-poll design.
            }
            let sampler_tid = self.sampler_tid;
            let registry = self.ctx.registry().clone();
            let new_tail = ring.drain(prev, |sample| {
                if sample.tid == sampler_tid {
                    return;
                }
                if let Some(arena_id) = registry.find_containing(sample.addr) {
                    let entry = accum.entry(arena_id).or_insert_with(|| vec![0u64; self.num_events]);
                    if event_idx < entry.len() {
                        entry[event_idx] += 1;
                    }
                }
            });
            self.prev_tail[ring_idx].store(new_tail, Ordering::SeqCst);
        }

        self.publish(accum);
    }

    fn publish(&self, accum: HashMap<u32, Vec<u64>>) {
        // The aggregator snapshots resident/extent bytes and merges them
        // with this accumulator before calling `ProfileTimeline::publish`.
        // If the aggregator has fallen behind, drop its oldest pending
        // interval rather than block the sampler on a full queue.
        if let Err(accum) = self.pending.push(accum) {
            let _ = self.pending.pop();
            let _ = self.pending.push(accum);
        }
    }

    /// Per-arena, per-event access counts for the most recently completed
    /// interval, consumed by [`crate::aggregator::Aggregator`]. Returns an
    /// empty map if no interval has completed since the last call.
    pub fn take_last_interval_accesses(&self) -> HashMap<u32, Vec<u64>> {
        self.pending.pop().unwrap_or_default()
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }
}

/// Every CPU on this machine, in order — the default `cpus[]` when the
/// caller hasn't pinned sampling to a specific subset.
pub fn default_cpus() -> Vec<i32> {
    (0..num_cpus::get() as i32).collect()
}

fn current_tid() -> u32 {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as u32
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
