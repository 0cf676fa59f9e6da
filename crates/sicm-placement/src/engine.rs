use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sicm_core::{Config, Context};
use sicm_core::config::OnlineStrategy;
use sicm_profile::ProfileTimeline;

use crate::hotset::{cut, rank, CurrentTier, RankedArena};
use crate::orig::{self, OrigArenaState, OrigDecision};
use crate::ski::prepare_penalties;

/// Per-socket bandwidth feeding the ski-rental cost model's
/// `penalty_move` term; a conservative default stands in when no
/// bandwidth estimator is wired up.
const DEFAULT_UPPER_TIER_BANDWIDTH_BYTES_PER_MS: f64 = 2_000_000.0; // ~2 GB/s
const DEFAULT_PER_ACCESS_LATENCY_MS: f64 = 0.00006; // ~60ns lost per access sampled at ~0.05% coverage

/// The periodic supervisor: reads the latest completed profile interval,
/// ranks arenas, computes a hotset, and triggers migrations per the
/// configured strategy. Runs on its own timer, independent of the
/// sampler's drain cadence.
pub struct PlacementEngine {
    ctx: Arc<Context>,
    timeline: Arc<ProfileTimeline>,
    upper_device: usize,
    lower_device: usize,
    upper_capacity: u64,
    strategy: OnlineStrategy,
    hot_intervals: u32,
    reconf_weight_ratio: f64,
    grace_accesses: f64,
    event_weights: Vec<f64>,
    nobind: bool,
    debug_writer: Option<parking_lot::Mutex<tracing_appender::non_blocking::NonBlocking>>,
    orig_states: parking_lot::Mutex<HashMap<u32, OrigArenaState>>,
    current_tier: parking_lot::Mutex<HashMap<u32, CurrentTier>>,
    shutdown: Arc<AtomicBool>,
}

impl PlacementEngine {
    pub fn new(ctx: Arc<Context>, timeline: Arc<ProfileTimeline>, config: &Config) -> sicm_core::Result<Arc<Self>> {
        let upper_capacity = ctx
            .device_table()
            .get(config.upper_device)?
            .tier_data
            .capacity_bytes;

        let debug_writer = config
            .online_debug_file
            .as_ref()
            .map(|path| {
                let dir = std::path::Path::new(path)
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let file_name = std::path::Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "sicm-placement.log".into());
                let appender = tracing_appender::rolling::never(dir, file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                // Leak the guard: the writer must outlive the engine, which
                // itself lives for the process lifetime in practice.
                std::mem::forget(guard);
                parking_lot::Mutex::new(non_blocking)
            });

        Ok(Arc::new(Self {
            ctx,
            timeline,
            upper_device: config.upper_device,
            lower_device: config.lower_device,
            upper_capacity,
            strategy: config.online_strategy,
            hot_intervals: config.online_hot_intervals,
            reconf_weight_ratio: config.online_reconf_weight_ratio,
            grace_accesses: config.online_grace_accesses,
            event_weights: (0..config.pebs_events.len())
                .map(|i| config.multiplier_for(i))
                .collect(),
            nobind: config.online_nobind,
            debug_writer,
            orig_states: parking_lot::Mutex::new(HashMap::new()),
            current_tier: parking_lot::Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn spawn(self: Arc<Self>, cadence: Duration) {
        let engine = self.clone();
        std::thread::Builder::new()
            .name("sicm-placement".into())
            .spawn(move || {
                while !engine.shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(cadence);
                    if engine.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    engine.tick();
                }
                tracing::info!("placement engine thread exiting");
            })
            .expect("failed to spawn placement engine thread");
    }

    fn tick(&self) {
        let interval = self.timeline.latest();
        if interval.arenas.is_empty() {
            return;
        }

        let current_tier = self.current_tier.lock().clone();
        let mut ranked = rank(&interval, &self.event_weights, |id| {
            current_tier.get(&id).copied().unwrap_or(CurrentTier::Unbound)
        });

        if self.upper_capacity > 0 {
            cut(&mut ranked, self.upper_capacity);
        } else {
            // No declared capacity: treat everything sampled this
            // interval as eligible for the upper tier.
            for arena in ranked.iter_mut() {
                arena.hot = true;
            }
        }

        match self.strategy {
            OnlineStrategy::Ski => self.tick_ski(&ranked),
            OnlineStrategy::Orig => self.tick_orig(&ranked),
        }
    }

    fn tick_ski(&self, ranked: &[RankedArena]) {
        let penalties = prepare_penalties(
            ranked,
            DEFAULT_UPPER_TIER_BANDWIDTH_BYTES_PER_MS,
            DEFAULT_PER_ACCESS_LATENCY_MS,
        );
        self.log_debug(&format!(
            "ski: rent={:.3}ms buy={:.3}ms (move={:.3} stay={:.3} displace={:.3})",
            penalties.rent_cost(),
            penalties.buy_cost(),
            penalties.penalty_move,
            penalties.penalty_stay,
            penalties.penalty_displace
        ));
        if !self.nobind && penalties.should_rebind() {
            self.rebind_disagreeing(ranked);
        }
    }

    fn tick_orig(&self, ranked: &[RankedArena]) {
        let mut states_map = self.orig_states.lock();
        let mut states: Vec<OrigArenaState> = ranked
            .iter()
            .map(|a| states_map.get(&a.arena_id).copied().unwrap_or_default())
            .collect();

        let decision = orig::decide(
            ranked,
            &mut states,
            self.grace_accesses,
            self.reconf_weight_ratio,
            self.hot_intervals,
            self.nobind,
        );

        for (arena, state) in ranked.iter().zip(states.iter()) {
            states_map.insert(arena.arena_id, *state);
        }
        drop(states_map);

        match decision {
            OrigDecision::FullRebind => {
                self.log_debug("orig: full rebind triggered");
                self.rebind_disagreeing(ranked);
            }
            OrigDecision::Individual(indices) => {
                for idx in indices {
                    let arena = &ranked[idx];
                    self.log_debug(&format!("orig: individual rebind of arena {}", arena.arena_id));
                    self.rebind_one(arena.arena_id, self.upper_device);
                    self.current_tier.lock().insert(arena.arena_id, CurrentTier::Upper);
                }
            }
            OrigDecision::NoAction => {}
        }
    }

    fn rebind_disagreeing(&self, ranked: &[RankedArena]) {
        let mut tiers = self.current_tier.lock();
        for arena in ranked {
            let target = if arena.hot {
                (self.upper_device, CurrentTier::Upper)
            } else {
                (self.lower_device, CurrentTier::Lower)
            };
            if tiers.get(&arena.arena_id).copied() == Some(target.1) {
                continue;
            }
            drop(tiers);
            self.rebind_one(arena.arena_id, target.0);
            tiers = self.current_tier.lock();
            tiers.insert(arena.arena_id, target.1);
        }
    }

    fn rebind_one(&self, arena_id: u32, device: usize) {
        match self.ctx.arena(arena_id).and_then(|a| a.set_device(device)) {
            Ok(()) => tracing::debug!(arena_id, device, "rebound arena"),
            Err(e) => tracing::warn!(arena_id, device, error = %e, "rebind failed"),
        }
    }

    fn log_debug(&self, msg: &str) {
        tracing::debug!("{msg}");
        if let Some(writer) = &self.debug_writer {
            use std::io::Write;
            let mut w = writer.lock();
            let _ = writeln!(w, "{msg}");
        }
    }
}
