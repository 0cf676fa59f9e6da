use std::collections::HashMap;

use arc_swap::ArcSwap;
use std::sync::Arc;

/// One arena's profile for a single interval.
#[derive(Debug, Clone, Default)]
pub struct ArenaInterval {
    pub accesses_per_event: Vec<u64>,
    pub resident_bytes: usize,
    pub extent_bytes: usize,
    pub bytes_per_second_estimate: f64,
}

/// Rolling peak/total maintained per arena, per event, across the whole
/// profile timeline.
#[derive(Debug, Clone, Default)]
pub struct ArenaRollup {
    pub peak_resident_bytes: usize,
    pub total_accesses_per_event: Vec<u64>,
    pub peak_accesses_per_event: Vec<u64>,
}

/// A completed interval: every arena's per-interval record, keyed by
/// arena id, plus the index of this interval in the timeline.
#[derive(Debug, Clone, Default)]
pub struct Interval {
    pub index: u64,
    pub arenas: HashMap<u32, ArenaInterval>,
}

/// Accumulates completed intervals into rolling per-arena peak/total
/// figures and publishes the latest completed interval lock-free via
/// `ArcSwap`, so the placement engine's thread never blocks on the
/// sampler's.
pub struct ProfileTimeline {
    latest: ArcSwap<Interval>,
    rollups: parking_lot::Mutex<HashMap<u32, ArenaRollup>>,
    next_index: std::sync::atomic::AtomicU64,
}

impl Default for ProfileTimeline {
    fn default() -> Self {
        Self {
            latest: ArcSwap::new(Arc::new(Interval::default())),
            rollups: parking_lot::Mutex::new(HashMap::new()),
            next_index: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl ProfileTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close out the current interval: update rollups, then publish it as
    /// the latest completed interval.
    pub fn publish(&self, arenas: HashMap<u32, ArenaInterval>) {
        let index = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let mut rollups = self.rollups.lock();
        for (&id, interval) in &arenas {
            let rollup = rollups.entry(id).or_default();
            rollup.peak_resident_bytes = rollup.peak_resident_bytes.max(interval.resident_bytes);
            if rollup.total_accesses_per_event.len() < interval.accesses_per_event.len() {
                rollup
                    .total_accesses_per_event
                    .resize(interval.accesses_per_event.len(), 0);
                rollup
                    .peak_accesses_per_event
                    .resize(interval.accesses_per_event.len(), 0);
            }
            for (i, &count) in interval.accesses_per_event.iter().enumerate() {
                rollup.total_accesses_per_event[i] += count;
                rollup.peak_accesses_per_event[i] = rollup.peak_accesses_per_event[i].max(count);
            }
        }
        drop(rollups);

        self.latest.store(Arc::new(Interval { index, arenas }));
    }

    pub fn latest(&self) -> Arc<Interval> {
        self.latest.load_full()
    }

    pub fn rollup_for(&self, arena_id: u32) -> ArenaRollup {
        self.rollups.lock().get(&arena_id).cloned().unwrap_or_default()
    }
}
