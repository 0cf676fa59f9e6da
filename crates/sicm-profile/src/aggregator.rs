use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sicm_core::Context;

use crate::bandwidth::{distribute_bandwidth, BandwidthEstimator};
use crate::profile::{ArenaInterval, ProfileTimeline};
use crate::rss::{PageMapBackend, ResidencyBackend};
use crate::sampler::Sampler;

/// Drives one interval's worth of work across the sampler, the RSS
/// prober and the bandwidth estimator, and publishes the merged result
/// onto a [`ProfileTimeline`]. Runs on its own cadence, independent of
/// the sampler's own ring-buffer drain cadence (the two agree in
/// practice because both read `SH_PROFILE_INTERVAL_MS`, but nothing here
/// assumes that).
pub struct Aggregator {
    ctx: Arc<Context>,
    sampler: Arc<Sampler>,
    timeline: Arc<ProfileTimeline>,
    residency: Box<dyn ResidencyBackend>,
    bandwidth: Option<parking_lot::Mutex<BandwidthEstimator>>,
    page_size: usize,
}

impl Aggregator {
    pub fn new(
        ctx: Arc<Context>,
        sampler: Arc<Sampler>,
        timeline: Arc<ProfileTimeline>,
        bandwidth: Option<BandwidthEstimator>,
        page_size: usize,
    ) -> std::io::Result<Self> {
        Ok(Self {
            ctx,
            sampler,
            timeline,
            residency: Box::new(PageMapBackend::open()?),
            bandwidth: bandwidth.map(parking_lot::Mutex::new),
            page_size,
        })
    }

    pub fn spawn(self: Arc<Self>, cadence: Duration, shutdown: Arc<std::sync::atomic::AtomicBool>) {
        std::thread::Builder::new()
            .name("sicm-aggregator".into())
            .spawn(move || {
                while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    std::thread::sleep(cadence);
                    if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    self.tick();
                }
            })
            .expect("failed to spawn aggregator thread");
    }

    fn tick(&self) {
        let accesses = self.sampler.take_last_interval_accesses();
        let per_socket_bw = self
            .bandwidth
            .as_ref()
            .map(|b| b.lock().sample_interval())
            .unwrap_or_default();

        let per_arena_bw = per_socket_bw
            .values()
            .fold(HashMap::<u32, f64>::new(), |mut acc, &bw| {
                for (id, share) in distribute_bandwidth(bw, &accesses) {
                    *acc.entry(id).or_insert(0.0) += share;
                }
                acc
            });

        let registry = self.ctx.registry();
        let mut arenas = HashMap::new();
        for arena_id in self.ctx.arena_ids() {
            let accesses_per_event = accesses.get(&arena_id).cloned().unwrap_or_default();
            let resident_bytes =
                crate::rss::resident_bytes_for_arena(registry, arena_id, self.page_size, self.residency.as_ref());
            let extent_bytes = registry.arena_extent_bytes(arena_id);
            let bytes_per_second_estimate = per_arena_bw.get(&arena_id).copied().unwrap_or(0.0);
            arenas.insert(
                arena_id,
                ArenaInterval {
                    accesses_per_event,
                    resident_bytes,
                    extent_bytes,
                    bytes_per_second_estimate,
                },
            );
        }

        self.timeline.publish(arenas);
    }
}
