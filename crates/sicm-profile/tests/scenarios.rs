//! Integration coverage for the profiling building blocks that feed the
//! placement engine's input (spec §4.4-§4.6): the perf event type
//! selection a PEBS-name resolver depends on, RSS accounting over a real
//! `ExtentRegistry`, and the profile timeline's rollup bookkeeping across
//! several published intervals.

use std::collections::HashMap;

use sicm_core::ExtentRegistry;
use sicm_profile::profile::ArenaInterval;
use sicm_profile::rss::{resident_bytes_for_arena, ResidencyBackend};
use sicm_profile::{PerfEventAttr, ProfileTimeline};

/// A generic hardware counter (`raw = false`) must select
/// `PERF_TYPE_HARDWARE` (0); a PEBS/raw event code (`raw = true`) must
/// select `PERF_TYPE_RAW` (4). Conflating the two silently samples the
/// wrong counter, which is exactly the bug this pins down.
#[test]
fn sampling_attr_type_matches_the_raw_flag() {
    let hw = PerfEventAttr::sampling(0, false, 1000);
    assert_eq!(hw.type_, 0, "generic hardware event must use PERF_TYPE_HARDWARE");
    assert_eq!(hw.config, 0);

    let raw = PerfEventAttr::sampling(0x01cd, true, 1000);
    assert_eq!(raw.type_, 4, "PEBS-style raw event must use PERF_TYPE_RAW");
    assert_eq!(raw.config, 0x01cd);
}

/// A fake residency backend reporting a fixed fraction of a range as
/// resident, standing in for `/proc/self/pagemap` so this doesn't depend
/// on this process's actual page residency.
struct FakeResidency {
    resident_fraction: f64,
}

impl ResidencyBackend for FakeResidency {
    fn resident_bytes(&self, start: usize, end: usize, page_size: usize) -> std::io::Result<usize> {
        let pages = (end - start).div_ceil(page_size);
        let resident_pages = (pages as f64 * self.resident_fraction) as usize;
        Ok(resident_pages * page_size)
    }
}

#[test]
fn resident_bytes_for_arena_sums_only_that_arenas_live_ranges() {
    let registry = ExtentRegistry::new();
    registry.insert(0x1000, 0x1000 + 8192, 7);
    registry.insert(0x10000, 0x10000 + 4096, 7);
    registry.insert(0x20000, 0x20000 + 4096, 9); // a different arena

    let backend = FakeResidency { resident_fraction: 1.0 };
    let total = resident_bytes_for_arena(&registry, 7, 4096, &backend);
    assert_eq!(total, 8192 + 4096);

    let other = resident_bytes_for_arena(&registry, 9, 4096, &backend);
    assert_eq!(other, 4096);

    let unknown = resident_bytes_for_arena(&registry, 42, 4096, &backend);
    assert_eq!(unknown, 0);
}

/// Publishing several intervals accumulates each arena's peak resident
/// size and running access totals, while `latest()` only ever reflects
/// the most recently published interval.
#[test]
fn profile_timeline_tracks_rollups_across_intervals() {
    let timeline = ProfileTimeline::new();

    let mut first = HashMap::new();
    first.insert(
        1,
        ArenaInterval {
            accesses_per_event: vec![10, 5],
            resident_bytes: 4096,
            extent_bytes: 8192,
            bytes_per_second_estimate: 0.0,
        },
    );
    timeline.publish(first);

    let mut second = HashMap::new();
    second.insert(
        1,
        ArenaInterval {
            accesses_per_event: vec![3, 50],
            resident_bytes: 16384,
            extent_bytes: 16384,
            bytes_per_second_estimate: 0.0,
        },
    );
    timeline.publish(second);

    let latest = timeline.latest();
    assert_eq!(latest.index, 1);
    assert_eq!(latest.arenas[&1].resident_bytes, 16384);

    let rollup = timeline.rollup_for(1);
    assert_eq!(rollup.peak_resident_bytes, 16384);
    assert_eq!(rollup.total_accesses_per_event, vec![13, 55]);
    assert_eq!(rollup.peak_accesses_per_event, vec![10, 50]);

    // An arena never published has an empty default rollup, not a panic.
    let absent = timeline.rollup_for(999);
    assert_eq!(absent.peak_resident_bytes, 0);
}
