//! Integration coverage for spec §8 scenarios 5 and 6: the two online
//! rebind strategies driven across several synthetic intervals. These
//! replay the same `rank` → `cut` → (`ski`|`orig`) decision pipeline
//! `PlacementEngine::tick` runs internally, but against a real
//! `sicm_core::Context` so the eventual `Arena::set_device` call and its
//! effect on `Arena::device()` are exercised end to end, not just the
//! pure ranking/decision math (already covered by each module's own unit
//! tests).

use std::collections::HashMap;

use sicm_core::{ArenaFlags, Context, Device, DeviceTable, Tier, TierData};
use sicm_placement::hotset::{cut, rank, CurrentTier};
use sicm_placement::orig::{self, OrigArenaState, OrigDecision};
use sicm_placement::ski::prepare_penalties;
use sicm_profile::ArenaInterval;

const UPPER: usize = 0;
const LOWER: usize = 1;

fn two_tier_table() -> DeviceTable {
    let tier = |tag| Device {
        tag,
        numa_node: -1,
        page_size_kib: 4,
        tier_data: TierData::default(),
    };
    DeviceTable::new(vec![tier(Tier::Hbm), tier(Tier::Dram)])
}

fn two_arena_interval(
    hot_id: u32,
    hot_accesses: u64,
    hot_resident: usize,
    cold_id: u32,
    cold_accesses: u64,
    cold_resident: usize,
) -> HashMap<u32, ArenaInterval> {
    let mut arenas = HashMap::new();
    arenas.insert(
        hot_id,
        ArenaInterval {
            accesses_per_event: vec![hot_accesses],
            resident_bytes: hot_resident,
            extent_bytes: hot_resident,
            bytes_per_second_estimate: 0.0,
        },
    );
    arenas.insert(
        cold_id,
        ArenaInterval {
            accesses_per_event: vec![cold_accesses],
            resident_bytes: cold_resident,
            extent_bytes: cold_resident,
            bytes_per_second_estimate: 0.0,
        },
    );
    arenas
}

fn one_arena_interval(id: u32, accesses: u64, resident: usize) -> HashMap<u32, ArenaInterval> {
    let mut arenas = HashMap::new();
    arenas.insert(
        id,
        ArenaInterval {
            accesses_per_event: vec![accesses],
            resident_bytes: resident,
            extent_bytes: resident,
            bytes_per_second_estimate: 0.0,
        },
    );
    arenas
}

/// Scenario 5: drive intervals heavily biased toward arena 0 (resident
/// on the lower tier) until `rent_cost >= buy_cost` first holds, then
/// assert both arenas' bindings swap in that interval.
#[test]
fn ski_strategy_swaps_bindings_once_rent_crosses_buy() {
    let ctx = Context::init_with_devices(two_tier_table()).unwrap();
    let hot = ctx.arena_create(0, ArenaFlags::empty(), &[LOWER]).unwrap();
    let cold = ctx.arena_create(0, ArenaFlags::empty(), &[UPPER]).unwrap();
    let hot_arena = ctx.arena(hot).unwrap();
    let cold_arena = ctx.arena(cold).unwrap();
    assert_eq!(hot_arena.device(), Some(LOWER));
    assert_eq!(cold_arena.device(), Some(UPPER));

    let mut current_tier: HashMap<u32, CurrentTier> = HashMap::new();
    current_tier.insert(hot, CurrentTier::Lower);
    current_tier.insert(cold, CurrentTier::Upper);

    // `prepare_penalties` is stateless: it weighs a single interval's
    // access counts against the fixed cost to move, with no memory of
    // earlier intervals. Driving "k intervals" against sustained hot
    // access pressure means the sampled count climbing interval over
    // interval, as it would under a real sustained workload, until
    // enough of it has accumulated in one interval's sample to clear the
    // move cost's 50ms floor.
    let mut swapped = false;
    for i in 1..=200u64 {
        let iv = sicm_profile::Interval {
            index: i,
            arenas: two_arena_interval(hot, i * 50_000, 4096, cold, 10, 4096),
        };
        let mut ranked = rank(&iv, &[1.0], |id| current_tier[&id]);
        cut(&mut ranked, 4096); // only one arena's worth of upper-tier room
        let penalties = prepare_penalties(&ranked, 2_000_000.0, 0.00006);

        if penalties.should_rebind() {
            assert!(i > 1, "rent crossed buy on the very first interval; the test no longer exercises a build-up");
            for arena in &ranked {
                let target = if arena.hot { UPPER } else { LOWER };
                let arena_handle = ctx.arena(arena.arena_id).unwrap();
                arena_handle.set_device(target).unwrap();
                current_tier.insert(arena.arena_id, if arena.hot { CurrentTier::Upper } else { CurrentTier::Lower });
            }
            swapped = true;
            break;
        }
    }

    assert!(swapped, "ski strategy never crossed rent >= buy over 200 intervals");
    assert_eq!(hot_arena.device(), Some(UPPER));
    assert_eq!(cold_arena.device(), Some(LOWER));
}

/// Scenario 6: `orig` strategy with `hot_intervals = 3` rebinds an arena
/// to the upper tier exactly on the third consecutive hot interval, not
/// before.
#[test]
fn orig_strategy_rebinds_on_third_consecutive_hot_interval() {
    const HOT_INTERVALS: u32 = 3;
    let ctx = Context::init_with_devices(two_tier_table()).unwrap();
    let arena_id = ctx.arena_create(0, ArenaFlags::empty(), &[LOWER]).unwrap();
    let arena = ctx.arena(arena_id).unwrap();
    assert_eq!(arena.device(), Some(LOWER));

    let mut state = OrigArenaState::default();
    let mut rebound_at = None;

    for i in 1..=HOT_INTERVALS {
        let iv = sicm_profile::Interval {
            index: i as u64,
            arenas: one_arena_interval(arena_id, 1000, 4096),
        };
        let mut ranked = rank(&iv, &[1.0], |_| CurrentTier::Lower);
        cut(&mut ranked, u64::MAX); // unbounded capacity: everything sampled is "hot"
        let mut states = vec![state];

        // grace_accesses/reconf_weight_ratio set so the full-rebind branch
        // never fires; only the per-arena `hot_intervals` counter path can.
        let decision = orig::decide(&ranked, &mut states, f64::INFINITY, 1.0, HOT_INTERVALS, false);
        state = states[0];

        match decision {
            OrigDecision::Individual(indices) if indices.contains(&0) => {
                arena.set_device(UPPER).unwrap();
                rebound_at = Some(i);
            }
            OrigDecision::FullRebind => panic!("full rebind should not fire with grace_accesses = infinity"),
            _ => {
                assert_eq!(
                    arena.device(),
                    Some(LOWER),
                    "arena rebound before its {HOT_INTERVALS}th consecutive hot interval"
                );
            }
        }
    }

    assert_eq!(rebound_at, Some(HOT_INTERVALS));
    assert_eq!(arena.device(), Some(UPPER));
}
