use sicm_profile::Interval;

/// Where an arena currently sits, as tracked by the placement engine
/// rather than queried live from the arena (so a full interval's ranking
/// sees a consistent snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentTier {
    Upper,
    Lower,
    Unbound,
}

#[derive(Debug, Clone)]
pub struct RankedArena {
    pub arena_id: u32,
    pub value: f64,
    pub weight: u64,
    pub current: CurrentTier,
    pub hot: bool,
}

/// Step 1 of the placement engine: `value/weight` descending, ties
/// broken by smaller weight. `event_weights` multiplies each event's
/// access count before summing (the `SH_PROFILE_PEBS_MULTIPLIERS` knob).
pub fn rank(
    interval: &Interval,
    event_weights: &[f64],
    current_tier: impl Fn(u32) -> CurrentTier,
) -> Vec<RankedArena> {
    let mut ranked: Vec<RankedArena> = interval
        .arenas
        .iter()
        .map(|(&arena_id, rec)| {
            let value: f64 = rec
                .accesses_per_event
                .iter()
                .enumerate()
                .map(|(i, &count)| count as f64 * event_weights.get(i).copied().unwrap_or(1.0))
                .sum();
            let weight = rec.resident_bytes as u64;
            RankedArena {
                arena_id,
                value,
                weight,
                current: current_tier(arena_id),
                hot: false,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        let da = if a.weight > 0 { a.value / a.weight as f64 } else { f64::INFINITY };
        let db = if b.weight > 0 { b.value / b.weight as f64 } else { f64::INFINITY };
        db.partial_cmp(&da)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.weight.cmp(&b.weight))
    });
    ranked
}

/// Step 2: walk the ranked list accumulating weight, marking arenas hot
/// up to and including the one that would cross `upper_capacity`.
pub fn cut(ranked: &mut [RankedArena], upper_capacity: u64) {
    let mut cumulative = 0u64;
    for arena in ranked.iter_mut() {
        if cumulative >= upper_capacity {
            arena.hot = false;
            continue;
        }
        arena.hot = true;
        cumulative += arena.weight;
    }
}
