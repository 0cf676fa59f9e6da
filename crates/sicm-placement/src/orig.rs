use crate::hotset::{CurrentTier, RankedArena};

/// Per-arena state the `orig` strategy carries across intervals: how many
/// consecutive intervals an arena has been in the hotset, reset to zero
/// the instant it drops out.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrigArenaState {
    pub num_hot_intervals: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum OrigDecision {
    /// Rebind every disagreeing arena to its desired tier.
    FullRebind,
    /// Rebind only the specific arenas listed (by index into `ranked`)
    /// that just crossed `hot_intervals` consecutive hot intervals.
    Individual(Vec<usize>),
    NoAction,
}

/// Update `num_hot_intervals` bookkeeping for every ranked arena and
/// decide this interval's action.
///
/// Mirrors the original's two-tier decision: a full rebind fires once
/// the accumulated hot/cold weight to move clears both
/// `grace_accesses` (a floor below which no rebind is worth the
/// disruption) and `reconf_weight_ratio` (the fraction of total weight
/// that must disagree with the current placement); otherwise, arenas
/// that have individually been hot for exactly `hot_intervals`
/// consecutive intervals are promoted one at a time.
pub fn decide(
    ranked: &[RankedArena],
    states: &mut [OrigArenaState],
    grace_accesses: f64,
    reconf_weight_ratio: f64,
    hot_intervals: u32,
    nobind: bool,
) -> OrigDecision {
    debug_assert_eq!(ranked.len(), states.len());

    let mut total_value = 0.0;
    let mut total_weight = 0u64;
    let mut weight_to_rebind = 0u64;

    for (arena, state) in ranked.iter().zip(states.iter_mut()) {
        total_value += arena.value;
        total_weight += arena.weight;

        if arena.hot {
            state.num_hot_intervals += 1;
        } else {
            state.num_hot_intervals = 0;
        }

        let disagrees = matches!(
            (arena.current, arena.hot),
            (CurrentTier::Lower, true) | (CurrentTier::Unbound, true) | (CurrentTier::Upper, false)
        );
        if disagrees {
            weight_to_rebind += arena.weight;
        }
    }

    if nobind {
        return OrigDecision::NoAction;
    }

    let ratio = if total_weight > 0 {
        weight_to_rebind as f64 / total_weight as f64
    } else {
        0.0
    };

    if total_value > grace_accesses && ratio >= reconf_weight_ratio {
        return OrigDecision::FullRebind;
    }

    if hot_intervals == 0 {
        return OrigDecision::NoAction;
    }

    let individual: Vec<usize> = states
        .iter()
        .enumerate()
        .filter(|(_, s)| s.num_hot_intervals == hot_intervals)
        .map(|(i, _)| i)
        .collect();

    if individual.is_empty() {
        OrigDecision::NoAction
    } else {
        OrigDecision::Individual(individual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(current: CurrentTier, hot: bool, value: f64, weight: u64) -> RankedArena {
        RankedArena {
            arena_id: 0,
            value,
            weight,
            current,
            hot,
        }
    }

    #[test]
    fn arena_not_rebound_before_reaching_hot_intervals_threshold() {
        let ranked = vec![arena(CurrentTier::Lower, true, 10.0, 100)];
        let mut states = vec![OrigArenaState::default()];
        for i in 0..2 {
            let decision = decide(&ranked, &mut states, 1_000_000.0, 1.0, 3, false);
            assert!(matches!(decision, OrigDecision::NoAction), "iteration {i}");
        }
        let decision = decide(&ranked, &mut states, 1_000_000.0, 1.0, 3, false);
        match decision {
            OrigDecision::Individual(idx) => assert_eq!(idx, vec![0]),
            other => panic!("expected Individual rebind on the 3rd hot interval, got {other:?}"),
        }
    }

    #[test]
    fn losing_hot_status_resets_the_counter() {
        let mut states = vec![OrigArenaState::default()];
        let hot = arena(CurrentTier::Lower, true, 10.0, 100);
        let cold = arena(CurrentTier::Lower, false, 10.0, 100);
        decide(&[hot.clone()], &mut states, 1_000_000.0, 1.0, 3, false);
        decide(&[hot.clone()], &mut states, 1_000_000.0, 1.0, 3, false);
        decide(&[cold], &mut states, 1_000_000.0, 1.0, 3, false);
        assert_eq!(states[0].num_hot_intervals, 0);
    }
}
