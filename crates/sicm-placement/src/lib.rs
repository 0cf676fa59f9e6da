//! Hotset ranking and the two rebind strategies (`ski`, `orig`) that
//! decide which arenas move between tiers, plus the supervisor thread
//! that drives them off a [`sicm_profile::ProfileTimeline`].

pub mod engine;
pub mod hotset;
pub mod orig;
pub mod ski;

pub use engine::PlacementEngine;
pub use hotset::{cut, rank, CurrentTier, RankedArena};
pub use orig::{OrigArenaState, OrigDecision};
pub use ski::{prepare_penalties, SkiPenalties};
