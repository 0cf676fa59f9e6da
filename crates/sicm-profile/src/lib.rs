//! Sampling, residency probing, bandwidth estimation and profile
//! aggregation for arenas managed by `sicm-core`. This crate has no
//! placement policy of its own; it only produces the
//! [`profile::ProfileTimeline`] the placement engine reads.

pub mod aggregator;
pub mod bandwidth;
pub mod profile;
pub mod rss;
pub mod sample;
pub mod sampler;

pub use aggregator::Aggregator;
pub use bandwidth::{BandwidthCounter, BandwidthEstimator};
pub use profile::{ArenaInterval, ArenaRollup, Interval, ProfileTimeline};
pub use sample::{PerfEventAttr, PerfRing, Sample};
pub use sampler::{default_cpus, Sampler};
