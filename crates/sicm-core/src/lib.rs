//! Device table, range set, extent registry and arena allocator core for
//! heterogeneous memory tiers. This crate has no knowledge of sampling or
//! placement policy; it only provides the mechanism those higher layers
//! drive: device-bound arenas whose pages can be migrated between tiers.

pub mod arena;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod extent_mmap;
pub mod numa;
pub mod range;
pub mod registry;
pub mod shared_mapping;
pub mod slab;

pub use arena::{Arena, ArenaFlags};
pub use config::Config;
pub use context::Context;
pub use device::{Device, DeviceTable, Tier, TierData};
pub use error::{abort_corrupted, Result, SicmError};
pub use range::{Range, RangeSet};
pub use registry::ExtentRegistry;
