//! Public, consumer-facing surface for the heterogeneous-memory allocator
//! and online placement engine.
//!
//! Applications that only need device-bound arenas call [`init`], then
//! [`Runtime::arena_create`]/[`Runtime::arena_alloc`]/[`Runtime::free`] on
//! the returned handle directly. Applications that want this crate to
//! intercept the process's own `malloc`/`free`/`new`/`delete` (so
//! unmodified C/C++ dependencies linked into the same binary also land on
//! a tier-bound arena) additionally enable the `override-malloc` feature,
//! which exports the C-ABI symbols in [`malloc`].

mod runtime;

#[cfg(feature = "override-malloc")]
pub mod malloc;

pub use sicm_core::{
    Arena, ArenaFlags, Config, Context, Device, DeviceTable, Result, SicmError, Tier, TierData,
};
pub use sicm_placement::{CurrentTier, PlacementEngine};
pub use sicm_profile::{ArenaInterval, Interval, ProfileTimeline};
pub use runtime::Runtime;

use std::sync::Arc;

static RUNTIME: once_cell::sync::OnceCell<Arc<Runtime>> = once_cell::sync::OnceCell::new();

/// Initialize the process-wide runtime: enumerate devices, read `SH_*`
/// configuration, create the default arena, and start the sampler,
/// profile aggregator and placement engine if `SH_PROFILE_PEBS_EVENTS`
/// is set. Idempotent: a second call returns the handle created by the
/// first.
pub fn init() -> Result<Arc<Runtime>> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt.clone());
    }
    let rt = Runtime::init()?;
    Ok(RUNTIME.get_or_init(|| rt).clone())
}

/// Shut down the background threads of the process-wide runtime created
/// by [`init`]. A no-op if `init` was never called.
pub fn fini() {
    if let Some(rt) = RUNTIME.get() {
        rt.fini();
    }
}

fn runtime() -> Result<Arc<Runtime>> {
    match RUNTIME.get() {
        Some(rt) => Ok(rt.clone()),
        None => init(),
    }
}

/// The arena every `malloc`/`new`-style override routes through.
pub fn default_arena_id() -> Result<u32> {
    Ok(runtime()?.default_arena_id())
}

/// Create a new arena bound to `devices[0]` (additional entries widen the
/// binding policy to any node among them), refusing to grow past
/// `max_size` bytes when non-zero.
pub fn arena_create(max_size: usize, flags: ArenaFlags, devices: &[usize]) -> Result<u32> {
    runtime()?.arena_create(max_size, flags, devices)
}

/// Like [`arena_create`], but the `SHARED` arena attaches to the file at
/// `path` instead of a fresh anonymous mapping, so a second arena opened
/// at the same path — in this process or another — observes the same
/// bytes at the same offsets.
pub fn arena_create_shared_at(
    path: impl AsRef<std::path::Path>,
    max_size: usize,
    devices: &[usize],
) -> Result<u32> {
    runtime()?.arena_create_shared_at(path.as_ref(), max_size, devices)
}

pub fn arena_destroy(arena_id: u32) -> Result<()> {
    runtime()?.arena_destroy(arena_id)
}

/// Allocate `size` bytes from `arena_id`, bypassing any thread-local
/// cache. Returns a null pointer on `CapacityExceeded` or
/// `OsMappingFailed`, matching the C surface's `malloc`-style contract;
/// callers wanting the structured error should go through
/// [`Runtime::arena_alloc`] instead.
pub fn arena_alloc(arena_id: u32, size: usize) -> *mut u8 {
    match runtime().and_then(|rt| rt.arena_alloc(arena_id, size)) {
        Ok(addr) => addr as *mut u8,
        Err(e) => {
            abort_if_corrupted(&e);
            tracing::debug!(arena_id, size, error = %e, "arena_alloc failed");
            std::ptr::null_mut()
        }
    }
}

/// Like [`arena_alloc`], but with a caller-chosen alignment.
pub fn arena_alloc_aligned(arena_id: u32, size: usize, align: usize) -> *mut u8 {
    match runtime().and_then(|rt| rt.arena_alloc_aligned(arena_id, size, align)) {
        Ok(addr) => addr as *mut u8,
        Err(e) => {
            abort_if_corrupted(&e);
            tracing::debug!(arena_id, size, align, error = %e, "arena_alloc_aligned failed");
            std::ptr::null_mut()
        }
    }
}

/// Reallocate an existing allocation within its own arena, moving it if
/// the current extent can't satisfy `new_size` in place. Returns null on
/// failure, leaving the original allocation untouched (it is not freed).
pub fn arena_realloc(arena_id: u32, ptr: *mut u8, new_size: usize) -> *mut u8 {
    match runtime().and_then(|rt| rt.arena_realloc(arena_id, ptr as usize, new_size)) {
        Ok(addr) => addr as *mut u8,
        Err(e) => {
            abort_if_corrupted(&e);
            tracing::debug!(arena_id, new_size, error = %e, "arena_realloc failed");
            std::ptr::null_mut()
        }
    }
}

/// `RangeInvariantViolation` means the arena's own bookkeeping disagrees
/// with what the slab layer just handed it — allocator corruption, not a
/// recoverable per-request failure. Every allocating entry point aborts
/// on it rather than returning null, per §7's recovery policy.
fn abort_if_corrupted(e: &SicmError) {
    if matches!(e, SicmError::RangeInvariantViolation(_)) {
        sicm_core::abort_corrupted(e);
    }
}

/// Arena-less free: resolves the owning arena via the extent registry.
/// A null pointer is silently ignored; any other pointer with no
/// enclosing range is a [`SicmError::RegistryNotFound`], which — per
/// §7's recovery policy — is a fatal allocator-corruption condition, so
/// this aborts the process rather than returning an error nobody can act
/// on.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let Ok(rt) = runtime() else { return };
    if let Err(e) = rt.free(ptr as usize) {
        sicm_core::abort_corrupted(&e);
    }
}

/// Like [`free`], but the caller additionally asserts `ptr`'s allocation
/// size (accepted for ABI parity with `sdallocx`-style sized frees; not
/// load-bearing for how this allocator actually releases memory).
pub fn sized_free(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    let Ok(rt) = runtime() else { return };
    if let Err(e) = rt.sized_free(ptr as usize, size) {
        sicm_core::abort_corrupted(&e);
    }
}

/// Resolve the arena owning `ptr`, or `None` if it isn't a live
/// allocation from any arena this runtime knows about.
pub fn lookup(ptr: *const u8) -> Option<u32> {
    runtime().ok()?.lookup(ptr as usize)
}

/// Rebind every live range of `arena_id` to `device`'s NUMA node. Mirrors
/// the C surface's `0 | -EINVAL | -errno` contract: `0` on success,
/// `-EINVAL` for an unknown arena or device index, `-errno` (negated, as
/// a raw OS error code) for a failed page-migration call.
pub fn arena_set_device(arena_id: u32, device: usize) -> i32 {
    match runtime().and_then(|rt| rt.arena_set_device(arena_id, device)) {
        Ok(()) => 0,
        Err(SicmError::InvalidDevice(_)) | Err(SicmError::InvalidConfig(_)) => -libc_einval(),
        Err(SicmError::BindingFailed { source, .. }) => {
            -source.raw_os_error().unwrap_or(libc_einval())
        }
        Err(_) => -libc_einval(),
    }
}

fn libc_einval() -> i32 {
    22 // EINVAL, stable across every unix sicm targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_the_free_function_api() {
        let rt = init().unwrap();
        let arena_id = rt.default_arena_id();
        let ptr = arena_alloc(arena_id, 256);
        assert!(!ptr.is_null());
        assert_eq!(lookup(ptr as *const u8), Some(arena_id));
        free(ptr);
    }

    #[test]
    fn arena_set_device_reports_einval_for_unknown_arena() {
        let _ = init();
        let code = arena_set_device(u32::MAX, 0);
        assert_eq!(code, -22);
    }
}
