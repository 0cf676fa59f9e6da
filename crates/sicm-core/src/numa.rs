//! Thin wrappers around the Linux NUMA policy syscalls (`mbind`,
//! `set_mempolicy`, `get_mempolicy`). These aren't exposed by `libc` at the
//! ergonomic level libnuma provides, so we go through `libc::syscall`
//! directly with the raw `SYS_*` numbers, mirroring how the original C
//! implementation calls straight into `numaif.h`.
//!
//! Node masks are capped at 64 nodes (a `u64` bitmask) — comfortably above
//! any machine this allocator targets, and far simpler than the
//! arbitrary-width bitmaps `numaif.h` technically allows for.

use std::io;

const MPOL_BIND: i32 = 2;
const MPOL_MF_MOVE: u32 = 1 << 1;
const MAXNODE: u64 = 64;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    pub fn mbind_range_mask(addr: usize, len: usize, nodemask: u64) -> io::Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr as *mut libc::c_void,
                len as libc::c_ulong,
                MPOL_BIND as libc::c_ulong,
                &nodemask as *const u64,
                MAXNODE,
                MPOL_MF_MOVE,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Returns the previous policy mode and nodemask so it can be restored.
    pub fn get_mempolicy() -> io::Result<(i32, u64)> {
        let mut mode: i32 = 0;
        let mut mask: u64 = 0;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &mut mode as *mut i32,
                &mut mask as *mut u64,
                MAXNODE,
                std::ptr::null_mut::<libc::c_void>(),
                0u64,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok((mode, mask))
        }
    }

    pub fn set_mempolicy(mode: i32, mask: u64) -> io::Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                mode as libc::c_long,
                &mask as *const u64,
                MAXNODE,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn mbind_range_mask(_addr: usize, _len: usize, _nodemask: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "NUMA page binding is only implemented on Linux",
        ))
    }

    pub fn get_mempolicy() -> io::Result<(i32, u64)> {
        Ok((0, 0))
    }

    pub fn set_mempolicy(_mode: i32, _mask: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Build a bitmask selecting `node`. Returns `0` for negative nodes (the
/// "no binding" sentinel callers use for an unpinned tier).
fn node_mask(node: i32) -> u64 {
    if node < 0 {
        0
    } else {
        1u64 << node
    }
}

/// Build a bitmask selecting every node in `nodes`, skipping negative
/// entries. Used when a tier is allowed to spread across more than one
/// NUMA node.
pub fn nodes_mask(nodes: impl IntoIterator<Item = i32>) -> u64 {
    nodes.into_iter().fold(0u64, |mask, n| mask | node_mask(n))
}

/// Bind `[addr, addr+len)` to `numa_node`, moving already-resident pages
/// (`MPOL_MF_MOVE`). A negative node is a no-op: callers use it for tiers
/// that carry no NUMA affinity.
pub fn mbind_range(addr: usize, len: usize, numa_node: i32) -> io::Result<()> {
    let mask = node_mask(numa_node);
    if mask == 0 {
        return Ok(());
    }
    imp::mbind_range_mask(addr, len, mask)
}

/// Like [`mbind_range`], but binds against any node set in `nodemask`
/// rather than a single node.
pub fn mbind_range_mask(addr: usize, len: usize, nodemask: u64) -> io::Result<()> {
    if nodemask == 0 {
        return Ok(());
    }
    imp::mbind_range_mask(addr, len, nodemask)
}

/// Run `f` with the calling thread's memory policy temporarily set to
/// `MPOL_BIND` against `numa_node`, then restore whatever policy was in
/// effect before. This is thread-local OS state: two threads racing
/// through their own allocation hooks never contend on it.
pub fn with_bind_policy<R>(numa_node: i32, f: impl FnOnce() -> R) -> io::Result<R> {
    with_bind_policy_mask(node_mask(numa_node), f)
}

/// Like [`with_bind_policy`], but accepts any node in `nodemask`.
pub fn with_bind_policy_mask<R>(nodemask: u64, f: impl FnOnce() -> R) -> io::Result<R> {
    if nodemask == 0 {
        return Ok(f());
    }
    let (old_mode, old_mask) = imp::get_mempolicy()?;
    imp::set_mempolicy(MPOL_BIND, nodemask)?;
    let result = f();
    // Best-effort restore; a failure here shouldn't unwind past the
    // caller's allocation attempt.
    let _ = imp::set_mempolicy(old_mode, old_mask);
    Ok(result)
}
