//! Backing-file plumbing for `SHARED` arenas. A shared arena's extents are
//! carved out of one growable file instead of anonymous memory, so a
//! second process that maps the same file sees the same bytes at the
//! same offsets.

use std::io;
use std::os::unix::io::RawFd;

/// Create an unlinked, memory-backed file (`memfd_create` where available,
/// falling back to a `tmpfile` under `/dev/shm`) sized on demand by the
/// arena's bump offset as extents are carved out of it.
#[cfg(target_os = "linux")]
pub fn anonymous_shared_fd() -> io::Result<RawFd> {
    let name = std::ffi::CString::new("sicm-arena").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn anonymous_shared_fd() -> io::Result<RawFd> {
    let path = std::ffi::CString::new(format!(
        "/tmp/sicm-arena-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ))
    .unwrap();
    unsafe {
        let fd = libc::open(
            path.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::unlink(path.as_ptr());
        Ok(fd)
    }
}

/// Open (creating if necessary) a named, real file to back a `SHARED`
/// arena, so a second arena opened at the same `path` — in this process
/// or another — shares its bytes. Unlike [`anonymous_shared_fd`], this
/// file is nameable and survives past the opening process, which is what
/// `ArenaFlags::PERSIST` relies on.
#[cfg(unix)]
pub fn open_at(path: &std::path::Path) -> io::Result<RawFd> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Grow the backing file to at least `len` bytes so the next mapping
/// attempt against an offset within it doesn't fault.
#[cfg(unix)]
pub fn ensure_len(fd: RawFd, len: i64) -> io::Result<()> {
    let ret = unsafe { libc::ftruncate(fd, len) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
