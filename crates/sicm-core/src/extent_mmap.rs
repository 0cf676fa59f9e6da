//! Raw anonymous/file-backed mapping primitives used by the arena's extent
//! hooks. Kept separate from the read-mostly `MappedFile` helper elsewhere
//! in the stack: these mappings are read-write, possibly huge, and need
//! the alignment-retry dance jemalloc's own `pages_map` does.
use std::io;

#[cfg(unix)]
pub fn map_anon(size: usize, alignment: usize) -> io::Result<usize> {
    map_generic(size, alignment, -1, 0)
}

#[cfg(unix)]
pub fn map_shared(fd: std::os::unix::io::RawFd, offset: i64, size: usize, alignment: usize) -> io::Result<usize> {
    map_fixed_or_retry(size, alignment, fd, offset, libc::MAP_SHARED)
}

#[cfg(unix)]
fn map_generic(size: usize, alignment: usize, fd: std::os::unix::io::RawFd, offset: i64) -> io::Result<usize> {
    map_fixed_or_retry(size, alignment, fd, offset, libc::MAP_PRIVATE | libc::MAP_ANON)
}

/// Mirrors `sa_alloc`'s two-attempt strategy: map at the requested size
/// first (cheap path, satisfies alignment almost always because `mmap`
/// already returns page-aligned addresses), and only if that didn't land
/// on the requested alignment, reserve a padded anonymous range purely to
/// find an aligned address, then `MAP_FIXED` the *real* mapping (the fd
/// and `offset` the caller asked for, still exactly `size` bytes) over
/// the aligned slice of that reservation.
///
/// The reservation step matters for the fd-backed path: remapping the fd
/// itself at the padded size would (a) require the file to already be
/// grown past `offset + size` to avoid SIGBUS on the overhang, and (b)
/// land the returned address on file offset `offset + (aligned - base)`
/// instead of `offset`, desyncing a `SHARED` arena's bump-offset
/// accounting from what's actually backing each extent. Reserving
/// anonymously and overlaying with `MAP_FIXED` keeps the real mapping's
/// file offset exactly `offset` regardless of which retry path is taken.
#[cfg(unix)]
fn map_fixed_or_retry(
    size: usize,
    alignment: usize,
    fd: std::os::unix::io::RawFd,
    offset: i64,
    extra_flags: libc::c_int,
) -> io::Result<usize> {
    unsafe {
        let first = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            extra_flags | libc::MAP_POPULATE,
            fd,
            offset,
        );
        if first == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = first as usize;
        if alignment <= 1 || addr % alignment == 0 {
            return Ok(addr);
        }

        // Unlucky: reserve a padded anonymous range to discover an
        // aligned address, then overlay the real mapping on it.
        libc::munmap(first, size);
        let padded = size + alignment;
        let reservation = libc::mmap(
            std::ptr::null_mut(),
            padded,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if reservation == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = reservation as usize;
        let aligned = (base + alignment - 1) & !(alignment - 1);
        if aligned > base {
            libc::munmap(reservation, aligned - base);
        }
        let tail_start = aligned + size;
        let tail_len = (base + padded) - tail_start;
        if tail_len > 0 {
            libc::munmap(tail_start as *mut libc::c_void, tail_len);
        }

        let fixed = libc::mmap(
            aligned as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            extra_flags | libc::MAP_POPULATE | libc::MAP_FIXED,
            fd,
            offset,
        );
        if fixed == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(aligned)
    }
}

#[cfg(unix)]
pub fn unmap(addr: usize, size: usize) -> io::Result<()> {
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn map_anon(_size: usize, _alignment: usize) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "anonymous mapping requires unix"))
}

#[cfg(not(unix))]
pub fn map_shared(_fd: i32, _offset: i64, _size: usize, _alignment: usize) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "shared mapping requires unix"))
}

#[cfg(not(unix))]
pub fn unmap(_addr: usize, _size: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "unmap requires unix"))
}
