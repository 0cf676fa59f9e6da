//! Resident-set-size estimation for live ranges, via `/proc/self/pagemap`.
//!
//! The object-map back-end the original also supports (a kernel patch
//! exposing per-object resident-page counts directly) isn't something a
//! stock Linux kernel provides; it's modeled here as a trait so a future
//! kernel-specific backend can slot in without touching the prober's
//! per-interval driving loop.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use sicm_core::ExtentRegistry;

const PAGEMAP_ENTRY_BYTES: usize = 8;
const PRESENT_BIT: u64 = 1 << 63;

pub trait ResidencyBackend: Send + Sync {
    /// Resident byte count for `[start, end)`.
    fn resident_bytes(&self, start: usize, end: usize, page_size: usize) -> io::Result<usize>;
}

/// Reads `/proc/self/pagemap`, counting present pages in the requested
/// range. One `u64` entry per page; bit 63 is the present flag.
pub struct PageMapBackend {
    file: parking_lot::Mutex<File>,
}

impl PageMapBackend {
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            file: parking_lot::Mutex::new(File::open("/proc/self/pagemap")?),
        })
    }
}

impl ResidencyBackend for PageMapBackend {
    fn resident_bytes(&self, start: usize, end: usize, page_size: usize) -> io::Result<usize> {
        let num_pages = (end - start).div_ceil(page_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(
            (start / page_size * PAGEMAP_ENTRY_BYTES) as u64,
        ))?;

        let mut buf = vec![0u8; num_pages * PAGEMAP_ENTRY_BYTES];
        // A short read (range extends past a mapped region's pagemap
        // coverage) is tolerated; count only whole entries actually read.
        let mut read_total = 0;
        loop {
            match file.read(&mut buf[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if read_total == buf.len() {
                break;
            }
        }

        let entries = read_total / PAGEMAP_ENTRY_BYTES;
        let mut resident = 0usize;
        for i in 0..entries {
            let bytes: [u8; 8] = buf[i * 8..i * 8 + 8].try_into().unwrap();
            let entry = u64::from_ne_bytes(bytes);
            if entry & PRESENT_BIT != 0 {
                resident += page_size;
            }
        }
        Ok(resident)
    }
}

/// Per-interval resident-byte total for every live range of `arena_id`,
/// as reported by the extent registry.
pub fn resident_bytes_for_arena(
    registry: &ExtentRegistry,
    arena_id: u32,
    page_size: usize,
    backend: &dyn ResidencyBackend,
) -> usize {
    let mut total = 0usize;
    registry.for_each_live(|start, end, owner| {
        if owner == arena_id {
            total += backend.resident_bytes(start, end, page_size).unwrap_or(0);
        }
    });
    total
}
