//! A minimal size-classed sub-allocator sitting between [`crate::Arena`]'s
//! public `alloc`/`realloc`/`free` surface and its extent hooks.
//!
//! A full production slab allocator isn't the goal here — in jemalloc
//! itself, that role belongs to the allocator's internals, which plug
//! `extent_hooks_t` callbacks in at the arena boundary. We don't carry a
//! jemalloc dependency for this (its extent-hook ABI is unstable across
//! builds and not something that can be hand-authored safely without the
//! exact header jemalloc was compiled with), so this module stands in with
//! just enough size-classing to get realistic extent coalescing: many
//! small requests share a chunk-sized extent instead of each getting their
//! own mmap.
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Result, SicmError};

/// Extents are requested in this granularity; large objects bypass
/// size-classing and get a dedicated extent instead.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;
/// Requests at or above this size skip size-classing entirely.
pub const LARGE_THRESHOLD: usize = CHUNK_SIZE / 4;

/// What [`Slab`] asks of its owning arena: carve out or release a
/// contiguous, tier-bound region. Implemented by `Arena` itself; kept as a
/// trait so the slab's bookkeeping can be unit-tested against a fake.
pub trait ExtentSource {
    fn extent_alloc(&self, size: usize, alignment: usize) -> Result<usize>;
    fn extent_dalloc(&self, addr: usize, size: usize) -> Result<()>;
}

fn class_for(size: usize) -> usize {
    size.max(16).next_power_of_two()
}

fn chunk_base_of(addr: usize) -> usize {
    addr & !(CHUNK_SIZE - 1)
}

#[derive(Debug, Clone, Copy)]
enum AllocMeta {
    Small { block_size: usize },
    Large { size: usize },
}

#[derive(Default)]
struct SizeClassState {
    free_list: Vec<usize>,
    /// Remaining free-block count per chunk base, used to detect when a
    /// whole chunk can be handed back to the extent source.
    chunk_free: HashMap<usize, usize>,
}

#[derive(Default)]
pub struct Slab {
    classes: Mutex<HashMap<usize, SizeClassState>>,
    allocs: Mutex<HashMap<usize, AllocMeta>>,
}

impl Slab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocs
            .lock()
            .values()
            .map(|m| match m {
                AllocMeta::Small { block_size } => *block_size,
                AllocMeta::Large { size } => *size,
            })
            .sum()
    }

    pub fn alloc(&self, source: &dyn ExtentSource, size: usize, align: usize) -> Result<usize> {
        let size = size.max(1);
        let align = align.max(1);
        if size >= LARGE_THRESHOLD || align > LARGE_THRESHOLD {
            return self.alloc_large(source, size, align);
        }
        let block_size = class_for(size).max(align.next_power_of_two());
        if block_size >= LARGE_THRESHOLD {
            return self.alloc_large(source, size, align);
        }
        self.alloc_small(source, block_size)
    }

    fn alloc_small(&self, source: &dyn ExtentSource, block_size: usize) -> Result<usize> {
        {
            let mut classes = self.classes.lock();
            let state = classes.entry(block_size).or_default();
            if let Some(addr) = state.free_list.pop() {
                let cb = chunk_base_of(addr);
                if let Some(cnt) = state.chunk_free.get_mut(&cb) {
                    *cnt -= 1;
                }
                self.allocs.lock().insert(addr, AllocMeta::Small { block_size });
                return Ok(addr);
            }
        }

        // No free block anywhere: carve a fresh chunk-sized extent.
        let chunk_base = source.extent_alloc(CHUNK_SIZE, CHUNK_SIZE)?;
        let total_blocks = CHUNK_SIZE / block_size;

        let mut classes = self.classes.lock();
        let state = classes.entry(block_size).or_default();
        for i in 1..total_blocks {
            state.free_list.push(chunk_base + i * block_size);
        }
        state.chunk_free.insert(chunk_base, total_blocks - 1);
        drop(classes);

        self.allocs
            .lock()
            .insert(chunk_base, AllocMeta::Small { block_size });
        Ok(chunk_base)
    }

    fn alloc_large(&self, source: &dyn ExtentSource, size: usize, align: usize) -> Result<usize> {
        let addr = source.extent_alloc(size, align)?;
        self.allocs.lock().insert(addr, AllocMeta::Large { size });
        Ok(addr)
    }

    /// Release `addr`, reclaiming its chunk back to the extent source the
    /// moment the chunk has no remaining live blocks, so a full
    /// free-everything pass drains the arena's `RangeSet` back to empty
    /// rather than retaining idle chunks forever.
    pub fn dalloc(&self, source: &dyn ExtentSource, addr: usize) -> Result<()> {
        let meta = self
            .allocs
            .lock()
            .remove(&addr)
            .ok_or(SicmError::RegistryNotFound(addr))?;

        match meta {
            AllocMeta::Large { size } => source.extent_dalloc(addr, size),
            AllocMeta::Small { block_size } => {
                let cb = chunk_base_of(addr);
                let release_chunk = {
                    let mut classes = self.classes.lock();
                    let state = classes.get_mut(&block_size).expect("known size class");
                    state.free_list.push(addr);
                    let cnt = state.chunk_free.get_mut(&cb).expect("known chunk");
                    *cnt += 1;
                    let total = CHUNK_SIZE / block_size;
                    if *cnt == total {
                        state.chunk_free.remove(&cb);
                        state.free_list.retain(|&a| chunk_base_of(a) != cb);
                        true
                    } else {
                        false
                    }
                };
                if release_chunk {
                    source.extent_dalloc(cb, CHUNK_SIZE)?;
                }
                Ok(())
            }
        }
    }

    /// The capacity backing `addr`, used by `realloc` to decide whether an
    /// in-place grow/shrink within the same size class is possible.
    pub fn capacity_of(&self, addr: usize) -> Option<usize> {
        self.allocs.lock().get(&addr).map(|m| match m {
            AllocMeta::Small { block_size } => *block_size,
            AllocMeta::Large { size } => *size,
        })
    }

    pub fn fits_in_place(&self, addr: usize, new_size: usize) -> bool {
        match self.allocs.lock().get(&addr) {
            Some(AllocMeta::Small { block_size }) => {
                new_size < LARGE_THRESHOLD && class_for(new_size) == *block_size
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A fake extent source that just hands out bump-pointer addresses;
    /// good enough to exercise the slab's own bookkeeping in isolation.
    struct FakeSource {
        next: AtomicUsize,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                next: AtomicUsize::new(0x10_0000_0000),
            }
        }
    }

    impl ExtentSource for FakeSource {
        fn extent_alloc(&self, size: usize, alignment: usize) -> Result<usize> {
            let cur = self.next.load(Ordering::SeqCst);
            let aligned = (cur + alignment - 1) & !(alignment - 1);
            self.next.store(aligned + size, Ordering::SeqCst);
            Ok(aligned)
        }
        fn extent_dalloc(&self, _addr: usize, _size: usize) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn many_small_allocs_share_chunks() {
        let slab = Slab::new();
        let src = FakeSource::new();
        let mut ptrs = Vec::new();
        for _ in 0..100_000 {
            ptrs.push(slab.alloc(&src, 200, 1).unwrap());
        }
        // 200B rounds up to the 256B class; 100,000 of them fit in far
        // fewer than 100,000 2MiB chunks.
        let chunks_used = (100_000usize * 256).div_ceil(CHUNK_SIZE);
        assert!(chunks_used < 20);
        for p in ptrs {
            slab.dalloc(&src, p).unwrap();
        }
        assert_eq!(slab.allocated_bytes(), 0);
    }

    #[test]
    fn large_alloc_bypasses_size_classing() {
        let slab = Slab::new();
        let src = FakeSource::new();
        let p = slab.alloc(&src, 4096, 1).unwrap();
        assert!(slab.fits_in_place(p, 4096));
        slab.dalloc(&src, p).unwrap();
    }

    #[test]
    fn double_free_reports_not_found() {
        let slab = Slab::new();
        let src = FakeSource::new();
        let p = slab.alloc(&src, 64, 1).unwrap();
        slab.dalloc(&src, p).unwrap();
        assert!(slab.dalloc(&src, p).is_err());
    }
}
