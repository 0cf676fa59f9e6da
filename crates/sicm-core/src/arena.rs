use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bitflags::bitflags;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::device::DeviceTable;
use crate::error::{Result, SicmError};
use crate::extent_mmap;
use crate::numa;
use crate::range::RangeSet;
use crate::registry::ExtentRegistry;
use crate::slab::{ExtentSource, Slab};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArenaFlags: u32 {
        /// The arena's range/device bookkeeping is expected to be touched
        /// from more than one thread without external synchronisation.
        const MUTEX_HOT = 1 << 0;
        /// Back this arena's extents with a shared, file-backed mapping
        /// instead of anonymous memory, so a second process attaching the
        /// same file sees the same bytes.
        const SHARED = 1 << 1;
        /// Keep the backing file on arena destroy instead of truncating
        /// and removing it.
        const PERSIST = 1 << 2;
    }
}

/// State only `SHARED` arenas carry: the backing file descriptor and a
/// bump offset handed out to each new extent request.
struct SharedBacking {
    fd: std::os::unix::io::RawFd,
    /// Padded: bumped by every concurrent extent request against a
    /// shared-mapping arena, so it's worth keeping off whatever cache
    /// line `fd` and other arena fields share.
    next_offset: CachePadded<AtomicI64>,
}

/// A device-bound allocation region. Every extent an arena hands out is
/// mapped against the NUMA node(s) in `devices` and tracked in both its
/// own `RangeSet` and the process-wide [`ExtentRegistry`].
pub struct Arena {
    id: u32,
    device_table: Arc<DeviceTable>,
    registry: Arc<ExtentRegistry>,
    /// Current device binding. Read on every `extent_alloc` to compute
    /// the thread's memory policy mask; `ArcSwap` keeps that read
    /// lock-free since rebinds (`set_device`/`set_devices`) are rare
    /// compared to allocation.
    devices: ArcSwap<Vec<usize>>,
    ranges: Mutex<RangeSet>,
    max_size: usize,
    flags: ArenaFlags,
    slab: Slab,
    shared: Option<SharedBacking>,
}

impl Arena {
    pub fn new(
        id: u32,
        device_table: Arc<DeviceTable>,
        registry: Arc<ExtentRegistry>,
        initial_device: usize,
        max_size: usize,
        flags: ArenaFlags,
    ) -> Result<Self> {
        Self::with_shared_fd(id, device_table, registry, initial_device, max_size, flags, None)
    }

    /// Like [`Self::new`], but a `SHARED` arena attaches to `shared_fd`
    /// (when given) instead of creating a fresh anonymous backing file.
    /// Used so a second arena — in this process or another — opened over
    /// the same named file observes the same bytes at the same offsets,
    /// which an anonymous `memfd_create`-backed arena can never provide.
    pub fn with_shared_fd(
        id: u32,
        device_table: Arc<DeviceTable>,
        registry: Arc<ExtentRegistry>,
        initial_device: usize,
        max_size: usize,
        flags: ArenaFlags,
        shared_fd: Option<std::os::unix::io::RawFd>,
    ) -> Result<Self> {
        device_table.get(initial_device)?;
        let shared = if flags.contains(ArenaFlags::SHARED) {
            let fd = match shared_fd {
                Some(fd) => fd,
                None => make_shared_fd()?,
            };
            Some(SharedBacking {
                fd,
                next_offset: CachePadded::new(AtomicI64::new(0)),
            })
        } else {
            None
        };
        Ok(Self {
            id,
            device_table,
            registry,
            devices: ArcSwap::new(Arc::new(vec![initial_device])),
            ranges: Mutex::new(RangeSet::new()),
            max_size,
            flags,
            slab: Slab::new(),
            shared,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn total_size(&self) -> usize {
        self.ranges.lock().total_size()
    }

    pub fn flags(&self) -> ArenaFlags {
        self.flags
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current device-index bindings, per the last successful
    /// `set_device`/`set_devices` call (or the arena's creation device if
    /// neither has been called yet).
    pub fn devices(&self) -> Vec<usize> {
        (**self.devices.load()).clone()
    }

    /// The single device this arena is bound to, if it's bound to exactly
    /// one (the common case outside of `set_devices`' multi-node policy).
    pub fn device(&self) -> Option<usize> {
        let devices = self.devices.load();
        (devices.len() == 1).then(|| devices[0])
    }

    /// NUMA node mask covering every device this arena currently binds to.
    fn nodemask(&self) -> Result<u64> {
        let devices = self.devices.load();
        let mut mask = 0u64;
        for &idx in devices.iter() {
            let device = self.device_table.get(idx)?;
            mask |= numa::nodes_mask([device.numa_node]);
        }
        Ok(mask)
    }

    /// Rebind every live range to `device_idx`, migrating already-resident
    /// pages. Stops at the first failing range and leaves everything
    /// migrated up to that point in place; only updates `self.devices` to
    /// the new single-device set once every range has moved.
    pub fn set_device(&self, device_idx: usize) -> Result<()> {
        let device = self.device_table.get(device_idx)?;
        let ranges = self.ranges.lock();
        for r in ranges.iter() {
            numa::mbind_range(r.start, r.size(), device.numa_node).map_err(|source| {
                SicmError::BindingFailed {
                    start: r.start,
                    end: r.end,
                    source,
                }
            })?;
        }
        drop(ranges);
        self.devices.store(Arc::new(vec![device_idx]));
        Ok(())
    }

    /// Like [`Self::set_device`], but the migration policy accepts any
    /// node among `device_indices` rather than pinning to exactly one.
    pub fn set_devices(&self, device_indices: &[usize]) -> Result<()> {
        if device_indices.is_empty() {
            return Err(SicmError::InvalidConfig(
                "set_devices requires at least one device".into(),
            ));
        }
        let mut mask = 0u64;
        for &idx in device_indices {
            let device = self.device_table.get(idx)?;
            mask |= numa::nodes_mask([device.numa_node]);
        }
        let ranges = self.ranges.lock();
        for r in ranges.iter() {
            numa::mbind_range_mask(r.start, r.size(), mask).map_err(|source| {
                SicmError::BindingFailed {
                    start: r.start,
                    end: r.end,
                    source,
                }
            })?;
        }
        drop(ranges);
        self.devices.store(Arc::new(device_indices.to_vec()));
        Ok(())
    }

    pub fn alloc(&self, size: usize, align: usize) -> Result<usize> {
        self.slab.alloc(self, size, align)
    }

    pub fn free(&self, addr: usize) -> Result<()> {
        self.slab.dalloc(self, addr)
    }

    /// The size-class capacity backing `addr`'s allocation, if it's a live
    /// allocation from this arena's slab. Used by `sized_free` to assert
    /// the caller's size hint against what we actually hold.
    pub fn capacity_of(&self, addr: usize) -> Option<usize> {
        self.slab.capacity_of(addr)
    }

    /// Snapshot of `(start, size)` for every range currently live in this
    /// arena, used by arena teardown to release everything regardless of
    /// the slab's own per-object bookkeeping.
    pub fn ranges_snapshot(&self) -> Vec<(usize, usize)> {
        self.ranges.lock().iter().map(|r| (r.start, r.size())).collect()
    }

    /// Tear down every live range: deregister and unmap (unless
    /// `PERSIST`), bypassing the slab's free lists since the arena itself
    /// is going away.
    pub fn destroy(&self) -> Result<()> {
        for (start, size) in self.ranges_snapshot() {
            ExtentSource::extent_dalloc(self, start, size)?;
        }
        Ok(())
    }

    pub fn realloc(&self, addr: usize, new_size: usize) -> Result<usize> {
        if self.slab.fits_in_place(addr, new_size) {
            return Ok(addr);
        }
        let new_addr = self.alloc(new_size, 1)?;
        if let Some(old_size) = self.slab.capacity_of(addr) {
            let copy_len = old_size.min(new_size);
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, copy_len);
            }
        }
        self.free(addr)?;
        Ok(new_addr)
    }
}

impl ExtentSource for Arena {
    fn extent_alloc(&self, size: usize, alignment: usize) -> Result<usize> {
        if self.max_size > 0 {
            let projected = self.ranges.lock().total_size() + size;
            if projected > self.max_size {
                return Err(SicmError::CapacityExceeded);
            }
        }

        let mask = self.nodemask()?;
        let addr = numa::with_bind_policy_mask(mask, || -> Result<usize> {
            if let Some(shared) = &self.shared {
                let offset = shared
                    .next_offset
                    .fetch_add(size as i64, Ordering::SeqCst);
                crate::shared_mapping::ensure_len(shared.fd, offset + size as i64)
                    .map_err(SicmError::OsMappingFailed)?;
                extent_mmap::map_shared(shared.fd, offset, size, alignment)
                    .map_err(SicmError::OsMappingFailed)
            } else {
                extent_mmap::map_anon(size, alignment).map_err(SicmError::OsMappingFailed)
            }
        })
        .map_err(SicmError::OsMappingFailed)??;

        let mut ranges = self.ranges.lock();
        ranges.add(addr, size)?;
        self.registry.insert(addr, addr + size, self.id);
        Ok(addr)
    }

    fn extent_dalloc(&self, addr: usize, size: usize) -> Result<()> {
        {
            let mut ranges = self.ranges.lock();
            ranges.remove(addr, size)?;
        }
        self.registry.delete(addr);
        if !self.flags.contains(ArenaFlags::PERSIST) {
            extent_mmap::unmap(addr, size).map_err(SicmError::OsMappingFailed)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_shared_fd() -> Result<std::os::unix::io::RawFd> {
    crate::shared_mapping::anonymous_shared_fd().map_err(SicmError::OsMappingFailed)
}

#[cfg(not(unix))]
fn make_shared_fd() -> Result<std::os::unix::io::RawFd> {
    Err(SicmError::InvalidConfig(
        "shared arenas require unix".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, Tier, TierData};

    fn table() -> Arc<DeviceTable> {
        Arc::new(DeviceTable::new(vec![Device {
            tag: Tier::Dram,
            numa_node: -1,
            page_size_kib: 4,
            tier_data: TierData::default(),
        }]))
    }

    #[test]
    fn alloc_then_free_drains_range_set() {
        let arena = Arena::new(
            0,
            table(),
            Arc::new(ExtentRegistry::new()),
            0,
            0,
            ArenaFlags::empty(),
        )
        .unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            ptrs.push(arena.alloc(128, 8).unwrap());
        }
        for p in ptrs {
            arena.free(p).unwrap();
        }
        assert_eq!(arena.total_size(), 0);
    }

    #[test]
    fn capacity_exceeded_rejects_large_request() {
        let arena = Arena::new(
            0,
            table(),
            Arc::new(ExtentRegistry::new()),
            0,
            4096,
            ArenaFlags::empty(),
        )
        .unwrap();
        let big = arena.alloc(1 << 20, 8);
        assert!(matches!(big, Err(SicmError::CapacityExceeded)));
    }

    #[test]
    fn realloc_preserves_contents_across_growth() {
        let arena = Arena::new(
            0,
            table(),
            Arc::new(ExtentRegistry::new()),
            0,
            0,
            ArenaFlags::empty(),
        )
        .unwrap();
        let p = arena.alloc(64, 8).unwrap();
        unsafe {
            std::ptr::write_bytes(p as *mut u8, 0xab, 64);
        }
        let grown = arena.realloc(p, 4096).unwrap();
        let byte = unsafe { *(grown as *const u8) };
        assert_eq!(byte, 0xab);
        arena.free(grown).unwrap();
    }
}
