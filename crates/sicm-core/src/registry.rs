use parking_lot::RwLock;

use crate::error::{Result, SicmError};

/// One entry in the extent array. A tombstoned (deleted) entry has both
/// addresses nulled so the compaction-deferred delete path can never
/// falsely match a live address.
#[derive(Debug, Clone, Copy)]
struct Slot {
    start: usize,
    end: usize,
    arena_id: u32,
}

#[derive(Default)]
struct Inner {
    /// Dense, insertion-position array of extents: cache-friendly full
    /// scans for the sampler's attribution loop and for per-arena
    /// migration passes.
    slots: Vec<Option<Slot>>,
    /// Indices of tombstoned slots, reused before the array grows.
    free: Vec<usize>,
    /// Same live entries, kept sorted by `start` in lockstep with `slots`
    /// so `find_containing` can binary-search once the extent count grows
    /// past a handful: a linear scan is fine for a few dozen live extents,
    /// but a sorted search pays off once that count climbs.
    sorted: Vec<Slot>,
}

/// Process-wide, concurrently-readable index from virtual address ranges
/// to the owning arena.
///
/// Readers (the sampler's hot path, and `free`/`realloc`) take the read
/// lock and may run in parallel; writers (the arena's extent hooks) take
/// the write lock. A registry entry must exist for exactly as long as the
/// extent is live in its owning arena's `RangeSet` — keeping the two
/// consistent is an invariant of the hooks, not a structural guarantee the
/// registry itself enforces.
#[derive(Default)]
pub struct ExtentRegistry {
    inner: RwLock<Inner>,
}

/// Once the live extent count passes this, `find_containing` prefers the
/// sorted binary search over the plain linear scan.
const BINARY_SEARCH_THRESHOLD: usize = 64;

impl ExtentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, start: usize, end: usize, arena_id: u32) {
        let mut inner = self.inner.write();
        let slot = Slot { start, end, arena_id };

        let idx = inner.sorted.partition_point(|s| s.start < start);
        inner.sorted.insert(idx, slot);

        if let Some(free_idx) = inner.free.pop() {
            inner.slots[free_idx] = Some(slot);
        } else {
            inner.slots.push(Some(slot));
        }
    }

    /// Mark the range starting at `start` empty. Physical compaction of the
    /// backing array is deferred; the slot is added to the free list for
    /// reuse by a future `insert`.
    pub fn delete(&self, start: usize) {
        let mut inner = self.inner.write();
        if let Some(pos) = inner.sorted.iter().position(|s| s.start == start) {
            inner.sorted.remove(pos);
        }
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.start == start))
        {
            inner.slots[idx] = None;
            inner.free.push(idx);
        }
    }

    /// Visit every non-tombstoned entry under the read lock.
    pub fn for_each_live(&self, mut f: impl FnMut(usize, usize, u32)) {
        let inner = self.inner.read();
        for slot in inner.slots.iter().flatten() {
            f(slot.start, slot.end, slot.arena_id);
        }
    }

    /// Resolve the arena owning `addr`, or `None` if no live extent
    /// contains it.
    pub fn find_containing(&self, addr: usize) -> Option<u32> {
        let inner = self.inner.read();
        if inner.sorted.len() >= BINARY_SEARCH_THRESHOLD {
            let idx = inner.sorted.partition_point(|s| s.start <= addr);
            if idx == 0 {
                return None;
            }
            let candidate = &inner.sorted[idx - 1];
            if addr < candidate.end {
                return Some(candidate.arena_id);
            }
            None
        } else {
            inner
                .slots
                .iter()
                .flatten()
                .find(|s| addr >= s.start && addr < s.end)
                .map(|s| s.arena_id)
        }
    }

    /// Like [`Self::find_containing`], but returns `RegistryNotFound` for a
    /// non-null pointer that resolves to nothing, which is the shape
    /// `free(ptr)` needs to report a bad pointer as an error rather than a
    /// silent no-op.
    pub fn find_containing_or_err(&self, addr: usize) -> Result<u32> {
        self.find_containing(addr)
            .ok_or(SicmError::RegistryNotFound(addr))
    }

    /// Total bytes currently registered to `arena_id` (used for the
    /// extent-size profile field).
    pub fn arena_extent_bytes(&self, arena_id: u32) -> usize {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .flatten()
            .filter(|s| s.arena_id == arena_id)
            .map(|s| s.end - s.start)
            .sum()
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().sorted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find() {
        let reg = ExtentRegistry::new();
        reg.insert(0x1000, 0x2000, 7);
        assert_eq!(reg.find_containing(0x1000), Some(7));
        assert_eq!(reg.find_containing(0x1fff), Some(7));
        assert_eq!(reg.find_containing(0x2000), None);
    }

    #[test]
    fn delete_then_tombstone_reuse() {
        let reg = ExtentRegistry::new();
        reg.insert(0x1000, 0x2000, 1);
        reg.delete(0x1000);
        assert_eq!(reg.find_containing(0x1500), None);
        // Reinsert should reuse the tombstoned slot, not grow unboundedly.
        reg.insert(0x9000, 0xa000, 2);
        let live: Vec<_> = {
            let mut v = Vec::new();
            reg.for_each_live(|s, e, a| v.push((s, e, a)));
            v
        };
        assert_eq!(live, vec![(0x9000, 0xa000, 2)]);
    }

    #[test]
    fn binary_search_path_agrees_with_linear_path() {
        let reg = ExtentRegistry::new();
        for i in 0..200usize {
            let base = i * 0x10000;
            reg.insert(base, base + 0x1000, i as u32);
        }
        for i in 0..200usize {
            let base = i * 0x10000;
            assert_eq!(reg.find_containing(base), Some(i as u32));
            assert_eq!(reg.find_containing(base + 0x1000), None);
        }
    }

    #[test]
    fn non_overlapping_invariant_holds_after_random_ops() {
        let reg = ExtentRegistry::new();
        for i in 0..50usize {
            reg.insert(i * 0x2000, i * 0x2000 + 0x1000, i as u32);
        }
        for i in (0..50usize).step_by(2) {
            reg.delete(i * 0x2000);
        }
        let mut live = Vec::new();
        reg.for_each_live(|s, e, _| live.push((s, e)));
        live.sort();
        for w in live.windows(2) {
            assert!(w[0].1 <= w[1].0);
        }
    }
}
