use crate::error::{Result, SicmError};

/// A closed-open, page-aligned virtual address interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: usize,
    pub end: usize,
}

impl Range {
    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn covers(&self, start: usize, size: usize) -> bool {
        start >= self.start && start.saturating_add(size) <= self.end
    }
}

/// Per-arena sorted, coalescing set of disjoint address ranges.
///
/// A dense `Vec<Range>` kept sorted by `start` with binary search is
/// faster than a balanced tree at the expected `n < 10^4` extents per
/// arena: extents already come coalesced from the slab layer above, so
/// this only has to track externally-visible mappings.
#[derive(Debug, Default)]
pub struct RangeSet {
    ranges: Vec<Range>,
    total_size: usize,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    /// Index of the first range whose `start` is `>= addr`.
    fn lower_bound(&self, addr: usize) -> usize {
        self.ranges.partition_point(|r| r.start < addr)
    }

    /// Insert `[start, start+size)`, coalescing with a flush-adjacent
    /// neighbor on either side. Fails with `RangeInvariantViolation` if the
    /// new range overlaps an existing one — that implies the slab layer
    /// above handed out an extent the registry already knows about.
    pub fn add(&mut self, start: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = start + size;
        let n = self.lower_bound(start);

        if n > 0 {
            let prev = self.ranges[n - 1];
            if prev.end > start {
                return Err(SicmError::RangeInvariantViolation(format!(
                    "add [{start:#x}, {end:#x}) overlaps existing [{:#x}, {:#x})",
                    prev.start, prev.end
                )));
            }
        }
        if n < self.ranges.len() {
            let next = self.ranges[n];
            if end > next.start {
                return Err(SicmError::RangeInvariantViolation(format!(
                    "add [{start:#x}, {end:#x}) overlaps existing [{:#x}, {:#x})",
                    next.start, next.end
                )));
            }
        }

        let merge_prev = n > 0 && self.ranges[n - 1].end == start;
        let merge_next = n < self.ranges.len() && self.ranges[n].start == end;

        match (merge_prev, merge_next) {
            (true, true) => {
                let next_end = self.ranges[n].end;
                self.ranges[n - 1].end = next_end;
                self.ranges.remove(n);
            }
            (true, false) => {
                self.ranges[n - 1].end = end;
            }
            (false, true) => {
                self.ranges[n].start = start;
            }
            (false, false) => {
                self.ranges.insert(n, Range { start, end });
            }
        }

        self.total_size += size;
        Ok(())
    }

    /// Remove `[start, start+size)` from whichever range covers it,
    /// splitting into at most two residual ranges. Never produces a range
    /// with a hole: a removal in the interior of an existing range yields
    /// exactly two residuals, never one.
    pub fn remove(&mut self, start: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = start + size;
        let n = self.lower_bound(start + 1).saturating_sub(1);

        let covering = self
            .ranges
            .get(n)
            .copied()
            .filter(|r| r.covers(start, size));
        let Some(r) = covering else {
            return Err(SicmError::RangeInvariantViolation(format!(
                "remove [{start:#x}, {end:#x}) has no covering range"
            )));
        };

        let leading = start - r.start;
        let trailing = r.end - end;

        match (leading > 0, trailing > 0) {
            (false, false) => {
                self.ranges.remove(n);
            }
            (true, false) => {
                self.ranges[n].end = start;
            }
            (false, true) => {
                self.ranges[n].start = end;
            }
            (true, true) => {
                self.ranges[n].end = start;
                self.ranges.insert(n + 1, Range { start: end, end: r.end });
            }
        }

        self.total_size -= size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_coalesces_adjacent_ranges() {
        let mut rs = RangeSet::new();
        rs.add(0x1000, 0x1000).unwrap();
        rs.add(0x3000, 0x1000).unwrap();
        rs.add(0x2000, 0x1000).unwrap(); // fills the gap, should merge all three
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.total_size(), 0x3000);
        let only: Vec<_> = rs.iter().collect();
        assert_eq!(only[0].start, 0x1000);
        assert_eq!(only[0].end, 0x4000);
    }

    #[test]
    fn add_rejects_overlap() {
        let mut rs = RangeSet::new();
        rs.add(0x1000, 0x2000).unwrap();
        assert!(rs.add(0x1800, 0x1000).is_err());
    }

    #[test]
    fn remove_splits_interior_without_hole() {
        let mut rs = RangeSet::new();
        rs.add(0x1000, 0x4000).unwrap(); // [0x1000, 0x5000)
        rs.remove(0x2000, 0x1000).unwrap(); // remove [0x2000, 0x3000)
        let ranges: Vec<_> = rs.iter().collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].end), (0x1000, 0x2000));
        assert_eq!((ranges[1].start, ranges[1].end), (0x3000, 0x5000));
        assert_eq!(rs.total_size(), 0x3000);
    }

    #[test]
    fn remove_at_either_end_has_no_hole() {
        let mut rs = RangeSet::new();
        rs.add(0x1000, 0x3000).unwrap(); // [0x1000, 0x4000)
        rs.remove(0x1000, 0x1000).unwrap(); // leading edge
        assert_eq!(rs.iter().next().unwrap().start, 0x2000);
        rs.remove(0x3000, 0x1000).unwrap(); // trailing edge
        assert_eq!(rs.iter().next().unwrap().end, 0x3000);
    }

    #[test]
    fn remove_missing_range_fails() {
        let mut rs = RangeSet::new();
        rs.add(0x1000, 0x1000).unwrap();
        assert!(rs.remove(0x5000, 0x1000).is_err());
    }

    #[test]
    fn whole_arena_round_trips_to_empty() {
        let mut rs = RangeSet::new();
        for i in 0..10u64 {
            rs.add((0x1000 + i as usize * 0x1000) as usize, 0x1000).unwrap();
        }
        assert_eq!(rs.total_size(), 0xa000);
        for i in 0..10u64 {
            rs.remove((0x1000 + i as usize * 0x1000) as usize, 0x1000).unwrap();
        }
        assert!(rs.is_empty());
        assert_eq!(rs.total_size(), 0);
    }
}
