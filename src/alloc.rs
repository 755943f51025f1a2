//! Coalescing free-space allocator.
//!
//! Tracks which byte ranges of the image are free for reuse by relocated
//! strings and rediscovered sub-tables. Registration is append-then-merge
//! lazily: overlapping ranges are tolerated until [`FreeSpaceAllocator::coalesce`]
//! runs, after which the set is pairwise disjoint and maximal. Allocation is
//! first-fit in insertion order, trading optimality for reproducibility.

use crate::error::{BinweaveError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A contiguous run of free bytes. Zero-length ranges never live in a
/// collection; they are dropped at the point they would be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// True when the other span overlaps or touches this one.
    fn touches(&self, start: u64, length: u64) -> bool {
        self.start <= start + length && start <= self.end()
    }

    /// True when `[start, start+length)` lies fully inside this range.
    fn contains(&self, start: u64, length: u64) -> bool {
        self.start <= start && start + length <= self.end()
    }

    /// True when the spans share no byte at all.
    fn disjoint(&self, start: u64, length: u64) -> bool {
        start + length <= self.start || start >= self.end()
    }

    /// Grow this range to the union of itself and the given span.
    fn merge(&mut self, start: u64, length: u64) {
        let end = self.end().max(start + length);
        self.start = self.start.min(start);
        self.length = end - self.start;
    }
}

fn round_up(len: u64, align: u64) -> u64 {
    (len + align - 1) & !(align - 1)
}

fn check_alignment(align: u64) -> Result<()> {
    if align.is_power_of_two() {
        Ok(())
    } else {
        Err(BinweaveError::InvalidAlignment { align })
    }
}

/// Free-space bookkeeping over the byte image.
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceAllocator {
    ranges: Vec<ByteRange>,
    allocations: u64,
}

impl FreeSpaceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current free ranges, in insertion order.
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Number of successful `alloc` calls served so far.
    pub fn alloc_count(&self) -> u64 {
        self.allocations
    }

    /// Register `len` bytes at `loc` as free, rounding `len` up to `align`.
    ///
    /// Merges into the first overlapping or touching range; otherwise appends
    /// a new one. Duplicate and overlapping registrations are fine, they are
    /// reduced by the next `coalesce`.
    pub fn register(&mut self, loc: u64, len: u64, align: u64) -> Result<()> {
        check_alignment(align)?;
        let len = round_up(len, align);
        if len == 0 {
            return Ok(());
        }
        trace!(loc = format_args!("{:#x}", loc), len, "register free range");
        for range in &mut self.ranges {
            if range.touches(loc, len) {
                range.merge(loc, len);
                return Ok(());
            }
        }
        self.ranges.push(ByteRange { start: loc, length: len });
        Ok(())
    }

    /// Withdraw `[loc, loc+len)` from the free set.
    ///
    /// The span must be fully covered by one free range (which is split
    /// around it) or fully disjoint from all of them (a no-op). A removal
    /// straddling a range boundary would silently truncate a foreign
    /// allocation, so it is rejected with `RangeNotOwned`.
    pub fn remove(&mut self, loc: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if let Some(pos) = self.ranges.iter().position(|r| r.contains(loc, len)) {
            let covering = self.ranges.swap_remove(pos);
            let left = ByteRange {
                start: covering.start,
                length: loc - covering.start,
            };
            let right = ByteRange {
                start: loc + len,
                length: covering.end() - (loc + len),
            };
            for fragment in [left, right] {
                if fragment.length > 0 {
                    self.ranges.push(fragment);
                }
            }
            return Ok(());
        }
        if self.ranges.iter().all(|r| r.disjoint(loc, len)) {
            return Ok(());
        }
        Err(BinweaveError::RangeNotOwned { start: loc, length: len })
    }

    /// Allocate `len` bytes (rounded up to `align`), first-fit.
    ///
    /// Scans ranges in insertion order and carves the allocation from the
    /// start of the first one that is large enough. Call [`coalesce`] first
    /// if maximal contiguous space matters.
    ///
    /// [`coalesce`]: FreeSpaceAllocator::coalesce
    pub fn alloc(&mut self, len: u64, align: u64) -> Result<u64> {
        check_alignment(align)?;
        let len = round_up(len, align);
        for (i, range) in self.ranges.iter_mut().enumerate() {
            if range.length >= len {
                let loc = range.start;
                range.start += len;
                range.length -= len;
                if range.length == 0 {
                    self.ranges.remove(i);
                }
                self.allocations += 1;
                debug!(
                    loc = format_args!("{:#x}", loc),
                    len, "assigned free range"
                );
                return Ok(loc);
            }
        }
        Err(BinweaveError::OutOfSpace { length: len })
    }

    /// Merge overlapping/adjacent ranges and drop contained ones until a
    /// fixed point is reached. Idempotent.
    pub fn coalesce(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            'scan: for i in 0..self.ranges.len() {
                for j in (i + 1)..self.ranges.len() {
                    let a = self.ranges[i];
                    let b = self.ranges[j];
                    if a.contains(b.start, b.length) {
                        self.ranges.remove(j);
                    } else if b.contains(a.start, a.length) {
                        self.ranges.remove(i);
                    } else if a.touches(b.start, b.length) {
                        self.ranges[i].merge(b.start, b.length);
                        self.ranges.remove(j);
                    } else {
                        continue;
                    }
                    changed = true;
                    break 'scan;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges_of(alloc: &FreeSpaceAllocator) -> Vec<(u64, u64)> {
        alloc.ranges().iter().map(|r| (r.start, r.length)).collect()
    }

    #[test]
    fn register_rounds_length_to_alignment() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 5, 8).unwrap();
        assert_eq!(ranges_of(&a), vec![(0x100, 8)]);
    }

    #[test]
    fn register_rejects_bad_alignment() {
        let mut a = FreeSpaceAllocator::new();
        let err = a.register(0x100, 5, 6).unwrap_err();
        assert!(matches!(err, BinweaveError::InvalidAlignment { align: 6 }));
    }

    #[test]
    fn register_merges_overlap_in_place() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 16, 1).unwrap();
        a.register(0x108, 32, 1).unwrap();
        assert_eq!(ranges_of(&a), vec![(0x100, 0x28)]);
    }

    #[test]
    fn remove_splits_covering_range() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 0x40, 1).unwrap();
        a.remove(0x110, 0x10).unwrap();
        a.coalesce();
        let mut got = ranges_of(&a);
        got.sort_unstable();
        assert_eq!(got, vec![(0x100, 0x10), (0x120, 0x20)]);
    }

    #[test]
    fn remove_at_edges_leaves_single_fragment() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 0x40, 1).unwrap();
        a.remove(0x100, 0x10).unwrap();
        assert_eq!(ranges_of(&a), vec![(0x110, 0x30)]);
        a.remove(0x130, 0x10).unwrap();
        assert_eq!(ranges_of(&a), vec![(0x110, 0x20)]);
    }

    #[test]
    fn remove_of_disjoint_span_is_noop() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 0x40, 1).unwrap();
        a.remove(0x1000, 0x10).unwrap();
        assert_eq!(ranges_of(&a), vec![(0x100, 0x40)]);
    }

    #[test]
    fn remove_straddling_boundary_is_rejected() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 0x40, 1).unwrap();
        let err = a.remove(0x130, 0x20).unwrap_err();
        assert!(matches!(
            err,
            BinweaveError::RangeNotOwned { start: 0x130, length: 0x20 }
        ));
    }

    #[test]
    fn alloc_is_first_fit_in_insertion_order() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x500, 8, 1).unwrap();
        a.register(0x100, 64, 1).unwrap();
        // 0x500 is first but too small for 16 bytes.
        assert_eq!(a.alloc(16, 1).unwrap(), 0x100);
        assert_eq!(a.alloc(8, 1).unwrap(), 0x500);
    }

    #[test]
    fn alloc_exhaustion() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 8, 1).unwrap();
        let err = a.alloc(16, 1).unwrap_err();
        assert!(matches!(err, BinweaveError::OutOfSpace { length: 16 }));
    }

    #[test]
    fn coalesce_reaches_fixed_point() {
        let mut a = FreeSpaceAllocator::new();
        // Deliberately fragmented and overlapping: remove() on a disjoint
        // region, then piecewise registrations that touch one another.
        a.register(0x100, 0x10, 1).unwrap();
        a.register(0x200, 0x10, 1).unwrap();
        a.register(0x110, 0x10, 1).unwrap();
        a.register(0x120, 0xf0, 1).unwrap();
        a.coalesce();
        assert_eq!(ranges_of(&a), vec![(0x100, 0x110)]);
        // Idempotent.
        a.coalesce();
        assert_eq!(ranges_of(&a), vec![(0x100, 0x110)]);
        for (i, r) in a.ranges().iter().enumerate() {
            for other in &a.ranges()[i + 1..] {
                assert!(r.disjoint(other.start, other.length));
                assert!(!r.touches(other.start, other.length));
            }
        }
    }

    #[test]
    fn alloc_then_register_restores_free_set() {
        let mut a = FreeSpaceAllocator::new();
        a.register(0x100, 0x80, 1).unwrap();
        a.register(0x400, 0x20, 1).unwrap();
        a.coalesce();
        let before = ranges_of(&a);

        let loc = a.alloc(0x30, 1).unwrap();
        a.register(loc, 0x30, 1).unwrap();
        a.coalesce();
        let mut after = ranges_of(&a);
        after.sort_unstable();
        let mut expected = before;
        expected.sort_unstable();
        assert_eq!(after, expected);
    }
}
