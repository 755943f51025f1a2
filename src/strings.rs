//! Deduplicating string storage over the free-space allocator.
//!
//! String content (exact byte sequence, no terminator) maps to a single
//! allocated address: identical content written by many records shares one
//! copy. The allocator is consulted only on the first occurrence. `reserve`
//! is the read-side counterpart that marks existing string storage as
//! reusable without allocating.

use crate::alloc::FreeSpaceAllocator;
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Deduplicating string allocator.
#[derive(Debug, Default)]
pub struct StringPool {
    by_content: HashMap<Vec<u8>, u64>,
    reserved: HashSet<u64>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of `bytes` in the image, allocating on first occurrence.
    ///
    /// The allocation covers the content plus its NUL terminator, rounded up
    /// to `align`. Propagates `OutOfSpace` from the allocator.
    pub fn allocate(
        &mut self,
        alloc: &mut FreeSpaceAllocator,
        bytes: &[u8],
        align: u64,
    ) -> Result<u64> {
        if let Some(&loc) = self.by_content.get(bytes) {
            trace!(loc = format_args!("{:#x}", loc), "string pool hit");
            return Ok(loc);
        }
        let loc = alloc.alloc(bytes.len() as u64 + 1, align)?;
        self.by_content.insert(bytes.to_vec(), loc);
        Ok(loc)
    }

    /// Mark existing string storage at `address` as free for reuse.
    ///
    /// Idempotent per distinct address; repeated reservations of the same
    /// location do not touch the allocator again.
    pub fn reserve(
        &mut self,
        alloc: &mut FreeSpaceAllocator,
        address: u64,
        bytes: &[u8],
        align: u64,
    ) -> Result<()> {
        if !self.reserved.insert(address) {
            return Ok(());
        }
        alloc.register(address, bytes.len() as u64 + 1, align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_shares_one_allocation() {
        let mut alloc = FreeSpaceAllocator::new();
        alloc.register(0x1000, 0x100, 1).unwrap();
        let mut pool = StringPool::new();

        let a = pool.allocate(&mut alloc, b"village", 8).unwrap();
        let b = pool.allocate(&mut alloc, b"village", 8).unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.alloc_count(), 1);

        let c = pool.allocate(&mut alloc, b"castle", 8).unwrap();
        assert_ne!(a, c);
        assert_eq!(alloc.alloc_count(), 2);
    }

    #[test]
    fn reserve_is_idempotent_per_address() {
        let mut alloc = FreeSpaceAllocator::new();
        let mut pool = StringPool::new();
        pool.reserve(&mut alloc, 0x2000, b"inn", 8).unwrap();
        pool.reserve(&mut alloc, 0x2000, b"inn", 8).unwrap();
        assert_eq!(alloc.ranges().len(), 1);
        assert_eq!(alloc.ranges()[0].start, 0x2000);
    }

    #[test]
    fn out_of_space_propagates() {
        let mut alloc = FreeSpaceAllocator::new();
        let mut pool = StringPool::new();
        let err = pool.allocate(&mut alloc, b"too big", 8).unwrap_err();
        assert!(matches!(err, crate::error::BinweaveError::OutOfSpace { .. }));
    }
}
