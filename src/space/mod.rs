//! Address-space translation for binary images.
//!
//! The record engine never parses container formats itself. It consumes an
//! [`AddressSpace`] capability that translates between virtual memory
//! addresses (VMAs) and raw file offsets, and answers alignment queries.
//! [`SegmentMap`] is the concrete implementation backed by an ordered list of
//! loadable segments; the `elf` submodule builds one from a real image.

pub mod elf;

use serde::{Deserialize, Serialize};

/// Translation between virtual addresses and file-relative offsets.
///
/// Implementations must be deterministic; a `None` answer means the address
/// is not backed by any file bytes and dereferencing it is an error.
pub trait AddressSpace {
    /// Translate a virtual memory address to a file offset.
    fn to_file_offset(&self, vma: u64) -> Option<u64>;

    /// Translate a file offset back to a virtual memory address.
    fn to_vma(&self, offset: u64) -> Option<u64>;

    /// Alignment in effect at a file offset, in bytes.
    fn alignment_at(&self, offset: u64) -> u32;
}

/// A single loadable segment: a contiguous file-backed region mapped at a VMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Virtual address the segment is mapped at.
    pub vma: u64,
    /// Offset of the segment's bytes within the file.
    pub file_offset: u64,
    /// Number of file-backed bytes (not the in-memory size).
    pub file_size: u64,
    /// Segment alignment in bytes.
    pub align: u64,
}

impl Segment {
    fn contains_vma(&self, vma: u64) -> bool {
        vma >= self.vma && vma < self.vma + self.file_size
    }

    fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.file_offset + self.file_size
    }
}

/// An ordered list of segments implementing [`AddressSpace`].
///
/// Lookups scan in insertion order and the first matching segment wins,
/// mirroring how loaders walk program headers. Overlapping PT_LOAD segments
/// should never happen in a well-formed image; if they do, the earlier one
/// shadows the later.
#[derive(Debug, Clone, Default)]
pub struct SegmentMap {
    segments: Vec<Segment>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl AddressSpace for SegmentMap {
    fn to_file_offset(&self, vma: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| s.contains_vma(vma))
            .map(|s| s.file_offset + (vma - s.vma))
    }

    fn to_vma(&self, offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| s.contains_offset(offset))
            .map(|s| s.vma + (offset - s.file_offset))
    }

    fn alignment_at(&self, offset: u64) -> u32 {
        let align = self
            .segments
            .iter()
            .find(|s| s.contains_offset(offset))
            .map(|s| s.align)
            .unwrap_or(1);
        if align.is_power_of_two() && align <= u64::from(u32::MAX) {
            align as u32
        } else {
            1
        }
    }
}
