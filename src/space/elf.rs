//! Build a [`SegmentMap`] from a real executable image.
//!
//! Uses the `object` crate to walk the loadable segments of an ELF (or any
//! other format `object` understands) and records their VMA/file-offset
//! mapping. This is the only place in the crate that knows about container
//! formats; everything else sees the [`AddressSpace`] trait.
//!
//! [`AddressSpace`]: crate::space::AddressSpace

use crate::codec::Endianness;
use crate::error::{BinweaveError, Result};
use crate::space::{Segment, SegmentMap};
use object::{Object, ObjectSegment};
use tracing::debug;

/// Parse `data` as an executable image and collect its loadable segments.
///
/// Segments with no file-backed bytes (pure BSS) are skipped: the engine can
/// only edit bytes that exist in the file. Alignment values that are not a
/// power of two are normalized to 1.
pub fn load_segments(data: &[u8]) -> Result<SegmentMap> {
    let file =
        object::File::parse(data).map_err(|e| BinweaveError::InvalidImage(e.to_string()))?;

    let mut map = SegmentMap::new();
    for segment in file.segments() {
        let (file_offset, file_size) = segment.file_range();
        if file_size == 0 {
            continue;
        }
        let align = segment.align();
        let align = if align.is_power_of_two() { align } else { 1 };
        debug!(
            vma = format_args!("{:#x}", segment.address()),
            file_offset = format_args!("{:#x}", file_offset),
            file_size,
            align,
            "mapped segment"
        );
        map.push(Segment {
            vma: segment.address(),
            file_offset,
            file_size,
            align,
        });
    }

    if map.segments().is_empty() {
        return Err(BinweaveError::InvalidImage(
            "image has no file-backed loadable segments".into(),
        ));
    }
    Ok(map)
}

/// Byte order declared by the image's own header.
pub fn detect_endianness(data: &[u8]) -> Result<Endianness> {
    let file =
        object::File::parse(data).map_err(|e| BinweaveError::InvalidImage(e.to_string()))?;
    Ok(if file.is_little_endian() {
        Endianness::Little
    } else {
        Endianness::Big
    })
}
