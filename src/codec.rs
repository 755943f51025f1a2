//! Field codec set: the closed family of per-field parsers/serializers.
//!
//! Three codec shapes cover every declarable field: fixed-width integers
//! (8/16/32/64-bit, signed or unsigned, as flat arrays), pointers to
//! NUL-terminated C strings, and pointers to sub-tables. Dispatch is static
//! over the [`CodecState`] enum; there is no per-field trait object.
//!
//! String and table pointers are 4-byte VMAs. A zero string pointer is the
//! null-string sentinel and is never dereferenced. Sub-table pointers are
//! read raw on the first pass; resolving them into live tables is deferred
//! until the owning record's direct fields are populated (see the record
//! module for the two-phase protocol).

use crate::engine::OpCtx;
use crate::error::{BinweaveError, Result};
use crate::registry::{TableId, TableRegistry};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Byte order of the image's encoded fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Width of a fixed-size integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub fn bytes(self) -> u64 {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }
}

/// Decode one integer from `bytes` (its length is the width), zero-extended
/// into raw bits.
fn decode_raw(bytes: &[u8], endian: Endianness) -> u64 {
    let mut value: u64 = 0;
    match endian {
        Endianness::Little => {
            for (i, b) in bytes.iter().enumerate() {
                value |= u64::from(*b) << (8 * i);
            }
        }
        Endianness::Big => {
            for b in bytes {
                value = (value << 8) | u64::from(*b);
            }
        }
    }
    value
}

/// Encode the low `width` bytes of `value` into `out`.
fn encode_raw(value: u64, width: IntWidth, endian: Endianness, out: &mut Vec<u8>) {
    let n = width.bytes() as usize;
    match endian {
        Endianness::Little => {
            for i in 0..n {
                out.push((value >> (8 * i)) as u8);
            }
        }
        Endianness::Big => {
            for i in (0..n).rev() {
                out.push((value >> (8 * i)) as u8);
            }
        }
    }
}

/// Sign-extend raw bits of the given width into an i64.
pub(crate) fn sign_extend(raw: u64, width: IntWidth) -> i64 {
    let shift = 64 - 8 * width.bytes() as u32;
    ((raw << shift) as i64) >> shift
}

/// Fixed-width integer array codec.
///
/// Values are stored as width-truncated raw bits; signedness only matters
/// for accessors and the snapshot representation.
#[derive(Debug, Clone)]
pub struct IntCodec {
    pub width: IntWidth,
    pub signed: bool,
    pub count: u64,
    pub values: Vec<u64>,
}

impl IntCodec {
    pub fn new(width: IntWidth, signed: bool, count: u64) -> Self {
        Self {
            width,
            signed,
            count,
            values: Vec::new(),
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.width.bytes() * self.count
    }

    pub(crate) fn read(&mut self, ctx: &OpCtx<'_>, at: u64) -> Result<()> {
        let w = self.width.bytes() as usize;
        let endian = ctx.config.endianness;
        let raw = ctx.read_at(at, w * self.count as usize)?;
        self.values = raw
            .chunks_exact(w)
            .map(|chunk| decode_raw(chunk, endian))
            .collect();
        Ok(())
    }

    pub(crate) fn write(&self, ctx: &mut OpCtx<'_>, at: u64) -> Result<()> {
        if self.values.len() as u64 != self.count {
            return Err(BinweaveError::SizeMismatch {
                expected: self.count,
                actual: self.values.len() as u64,
            });
        }
        let endian = ctx.config.endianness;
        let mut out = Vec::with_capacity(self.byte_size() as usize);
        for &v in &self.values {
            encode_raw(v, self.width, endian, &mut out);
        }
        ctx.write_at(at, &out)
    }
}

/// Pointer-to-C-string codec.
///
/// `addr` keeps the most recently read or written pointer value; `bytes` is
/// the dereferenced content without terminator, or `None` for the null
/// sentinel.
#[derive(Debug, Clone)]
pub struct CStrCodec {
    pub relocatable: bool,
    pub addr: u32,
    pub bytes: Option<Vec<u8>>,
}

impl CStrCodec {
    pub fn new(relocatable: bool) -> Self {
        Self {
            relocatable,
            addr: 0,
            bytes: None,
        }
    }

    pub fn byte_size(&self) -> u64 {
        4
    }

    pub(crate) fn read(&mut self, ctx: &mut OpCtx<'_>, at: u64) -> Result<()> {
        self.addr = read_ptr(ctx, at)?;
        if self.addr == 0 {
            self.bytes = None;
            return Ok(());
        }
        let off = ctx.deref_vma(u64::from(self.addr))?;
        let content = ctx.read_cstr_at(off)?.to_vec();
        trace!(
            vma = format_args!("{:#x}", self.addr),
            len = content.len(),
            "fetched string"
        );
        if self.relocatable && ctx.config.relocate_strings() {
            let align = u64::from(ctx.space.alignment_at(off));
            ctx.strings.reserve(ctx.alloc, off, &content, align)?;
        }
        self.bytes = Some(content);
        Ok(())
    }

    pub(crate) fn write(&mut self, ctx: &mut OpCtx<'_>, at: u64) -> Result<()> {
        let Some(content) = self.bytes.clone() else {
            self.addr = 0;
            return write_ptr(ctx, at, 0);
        };
        let off = if self.relocatable && ctx.config.relocate_strings() {
            ctx.strings
                .allocate(ctx.alloc, &content, ctx.config.string_align)?
        } else {
            // Pinned strings must still land at their original address.
            ctx.deref_vma(u64::from(self.addr))?
        };
        let mut stored = content;
        stored.push(0);
        ctx.write_at(off, &stored)?;
        let vma = ctx
            .space
            .to_vma(off)
            .ok_or(BinweaveError::AddressNotReachable { address: off })?;
        self.addr = vma as u32;
        write_ptr(ctx, at, self.addr)
    }
}

/// How many elements a referenced sub-table holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountSpec {
    /// Declared constant.
    Fixed(u64),
    /// Taken from another field of the same record.
    Field(String),
}

/// Sub-table reference codec.
///
/// The first read pass captures only the raw pointer; `target` is filled in
/// by the deferred pass once the registry has resolved a canonical identity.
#[derive(Debug, Clone)]
pub struct RefCodec {
    pub target_type: String,
    pub count: CountSpec,
    pub raw: u32,
    pub target: Option<TableId>,
}

impl RefCodec {
    pub fn new(target_type: String, count: CountSpec) -> Self {
        Self {
            target_type,
            count,
            raw: 0,
            target: None,
        }
    }

    pub fn byte_size(&self) -> u64 {
        4
    }

    pub(crate) fn read(&mut self, ctx: &OpCtx<'_>, at: u64) -> Result<()> {
        self.raw = read_ptr(ctx, at)?;
        self.target = None;
        Ok(())
    }

    pub(crate) fn write(
        &self,
        ctx: &mut OpCtx<'_>,
        registry: &TableRegistry,
        at: u64,
    ) -> Result<()> {
        let vma = match &self.target {
            Some(id) => registry.target_vma(id)?,
            None => u64::from(self.raw),
        };
        write_ptr(ctx, at, vma as u32)
    }
}

fn read_ptr(ctx: &OpCtx<'_>, at: u64) -> Result<u32> {
    let raw = ctx.read_at(at, 4)?;
    let bytes = [raw[0], raw[1], raw[2], raw[3]];
    Ok(match ctx.config.endianness {
        Endianness::Little => u32::from_le_bytes(bytes),
        Endianness::Big => u32::from_be_bytes(bytes),
    })
}

fn write_ptr(ctx: &mut OpCtx<'_>, at: u64, value: u32) -> Result<()> {
    let bytes = match ctx.config.endianness {
        Endianness::Little => value.to_le_bytes(),
        Endianness::Big => value.to_be_bytes(),
    };
    ctx.write_at(at, &bytes)
}

/// Closed set of codec variants; one per declared field.
#[derive(Debug, Clone)]
pub enum CodecState {
    Int(IntCodec),
    CStr(CStrCodec),
    Ref(RefCodec),
}

impl CodecState {
    pub fn byte_size(&self) -> u64 {
        match self {
            CodecState::Int(c) => c.byte_size(),
            CodecState::CStr(c) => c.byte_size(),
            CodecState::Ref(c) => c.byte_size(),
        }
    }
}
