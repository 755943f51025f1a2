//! Engine: composition root over one byte image.
//!
//! The engine owns the image bytes, the segment map, the record-type
//! registry, the free-space allocator, the string pool and the table
//! registry, and wires them together for `read`/`write` passes. It holds
//! exclusive access to the image for the duration of a call: the design is
//! single-threaded and takes no locks. A `write` that fails partway leaves
//! the image in an undefined state; callers wanting atomicity should operate
//! on a scratch copy and promote it afterwards (`into_image` supports that).

use crate::alloc::FreeSpaceAllocator;
use crate::codec::Endianness;
use crate::error::{BinweaveError, Result};
use crate::record::{RecordType, TypeRegistry};
use crate::registry::{CellWarning, TableId, TableRegistry};
use crate::space::{elf, AddressSpace, SegmentMap};
use crate::strings::StringPool;
use crate::table::Table;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Whether discovered data may move to fresh addresses on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationMode {
    /// Everything round-trips through its original address.
    InPlace,
    /// Relocatable string fields are re-placed through the string pool.
    Strings,
}

/// Explicit engine configuration, threaded through every operation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Byte order of encoded fields and pointers.
    pub endianness: Endianness,
    /// Relocation policy for write passes.
    pub relocation: RelocationMode,
    /// Alignment for freshly allocated strings, in bytes.
    pub string_align: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endianness: Endianness::Little,
            relocation: RelocationMode::Strings,
            string_align: 8,
        }
    }
}

impl EngineConfig {
    pub(crate) fn relocate_strings(&self) -> bool {
        self.relocation == RelocationMode::Strings
    }
}

/// Borrowed view over the engine's collaborators for one read/write pass.
pub(crate) struct OpCtx<'a> {
    pub image: &'a mut [u8],
    pub space: &'a dyn AddressSpace,
    pub types: &'a TypeRegistry,
    pub alloc: &'a mut FreeSpaceAllocator,
    pub strings: &'a mut StringPool,
    pub config: &'a EngineConfig,
}

impl OpCtx<'_> {
    /// Borrow `len` bytes at file offset `off`.
    pub fn read_at(&self, off: u64, len: usize) -> Result<&[u8]> {
        let start = usize::try_from(off)
            .map_err(|_| BinweaveError::AddressNotReachable { address: off })?;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.image.len())
            .ok_or(BinweaveError::AddressNotReachable { address: off })?;
        Ok(&self.image[start..end])
    }

    /// Overwrite bytes at file offset `off`.
    pub fn write_at(&mut self, off: u64, bytes: &[u8]) -> Result<()> {
        let start = usize::try_from(off)
            .map_err(|_| BinweaveError::AddressNotReachable { address: off })?;
        let end = start
            .checked_add(bytes.len())
            .filter(|&e| e <= self.image.len())
            .ok_or(BinweaveError::AddressNotReachable { address: off })?;
        self.image[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Bytes from `off` up to (not including) the next NUL terminator.
    pub fn read_cstr_at(&self, off: u64) -> Result<&[u8]> {
        let start = usize::try_from(off)
            .map_err(|_| BinweaveError::AddressNotReachable { address: off })?;
        if start >= self.image.len() {
            return Err(BinweaveError::AddressNotReachable { address: off });
        }
        let tail = &self.image[start..];
        let nul = memchr::memchr(0, tail)
            .ok_or(BinweaveError::AddressNotReachable { address: off })?;
        Ok(&tail[..nul])
    }

    /// Translate a VMA to a file offset or fail with `AddressNotReachable`.
    pub fn deref_vma(&self, vma: u64) -> Result<u64> {
        self.space
            .to_file_offset(vma)
            .ok_or(BinweaveError::AddressNotReachable { address: vma })
    }
}

/// The binary-object engine over one image.
pub struct Engine {
    image: Vec<u8>,
    image_name: String,
    space: SegmentMap,
    types: TypeRegistry,
    alloc: FreeSpaceAllocator,
    strings: StringPool,
    registry: TableRegistry,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine over raw image bytes and a prepared segment map.
    pub fn new(image: Vec<u8>, space: SegmentMap, config: EngineConfig) -> Self {
        Self {
            image,
            image_name: String::new(),
            space,
            types: TypeRegistry::new(),
            alloc: FreeSpaceAllocator::new(),
            strings: StringPool::new(),
            registry: TableRegistry::new(),
            config,
        }
    }

    /// Load an executable image from disk, deriving the segment map from its
    /// program headers. The image's own byte order takes precedence over
    /// `config.endianness`.
    pub fn open_image(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let image = std::fs::read(path)?;
        let space = elf::load_segments(&image)?;
        let mut config = config;
        config.endianness = elf::detect_endianness(&image)?;
        info!(path = %path.display(), size = image.len(), "opened image");
        let mut engine = Self::new(image, space, config);
        engine.image_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(engine)
    }

    /// Name the image for snapshot identity checks.
    pub fn set_image_name(&mut self, name: impl Into<String>) {
        self.image_name = name.into();
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Register a record type; reference fields of other types may name it
    /// afterwards.
    pub fn define_record(&mut self, ty: RecordType) -> Result<Arc<RecordType>> {
        self.types.define(ty)
    }

    /// Declare an explicit, immovable table of `count` records at `vma`.
    pub fn declare_table(
        &mut self,
        name: &str,
        vma: u64,
        count: u64,
        type_name: &str,
    ) -> Result<TableId> {
        let ty = self.types.get(type_name)?;
        self.registry.declare_primary(name, vma, ty, count)
    }

    /// Read every declared table (and everything their pointers reach),
    /// then coalesce the reclaimed free space.
    pub fn read(&mut self) -> Result<()> {
        let mut ctx = OpCtx {
            image: &mut self.image,
            space: &self.space,
            types: &self.types,
            alloc: &mut self.alloc,
            strings: &mut self.strings,
            config: &self.config,
        };
        self.registry.read_all(&mut ctx)?;
        self.alloc.coalesce();
        Ok(())
    }

    /// Write every table back into the image.
    pub fn write(&mut self) -> Result<()> {
        self.alloc.coalesce();
        let mut ctx = OpCtx {
            image: &mut self.image,
            space: &self.space,
            types: &self.types,
            alloc: &mut self.alloc,
            strings: &mut self.strings,
            config: &self.config,
        };
        self.registry.write_all(&mut ctx)
    }

    /// The configuration in effect, including any byte order taken from the
    /// image itself.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut TableRegistry {
        &mut self.registry
    }

    pub(crate) fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub(crate) fn allocator_mut(&mut self) -> &mut FreeSpaceAllocator {
        &mut self.alloc
    }

    pub fn allocator(&self) -> &FreeSpaceAllocator {
        &self.alloc
    }

    /// Donate a byte region of the image to the free-space pool, making it
    /// available to relocated strings on the next write.
    pub fn register_free(&mut self, loc: u64, len: u64, align: u64) -> Result<()> {
        self.alloc.register(loc, len, align)
    }

    /// Materialized table for an identity, if it is a whole cell.
    pub fn table(&self, id: &TableId) -> Option<&Table> {
        self.registry.table(id)
    }

    pub fn table_mut(&mut self, id: &TableId) -> Option<&mut Table> {
        self.registry.table_mut(id)
    }

    /// All structured warnings accumulated across cells.
    pub fn warnings(&self) -> impl Iterator<Item = (&TableId, &CellWarning)> {
        self.registry.warnings()
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Surrender the (possibly edited) image bytes.
    pub fn into_image(self) -> Vec<u8> {
        self.image
    }
}
