//! binweave: a typed binary-record engine for executable images.
//!
//! External tools declare record layouts ("a table of 32 dialog structs at
//! VMA 0x2ff59d3") that live at fixed or pointer-indirected locations inside
//! a flat byte image. The engine reads them into an editable in-memory
//! model, lets callers mutate field values, and writes the result back
//! without corrupting the image: relocated strings go through a
//! deduplicating pool over a coalescing free-space allocator, and every
//! table discovered by following a pointer is canonicalized by the table
//! registry so the same physical data is never represented twice.
//!
//! The crate deliberately does not parse container formats beyond deriving
//! a segment map (see [`space`]), and it attaches no meaning to field
//! contents: it moves bytes and tracks address space.

pub mod alloc;
pub mod codec;
pub mod engine;
pub mod error;
pub mod logging;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod space;
pub mod strings;
pub mod table;

pub use alloc::{ByteRange, FreeSpaceAllocator};
pub use codec::{CountSpec, Endianness, IntWidth};
pub use engine::{Engine, EngineConfig, RelocationMode};
pub use error::{BinweaveError, Result};
pub use record::{FieldKind, FieldSpec, RecordInstance, RecordType};
pub use registry::{CellWarning, TableCell, TableId, TableKind, TableRegistry};
pub use snapshot::{Snapshot, SnapshotMode, SnapshotWarning};
pub use space::{AddressSpace, Segment, SegmentMap};
pub use strings::StringPool;
pub use table::Table;
