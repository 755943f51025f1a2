//! Error types for the binweave record engine.
//!
//! This module provides structured error handling using thiserror. All
//! fallible operations in the crate return [`Result`], and the variants map
//! one-to-one onto the failure modes of the allocator, the codec set, the
//! table registry and the snapshot layer.

use thiserror::Error;

/// Main error type for binweave operations.
#[derive(Debug, Error)]
pub enum BinweaveError {
    /// An alignment argument was not a power of two.
    #[error("invalid alignment: {align} is not a power of two")]
    InvalidAlignment { align: u64 },

    /// A removal straddles the boundary of a free range.
    #[error("range {start:#x}+{length:#x} is not owned by the free-space set")]
    RangeNotOwned { start: u64, length: u64 },

    /// The free-space allocator has no range large enough.
    #[error("out of free space: no range can hold {length} byte(s)")]
    OutOfSpace { length: u64 },

    /// A dereference fell outside every defined segment or outside the image.
    #[error("address not reachable: {address:#x}")]
    AddressNotReachable { address: u64 },

    /// Declared element count does not match the materialized entries.
    #[error("size mismatch: expected {expected} entries, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// An explicit declaration collides with an incompatible implicit cell.
    #[error("identity conflict for {identity:?} at {location:#x}")]
    IdentityConflict { identity: String, location: u64 },

    /// Snapshot was captured against a different image revision.
    #[error("image version mismatch: snapshot has {expected}, image has {actual}")]
    VersionMismatch { expected: String, actual: String },

    /// Snapshot was captured against a differently named image.
    #[error("image name mismatch: snapshot has {expected:?}, image has {actual:?}")]
    NameMismatch { expected: String, actual: String },

    /// The byte image could not be parsed as a supported container format.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A record type declaration is malformed.
    #[error("invalid record type {record:?}: {reason}")]
    InvalidRecordType { record: String, reason: String },

    /// A record type name is not registered.
    #[error("unknown record type: {0}")]
    UnknownType(String),

    /// A field name is not declared by the record type.
    #[error("record type {record:?} has no field {field:?}")]
    UnknownField { record: String, field: String },

    /// A field exists but was accessed with the wrong kind or arity.
    #[error("field {field:?} of {record:?} does not match the requested access")]
    FieldMismatch { record: String, field: String },

    /// A table identity is not present in the registry.
    #[error("unknown table identity: {0}")]
    UnknownTable(String),

    /// File I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BinweaveError {
    fn from(err: serde_json::Error) -> Self {
        BinweaveError::Serialization(err.to_string())
    }
}

/// Result type alias for binweave operations.
pub type Result<T> = std::result::Result<T, BinweaveError>;
