//! Snapshot persistence: the save/load contract over the table registry.
//!
//! A [`Snapshot`] is the external, serde-backed representation of everything
//! the registry knows: per cell its identity, kind, location, count, record
//! type and ordered field values, plus the free-range list. Reference fields
//! export as an inline subtree when the target is uniquely owned (a `Single`
//! cell with one reference) and as a named cross-reference otherwise.
//!
//! The header carries the image name and a sha256 digest so a snapshot can
//! be checked against the image it is applied to. Mismatches are reported as
//! warnings, or abort the load in strict mode.

use crate::alloc::ByteRange;
use crate::codec::{sign_extend, CodecState};
use crate::engine::Engine;
use crate::error::{BinweaveError, Result};
use crate::record::{RecordInstance, RecordType};
use crate::registry::{TableCell, TableId, TableKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// How identity mismatches between snapshot and image are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Mismatches become warnings in the returned list.
    Lenient,
    /// Mismatches abort the load.
    Strict,
}

/// Non-fatal findings from applying a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotWarning {
    NameMismatch { expected: String, actual: String },
    VersionMismatch { expected: String, actual: String },
}

/// Hex sha256 fingerprint of an image, used as its snapshot version.
pub fn image_digest(image: &[u8]) -> String {
    hex::encode(Sha256::digest(image))
}

/// Serialized string content: UTF-8 text when possible, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringRepr {
    Text(String),
    Bytes(Vec<u8>),
}

impl StringRepr {
    fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => StringRepr::Text(text.to_string()),
            Err(_) => StringRepr::Bytes(bytes.to_vec()),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            StringRepr::Text(text) => text.clone().into_bytes(),
            StringRepr::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// One exported field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSnapshot {
    /// Signed integer field, sign-extended element values.
    Ints(Vec<i64>),
    /// Unsigned integer field, zero-extended element values.
    Uints(Vec<u64>),
    /// C-string field: pointer value plus content (`None` = null sentinel).
    Str { addr: u32, text: Option<StringRepr> },
    /// Uniquely owned sub-table, embedded in place.
    RefInline(Box<TableSnapshot>),
    /// Cross-reference to another cell's identity.
    RefNamed(String),
    /// Reference that was never resolved; the raw pointer round-trips.
    RefRaw(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub name: String,
    pub value: ValueSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub fields: Vec<FieldSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum KindSnapshot {
    Primary,
    Single,
    Partial { parent: String, index: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub identity: String,
    #[serde(flatten)]
    pub kind: KindSnapshot,
    pub location: u64,
    pub count: u64,
    pub record_type: String,
    pub ref_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<RecordSnapshot>,
}

/// Complete external representation of an engine's table state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub image_name: String,
    pub image_digest: String,
    pub tables: Vec<TableSnapshot>,
    pub free_ranges: Vec<ByteRange>,
}

impl Snapshot {
    /// Export the engine's registry content.
    pub fn capture(engine: &Engine) -> Result<Self> {
        let registry = engine.registry();
        // Uniquely owned singles are embedded at their referencing field and
        // omitted from the top level.
        let embedded: HashSet<&TableId> = registry
            .cells()
            .iter()
            .filter(|c| c.kind() == &TableKind::Single && c.ref_count() == 1)
            .map(|c| c.id())
            .collect();

        let mut tables = Vec::new();
        for cell in registry.cells() {
            if embedded.contains(cell.id()) {
                continue;
            }
            tables.push(snapshot_cell(engine, cell, &embedded)?);
        }
        Ok(Self {
            image_name: engine.image_name().to_string(),
            image_digest: image_digest(engine.image()),
            tables,
            free_ranges: engine.allocator().ranges().to_vec(),
        })
    }

    /// Map the snapshot back into the engine: declare missing cells, then
    /// replace entry values. Returns identity-check warnings; in strict mode
    /// those abort instead.
    pub fn apply(&self, engine: &mut Engine, mode: SnapshotMode) -> Result<Vec<SnapshotWarning>> {
        let mut warnings = Vec::new();

        let actual = image_digest(engine.image());
        if self.image_digest != actual {
            if mode == SnapshotMode::Strict {
                return Err(BinweaveError::VersionMismatch {
                    expected: self.image_digest.clone(),
                    actual,
                });
            }
            warn!("snapshot was captured against a different image revision");
            warnings.push(SnapshotWarning::VersionMismatch {
                expected: self.image_digest.clone(),
                actual,
            });
        }
        if self.image_name != engine.image_name() {
            if mode == SnapshotMode::Strict {
                return Err(BinweaveError::NameMismatch {
                    expected: self.image_name.clone(),
                    actual: engine.image_name().to_string(),
                });
            }
            warn!(
                expected = %self.image_name,
                actual = %engine.image_name(),
                "snapshot image name mismatch"
            );
            warnings.push(SnapshotWarning::NameMismatch {
                expected: self.image_name.clone(),
                actual: engine.image_name().to_string(),
            });
        }

        for range in &self.free_ranges {
            engine.allocator_mut().register(range.start, range.length, 1)?;
        }
        engine.allocator_mut().coalesce();

        for table in &self.tables {
            apply_table(engine, table)?;
        }
        Ok(warnings)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

fn snapshot_cell(
    engine: &Engine,
    cell: &TableCell,
    embedded: &HashSet<&TableId>,
) -> Result<TableSnapshot> {
    let kind = match cell.kind() {
        TableKind::Primary => KindSnapshot::Primary,
        TableKind::Single => KindSnapshot::Single,
        TableKind::Partial { parent, index } => KindSnapshot::Partial {
            parent: parent.to_string(),
            index: *index,
        },
    };
    let mut entries = Vec::new();
    if let Some(table) = cell.table() {
        for entry in table.entries() {
            entries.push(snapshot_record(engine, entry, embedded)?);
        }
    }
    Ok(TableSnapshot {
        identity: cell.id().to_string(),
        kind,
        location: cell.location(),
        count: cell.count(),
        record_type: cell.record_type().name().to_string(),
        ref_count: cell.ref_count(),
        entries,
    })
}

fn snapshot_record(
    engine: &Engine,
    inst: &RecordInstance,
    embedded: &HashSet<&TableId>,
) -> Result<RecordSnapshot> {
    let mut fields = Vec::new();
    for (spec, state) in inst.record_type().fields().iter().zip(inst.states()) {
        let value = match state {
            CodecState::Int(c) if c.signed => {
                ValueSnapshot::Ints(c.values.iter().map(|&v| sign_extend(v, c.width)).collect())
            }
            CodecState::Int(c) => ValueSnapshot::Uints(c.values.clone()),
            CodecState::CStr(c) => ValueSnapshot::Str {
                addr: c.addr,
                text: c.bytes.as_deref().map(StringRepr::from_bytes),
            },
            CodecState::Ref(c) => match &c.target {
                Some(id) if embedded.contains(id) => {
                    let cell = engine
                        .registry()
                        .cell(id)
                        .ok_or_else(|| BinweaveError::UnknownTable(id.to_string()))?;
                    ValueSnapshot::RefInline(Box::new(snapshot_cell(engine, cell, embedded)?))
                }
                Some(id) => ValueSnapshot::RefNamed(id.to_string()),
                None => ValueSnapshot::RefRaw(c.raw),
            },
        };
        fields.push(FieldSnapshot {
            name: spec.name.clone(),
            value,
        });
    }
    Ok(RecordSnapshot { fields })
}

fn apply_table(engine: &mut Engine, snap: &TableSnapshot) -> Result<TableId> {
    let ty = engine.types().get(&snap.record_type)?;
    let id = TableId::new(&snap.identity);
    let kind = match &snap.kind {
        KindSnapshot::Primary => TableKind::Primary,
        KindSnapshot::Single => TableKind::Single,
        KindSnapshot::Partial { parent, index } => TableKind::Partial {
            parent: TableId::new(parent),
            index: *index,
        },
    };
    if engine.registry().cell(&id).is_none() {
        debug!(id = %id, "restoring cell from snapshot");
        engine.registry_mut().insert_cell(TableCell::restored(
            id.clone(),
            kind.clone(),
            snap.location,
            snap.count,
            ty.clone(),
            snap.ref_count,
        ))?;
    }
    if matches!(kind, TableKind::Partial { .. }) {
        return Ok(id);
    }

    let mut entries = Vec::with_capacity(snap.entries.len());
    for record in &snap.entries {
        entries.push(build_record(engine, &ty, record)?);
    }
    let table = engine
        .registry_mut()
        .table_mut(&id)
        .ok_or_else(|| BinweaveError::UnknownTable(id.to_string()))?;
    table.set_entries(entries)?;
    Ok(id)
}

fn build_record(
    engine: &mut Engine,
    ty: &Arc<RecordType>,
    snap: &RecordSnapshot,
) -> Result<RecordInstance> {
    let mut inst = RecordInstance::new(ty.clone());
    for field in &snap.fields {
        // Inline subtrees restore their cell before the field is assigned.
        let inline_id = match &field.value {
            ValueSnapshot::RefInline(sub) => Some(apply_table(engine, sub)?),
            _ => None,
        };
        let idx = ty
            .fields()
            .iter()
            .position(|f| f.name == field.name)
            .ok_or_else(|| BinweaveError::UnknownField {
                record: ty.name().to_string(),
                field: field.name.clone(),
            })?;
        let mismatch = || BinweaveError::FieldMismatch {
            record: ty.name().to_string(),
            field: field.name.clone(),
        };
        match (&field.value, &mut inst.states_mut()[idx]) {
            (ValueSnapshot::Ints(vs), CodecState::Int(c)) => {
                c.values = vs.iter().map(|&v| v as u64).collect();
            }
            (ValueSnapshot::Uints(vs), CodecState::Int(c)) => {
                c.values = vs.clone();
            }
            (ValueSnapshot::Str { addr, text }, CodecState::CStr(c)) => {
                c.addr = *addr;
                c.bytes = text.as_ref().map(StringRepr::to_bytes);
            }
            (ValueSnapshot::RefInline(_), CodecState::Ref(c)) => {
                c.target = inline_id;
            }
            (ValueSnapshot::RefNamed(name), CodecState::Ref(c)) => {
                c.target = Some(TableId::new(name));
            }
            (ValueSnapshot::RefRaw(raw), CodecState::Ref(c)) => {
                c.raw = *raw;
                c.target = None;
            }
            _ => return Err(mismatch()),
        }
    }
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_repr_prefers_text() {
        assert_eq!(
            StringRepr::from_bytes(b"hello"),
            StringRepr::Text("hello".into())
        );
        let raw = StringRepr::from_bytes(&[0xff, 0x20]);
        assert_eq!(raw, StringRepr::Bytes(vec![0xff, 0x20]));
        assert_eq!(raw.to_bytes(), vec![0xff, 0x20]);
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = image_digest(b"abc");
        assert_eq!(d.len(), 64);
        assert_eq!(d, image_digest(b"abc"));
        assert_ne!(d, image_digest(b"abd"));
    }
}
