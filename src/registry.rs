//! Canonical table identities and pointer resolution.
//!
//! The registry exclusively owns every [`TableCell`]; record instances hold
//! only borrowed [`TableId`] keys, so the pointer graph can never form an
//! ownership cycle. Tables are discovered two ways: explicitly declared
//! (`Primary`, immovable) or implicitly through a pointer field (`Single`,
//! relocatable, or `Partial` when the pointer lands inside a known table's
//! element range). The same physical record array is never represented
//! twice: explicit declarations always win identity collisions over
//! implicit discovery.

use crate::engine::OpCtx;
use crate::error::{BinweaveError, Result};
use crate::record::RecordType;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Naming prefix for implicitly discovered tables.
const IMPLICIT_PREFIX: &str = "implicit_";

/// Borrowable identity key of a table cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of a cell. Terminal: a cell never changes kind, only its
/// reference count moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKind {
    /// Explicitly declared before any read; immovable; always fully
    /// materialized.
    Primary,
    /// Discovered through a pointer; materialized eagerly at discovery;
    /// relocatable.
    Single,
    /// A pointer target inside an existing table's element range. Owns no
    /// bytes of its own.
    Partial { parent: TableId, index: u64 },
}

/// Structured warning attached to a cell instead of silently degrading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellWarning {
    /// A read stopped early; only `read` of `declared` entries materialized.
    RecordTruncated { read: u64, declared: u64 },
    /// An explicit declaration landed on this already-discovered cell.
    IdentityConflict { declared: String },
}

/// One canonical table plus its bookkeeping.
#[derive(Debug)]
pub struct TableCell {
    id: TableId,
    kind: TableKind,
    location: u64,
    count: u64,
    ty: Arc<RecordType>,
    ref_count: u32,
    warnings: Vec<CellWarning>,
    // None for partial cells, or while the table is checked out during a
    // read/write pass.
    table: Option<Table>,
}

impl TableCell {
    pub fn id(&self) -> &TableId {
        &self.id
    }

    pub fn kind(&self) -> &TableKind {
        &self.kind
    }

    /// VMA of the table start (for partial cells, of the element).
    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.ty
    }

    /// Number of pointer-field discoveries of this cell. Zero for a primary
    /// nothing has pointed at yet.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn warnings(&self) -> &[CellWarning] {
        &self.warnings
    }

    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    pub fn table_mut(&mut self) -> Option<&mut Table> {
        self.table.as_mut()
    }

    pub(crate) fn restored(
        id: TableId,
        kind: TableKind,
        location: u64,
        count: u64,
        ty: Arc<RecordType>,
        ref_count: u32,
    ) -> Self {
        let table = match kind {
            TableKind::Partial { .. } => None,
            _ => Some(Table::new(location, count, ty.clone())),
        };
        Self {
            id,
            kind,
            location,
            count,
            ty,
            ref_count,
            warnings: Vec::new(),
            table,
        }
    }
}

enum PrimaryHit {
    Whole(usize),
    Partial { parent: usize, index: u64 },
}

/// Owner of all table cells; canonicalizes tables by location, record type
/// and count.
#[derive(Debug, Default)]
pub struct TableRegistry {
    cells: Vec<TableCell>,
    by_id: HashMap<TableId, usize>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cells(&self) -> &[TableCell] {
        &self.cells
    }

    pub fn cell(&self, id: &TableId) -> Option<&TableCell> {
        self.by_id.get(id).map(|&i| &self.cells[i])
    }

    pub fn cell_mut(&mut self, id: &TableId) -> Option<&mut TableCell> {
        self.by_id.get(id).copied().map(move |i| &mut self.cells[i])
    }

    /// Materialized table of a whole cell; `None` for partials.
    pub fn table(&self, id: &TableId) -> Option<&Table> {
        self.cell(id).and_then(TableCell::table)
    }

    pub fn table_mut(&mut self, id: &TableId) -> Option<&mut Table> {
        self.cell_mut(id).and_then(TableCell::table_mut)
    }

    /// All structured warnings, paired with the owning cell's identity.
    pub fn warnings(&self) -> impl Iterator<Item = (&TableId, &CellWarning)> {
        self.cells
            .iter()
            .flat_map(|c| c.warnings.iter().map(move |w| (&c.id, w)))
    }

    /// Insert an explicitly declared, immovable table.
    ///
    /// Fails with `IdentityConflict` when the name is taken or when an
    /// implicit cell already covers `location` with an incompatible count or
    /// type. A fully compatible implicit cell keeps its identity; the
    /// collision is recorded as a warning on it and its id is returned, so
    /// the caller never ends up with two cells for one array.
    pub fn declare_primary(
        &mut self,
        name: &str,
        location: u64,
        ty: Arc<RecordType>,
        count: u64,
    ) -> Result<TableId> {
        let id = TableId::new(name);
        let conflict = || BinweaveError::IdentityConflict {
            identity: name.to_string(),
            location,
        };
        if self.by_id.contains_key(&id) {
            return Err(conflict());
        }
        if let Some(idx) = self.cells.iter().position(|c| c.location == location) {
            let cell = &mut self.cells[idx];
            match cell.kind {
                TableKind::Single
                    if cell.count == count && cell.ty.name() == ty.name() =>
                {
                    cell.warnings
                        .push(CellWarning::IdentityConflict {
                            declared: name.to_string(),
                        });
                    debug!(
                        id = %cell.id,
                        declared = name,
                        "primary declaration folded into existing implicit cell"
                    );
                    return Ok(cell.id.clone());
                }
                TableKind::Single | TableKind::Partial { .. } => return Err(conflict()),
                TableKind::Primary => {}
            }
        }
        debug!(
            name,
            location = format_args!("{:#x}", location),
            count,
            ty = ty.name(),
            "declared primary table"
        );
        self.insert_cell(TableCell {
            id: id.clone(),
            kind: TableKind::Primary,
            location,
            count,
            ty: ty.clone(),
            ref_count: 0,
            warnings: Vec::new(),
            table: Some(Table::new(location, count, ty)),
        })?;
        Ok(id)
    }

    /// Resolve a pointer target to a canonical identity.
    ///
    /// Called during the deferred pass, after the owning record's direct
    /// fields (including any count source) are populated. Resolution order:
    /// existing implicit cells, then element hits inside primaries, then
    /// materializing a fresh single.
    pub(crate) fn resolve_reference(
        &mut self,
        ctx: &mut OpCtx<'_>,
        raw_vma: u64,
        ty: Arc<RecordType>,
        count: u64,
    ) -> Result<TableId> {
        // Dedup against already-discovered implicit cells.
        for cell in &mut self.cells {
            let hit = match cell.kind {
                TableKind::Single => {
                    cell.location == raw_vma
                        && cell.count == count
                        && cell.ty.name() == ty.name()
                }
                TableKind::Partial { .. } => cell.location == raw_vma,
                TableKind::Primary => false,
            };
            if hit {
                cell.ref_count += 1;
                trace!(id = %cell.id, refs = cell.ref_count, "reference dedup");
                return Ok(cell.id.clone());
            }
        }

        // Classify against primaries of the same record type. Partial
        // references are classified only against primaries, never against
        // singles; generalizing that would change identity semantics of
        // previously exported snapshots.
        let mut hit = None;
        for (idx, cell) in self.cells.iter().enumerate() {
            if cell.kind != TableKind::Primary || cell.ty.name() != ty.name() {
                continue;
            }
            let size = cell.ty.size();
            if size == 0 || raw_vma < cell.location {
                continue;
            }
            let delta = raw_vma - cell.location;
            if delta % size != 0 || delta / size >= cell.count {
                continue;
            }
            let index = delta / size;
            hit = Some(if raw_vma == cell.location && count == cell.count {
                PrimaryHit::Whole(idx)
            } else {
                PrimaryHit::Partial { parent: idx, index }
            });
            break;
        }

        match hit {
            Some(PrimaryHit::Whole(idx)) => {
                let cell = &mut self.cells[idx];
                cell.ref_count += 1;
                trace!(id = %cell.id, "reference hit whole primary table");
                Ok(cell.id.clone())
            }
            Some(PrimaryHit::Partial { parent, index }) => {
                let parent_id = self.cells[parent].id.clone();
                let ty = self.cells[parent].ty.clone();
                let id = TableId::new(format!("{parent_id}:{index}"));
                debug!(
                    id = %id,
                    vma = format_args!("{:#x}", raw_vma),
                    "classified partial reference"
                );
                self.insert_cell(TableCell {
                    id: id.clone(),
                    kind: TableKind::Partial {
                        parent: parent_id,
                        index,
                    },
                    location: raw_vma,
                    count,
                    ty,
                    ref_count: 1,
                    warnings: Vec::new(),
                    table: None,
                })?;
                Ok(id)
            }
            None => {
                let id = self.implicit_id(raw_vma, count);
                debug!(
                    id = %id,
                    vma = format_args!("{:#x}", raw_vma),
                    count,
                    ty = ty.name(),
                    "materializing implicit table"
                );
                self.insert_cell(TableCell {
                    id: id.clone(),
                    kind: TableKind::Single,
                    location: raw_vma,
                    count,
                    ty: ty.clone(),
                    ref_count: 1,
                    warnings: Vec::new(),
                    table: Some(Table::new(raw_vma, count, ty)),
                })?;
                // Registered before reading so that a cyclic pointer graph
                // dedups against this cell instead of recursing forever.
                let idx = self.cells.len() - 1;
                self.read_cell(idx, ctx)?;
                Ok(id)
            }
        }
    }

    /// VMA a reference field should encode for the given identity.
    pub fn target_vma(&self, id: &TableId) -> Result<u64> {
        self.cell(id)
            .map(TableCell::location)
            .ok_or_else(|| BinweaveError::UnknownTable(id.to_string()))
    }

    /// Read every primary table. Implicit singles are read eagerly the
    /// moment a pointer discovers them.
    pub(crate) fn read_all(&mut self, ctx: &mut OpCtx<'_>) -> Result<()> {
        let declared = self.cells.len();
        for idx in 0..declared {
            if self.cells[idx].kind == TableKind::Primary {
                self.read_cell(idx, ctx)?;
            }
        }
        Ok(())
    }

    /// Write every whole table back; partial cells hold no bytes of their
    /// own and are skipped.
    pub(crate) fn write_all(&mut self, ctx: &mut OpCtx<'_>) -> Result<()> {
        for idx in 0..self.cells.len() {
            let Some(mut table) = self.cells[idx].table.take() else {
                continue;
            };
            debug!(id = %self.cells[idx].id, "writing table");
            let outcome = table.write(ctx, self);
            self.cells[idx].table = Some(table);
            outcome?;
        }
        Ok(())
    }

    fn read_cell(&mut self, idx: usize, ctx: &mut OpCtx<'_>) -> Result<()> {
        let Some(mut table) = self.cells[idx].table.take() else {
            return Ok(());
        };
        let outcome = table.read(ctx, self);
        self.cells[idx].table = Some(table);
        if let Some(warning) = outcome? {
            self.cells[idx].warnings.push(warning);
        }
        Ok(())
    }

    fn implicit_id(&self, vma: u64, count: u64) -> TableId {
        let id = TableId::new(format!("{IMPLICIT_PREFIX}{vma:x}"));
        if !self.by_id.contains_key(&id) {
            return id;
        }
        // Same address reused with a different count; disambiguate.
        TableId::new(format!("{IMPLICIT_PREFIX}{vma:x}_{count}"))
    }

    pub(crate) fn insert_cell(&mut self, cell: TableCell) -> Result<()> {
        if self.by_id.contains_key(&cell.id) {
            return Err(BinweaveError::IdentityConflict {
                identity: cell.id.to_string(),
                location: cell.location,
            });
        }
        self.by_id.insert(cell.id.clone(), self.cells.len());
        self.cells.push(cell);
        Ok(())
    }
}
