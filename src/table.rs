//! A contiguous run of records at a fixed virtual address.
//!
//! Tables own partial-failure recovery during read: a record whose pointer
//! dereference falls outside every segment truncates the table to the
//! successfully read prefix instead of failing the whole operation. Callers
//! can tell a truncated table apart by comparing `entries().len()` with
//! `declared_count()`.

use crate::engine::OpCtx;
use crate::error::{BinweaveError, Result};
use crate::record::{RecordInstance, RecordType};
use crate::registry::{CellWarning, TableRegistry};
use std::sync::Arc;
use tracing::{debug, warn};

/// A record array at `base_location` (a VMA), `declared_count` elements long.
#[derive(Debug, Clone)]
pub struct Table {
    base_location: u64,
    declared_count: u64,
    ty: Arc<RecordType>,
    entries: Vec<RecordInstance>,
}

impl Table {
    pub fn new(base_location: u64, declared_count: u64, ty: Arc<RecordType>) -> Self {
        Self {
            base_location,
            declared_count,
            ty,
            entries: Vec::new(),
        }
    }

    pub fn base_location(&self) -> u64 {
        self.base_location
    }

    pub fn declared_count(&self) -> u64 {
        self.declared_count
    }

    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.ty
    }

    pub fn entries(&self) -> &[RecordInstance] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [RecordInstance] {
        &mut self.entries
    }

    /// Replace the entry list. The length must match the declared count;
    /// use this to rebuild a table from external data before writing.
    pub fn set_entries(&mut self, entries: Vec<RecordInstance>) -> Result<()> {
        if entries.len() as u64 != self.declared_count {
            return Err(BinweaveError::SizeMismatch {
                expected: self.declared_count,
                actual: entries.len() as u64,
            });
        }
        self.entries = entries;
        Ok(())
    }

    /// Index of the entry starting exactly at `vma`, if any.
    pub fn locate(&self, vma: u64) -> Option<u64> {
        let size = self.ty.size();
        if size == 0 || vma < self.base_location {
            return None;
        }
        let delta = vma - self.base_location;
        if delta % size != 0 {
            return None;
        }
        let index = delta / size;
        (index < self.declared_count).then_some(index)
    }

    /// Read `declared_count` records, two-phase each, recovering from
    /// address-range failures by truncating to the good prefix.
    ///
    /// Returns the truncation warning to attach to the owning cell, if any.
    pub(crate) fn read(
        &mut self,
        ctx: &mut OpCtx<'_>,
        registry: &mut TableRegistry,
    ) -> Result<Option<CellWarning>> {
        let base = ctx.deref_vma(self.base_location)?;
        let size = self.ty.size();
        debug!(
            base = format_args!("{:#x}", self.base_location),
            count = self.declared_count,
            ty = self.ty.name(),
            "reading table"
        );
        self.entries.clear();
        for i in 0..self.declared_count {
            let mut inst = RecordInstance::new(self.ty.clone());
            let outcome = inst
                .read_direct(ctx, base + i * size)
                .and_then(|()| inst.resolve_refs(ctx, registry));
            match outcome {
                Ok(()) => self.entries.push(inst),
                Err(BinweaveError::AddressNotReachable { address }) => {
                    warn!(
                        entry = i,
                        address = format_args!("{:#x}", address),
                        "table read truncated at unreachable address"
                    );
                    return Ok(Some(CellWarning::RecordTruncated {
                        read: i,
                        declared: self.declared_count,
                    }));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }

    /// Write all records back. Fails with `SizeMismatch` when the entry list
    /// does not cover the declared count (e.g. after a truncated read).
    pub(crate) fn write(&mut self, ctx: &mut OpCtx<'_>, registry: &TableRegistry) -> Result<()> {
        if self.entries.len() as u64 != self.declared_count {
            return Err(BinweaveError::SizeMismatch {
                expected: self.declared_count,
                actual: self.entries.len() as u64,
            });
        }
        let base = ctx.deref_vma(self.base_location)?;
        let size = self.ty.size();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.write(ctx, registry, base + i as u64 * size)?;
        }
        Ok(())
    }
}
