//! Record types and instances.
//!
//! A [`RecordType`] is a named, ordered set of field declarations; a
//! [`RecordInstance`] owns one codec state per field and carries the parsed
//! values. Reading is two-phase: `read_direct` runs every codec's first pass
//! in declaration order (sub-table references capture only their raw
//! pointer), then `resolve_refs` runs the deferred pass, by which point any
//! sibling field a reference's element count depends on is already populated.

use crate::codec::{sign_extend, CStrCodec, CodecState, CountSpec, IntCodec, IntWidth, RefCodec};
use crate::engine::OpCtx;
use crate::error::{BinweaveError, Result};
use crate::registry::{TableId, TableRegistry};
use std::collections::HashMap;
use std::sync::Arc;

/// What a single field holds and how it is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Flat array of fixed-width integers; `count == 1` fields expose their
    /// value as a scalar through the accessors.
    Int {
        width: IntWidth,
        signed: bool,
        count: u64,
    },
    /// 4-byte pointer to a NUL-terminated string.
    CStr { relocatable: bool },
    /// 4-byte pointer to a sub-table of `target` records.
    Ref { target: String, count: CountSpec },
}

/// One declared field of a record type. Immutable after declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Serialized width of this field. Pointer fields contribute only the
    /// pointer, never the pointee.
    pub fn byte_size(&self) -> u64 {
        match &self.kind {
            FieldKind::Int { width, count, .. } => width.bytes() * count,
            FieldKind::CStr { .. } | FieldKind::Ref { .. } => 4,
        }
    }
}

/// A named, ordered set of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordType {
    name: String,
    fields: Vec<FieldSpec>,
}

impl RecordType {
    pub fn builder(name: impl Into<String>) -> RecordTypeBuilder {
        RecordTypeBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Serialized size of one record: the sum of its field widths.
    pub fn size(&self) -> u64 {
        self.fields.iter().map(FieldSpec::byte_size).sum()
    }
}

/// Builder for [`RecordType`]; validation happens in [`build`].
///
/// [`build`]: RecordTypeBuilder::build
#[derive(Debug)]
pub struct RecordTypeBuilder {
    name: String,
    fields: Vec<FieldSpec>,
}

macro_rules! int_field {
    ($fn_name:ident, $width:expr, $signed:expr) => {
        pub fn $fn_name(self, name: impl Into<String>) -> Self {
            self.field(
                name,
                FieldKind::Int {
                    width: $width,
                    signed: $signed,
                    count: 1,
                },
            )
        }
    };
}

impl RecordTypeBuilder {
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
        });
        self
    }

    int_field!(int8, IntWidth::W8, true);
    int_field!(int16, IntWidth::W16, true);
    int_field!(int32, IntWidth::W32, true);
    int_field!(int64, IntWidth::W64, true);
    int_field!(uint8, IntWidth::W8, false);
    int_field!(uint16, IntWidth::W16, false);
    int_field!(uint32, IntWidth::W32, false);
    int_field!(uint64, IntWidth::W64, false);

    /// Flat integer array field.
    pub fn array(self, name: impl Into<String>, width: IntWidth, signed: bool, count: u64) -> Self {
        self.field(
            name,
            FieldKind::Int {
                width,
                signed,
                count,
            },
        )
    }

    /// Pointer to a NUL-terminated string.
    pub fn cstring(self, name: impl Into<String>, relocatable: bool) -> Self {
        self.field(name, FieldKind::CStr { relocatable })
    }

    /// Pointer to a sub-table of `target` records.
    pub fn reference(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        count: CountSpec,
    ) -> Self {
        self.field(
            name,
            FieldKind::Ref {
                target: target.into(),
                count,
            },
        )
    }

    pub fn build(self) -> Result<RecordType> {
        let invalid = |reason: &str| BinweaveError::InvalidRecordType {
            record: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.fields.is_empty() {
            return Err(invalid("record type has no fields"));
        }
        for (i, spec) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == spec.name) {
                return Err(invalid(&format!("duplicate field {:?}", spec.name)));
            }
            match &spec.kind {
                FieldKind::Int { count: 0, .. } => {
                    return Err(invalid(&format!("field {:?} has zero count", spec.name)));
                }
                FieldKind::Ref {
                    count: CountSpec::Field(source),
                    ..
                } => {
                    let ok = self.fields.iter().any(|f| {
                        f.name == *source
                            && matches!(f.kind, FieldKind::Int { count: 1, .. })
                    });
                    if !ok {
                        return Err(invalid(&format!(
                            "field {:?} takes its count from {:?}, which is not a scalar integer field",
                            spec.name, source
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(RecordType {
            name: self.name,
            fields: self.fields,
        })
    }
}

/// Name-to-type map owned by the engine. Ref fields name their target type
/// and are resolved through this registry at read time.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<RecordType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, ty: RecordType) -> Result<Arc<RecordType>> {
        if self.types.contains_key(ty.name()) {
            return Err(BinweaveError::InvalidRecordType {
                record: ty.name().to_string(),
                reason: "record type is already defined".into(),
            });
        }
        let ty = Arc::new(ty);
        self.types.insert(ty.name().to_string(), ty.clone());
        Ok(ty)
    }

    pub fn get(&self, name: &str) -> Result<Arc<RecordType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| BinweaveError::UnknownType(name.to_string()))
    }
}

/// One materialized record: a codec state per declared field.
#[derive(Debug, Clone)]
pub struct RecordInstance {
    ty: Arc<RecordType>,
    states: Vec<CodecState>,
}

fn codec_for(spec: &FieldSpec) -> CodecState {
    match &spec.kind {
        FieldKind::Int {
            width,
            signed,
            count,
        } => CodecState::Int(IntCodec::new(*width, *signed, *count)),
        FieldKind::CStr { relocatable } => CodecState::CStr(CStrCodec::new(*relocatable)),
        FieldKind::Ref { target, count } => {
            CodecState::Ref(RefCodec::new(target.clone(), count.clone()))
        }
    }
}

impl RecordInstance {
    /// Create an empty instance of `ty`; populated by `read_direct`.
    pub fn new(ty: Arc<RecordType>) -> Self {
        let states = ty.fields().iter().map(codec_for).collect();
        Self { ty, states }
    }

    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.ty
    }

    pub(crate) fn states(&self) -> &[CodecState] {
        &self.states
    }

    pub(crate) fn states_mut(&mut self) -> &mut [CodecState] {
        &mut self.states
    }

    /// First pass: every field reads itself in declaration order. Sub-table
    /// references capture the raw pointer only.
    pub(crate) fn read_direct(&mut self, ctx: &mut OpCtx<'_>, at: u64) -> Result<()> {
        let mut off = at;
        for state in &mut self.states {
            let size = state.byte_size();
            match state {
                CodecState::Int(c) => c.read(ctx, off)?,
                CodecState::CStr(c) => c.read(ctx, off)?,
                CodecState::Ref(c) => c.read(ctx, off)?,
            }
            off += size;
        }
        Ok(())
    }

    /// Deferred pass: resolve every reference field to a canonical table
    /// identity. Runs after `read_direct`, so count fields are populated
    /// regardless of declaration order.
    pub(crate) fn resolve_refs(
        &mut self,
        ctx: &mut OpCtx<'_>,
        registry: &mut TableRegistry,
    ) -> Result<()> {
        let mut pending = Vec::new();
        for (i, state) in self.states.iter().enumerate() {
            if let CodecState::Ref(r) = state {
                let count = match &r.count {
                    CountSpec::Fixed(n) => *n,
                    CountSpec::Field(source) => self.uint(source)?,
                };
                pending.push((i, u64::from(r.raw), r.target_type.clone(), count));
            }
        }
        for (i, raw, target_type, count) in pending {
            let ty = ctx.types.get(&target_type)?;
            let id = registry.resolve_reference(ctx, raw, ty, count)?;
            if let CodecState::Ref(r) = &mut self.states[i] {
                r.target = Some(id);
            }
        }
        Ok(())
    }

    /// Serialize every field back at `at`, in declaration order.
    pub(crate) fn write(
        &mut self,
        ctx: &mut OpCtx<'_>,
        registry: &TableRegistry,
        at: u64,
    ) -> Result<()> {
        let mut off = at;
        for state in &mut self.states {
            let size = state.byte_size();
            match state {
                CodecState::Int(c) => c.write(ctx, off)?,
                CodecState::CStr(c) => c.write(ctx, off)?,
                CodecState::Ref(c) => c.write(ctx, registry, off)?,
            }
            off += size;
        }
        Ok(())
    }

    fn index_of(&self, field: &str) -> Result<usize> {
        self.ty
            .fields()
            .iter()
            .position(|f| f.name == field)
            .ok_or_else(|| BinweaveError::UnknownField {
                record: self.ty.name().to_string(),
                field: field.to_string(),
            })
    }

    fn mismatch(&self, field: &str) -> BinweaveError {
        BinweaveError::FieldMismatch {
            record: self.ty.name().to_string(),
            field: field.to_string(),
        }
    }

    fn int_state(&self, field: &str) -> Result<&IntCodec> {
        match &self.states[self.index_of(field)?] {
            CodecState::Int(c) => Ok(c),
            _ => Err(self.mismatch(field)),
        }
    }

    fn int_state_mut(&mut self, field: &str) -> Result<&mut IntCodec> {
        let idx = self.index_of(field)?;
        match &mut self.states[idx] {
            CodecState::Int(c) => Ok(c),
            _ => {
                Err(BinweaveError::FieldMismatch {
                    record: self.ty.name().to_string(),
                    field: field.to_string(),
                })
            }
        }
    }

    /// Scalar unsigned value of a `count == 1` integer field.
    pub fn uint(&self, field: &str) -> Result<u64> {
        let c = self.int_state(field)?;
        if c.count != 1 {
            return Err(self.mismatch(field));
        }
        c.values.first().copied().ok_or_else(|| self.mismatch(field))
    }

    /// Scalar signed value of a `count == 1` integer field.
    pub fn int(&self, field: &str) -> Result<i64> {
        let c = self.int_state(field)?;
        if c.count != 1 {
            return Err(self.mismatch(field));
        }
        let raw = c.values.first().copied().ok_or_else(|| self.mismatch(field))?;
        Ok(sign_extend(raw, c.width))
    }

    /// Raw (zero-extended) element values of an integer array field.
    pub fn uints(&self, field: &str) -> Result<&[u64]> {
        Ok(&self.int_state(field)?.values)
    }

    /// Sign-extended element values of an integer array field.
    pub fn ints(&self, field: &str) -> Result<Vec<i64>> {
        let c = self.int_state(field)?;
        Ok(c.values.iter().map(|&v| sign_extend(v, c.width)).collect())
    }

    pub fn set_uint(&mut self, field: &str, value: u64) -> Result<()> {
        let mismatch = self.mismatch(field);
        let c = self.int_state_mut(field)?;
        if c.count != 1 {
            return Err(mismatch);
        }
        c.values = vec![value];
        Ok(())
    }

    pub fn set_int(&mut self, field: &str, value: i64) -> Result<()> {
        self.set_uint(field, value as u64)
    }

    pub fn set_uints(&mut self, field: &str, values: Vec<u64>) -> Result<()> {
        self.int_state_mut(field)?.values = values;
        Ok(())
    }

    /// String content of a C-string field; `None` is the null sentinel.
    pub fn string_bytes(&self, field: &str) -> Result<Option<&[u8]>> {
        match &self.states[self.index_of(field)?] {
            CodecState::CStr(c) => Ok(c.bytes.as_deref()),
            _ => Err(self.mismatch(field)),
        }
    }

    pub fn set_string(&mut self, field: &str, value: Option<&[u8]>) -> Result<()> {
        let idx = self.index_of(field)?;
        match &mut self.states[idx] {
            CodecState::CStr(c) => {
                c.bytes = value.map(<[u8]>::to_vec);
                Ok(())
            }
            _ => Err(BinweaveError::FieldMismatch {
                record: self.ty.name().to_string(),
                field: field.to_string(),
            }),
        }
    }

    /// Canonical identity of the table a reference field points at, once the
    /// deferred pass has run.
    pub fn ref_id(&self, field: &str) -> Result<Option<&TableId>> {
        match &self.states[self.index_of(field)?] {
            CodecState::Ref(c) => Ok(c.target.as_ref()),
            _ => Err(self.mismatch(field)),
        }
    }

    pub fn set_ref(&mut self, field: &str, target: Option<TableId>) -> Result<()> {
        let idx = self.index_of(field)?;
        match &mut self.states[idx] {
            CodecState::Ref(c) => {
                c.target = target;
                Ok(())
            }
            _ => Err(BinweaveError::FieldMismatch {
                record: self.ty.name().to_string(),
                field: field.to_string(),
            }),
        }
    }
}
