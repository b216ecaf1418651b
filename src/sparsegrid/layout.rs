//! Field schema and in-block byte layout.
//!
//! A block owns one contiguous byte chunk of `block_size * record_size` bytes.
//! The `Layout` decides how cells and fields are arranged inside that chunk:
//! - `ArrayOfStructs`: cell `c` occupies `[c * record_size, (c + 1) * record_size)`.
//! - `StructOfArrays`: field `f` occupies `block_size * field_size(f)` bytes
//!   starting at `block_size * record_offset(f)`.
//!
//! A "record" is one cell's fields packed back to back in declaration order;
//! it is the unit moved by the insert buffer, the halo gather and pack/unpack.

use std::fmt;
use std::io::{self, Write};
use std::marker::PhantomData;

use bytemuck::Pod;

use super::error::GridError;

/// Scalar type tag for a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    U8,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl FieldKind {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::I32 | FieldKind::U32 | FieldKind::F32 => 4,
            FieldKind::I64 | FieldKind::U64 | FieldKind::F64 => 8,
        }
    }

    /// Legacy VTK data type name.
    pub const fn vtk_name(self) -> &'static str {
        match self {
            FieldKind::U8 => "unsigned_char",
            FieldKind::I32 => "int",
            FieldKind::U32 => "unsigned_int",
            FieldKind::I64 => "long",
            FieldKind::U64 => "unsigned_long",
            FieldKind::F32 => "float",
            FieldKind::F64 => "double",
        }
    }

    /// Format one scalar stored in native byte order.
    pub(crate) fn write_value(self, bytes: &[u8], out: &mut dyn Write) -> io::Result<()> {
        use bytemuck::pod_read_unaligned as read;
        let bytes = &bytes[..self.size()];
        match self {
            FieldKind::U8 => write!(out, "{}", bytes[0]),
            FieldKind::I32 => write!(out, "{}", read::<i32>(bytes)),
            FieldKind::U32 => write!(out, "{}", read::<u32>(bytes)),
            FieldKind::I64 => write!(out, "{}", read::<i64>(bytes)),
            FieldKind::U64 => write!(out, "{}", read::<u64>(bytes)),
            FieldKind::F32 => write!(out, "{}", read::<f32>(bytes)),
            FieldKind::F64 => write!(out, "{}", read::<f64>(bytes)),
        }
    }
}

/// Rust scalar types that can back a field.
pub trait FieldScalar: Pod + Send + Sync + fmt::Debug {
    const KIND: FieldKind;
}

macro_rules! impl_field_scalar {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl FieldScalar for $ty {
            const KIND: FieldKind = FieldKind::$kind;
        })*
    };
}

impl_field_scalar! {
    u8 => U8,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    pub kind: FieldKind,
    /// `1` for a scalar field, `n` for an `n`-vector.
    pub components: usize,
}

impl FieldDesc {
    pub fn scalar(name: impl Into<String>, kind: FieldKind) -> Self {
        Self::vector(name, kind, 1)
    }

    pub fn vector(name: impl Into<String>, kind: FieldKind, components: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            components,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.kind.size() * self.components
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Layout {
    #[default]
    ArrayOfStructs,
    StructOfArrays,
}

/// Position of a field in its schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) usize);

impl FieldId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Type-checked field handle, resolved once via [`Schema::field`].
pub struct Field<T> {
    id: FieldId,
    components: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("id", &self.id)
            .field("components", &self.components)
            .finish()
    }
}

impl<T> Field<T> {
    #[inline]
    pub fn id(self) -> FieldId {
        self.id
    }

    #[inline]
    pub fn components(self) -> usize {
        self.components
    }
}

/// Where a cell's bytes live.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CellBase {
    /// The slice is a single packed record.
    Record,
    /// The slice is a whole block chunk; `cell` is the in-block offset.
    Block { cell: usize, block_size: usize },
}

/// Name under which the cell mask is exported; schemas may not use it.
pub const STATUS_FIELD: &str = "status";

#[derive(Clone, Debug)]
pub struct Schema {
    fields: Vec<FieldDesc>,
    layout: Layout,
    record_offsets: Vec<usize>,
    record_size: usize,
}

impl Schema {
    pub fn new(fields: Vec<FieldDesc>, layout: Layout) -> Result<Self, GridError> {
        if fields.is_empty() {
            return Err(GridError::EmptySchema);
        }
        let mut record_offsets = Vec::with_capacity(fields.len());
        let mut record_size = 0usize;
        for (i, desc) in fields.iter().enumerate() {
            if desc.components == 0 {
                return Err(GridError::EmptyField(desc.name.clone()));
            }
            if desc.name == STATUS_FIELD {
                return Err(GridError::ReservedField(desc.name.clone()));
            }
            if fields[..i].iter().any(|other| other.name == desc.name) {
                return Err(GridError::DuplicateField(desc.name.clone()));
            }
            record_offsets.push(record_size);
            record_size += desc.size();
        }
        Ok(Self {
            fields,
            layout,
            record_offsets,
            record_size,
        })
    }

    #[inline]
    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Bytes per packed record.
    #[inline]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn desc(&self, id: FieldId) -> Result<&FieldDesc, GridError> {
        self.fields.get(id.0).ok_or(GridError::UnknownFieldId(id.0))
    }

    pub fn id(&self, name: &str) -> Result<FieldId, GridError> {
        self.fields
            .iter()
            .position(|desc| desc.name == name)
            .map(FieldId)
            .ok_or_else(|| GridError::UnknownField(name.to_string()))
    }

    /// Resolve a typed handle by name.
    pub fn field<T: FieldScalar>(&self, name: &str) -> Result<Field<T>, GridError> {
        let id = self.id(name)?;
        self.field_by_id(id)
    }

    pub fn field_by_id<T: FieldScalar>(&self, id: FieldId) -> Result<Field<T>, GridError> {
        let desc = self.desc(id)?;
        if desc.kind != T::KIND {
            return Err(GridError::FieldType {
                name: desc.name.clone(),
                actual: desc.kind,
                requested: T::KIND,
            });
        }
        Ok(Field {
            id,
            components: desc.components,
            _marker: PhantomData,
        })
    }

    /// Offset of field `field` within a packed record.
    #[inline]
    pub fn record_offset(&self, field: FieldId) -> usize {
        self.record_offsets[field.0]
    }

    /// Byte offset of `(field, component)` relative to the start of `base`.
    #[inline]
    pub(crate) fn locate(&self, base: CellBase, field: usize, component: usize) -> usize {
        let desc = &self.fields[field];
        let within = component * desc.kind.size();
        match base {
            CellBase::Record => self.record_offsets[field] + within,
            CellBase::Block { cell, block_size } => match self.layout {
                Layout::ArrayOfStructs => {
                    cell * self.record_size + self.record_offsets[field] + within
                }
                Layout::StructOfArrays => {
                    block_size * self.record_offsets[field] + cell * desc.size() + within
                }
            },
        }
    }

    /// Copy cell `cell` of a block chunk into a packed record.
    pub(crate) fn read_record(&self, block: &[u8], block_size: usize, cell: usize, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.record_size);
        match self.layout {
            Layout::ArrayOfStructs => {
                let start = cell * self.record_size;
                out.copy_from_slice(&block[start..start + self.record_size]);
            }
            Layout::StructOfArrays => {
                for (f, desc) in self.fields.iter().enumerate() {
                    let size = desc.size();
                    let src = block_size * self.record_offsets[f] + cell * size;
                    let dst = self.record_offsets[f];
                    out[dst..dst + size].copy_from_slice(&block[src..src + size]);
                }
            }
        }
    }

    /// Copy a packed record into cell `cell` of a block chunk.
    pub(crate) fn write_record(
        &self,
        block: &mut [u8],
        block_size: usize,
        cell: usize,
        record: &[u8],
    ) {
        debug_assert_eq!(record.len(), self.record_size);
        match self.layout {
            Layout::ArrayOfStructs => {
                let start = cell * self.record_size;
                block[start..start + self.record_size].copy_from_slice(record);
            }
            Layout::StructOfArrays => {
                for (f, desc) in self.fields.iter().enumerate() {
                    let size = desc.size();
                    let dst = block_size * self.record_offsets[f] + cell * size;
                    let src = self.record_offsets[f];
                    block[dst..dst + size].copy_from_slice(&record[src..src + size]);
                }
            }
        }
    }

    /// Resolve a field subset into `(record offset, size)` runs. An empty list
    /// selects every field.
    pub fn selection(&self, ids: &[FieldId]) -> Result<FieldSelection, GridError> {
        let ids: Vec<FieldId> = if ids.is_empty() {
            (0..self.fields.len()).map(FieldId).collect()
        } else {
            ids.to_vec()
        };
        let mut parts = Vec::with_capacity(ids.len());
        let mut bytes_per_point = 0;
        for id in ids {
            let desc = self.desc(id)?;
            parts.push(SelectedField {
                id,
                record_offset: self.record_offsets[id.0],
                size: desc.size(),
            });
            bytes_per_point += desc.size();
        }
        Ok(FieldSelection {
            parts,
            bytes_per_point,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectedField {
    pub id: FieldId,
    pub record_offset: usize,
    pub size: usize,
}

/// A field subset resolved once per pack/unpack/export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSelection {
    pub parts: Vec<SelectedField>,
    pub bytes_per_point: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(layout: Layout) -> Schema {
        Schema::new(
            vec![
                FieldDesc::scalar("rho", FieldKind::F64),
                FieldDesc::vector("vel", FieldKind::F32, 3),
                FieldDesc::scalar("flag", FieldKind::U8),
            ],
            layout,
        )
        .unwrap()
    }

    #[test]
    fn record_offsets_follow_declaration_order() {
        let s = schema(Layout::ArrayOfStructs);
        assert_eq!(s.record_size(), 8 + 12 + 1);
        assert_eq!(s.record_offset(FieldId(0)), 0);
        assert_eq!(s.record_offset(FieldId(1)), 8);
        assert_eq!(s.record_offset(FieldId(2)), 20);
    }

    #[test]
    fn typed_handles_check_kind() {
        let s = schema(Layout::ArrayOfStructs);
        let vel = s.field::<f32>("vel").unwrap();
        assert_eq!(vel.components(), 3);
        assert!(matches!(
            s.field::<f64>("vel"),
            Err(GridError::FieldType { .. })
        ));
        assert!(matches!(
            s.field::<u8>("missing"),
            Err(GridError::UnknownField(_))
        ));
    }

    #[test]
    fn rejects_duplicate_and_empty_fields() {
        let dup = Schema::new(
            vec![
                FieldDesc::scalar("a", FieldKind::U8),
                FieldDesc::scalar("a", FieldKind::U32),
            ],
            Layout::ArrayOfStructs,
        );
        assert!(matches!(dup, Err(GridError::DuplicateField(name)) if name == "a"));
        let empty = Schema::new(
            vec![FieldDesc::vector("v", FieldKind::F32, 0)],
            Layout::StructOfArrays,
        );
        assert!(matches!(empty, Err(GridError::EmptyField(_))));
        let reserved = Schema::new(
            vec![FieldDesc::scalar(STATUS_FIELD, FieldKind::U8)],
            Layout::ArrayOfStructs,
        );
        assert!(matches!(reserved, Err(GridError::ReservedField(name)) if name == "status"));
        assert!(matches!(
            Schema::new(Vec::new(), Layout::ArrayOfStructs),
            Err(GridError::EmptySchema)
        ));
    }

    #[test]
    fn soa_places_each_field_contiguously() {
        let s = schema(Layout::StructOfArrays);
        let block_size = 4;
        let at = |cell, field, comp| s.locate(CellBase::Block { cell, block_size }, field, comp);
        assert_eq!(at(0, 0, 0), 0);
        assert_eq!(at(1, 0, 0), 8);
        assert_eq!(at(0, 1, 0), 32);
        assert_eq!(at(1, 1, 2), 32 + 12 + 8);
        assert_eq!(at(3, 2, 0), 32 + 48 + 3);
    }

    #[test]
    fn records_round_trip_through_both_layouts() {
        for layout in [Layout::ArrayOfStructs, Layout::StructOfArrays] {
            let s = schema(layout);
            let block_size = 8;
            let mut block = vec![0u8; block_size * s.record_size()];
            let record: Vec<u8> = (0..s.record_size() as u8).collect();
            s.write_record(&mut block, block_size, 5, &record);
            let mut out = vec![0u8; s.record_size()];
            s.read_record(&block, block_size, 5, &mut out);
            assert_eq!(out, record, "{layout:?}");
            s.read_record(&block, block_size, 4, &mut out);
            assert!(out.iter().all(|&b| b == 0), "{layout:?}");
        }
    }

    #[test]
    fn empty_selection_means_all_fields() {
        let s = schema(Layout::ArrayOfStructs);
        let all = s.selection(&[]).unwrap();
        assert_eq!(all.parts.len(), 3);
        assert_eq!(all.bytes_per_point, s.record_size());
        let one = s.selection(&[FieldId(1)]).unwrap();
        assert_eq!(one.bytes_per_point, 12);
        assert!(s.selection(&[FieldId(7)]).is_err());
    }
}
