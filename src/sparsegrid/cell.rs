//! Borrowed cell views.
//!
//! A view is a byte slice plus a schema and a base describing where the
//! cell's fields sit inside that slice. Views are created right before a
//! read or write and never outlive the borrow of the buffer they alias.

use super::block;
use super::layout::{CellBase, Field, FieldScalar, Schema};

/// Read-only view of one cell.
#[derive(Clone, Copy)]
pub struct CellRef<'a> {
    schema: &'a Schema,
    bytes: &'a [u8],
    base: CellBase,
    mask: u8,
}

impl<'a> CellRef<'a> {
    #[inline]
    pub(crate) fn new(schema: &'a Schema, bytes: &'a [u8], base: CellBase, mask: u8) -> Self {
        Self {
            schema,
            bytes,
            base,
            mask,
        }
    }

    /// Component 0 of `field`.
    #[inline]
    pub fn get<T: FieldScalar>(&self, field: Field<T>) -> T {
        read_at(self.bytes, self.schema.locate(self.base, field.id().index(), 0))
    }

    #[inline]
    pub fn component<T: FieldScalar>(&self, field: Field<T>, component: usize) -> Option<T> {
        (component < field.components()).then(|| {
            read_at(
                self.bytes,
                self.schema.locate(self.base, field.id().index(), component),
            )
        })
    }

    /// The raw status byte.
    #[inline]
    pub fn mask(&self) -> u8 {
        self.mask
    }

    #[inline]
    pub fn exists(&self) -> bool {
        block::exists(self.mask)
    }

    #[inline]
    pub fn is_padding(&self) -> bool {
        block::is_padding(self.mask)
    }
}

/// Writable view of one cell's field payload.
pub struct CellMut<'a> {
    schema: &'a Schema,
    bytes: &'a mut [u8],
    base: CellBase,
}

impl<'a> CellMut<'a> {
    #[inline]
    pub(crate) fn new(schema: &'a Schema, bytes: &'a mut [u8], base: CellBase) -> Self {
        Self {
            schema,
            bytes,
            base,
        }
    }

    /// Shorter-lived view of the same cell.
    #[inline]
    pub fn reborrow(&mut self) -> CellMut<'_> {
        CellMut {
            schema: self.schema,
            bytes: &mut *self.bytes,
            base: self.base,
        }
    }

    #[inline]
    pub fn get<T: FieldScalar>(&self, field: Field<T>) -> T {
        read_at(self.bytes, self.schema.locate(self.base, field.id().index(), 0))
    }

    #[inline]
    pub fn component<T: FieldScalar>(&self, field: Field<T>, component: usize) -> Option<T> {
        (component < field.components()).then(|| {
            read_at(
                self.bytes,
                self.schema.locate(self.base, field.id().index(), component),
            )
        })
    }

    /// Set component 0 of `field`.
    #[inline]
    pub fn set<T: FieldScalar>(&mut self, field: Field<T>, value: T) -> &mut Self {
        let at = self.schema.locate(self.base, field.id().index(), 0);
        write_at(self.bytes, at, value);
        self
    }

    /// Returns `false` if `component` is out of range; nothing is written then.
    #[inline]
    pub fn set_component<T: FieldScalar>(
        &mut self,
        field: Field<T>,
        component: usize,
        value: T,
    ) -> bool {
        if component >= field.components() {
            return false;
        }
        let at = self.schema.locate(self.base, field.id().index(), component);
        write_at(self.bytes, at, value);
        true
    }
}

#[inline(always)]
fn read_at<T: FieldScalar>(bytes: &[u8], at: usize) -> T {
    bytemuck::pod_read_unaligned(&bytes[at..at + std::mem::size_of::<T>()])
}

#[inline(always)]
fn write_at<T: FieldScalar>(bytes: &mut [u8], at: usize, value: T) {
    bytes[at..at + std::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsegrid::layout::{FieldDesc, FieldKind, Layout};

    fn schema(layout: Layout) -> Schema {
        Schema::new(
            vec![
                FieldDesc::scalar("id", FieldKind::U32),
                FieldDesc::vector("v", FieldKind::F64, 2),
            ],
            layout,
        )
        .unwrap()
    }

    #[test]
    fn record_views_read_back_writes() {
        let s = schema(Layout::ArrayOfStructs);
        let id = s.field::<u32>("id").unwrap();
        let v = s.field::<f64>("v").unwrap();
        let mut record = vec![0u8; s.record_size()];
        {
            let mut cell = CellMut::new(&s, &mut record, CellBase::Record);
            cell.set(id, 7).set(v, 1.5);
            assert!(cell.set_component(v, 1, -2.0));
            assert!(!cell.set_component(v, 2, 9.0));
            assert_eq!(cell.get(id), 7);
        }
        let cell = CellRef::new(&s, &record, CellBase::Record, block::EXISTS_BIT);
        assert_eq!(cell.get(id), 7);
        assert_eq!(cell.component(v, 0), Some(1.5));
        assert_eq!(cell.component(v, 1), Some(-2.0));
        assert_eq!(cell.component(v, 2), None);
        assert!(cell.exists());
        assert!(!cell.is_padding());
    }

    #[test]
    fn block_views_respect_layout() {
        for layout in [Layout::ArrayOfStructs, Layout::StructOfArrays] {
            let s = schema(layout);
            let id = s.field::<u32>("id").unwrap();
            let block_size = 4;
            let mut chunk = vec![0u8; block_size * s.record_size()];
            for cell in 0..block_size {
                let base = CellBase::Block { cell, block_size };
                CellMut::new(&s, &mut chunk, base).set(id, cell as u32 * 10);
            }
            let mut record = vec![0u8; s.record_size()];
            s.read_record(&chunk, block_size, 3, &mut record);
            let cell = CellRef::new(&s, &record, CellBase::Record, 0);
            assert_eq!(cell.get(id), 30, "{layout:?}");
        }
    }
}
