//! Point-cloud export of existing cells.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::block;
use super::error::GridError;
use super::layout::{FieldId, FieldKind, Schema, STATUS_FIELD};
use super::linearizer::Linearizer;
use super::store::BlockStore;

/// One per-point property array, values in native byte order.
#[derive(Clone, Debug)]
pub struct PointProperty {
    pub name: String,
    pub kind: FieldKind,
    pub components: usize,
    /// `points * components * kind.size()` bytes.
    pub values: Vec<u8>,
}

/// Sink for a point set with per-point properties.
pub trait PointWriter {
    fn write(&mut self, points: &[[f64; 3]], properties: &[PointProperty]) -> Result<(), GridError>;
}

/// Legacy ASCII VTK `POLYDATA` writer, one vertex per point.
pub struct VtkPointWriter<W: Write> {
    out: W,
    title: String,
}

impl VtkPointWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, GridError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> VtkPointWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            title: "sparse block grid".to_owned(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PointWriter for VtkPointWriter<W> {
    fn write(&mut self, points: &[[f64; 3]], properties: &[PointProperty]) -> Result<(), GridError> {
        let out = &mut self.out;
        let n = points.len();
        writeln!(out, "# vtk DataFile Version 3.0")?;
        // The title line may not contain newlines.
        writeln!(out, "{}", self.title.replace('\n', " "))?;
        writeln!(out, "ASCII")?;
        writeln!(out, "DATASET POLYDATA")?;
        writeln!(out, "POINTS {n} double")?;
        for p in points {
            writeln!(out, "{} {} {}", p[0], p[1], p[2])?;
        }
        writeln!(out, "VERTICES {n} {}", 2 * n)?;
        for i in 0..n {
            writeln!(out, "1 {i}")?;
        }
        if properties.is_empty() {
            return Ok(out.flush()?);
        }

        writeln!(out, "POINT_DATA {n}")?;
        let (scalars, wide): (Vec<&PointProperty>, Vec<&PointProperty>) =
            properties.iter().partition(|p| p.components <= 4);
        for prop in scalars {
            writeln!(
                out,
                "SCALARS {} {} {}",
                prop.name,
                prop.kind.vtk_name(),
                prop.components
            )?;
            writeln!(out, "LOOKUP_TABLE default")?;
            write_values(out, prop)?;
        }
        if !wide.is_empty() {
            writeln!(out, "FIELD FieldData {}", wide.len())?;
            for prop in wide {
                writeln!(
                    out,
                    "{} {} {n} {}",
                    prop.name,
                    prop.components,
                    prop.kind.vtk_name()
                )?;
                write_values(out, prop)?;
            }
        }
        Ok(out.flush()?)
    }
}

fn write_values(out: &mut dyn Write, prop: &PointProperty) -> Result<(), GridError> {
    let size = prop.kind.size();
    let stride = size * prop.components.max(1);
    for row in prop.values.chunks_exact(stride) {
        for (c, value) in row.chunks_exact(size).enumerate() {
            if c > 0 {
                out.write_all(b" ")?;
            }
            prop.kind.write_value(value, out)?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Coordinates and properties of every existing cell in block traversal
/// order. An empty `fields` list exports every field; `status` is always
/// appended.
pub fn collect_points<const D: usize>(
    lin: &Linearizer<D>,
    store: &BlockStore,
    schema: &Schema,
    fields: &[FieldId],
) -> Result<(Vec<[f64; 3]>, Vec<PointProperty>), GridError> {
    if D > 3 {
        return Err(GridError::ExportDimension(D));
    }
    let selection = schema.selection(fields)?;
    let mut props: Vec<PointProperty> = Vec::with_capacity(selection.parts.len() + 1);
    for part in &selection.parts {
        let desc = schema.desc(part.id)?;
        props.push(PointProperty {
            name: desc.name.clone(),
            kind: desc.kind,
            components: desc.components,
            values: Vec::new(),
        });
    }
    let mut status = Vec::new();
    let mut points = Vec::new();

    let block_size = store.block_size();
    let mut record = vec![0u8; schema.record_size()];
    for slot in store.slots() {
        let key = store.key(slot);
        let data = store.block_data(slot);
        for (offset, &mask) in store.block_masks(slot).iter().enumerate() {
            if !block::exists(mask) {
                continue;
            }
            let coord = lin.join(key, offset as u32);
            let mut p = [0.0f64; 3];
            for d in 0..D {
                p[d] = coord[d] as f64;
            }
            points.push(p);
            status.push(mask);
            schema.read_record(data, block_size, offset, &mut record);
            for (prop, part) in props.iter_mut().zip(&selection.parts) {
                prop.values
                    .extend_from_slice(&record[part.record_offset..part.record_offset + part.size]);
            }
        }
    }

    props.push(PointProperty {
        name: STATUS_FIELD.to_owned(),
        kind: FieldKind::U8,
        components: 1,
        values: status,
    });
    Ok((points, props))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtk_output_lists_points_vertices_and_scalars() {
        let mut writer = VtkPointWriter::new(Vec::new()).with_title("t");
        let points = [[0.0, 1.0, 0.0], [2.0, 3.0, 0.0]];
        let props = vec![
            PointProperty {
                name: "v".into(),
                kind: FieldKind::F32,
                components: 1,
                values: [1.5f32, -2.0].iter().flat_map(|v| v.to_ne_bytes()).collect(),
            },
            PointProperty {
                name: "status".into(),
                kind: FieldKind::U8,
                components: 1,
                values: vec![1, 3],
            },
        ];
        writer.write(&points, &props).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "t");
        assert_eq!(lines[4], "POINTS 2 double");
        assert_eq!(lines[5], "0 1 0");
        assert_eq!(lines[7], "VERTICES 2 4");
        assert!(text.contains("SCALARS v float 1\nLOOKUP_TABLE default\n1.5\n-2\n"));
        assert!(text.contains("SCALARS status unsigned_char 1\nLOOKUP_TABLE default\n1\n3\n"));
    }

    #[test]
    fn wide_vectors_go_to_field_data() {
        let mut writer = VtkPointWriter::new(Vec::new());
        let props = vec![PointProperty {
            name: "w".into(),
            kind: FieldKind::U8,
            components: 5,
            values: vec![1, 2, 3, 4, 5],
        }];
        writer.write(&[[0.0; 3]], &props).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert!(text.contains("FIELD FieldData 1\nw 5 1 unsigned_char\n1 2 3 4 5\n"));
    }

    #[test]
    fn four_dimensional_grids_are_rejected() {
        use crate::sparsegrid::layout::{FieldDesc, Layout};
        use crate::sparsegrid::linearizer::BlockOrder;

        let lin = Linearizer::<4>::new([4; 4], 2, BlockOrder::RowMajor).unwrap();
        let schema = Schema::new(
            vec![FieldDesc::scalar("v", FieldKind::U8)],
            Layout::ArrayOfStructs,
        )
        .unwrap();
        let store = BlockStore::new(lin.block_size(), schema.record_size());
        let err = collect_points(&lin, &store, &schema, &[]).unwrap_err();
        assert!(matches!(err, GridError::ExportDimension(4)));
    }
}
