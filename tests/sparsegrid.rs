use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use sparse_block_grid::sparsegrid::{
    block, BlockOrder, BoxRegion, FieldDesc, FieldKind, GridError, Layout, NeighborShape,
    OccupancyMode, Schema, SparseGrid, SparseGridConfig, TagOptions, VtkPointWriter,
    BACKGROUND_SLOT,
};

fn schema(layout: Layout) -> Schema {
    Schema::new(
        vec![
            FieldDesc::scalar("v", FieldKind::F64),
            FieldDesc::vector("w", FieldKind::I32, 3),
        ],
        layout,
    )
    .unwrap()
}

fn grid2(resolution: [usize; 2], edge: usize, shape: NeighborShape, radius: usize) -> SparseGrid<2> {
    SparseGrid::new(
        SparseGridConfig::new(resolution)
            .block_edge(edge)
            .shape(shape)
            .stencil_radius(radius)
            .thread_count(2),
        schema(Layout::ArrayOfStructs),
    )
    .unwrap()
}

fn fill(grid: &mut SparseGrid<2>, cells: &HashSet<(i64, i64)>) {
    let v = grid.schema().field::<f64>("v").unwrap();
    for &(x, y) in cells {
        grid.insert([x, y]).unwrap().set(v, (x * 100 + y) as f64);
    }
    grid.flush().unwrap();
}

fn square(lo: i64, hi: i64) -> HashSet<(i64, i64)> {
    let mut out = HashSet::new();
    for y in lo..hi {
        for x in lo..hi {
            out.insert((x, y));
        }
    }
    out
}

fn padding_cells(grid: &SparseGrid<2>) -> HashSet<(i64, i64)> {
    let mut out = HashSet::new();
    grid.for_each_existing(|c, cell| {
        if cell.is_padding() {
            out.insert((c[0], c[1]));
        }
    });
    out
}

fn tag(grid: &mut SparseGrid<2>) {
    grid.find_neighbours();
    grid.tag_boundaries(TagOptions::default()).unwrap();
}

#[test]
fn insert_flush_round_trip_both_layouts() {
    for layout in [Layout::ArrayOfStructs, Layout::StructOfArrays] {
        let mut grid = SparseGrid::new(
            SparseGridConfig::new([40, 24]).block_edge(4).thread_count(2),
            schema(layout),
        )
        .unwrap();
        let v = grid.schema().field::<f64>("v").unwrap();
        let w = grid.schema().field::<i32>("w").unwrap();
        let coords = [[0, 0], [3, 3], [4, 0], [39, 23], [17, 9]];
        for (i, &c) in coords.iter().enumerate() {
            let mut cell = grid.insert(c).unwrap();
            cell.set(v, i as f64 + 0.5);
            assert!(cell.set_component(w, 2, -(i as i32)));
        }
        assert!(!grid.exists([17, 9]), "inserts are invisible before flush");
        let report = grid.flush().unwrap();
        assert_eq!(report.merged, coords.len());

        for (i, &c) in coords.iter().enumerate() {
            assert!(grid.exists(c), "{layout:?} {c:?}");
            let cell = grid.get(c);
            assert_eq!(cell.get(v), i as f64 + 0.5);
            assert_eq!(cell.component(w, 0), Some(0));
            assert_eq!(cell.component(w, 2), Some(-(i as i32)));
        }
        assert_eq!(grid.count_existing(), coords.len());
    }
}

#[test]
fn repeated_flush_changes_nothing() {
    let mut grid = grid2([32, 32], 4, NeighborShape::Star, 1);
    fill(&mut grid, &square(3, 9));
    let masks = grid.store().masks().to_vec();
    let data = grid.store().data().to_vec();
    let generation = grid.generation();

    let report = grid.flush().unwrap();
    assert_eq!(report.merged, 0);
    assert_eq!(grid.generation(), generation);
    assert_eq!(grid.store().masks(), &masks[..]);
    assert_eq!(grid.store().data(), &data[..]);
}

#[test]
fn duplicate_cell_writes_keep_the_last() {
    let mut grid = grid2([16, 16], 4, NeighborShape::Star, 1);
    let v = grid.schema().field::<f64>("v").unwrap();
    grid.insert([5, 5]).unwrap().set(v, 1.0);
    grid.insert([6, 5]).unwrap().set(v, 9.0);
    grid.insert([5, 5]).unwrap().set(v, 2.0);
    assert_eq!(grid.pending_inserts().len(), 3);

    let report = grid.flush().unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(grid.get([5, 5]).get(v), 2.0);
    assert_eq!(grid.get([6, 5]).get(v), 9.0);
    assert!(grid.pending_inserts().is_empty());
}

#[test]
fn staged_record_starts_from_committed_value() {
    let mut grid = grid2([16, 16], 4, NeighborShape::Star, 1);
    let v = grid.schema().field::<f64>("v").unwrap();
    let w = grid.schema().field::<i32>("w").unwrap();
    grid.insert_flush([2, 3], |c| {
        c.set(v, 7.0).set(w, 11);
    })
    .unwrap();
    grid.insert_flush([2, 3], |c| {
        c.set(w, 12);
    })
    .unwrap();
    let cell = grid.get([2, 3]);
    assert_eq!(cell.get(v), 7.0);
    assert_eq!(cell.get(w), 12);
}

#[test]
fn inserts_outside_the_domain_fail() {
    let mut grid = grid2([10, 10], 4, NeighborShape::Star, 1);
    for c in [[-1, 0], [0, 10], [10, 3]] {
        assert!(matches!(grid.insert(c), Err(GridError::OutOfDomain { .. })));
    }
    assert!(grid.pending_inserts().is_empty());
    // Partial last block: 10 points with edge 4 needs 3 blocks per axis.
    assert!(grid.insert([9, 9]).is_ok());
}

#[test]
fn neighbor_table_has_one_row_per_block() {
    for (shape, n_nn) in [(NeighborShape::Star, 4), (NeighborShape::Full, 9)] {
        let mut grid = grid2([32, 32], 4, shape, 1);
        fill(&mut grid, &square(2, 11));
        grid.find_neighbours();
        let table = grid.neighbor_table().unwrap();
        assert_eq!(table.n_neighbors(), n_nn);
        assert_eq!(table.len(), grid.num_blocks() * n_nn);
        let slots = grid.store().slot_count() as u32;
        assert!(table.as_slice().iter().all(|&s| s < slots));

        let lin = grid.linearizer();
        let origin = grid.store().slot_of(lin.block_key([0, 0]).unwrap()).unwrap();
        let east = grid.store().slot_of(lin.block_key([1, 0]).unwrap()).unwrap();
        let dir = shape.direction::<2>([1, 0]).unwrap();
        assert_eq!(table.get(origin, dir), east);
        let west = shape.direction::<2>([-1, 0]).unwrap();
        assert_eq!(table.get(origin, west).0, BACKGROUND_SLOT);
    }
}

#[test]
fn star_padding_iff_face_neighbor_missing() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x0BAD_5EED);
    for radius in [1usize, 2] {
        let mut grid = grid2([24, 24], 4, NeighborShape::Star, radius);
        let mut cells = HashSet::new();
        for _ in 0..300 {
            cells.insert((rng.random_range(0..24i64), rng.random_range(0..24i64)));
        }
        fill(&mut grid, &cells);
        tag(&mut grid);

        let r = radius as i64;
        let expected: HashSet<(i64, i64)> = cells
            .iter()
            .copied()
            .filter(|&(x, y)| {
                (1..=r).any(|k| {
                    [(k, 0), (-k, 0), (0, k), (0, -k)]
                        .iter()
                        .any(|&(dx, dy)| !cells.contains(&(x + dx, y + dy)))
                })
            })
            .collect();
        assert_eq!(padding_cells(&grid), expected, "radius {radius}");
        assert_eq!(grid.count_boundary(), expected.len());
    }
}

#[test]
fn full_padding_iff_any_surrounding_cell_missing() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xF011_F011);
    let mut grid = grid2([24, 24], 4, NeighborShape::Full, 1);
    let mut cells = HashSet::new();
    for _ in 0..350 {
        cells.insert((rng.random_range(0..24i64), rng.random_range(0..24i64)));
    }
    fill(&mut grid, &cells);
    tag(&mut grid);

    let expected: HashSet<(i64, i64)> = cells
        .iter()
        .copied()
        .filter(|&(x, y)| {
            (-1..=1).any(|dy| {
                (-1..=1).any(|dx| (dx, dy) != (0, 0) && !cells.contains(&(x + dx, y + dy)))
            })
        })
        .collect();
    assert_eq!(padding_cells(&grid), expected);
}

#[test]
fn missing_corner_only_matters_for_full_shape() {
    // 3x3 cells straddling four blocks, corner (5, 5) missing.
    let mut cells = HashSet::new();
    for y in 3..6 {
        for x in 3..6 {
            cells.insert((x, y));
        }
    }
    cells.remove(&(5, 5));

    let mut star = grid2([16, 16], 4, NeighborShape::Star, 1);
    fill(&mut star, &cells);
    tag(&mut star);
    let star_padding = padding_cells(&star);
    assert!(!star_padding.contains(&(4, 4)));
    assert_eq!(star_padding.len(), cells.len() - 1);

    let mut full = grid2([16, 16], 4, NeighborShape::Full, 1);
    fill(&mut full, &cells);
    tag(&mut full);
    assert!(padding_cells(&full).contains(&(4, 4)));
    assert_eq!(full.count_boundary(), cells.len());
}

#[test]
fn retagging_clears_stale_padding() {
    let mut grid = grid2([16, 16], 4, NeighborShape::Star, 1);
    let mut cells = square(2, 7);
    cells.remove(&(4, 3));
    fill(&mut grid, &cells);
    tag(&mut grid);
    assert!(padding_cells(&grid).contains(&(4, 4)));

    grid.insert_flush([4, 3], |_| {}).unwrap();
    tag(&mut grid);
    assert!(!padding_cells(&grid).contains(&(4, 4)));
}

#[test]
fn existing_points_cover_interior_cells_in_slot_order() {
    let mut grid = grid2([32, 32], 4, NeighborShape::Star, 1);
    fill(&mut grid, &square(1, 13));
    grid.find_neighbours();
    let report = grid
        .tag_boundaries(TagOptions::with_existing_points())
        .unwrap();
    let points = grid.existing_points().unwrap();
    assert_eq!(report.existing_points, Some(points.len()));
    assert_eq!(points.len(), report.existing - report.padding);
    assert_eq!(points.generation(), grid.generation());
    assert!(points
        .points()
        .windows(2)
        .all(|w| (w[0].slot, w[0].offset) < (w[1].slot, w[1].offset)));
    for p in points.points() {
        let mask = grid.store().block_masks(p.slot)[p.offset as usize];
        assert!(block::is_interior(mask));
    }
    assert_eq!(points.block_starts().len(), grid.num_blocks() + 1);
}

#[test]
fn occupancy_is_existing_over_capacity() {
    let mut grid = grid2([32, 32], 4, NeighborShape::Star, 1);
    fill(&mut grid, &square(0, 6));
    tag(&mut grid);

    let stats = grid.measure_occupancy(OccupancyMode::Existing);
    assert_eq!(stats.per_block.len(), grid.num_blocks());
    for (slot, &frac) in grid.store().slots().zip(&stats.per_block) {
        assert!((0.0..=1.0).contains(&frac));
        let existing = grid
            .store()
            .block_masks(slot)
            .iter()
            .filter(|&&m| block::exists(m))
            .count();
        assert_eq!(frac, existing as f64 / 16.0);
    }
    // 36 cells over blocks holding 16, 8, 8 and 4 cells.
    assert!((stats.mean - 0.5625).abs() < 1e-12);

    let interior = grid.measure_occupancy(OccupancyMode::Interior);
    let interior_total: f64 = interior.per_block.iter().sum::<f64>() * 16.0;
    assert_eq!(interior_total.round() as usize, 36 - grid.count_boundary());
}

#[test]
fn morton_and_row_major_store_the_same_cells() {
    let cells = square(5, 20);
    let mut results = Vec::new();
    for order in [BlockOrder::RowMajor, BlockOrder::Morton] {
        let mut grid = SparseGrid::new(
            SparseGridConfig::new([64, 64])
                .block_edge(4)
                .block_order(order)
                .thread_count(2),
            schema(Layout::StructOfArrays),
        )
        .unwrap();
        fill(&mut grid, &cells);
        tag(&mut grid);
        let v = grid.schema().field::<f64>("v").unwrap();
        let mut seen = HashMap::new();
        grid.for_each_existing(|c, cell| {
            seen.insert((c[0], c[1]), (cell.get(v), cell.is_padding()));
        });
        results.push(seen);
    }
    assert_eq!(results[0].len(), cells.len());
    assert_eq!(results[0], results[1]);
}

#[test]
fn region_iteration_visits_only_the_box() {
    let mut grid = grid2([32, 32], 4, NeighborShape::Star, 1);
    fill(&mut grid, &square(0, 20));
    let region = BoxRegion::new([3, 6], [9, 8]);
    let mut seen = Vec::new();
    grid.for_each_in_region(&region, |c, cell| {
        assert!(cell.exists());
        seen.push((c[0], c[1]));
    });
    seen.sort_unstable();
    let expected: Vec<(i64, i64)> = (3..9).flat_map(|x| (6..8).map(move |y| (x, y))).collect();
    assert_eq!(seen, expected);

    let mut none = 0;
    grid.for_each_in_region(&BoxRegion::new([4, 4], [4, 9]), |_, _| none += 1);
    assert_eq!(none, 0);
}

#[test]
fn export_writes_every_existing_cell() {
    let mut grid = grid2([16, 16], 4, NeighborShape::Star, 1);
    let cells = square(1, 4);
    fill(&mut grid, &cells);
    tag(&mut grid);
    let v = grid.schema().id("v").unwrap();

    let mut writer = VtkPointWriter::new(Vec::new());
    grid.write_points(&mut writer, &[v]).unwrap();
    let text = String::from_utf8(writer.into_inner()).unwrap();
    assert!(text.starts_with("# vtk DataFile Version 3.0\n"));
    assert!(text.contains("POINTS 9 double\n"));
    assert!(text.contains("VERTICES 9 18\n"));
    assert!(text.contains("POINT_DATA 9\nSCALARS v double 1\n"));
    assert!(text.contains("SCALARS status unsigned_char 1\n"));
    assert!(!text.contains("SCALARS w "));
    // (2, 2) is the only interior cell: status 1, all others 3.
    let status: Vec<&str> = text
        .split("SCALARS status unsigned_char 1\nLOOKUP_TABLE default\n")
        .nth(1)
        .unwrap()
        .lines()
        .collect();
    assert_eq!(status.iter().filter(|&&s| s == "1").count(), 1);
    assert_eq!(status.iter().filter(|&&s| s == "3").count(), 8);

    let path = std::env::temp_dir().join(format!("sparse-grid-export-{}.vtk", std::process::id()));
    grid.write(&path, &[]).unwrap();
    let on_disk = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert!(on_disk.contains("SCALARS w int 3\n"));
}

proptest! {
    #[test]
    fn prop_round_trip_last_write_wins(
        writes in proptest::collection::vec((0i64..40, 0i64..40, -1000i32..1000), 1..200)
    ) {
        let mut grid = grid2([40, 40], 4, NeighborShape::Star, 1);
        let w = grid.schema().field::<i32>("w").unwrap();
        let mut reference = HashMap::new();
        for &(x, y, value) in &writes {
            grid.insert([x, y]).unwrap().set(w, value);
            reference.insert((x, y), value);
        }
        grid.flush().unwrap();

        prop_assert_eq!(grid.count_existing(), reference.len());
        for (&(x, y), &value) in &reference {
            prop_assert!(grid.exists([x, y]));
            prop_assert_eq!(grid.get([x, y]).get(w), value);
        }
    }

    #[test]
    fn prop_count_matches_distinct_coordinates(
        coords in proptest::collection::hash_set((0i64..64, 0i64..64), 0..300),
        edge in prop_oneof![Just(2usize), Just(4), Just(8)],
    ) {
        let mut grid = grid2([64, 64], edge, NeighborShape::Full, 1);
        fill(&mut grid, &coords);
        prop_assert_eq!(grid.count_existing(), coords.len());
        let blocks: HashSet<(i64, i64)> = coords
            .iter()
            .map(|&(x, y)| (x / edge as i64, y / edge as i64))
            .collect();
        prop_assert_eq!(grid.num_blocks(), blocks.len());
    }
}
