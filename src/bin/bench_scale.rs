use rand::RngCore;
use rand::SeedableRng;
use sparse_block_grid::sparsegrid::{
    stencil_fn, FieldDesc, FieldKind, GridError, Layout, Schema, SparseGrid, SparseGridConfig,
    StencilMode,
};
use std::time::Instant;

struct BenchResult {
    blocks: usize,
    cells: usize,
    flush_ms: f64,
    in_place_ms: f64,
    no_shared_ms: f64,
}

fn bench_scale(size: usize, density: f64, iterations: u64) -> Result<BenchResult, GridError> {
    let schema = Schema::new(
        vec![FieldDesc::scalar("u", FieldKind::F32)],
        Layout::ArrayOfStructs,
    )?;
    let mut grid = SparseGrid::new(SparseGridConfig::new([size, size]).block_edge(8), schema)?;
    let u = grid.schema().field::<f32>("u")?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_1234_ABCD_EF01);
    let threshold = (u64::MAX as f64 * density) as u64;

    let start = Instant::now();
    for y in 0..size as i64 {
        for x in 0..size as i64 {
            if rng.next_u64() <= threshold {
                grid.insert([x, y])?.set(u, (x ^ y) as f32);
            }
        }
    }
    grid.flush()?;
    let flush_ms = start.elapsed().as_secs_f64() * 1000.0;
    grid.refresh_topology(true)?;

    let smooth = stencil_fn::<2, _>(move |p, out| {
        let mut acc = 4.0 * p.get(u);
        for delta in [[1, 0], [-1, 0], [0, 1], [0, -1]] {
            acc += p.neighbor(delta).get(u);
        }
        out.center().set(u, acc * 0.125);
    });

    let start = Instant::now();
    for _ in 0..iterations {
        grid.apply_stencil(StencilMode::InPlace, &smooth)?;
    }
    let in_place_ms = start.elapsed().as_secs_f64() * 1000.0;

    let start = Instant::now();
    for _ in 0..iterations {
        grid.apply_stencil(StencilMode::InPlaceNoShared, &smooth)?;
    }
    let no_shared_ms = start.elapsed().as_secs_f64() * 1000.0;

    Ok(BenchResult {
        blocks: grid.num_blocks(),
        cells: grid.count_existing(),
        flush_ms,
        in_place_ms,
        no_shared_ms,
    })
}

fn main() -> Result<(), GridError> {
    let scales: &[(usize, f64, u64)] = &[
        (512, 0.42, 100),  // ~4096 blocks
        (1024, 0.42, 50),  // ~16384 blocks
        (2048, 0.42, 20),  // ~65536 blocks
        (2048, 0.05, 20),  // same blocks, sparse cells
        (4096, 0.02, 10),  // ~262144 blocks, very sparse
    ];

    println!(
        "{:<11} {:>7} {:>9} {:>10} {:>10} {:>14} {:>14}",
        "Grid", "Density", "Blocks", "Cells", "Flush(ms)", "InPlace(ms/it)", "NoShared(ms/it)"
    );
    println!("{}", "-".repeat(81));

    for &(size, density, iters) in scales {
        let r = bench_scale(size, density, iters)?;
        println!(
            "{:<11} {:>7.2} {:>9} {:>10} {:>10.1} {:>14.4} {:>14.4}",
            format!("{}x{}", size, size),
            density,
            r.blocks,
            r.cells,
            r.flush_ms,
            r.in_place_ms / iters as f64,
            r.no_shared_ms / iters as f64
        );
    }
    Ok(())
}
