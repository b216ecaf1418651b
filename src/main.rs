#[cfg(feature = "mimalloc-global")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

use rand::RngCore;
use rand::SeedableRng;
use sparse_block_grid::sparsegrid::{
    stencil_fn, FieldDesc, FieldKind, GridError, Layout, NeighborShape, OccupancyMode, Schema,
    SparseGrid, SparseGridConfig, StencilMode,
};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const DOMAIN_SIDE: usize = 1024;
const SEED_RADIUS: i64 = 320;
const FILL_DENSITY: f64 = 0.9;
const TOTAL_STEPS: u64 = 200;
const CHECK_INTERVAL: u64 = 50;
const DIFFUSIVITY: f64 = 0.2;
/// Cells above this value seed their face neighbors in growth passes.
const GROWTH_THRESHOLD: f64 = 0.05;

struct MainArgs {
    config: SparseGridConfig<2>,
    mode: StencilMode,
    steps: u64,
    export: Option<String>,
}

fn parse_args() -> MainArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SparseGridConfig::new([DOMAIN_SIDE; 2]).block_edge(8);
    let mut mode = StencilMode::InPlace;
    let mut steps = TOTAL_STEPS;
    let mut export = None;
    let next_arg = |i: usize, flag: &str| -> &str {
        args.get(i)
            .map(String::as_str)
            .unwrap_or_else(|| panic!("{flag} requires a value"))
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--threads" => {
                i += 1;
                let n: usize = next_arg(i, "--threads")
                    .parse()
                    .expect("--threads requires a positive integer");
                config = config.thread_count(n);
            }
            "--max-threads" => {
                i += 1;
                let n: usize = next_arg(i, "--max-threads")
                    .parse()
                    .expect("--max-threads requires a positive integer");
                config = config.max_threads(n);
            }
            "--full" => {
                config = config.shape(NeighborShape::Full);
            }
            "--steps" => {
                i += 1;
                steps = next_arg(i, "--steps")
                    .parse()
                    .expect("--steps requires a positive integer");
            }
            "--mode" => {
                i += 1;
                mode = match next_arg(i, "--mode").to_ascii_lowercase().as_str() {
                    "inplace" => StencilMode::InPlace,
                    "noshared" => StencilMode::InPlaceNoShared,
                    "insert" => StencilMode::Insert,
                    other => panic!("unknown mode: {other} (expected inplace, noshared, or insert)"),
                };
            }
            "--export" => {
                i += 1;
                export = Some(next_arg(i, "--export").to_owned());
            }
            other => panic!(
                "unknown argument: {other}\nusage: sparse-block-grid [--threads N] [--max-threads N] [--full] [--steps N] [--mode inplace|noshared|insert] [--export FILE.vtk]"
            ),
        }
        i += 1;
    }
    MainArgs {
        config,
        mode,
        steps,
        export,
    }
}

fn seed_disk(grid: &mut SparseGrid<2>) -> Result<(), GridError> {
    let u = grid.schema().field::<f64>("u")?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_1234_ABCD_EF01);
    let threshold = (u64::MAX as f64 * FILL_DENSITY) as u64;
    let c = DOMAIN_SIDE as i64 / 2;

    for y in c - SEED_RADIUS..c + SEED_RADIUS {
        for x in c - SEED_RADIUS..c + SEED_RADIUS {
            let (dx, dy) = (x - c, y - c);
            if dx * dx + dy * dy > SEED_RADIUS * SEED_RADIUS || rng.next_u64() > threshold {
                continue;
            }
            let hot = dx.abs() < 16 && dy.abs() < 16;
            grid.insert([x, y])?.set(u, if hot { 1.0 } else { 0.0 });
        }
    }
    let report = grid.flush()?;
    println!(
        "Seeded {} cells in {} blocks ({} new)",
        report.merged,
        grid.num_blocks(),
        report.new_blocks
    );
    Ok(())
}

fn run(args: MainArgs) -> Result<(), GridError> {
    let schema = Schema::new(
        vec![
            FieldDesc::scalar("u", FieldKind::F64),
            FieldDesc::scalar("age", FieldKind::U32),
        ],
        Layout::StructOfArrays,
    )?;
    let mut grid = SparseGrid::new(args.config, schema)?;
    let u = grid.schema().field::<f64>("u")?;
    let age = grid.schema().field::<u32>("age")?;
    seed_disk(&mut grid)?;

    let diffuse = stencil_fn::<2, _>(move |p, out| {
        let center = p.get(u);
        let mut lap = 0.0;
        for delta in [[1, 0], [-1, 0], [0, 1], [0, -1]] {
            let nb = p.neighbor(delta);
            if nb.exists() {
                lap += nb.get(u) - center;
            }
        }
        out.center()
            .set(u, center + DIFFUSIVITY * lap)
            .set(age, p.get(age) + 1);
    });
    let grow = stencil_fn::<2, _>(move |p, out| {
        let center = p.get(u);
        if center <= GROWTH_THRESHOLD {
            return;
        }
        for delta in [[1, 0], [-1, 0], [0, 1], [0, -1]] {
            if !p.neighbor(delta).exists() {
                if let Some(mut cell) = out.insert(delta) {
                    cell.set(u, 0.0);
                }
            }
        }
    });

    let mut total = std::time::Duration::ZERO;
    let mut prev = std::time::Duration::ZERO;
    let with_points = args.mode == StencilMode::InPlaceNoShared;
    let mut step = 0;
    while step < args.steps {
        let start = Instant::now();
        grid.refresh_topology(with_points)?;
        if args.mode == StencilMode::Insert {
            grid.apply_stencils(StencilMode::Insert, &[&grow])?;
            grid.apply_stencils(StencilMode::InPlace, &[&diffuse])?;
        } else {
            grid.apply_stencil(args.mode, &diffuse)?;
        }
        total += start.elapsed();
        step += 1;

        if step % CHECK_INTERVAL == 0 || step == args.steps {
            let phase_ms = (total - prev).as_secs_f64() * 1000.0;
            prev = total;
            grid.refresh_topology(false)?;
            let mut mass = 0.0;
            grid.for_each_existing(|_, cell| mass += cell.get(u));
            let occupancy = grid.measure_occupancy(OccupancyMode::Existing);
            println!(
                "Step {step}: cells = {}, boundary = {}, blocks = {}, mass = {mass:.6}, occupancy = {:.3} ± {:.3} ({phase_ms:.3} ms)",
                grid.count_existing(),
                grid.count_boundary(),
                grid.num_blocks(),
                occupancy.mean,
                occupancy.std_dev
            );
        }
    }

    let total_ms = total.as_secs_f64() * 1000.0;
    println!("\n--- Summary ({} steps, {} threads) ---", args.steps, grid.thread_count());
    println!(
        "{total_ms:.3} ms total, {:.6} ms/step",
        total_ms / args.steps.max(1) as f64
    );

    if let Some(path) = args.export {
        grid.write(&path, &[])?;
        println!("Wrote {} points to {path}", grid.count_existing());
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    if let Err(err) = run(parse_args()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
