//! The sparse grid engine: configuration, lifecycle and dispatch.
//!
//! `SparseGrid` composes the block store, the insert buffer and the derived
//! topology (ghost mapping, neighbor table, boundary tags, existing points).
//! Every parallel operation runs inside the grid's own rayon pool and returns
//! once all of its tasks have finished.

use std::path::Path;
use std::sync::OnceLock;

use super::accounting::{self, OccupancyMode, OccupancyStats};
use super::block::{self, BACKGROUND_SLOT};
use super::boundary::{self, ExistingPoints, TagOptions, TagReport};
use super::cell::{CellMut, CellRef};
use super::error::GridError;
use super::export::{self, PointWriter, VtkPointWriter};
use super::ghost::GhostMapping;
use super::insert::{self, FlushReport, InsertBuffer, StagedEntry};
use super::layout::{CellBase, FieldId, Schema};
use super::linearizer::{default_block_edge, BlockOrder, Linearizer};
use super::neighbors::{NeighborShape, NeighborTable};
use super::pack::{self, BoxRegion, PackRequest};
use super::stencil::{self, CellFilter, Stencil, StencilEnv, StencilMode};
use super::store::BlockStore;

static PHYSICAL_CORES: OnceLock<usize> = OnceLock::new();

#[inline]
fn physical_core_count() -> usize {
    *PHYSICAL_CORES.get_or_init(|| num_cpus::get_physical().max(1))
}

/// Zero-config pool size: all physical cores on small machines, about half
/// of them on large ones where block sweeps are memory-bandwidth bound.
#[inline]
fn auto_pool_thread_count_for_physical(physical: usize) -> usize {
    let physical = physical.max(1);
    if physical <= 8 {
        physical
    } else {
        physical.div_ceil(2).max(6)
    }
}

#[inline]
fn auto_pool_thread_count() -> usize {
    auto_pool_thread_count_for_physical(physical_core_count())
}

/// Resolve the thread count from a config, falling back to auto-detect.
fn resolve_thread_count<const D: usize>(config: &SparseGridConfig<D>) -> usize {
    let mut threads = config.thread_count.unwrap_or_else(auto_pool_thread_count);
    if let Some(cap) = config.max_threads {
        threads = threads.min(cap);
    }
    threads.max(1)
}

/// The neighbor table if it was built for `generation` and `shape`.
fn fresh_table(
    table: &Option<NeighborTable>,
    shape: NeighborShape,
    generation: u64,
) -> Result<&NeighborTable, GridError> {
    let fresh = table
        .as_ref()
        .filter(|t| t.generation() == generation)
        .ok_or(GridError::StaleNeighbors {
            built: table.as_ref().map(NeighborTable::generation),
            current: generation,
        })?;
    if fresh.shape() != shape {
        return Err(GridError::ShapeMismatch {
            built: fresh.shape(),
            configured: shape,
        });
    }
    Ok(fresh)
}

/// Construction parameters for a [`SparseGrid`].
#[derive(Clone, Debug)]
pub struct SparseGridConfig<const D: usize> {
    /// Domain size in points per dimension.
    pub resolution: [usize; D],
    /// Block edge in points. `None` picks a per-dimension default.
    pub block_edge: Option<usize>,
    /// Stencil support radius used for the ghost mapping and tagging.
    pub stencil_radius: usize,
    pub shape: NeighborShape,
    pub block_order: BlockOrder,
    /// Number of threads for the compute pool.
    /// `None` means auto-detect (physical cores, memory-bandwidth capped).
    pub thread_count: Option<usize>,
    /// Hard upper bound on threads regardless of auto-detection.
    pub max_threads: Option<usize>,
}

impl<const D: usize> SparseGridConfig<D> {
    pub fn new(resolution: [usize; D]) -> Self {
        Self {
            resolution,
            block_edge: None,
            stencil_radius: 1,
            shape: NeighborShape::Star,
            block_order: BlockOrder::RowMajor,
            thread_count: None,
            max_threads: None,
        }
    }

    pub fn block_edge(mut self, edge: usize) -> Self {
        self.block_edge = Some(edge);
        self
    }

    pub fn stencil_radius(mut self, radius: usize) -> Self {
        self.stencil_radius = radius;
        self
    }

    pub fn shape(mut self, shape: NeighborShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn block_order(mut self, order: BlockOrder) -> Self {
        self.block_order = order;
        self
    }

    /// Set an explicit thread count for the compute pool.
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = Some(n.max(1));
        self
    }

    /// Set a hard upper bound on threads.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n.max(1));
        self
    }

    #[inline]
    fn edge(&self) -> usize {
        self.block_edge.unwrap_or(default_block_edge(D))
    }
}

pub struct SparseGrid<const D: usize> {
    config: SparseGridConfig<D>,
    lin: Linearizer<D>,
    schema: Schema,
    store: BlockStore,
    buffer: InsertBuffer,
    mapping: GhostMapping,
    table: Option<NeighborTable>,
    /// Generation the boundary tags were computed for.
    tagged: Option<u64>,
    existing_points: Option<ExistingPoints>,
    generation: u64,
    pool: rayon::ThreadPool,
    threads: usize,
}

impl<const D: usize> SparseGrid<D> {
    pub fn new(config: SparseGridConfig<D>, schema: Schema) -> Result<Self, GridError> {
        let edge = config.edge();
        let lin = Linearizer::new(config.resolution, edge, config.block_order)
            .inspect_err(|err| tracing::warn!(%err, "rejected grid configuration"))?;
        if config.stencil_radius > edge {
            let err = GridError::RadiusExceedsBlock {
                radius: config.stencil_radius,
                edge,
            };
            tracing::warn!(%err, "rejected grid configuration");
            return Err(err);
        }
        let threads = resolve_thread_count(&config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        let mapping = GhostMapping::build::<D>(edge, config.stencil_radius, config.shape);

        tracing::info!(
            dim = D,
            resolution = ?config.resolution,
            edge,
            radius = config.stencil_radius,
            shape = ?config.shape,
            order = ?config.block_order,
            threads,
            fields = schema.len(),
            layout = ?schema.layout(),
            "created sparse grid"
        );

        Ok(Self {
            store: BlockStore::new(lin.block_size(), schema.record_size()),
            buffer: InsertBuffer::new(schema.record_size()),
            config,
            lin,
            schema,
            mapping,
            table: None,
            tagged: None,
            existing_points: None,
            generation: 0,
            pool,
            threads,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[inline]
    pub fn config(&self) -> &SparseGridConfig<D> {
        &self.config
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn linearizer(&self) -> &Linearizer<D> {
        &self.lin
    }

    #[inline]
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    #[inline]
    pub fn ghost_mapping(&self) -> &GhostMapping {
        &self.mapping
    }

    /// The last neighbor table built, fresh or not.
    #[inline]
    pub fn neighbor_table(&self) -> Option<&NeighborTable> {
        self.table.as_ref()
    }

    #[inline]
    pub fn existing_points(&self) -> Option<&ExistingPoints> {
        self.existing_points.as_ref()
    }

    /// Structural generation; bumped by every flush that merges a cell.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.store.num_blocks()
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    #[inline]
    pub fn shape(&self) -> NeighborShape {
        self.mapping.shape()
    }

    #[inline]
    pub fn stencil_radius(&self) -> usize {
        self.mapping.radius()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Discard all cells and staged inserts; geometry is kept.
    pub fn clear(&mut self) {
        self.store.clear();
        self.buffer.clear();
        self.drop_derived();
        self.generation += 1;
    }

    /// Discard all cells and reinitialize for a new domain resolution.
    pub fn resize(&mut self, resolution: [usize; D]) -> Result<(), GridError> {
        let lin = Linearizer::new(resolution, self.lin.edge(), self.lin.order())?;
        self.lin = lin;
        self.config.resolution = resolution;
        self.clear();
        tracing::info!(resolution = ?resolution, "resized sparse grid");
        Ok(())
    }

    fn drop_derived(&mut self) {
        self.table = None;
        self.tagged = None;
        self.existing_points = None;
    }

    // ── Insert / read ───────────────────────────────────────────────────

    /// Stage a write to `coord`. The staged record starts from the committed
    /// value if the cell exists, else zeros; it becomes visible on `flush`.
    pub fn insert(&mut self, coord: [i64; D]) -> Result<CellMut<'_>, GridError> {
        let (key, offset) = self.split(coord)?;
        let record = self.buffer.stage(key, offset, None)?;
        if let Some(slot) = self.store.slot_of(key) {
            if block::exists(self.store.block_masks(slot)[offset as usize]) {
                self.schema.read_record(
                    self.store.block_data(slot),
                    self.store.block_size(),
                    offset as usize,
                    record,
                );
            }
        }
        Ok(CellMut::new(&self.schema, record, CellBase::Record))
    }

    /// Insert, let `write` fill the cell, then flush.
    pub fn insert_flush<F>(&mut self, coord: [i64; D], write: F) -> Result<FlushReport, GridError>
    where
        F: FnOnce(&mut CellMut<'_>),
    {
        let mut cell = self.insert(coord)?;
        write(&mut cell);
        self.flush()
    }

    /// Merge the insert buffer into the store.
    pub fn flush(&mut self) -> Result<FlushReport, GridError> {
        let report = self
            .pool
            .install(|| insert::flush(&mut self.buffer, &mut self.store, &self.schema))?;
        if report.merged > 0 {
            self.generation += 1;
        }
        #[cfg(debug_assertions)]
        debug_assert!(self.store.background_is_clean());
        Ok(report)
    }

    /// Staged entries in insertion order.
    #[inline]
    pub fn pending_inserts(&self) -> &[StagedEntry] {
        self.buffer.entries()
    }

    pub fn exists(&self, coord: [i64; D]) -> bool {
        self.locate(coord)
            .is_some_and(|(slot, offset)| block::exists(self.store.block_masks(slot)[offset]))
    }

    /// Committed cell at `coord`. A missing cell reads as the background
    /// cell; debug builds report the miss.
    pub fn get(&self, coord: [i64; D]) -> CellRef<'_> {
        match self.try_get(coord) {
            Some(cell) => cell,
            None => {
                #[cfg(debug_assertions)]
                tracing::error!(?coord, "read of a cell that does not exist");
                self.background_cell()
            }
        }
    }

    pub fn try_get(&self, coord: [i64; D]) -> Option<CellRef<'_>> {
        let (slot, offset) = self.locate(coord)?;
        let mask = self.store.block_masks(slot)[offset];
        block::exists(mask).then(|| {
            CellRef::new(
                &self.schema,
                self.store.block_data(slot),
                CellBase::Block {
                    cell: offset,
                    block_size: self.store.block_size(),
                },
                mask,
            )
        })
    }

    fn background_cell(&self) -> CellRef<'_> {
        CellRef::new(
            &self.schema,
            self.store.block_data(block::BlockSlot(BACKGROUND_SLOT)),
            CellBase::Block {
                cell: 0,
                block_size: self.store.block_size(),
            },
            0,
        )
    }

    fn split(&self, coord: [i64; D]) -> Result<(u64, u32), GridError> {
        self.lin.split(coord).ok_or_else(|| GridError::OutOfDomain {
            coord: coord.to_vec(),
            resolution: self.lin.resolution().to_vec(),
        })
    }

    fn locate(&self, coord: [i64; D]) -> Option<(block::BlockSlot, usize)> {
        let (key, offset) = self.lin.split(coord)?;
        Some((self.store.slot_of(key)?, offset as usize))
    }

    // ── Iteration ───────────────────────────────────────────────────────

    /// Visit every existing cell in block traversal order.
    pub fn for_each_existing<F>(&self, mut f: F)
    where
        F: FnMut([i64; D], CellRef<'_>),
    {
        let block_size = self.store.block_size();
        for slot in self.store.slots() {
            let key = self.store.key(slot);
            let data = self.store.block_data(slot);
            for (offset, &mask) in self.store.block_masks(slot).iter().enumerate() {
                if block::exists(mask) {
                    let cell = CellRef::new(
                        &self.schema,
                        data,
                        CellBase::Block {
                            cell: offset,
                            block_size,
                        },
                        mask,
                    );
                    f(self.lin.join(key, offset as u32), cell);
                }
            }
        }
    }

    /// Visit existing cells inside the half-open box `region`.
    pub fn for_each_in_region<F>(&self, region: &BoxRegion<D>, mut f: F)
    where
        F: FnMut([i64; D], CellRef<'_>),
    {
        if region.is_empty() {
            return;
        }
        let edge = self.lin.edge() as i64;
        let block_size = self.store.block_size();
        for slot in self.store.slots() {
            let key = self.store.key(slot);
            let origin = self.lin.block_coord(key).map(|b| b * edge);
            if !region.intersects(origin, origin.map(|o| o + edge)) {
                continue;
            }
            let data = self.store.block_data(slot);
            for (offset, &mask) in self.store.block_masks(slot).iter().enumerate() {
                if !block::exists(mask) {
                    continue;
                }
                let coord = self.lin.join(key, offset as u32);
                if region.contains(coord) {
                    let cell = CellRef::new(
                        &self.schema,
                        data,
                        CellBase::Block {
                            cell: offset,
                            block_size,
                        },
                        mask,
                    );
                    f(coord, cell);
                }
            }
        }
    }

    // ── Topology ────────────────────────────────────────────────────────

    /// Rebuild the neighbor table for the current block set.
    pub fn find_neighbours(&mut self) {
        let shape = self.mapping.shape();
        let generation = self.generation;
        let table = self
            .pool
            .install(|| NeighborTable::build(&self.lin, &self.store, shape, generation));
        self.table = Some(table);
    }

    /// Switch the neighborhood shape. The ghost mapping is rebuilt and all
    /// derived topology is dropped.
    pub fn set_neighbor_shape(&mut self, shape: NeighborShape) {
        if shape == self.mapping.shape() {
            return;
        }
        self.mapping = GhostMapping::build::<D>(self.lin.edge(), self.mapping.radius(), shape);
        self.config.shape = shape;
        self.drop_derived();
    }

    /// Set or clear the padding bit of every existing cell. Needs a fresh
    /// neighbor table. An unsupported radius changes nothing.
    pub fn tag_boundaries(&mut self, options: TagOptions) -> Result<TagReport, GridError> {
        boundary::check_radius(self.mapping.radius())?;
        let table = fresh_table(&self.table, self.mapping.shape(), self.generation)?;
        let generation = self.generation;
        let (existing, padding) = self
            .pool
            .install(|| boundary::tag_boundaries::<D>(&mut self.store, &self.mapping, table))?;
        self.tagged = Some(generation);

        let existing_points = if options.compute_existing_points {
            let points = self
                .pool
                .install(|| boundary::build_existing_points(&self.store, generation))?;
            let len = points.len();
            self.existing_points = Some(points);
            Some(len)
        } else {
            None
        };
        Ok(TagReport {
            existing,
            padding,
            existing_points,
        })
    }

    /// Neighbor table plus boundary tags (and the existing-points index if
    /// `with_points`) for the current generation, rebuilding what is stale.
    pub fn refresh_topology(&mut self, with_points: bool) -> Result<(), GridError> {
        if fresh_table(&self.table, self.mapping.shape(), self.generation).is_err() {
            self.find_neighbours();
        }
        let points_stale = with_points && !self.points_are_fresh();
        if self.tagged != Some(self.generation) || points_stale {
            let options = TagOptions {
                compute_existing_points: with_points,
            };
            self.tag_boundaries(options)?;
        }
        Ok(())
    }

    fn points_are_fresh(&self) -> bool {
        self.existing_points
            .as_ref()
            .is_some_and(|p| p.generation() == self.generation)
    }

    fn check_tags(&self) -> Result<(), GridError> {
        if self.tagged != Some(self.generation) {
            return Err(GridError::StaleBoundaryTags {
                tagged: self.tagged,
                current: self.generation,
            });
        }
        Ok(())
    }

    // ── Stencils ────────────────────────────────────────────────────────

    /// Apply `stencil` to every existing, non-padding cell. Needs fresh
    /// neighbors and tags (plus existing points for `InPlaceNoShared`).
    /// Returns the number of cells visited.
    pub fn apply_stencil(
        &mut self,
        mode: StencilMode,
        stencil: &dyn Stencil<D>,
    ) -> Result<usize, GridError> {
        boundary::check_radius(self.mapping.radius())?;
        let table = fresh_table(&self.table, self.mapping.shape(), self.generation)?;
        self.check_tags()?;
        let env = StencilEnv {
            lin: &self.lin,
            schema: &self.schema,
            mapping: &self.mapping,
            table,
        };

        let visited = match mode {
            StencilMode::InPlace => self.pool.install(|| {
                stencil::run_in_place(&env, &mut self.store, stencil, CellFilter::Interior)
            })?,
            StencilMode::InPlaceNoShared => {
                let points = self
                    .existing_points
                    .as_ref()
                    .filter(|p| p.generation() == self.generation)
                    .ok_or(GridError::StaleExistingPoints {
                        built: self.existing_points.as_ref().map(ExistingPoints::generation),
                        current: self.generation,
                    })?;
                self.pool.install(|| {
                    stencil::run_in_place_no_shared(&env, &mut self.store, points, stencil)
                })?
            }
            StencilMode::Insert | StencilMode::InsertNoFlush => {
                let (mut staged, visited) = self
                    .pool
                    .install(|| stencil::run_insert(&env, &self.store, stencil))?;
                self.buffer.append(&mut staged)?;
                visited
            }
        };

        tracing::debug!(?mode, visited, generation = self.generation, "applied stencil");
        if mode == StencilMode::Insert {
            self.flush()?;
        }
        Ok(visited)
    }

    /// Apply each stencil to completion before the next, refreshing the
    /// topology whenever a previous pass changed the structure.
    pub fn apply_stencils(
        &mut self,
        mode: StencilMode,
        stencils: &[&dyn Stencil<D>],
    ) -> Result<usize, GridError> {
        let mut visited = 0;
        for stencil in stencils {
            self.refresh_topology(mode == StencilMode::InPlaceNoShared)?;
            visited += self.apply_stencil(mode, *stencil)?;
        }
        Ok(visited)
    }

    /// In-place application to existing padding cells only.
    pub fn apply_boundary_stencil(&mut self, stencil: &dyn Stencil<D>) -> Result<usize, GridError> {
        boundary::check_radius(self.mapping.radius())?;
        let table = fresh_table(&self.table, self.mapping.shape(), self.generation)?;
        self.check_tags()?;
        let env = StencilEnv {
            lin: &self.lin,
            schema: &self.schema,
            mapping: &self.mapping,
            table,
        };
        self.pool
            .install(|| stencil::run_in_place(&env, &mut self.store, stencil, CellFilter::Padding))
    }

    // ── Accounting ──────────────────────────────────────────────────────

    pub fn count_existing(&self) -> usize {
        self.pool.install(|| accounting::count_existing(&self.store))
    }

    pub fn count_boundary(&self) -> usize {
        self.pool.install(|| accounting::count_boundary(&self.store))
    }

    pub fn measure_occupancy(&self, mode: OccupancyMode) -> OccupancyStats {
        self.pool
            .install(|| accounting::measure_occupancy(&self.store, mode))
    }

    // ── Pack / export ───────────────────────────────────────────────────

    pub fn pack_size(&self, request: &PackRequest<D>) -> Result<usize, GridError> {
        self.pool
            .install(|| pack::pack_size(&self.lin, &self.store, &self.schema, request))
    }

    pub fn pack(&self, request: &PackRequest<D>) -> Result<Vec<u8>, GridError> {
        self.pool
            .install(|| pack::pack(&self.lin, &self.store, &self.schema, request))
    }

    /// Insert every point of a buffer produced by `pack` with the same field
    /// subset, then flush. Returns the number of points read.
    pub fn unpack(&mut self, fields: &[FieldId], bytes: &[u8]) -> Result<usize, GridError> {
        let points = pack::unpack(
            &self.lin,
            &self.store,
            &self.schema,
            fields,
            bytes,
            &mut self.buffer,
        )?;
        self.flush()?;
        Ok(points)
    }

    /// Export existing cells through `writer`.
    pub fn write_points(
        &self,
        writer: &mut dyn PointWriter,
        fields: &[FieldId],
    ) -> Result<(), GridError> {
        let (points, props) = export::collect_points(&self.lin, &self.store, &self.schema, fields)?;
        writer.write(&points, &props)
    }

    /// Export existing cells as a legacy VTK point cloud.
    pub fn write(&self, path: impl AsRef<Path>, fields: &[FieldId]) -> Result<(), GridError> {
        let mut writer = VtkPointWriter::create(path)?;
        self.write_points(&mut writer, fields)
    }
}
