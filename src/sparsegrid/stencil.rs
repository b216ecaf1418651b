//! Stencil execution over the tagged, neighbor-indexed block set.
//!
//! Every mode visits the same cells (existing and not padding) and every
//! mode reads the pre-pass state, so results are independent of scheduling
//! and thread count:
//! - `InPlace`: one task per block gathers the enlarged block from a data
//!   snapshot, then writes the block's own cells.
//! - `Insert` / `InsertNoFlush`: the store stays immutable during the pass;
//!   writes (center or any neighbor position) are staged per block and
//!   appended to the grid's insert buffer in slot order.
//! - `InPlaceNoShared`: one task per chunk of the existing-points index,
//!   neighbor reads go straight through the neighbor table, outputs are
//!   buffered and scattered after the pass.

use rayon::prelude::*;

use super::block::{self, BlockSlot, BACKGROUND_SLOT};
use super::boundary::ExistingPoints;
use super::cell::{CellMut, CellRef};
use super::error::GridError;
use super::ghost::{EnlargedBlock, GhostMapping};
use super::insert::InsertBuffer;
use super::layout::{CellBase, Field, FieldScalar, Schema};
use super::linearizer::Linearizer;
use super::neighbors::NeighborTable;
use super::store::{BlockStore, StoreView};

/// Existing points per task in `InPlaceNoShared` mode.
pub const NO_SHARED_CHUNK: usize = 128;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StencilMode {
    Insert = 0,
    #[default]
    InPlace = 1,
    InsertNoFlush = 2,
    InPlaceNoShared = 3,
}

impl StencilMode {
    #[inline]
    pub const fn is_insert(self) -> bool {
        matches!(self, StencilMode::Insert | StencilMode::InsertNoFlush)
    }
}

/// A per-cell operator. It is shared by every worker, hence `Sync`.
pub trait Stencil<const D: usize>: Sync {
    fn apply(&self, point: &StencilPoint<'_, D>, out: &mut StencilOutput<'_, D>);
}

/// Adapter turning a closure into a [`Stencil`].
pub struct FnStencil<F>(pub F);

impl<const D: usize, F> Stencil<D> for FnStencil<F>
where
    F: Fn(&StencilPoint<'_, D>, &mut StencilOutput<'_, D>) + Sync,
{
    #[inline]
    fn apply(&self, point: &StencilPoint<'_, D>, out: &mut StencilOutput<'_, D>) {
        (self.0)(point, out)
    }
}

pub fn stencil_fn<const D: usize, F>(f: F) -> FnStencil<F>
where
    F: Fn(&StencilPoint<'_, D>, &mut StencilOutput<'_, D>) + Sync,
{
    FnStencil(f)
}

// ── Read side ───────────────────────────────────────────────────────────

enum Source<'a, const D: usize> {
    Enlarged {
        mapping: &'a GhostMapping,
        block: &'a EnlargedBlock,
        center: usize,
    },
    Direct {
        mapping: &'a GhostMapping,
        view: StoreView<'a>,
        row: &'a [u32],
        slot: BlockSlot,
        local: [usize; D],
    },
}

/// The cell being updated plus read access to its stencil support.
pub struct StencilPoint<'a, const D: usize> {
    coord: [i64; D],
    schema: &'a Schema,
    background: &'a [u8],
    source: Source<'a, D>,
}

impl<'a, const D: usize> StencilPoint<'a, D> {
    #[inline]
    pub fn coord(&self) -> [i64; D] {
        self.coord
    }

    #[inline]
    pub fn cell(&self) -> CellRef<'_> {
        self.neighbor([0; D])
    }

    /// Component 0 of `field` at the center.
    #[inline]
    pub fn get<T: FieldScalar>(&self, field: Field<T>) -> T {
        self.cell().get(field)
    }

    /// The cell at `coord + delta`. Cells outside the stencil radius, outside
    /// the domain or in absent blocks read as the background cell.
    pub fn neighbor(&self, delta: [i64; D]) -> CellRef<'_> {
        let mapping = match &self.source {
            Source::Enlarged { mapping, .. } | Source::Direct { mapping, .. } => *mapping,
        };
        let r = mapping.radius() as i64;
        if delta.iter().any(|d| d.abs() > r) {
            if cfg!(debug_assertions) {
                tracing::debug!(?delta, radius = r, "stencil read beyond radius");
            }
            return CellRef::new(self.schema, self.background, CellBase::Record, 0);
        }
        match &self.source {
            Source::Enlarged { block, center, .. } => {
                let ext = (*center as isize + mapping.ext_delta(delta)) as usize;
                CellRef::new(self.schema, block.record(ext), CellBase::Record, block.mask(ext))
            }
            Source::Direct {
                view,
                row,
                slot,
                local,
                ..
            } => {
                let edge = mapping.edge() as i64;
                let mut block_delta = [0i64; D];
                let mut src_local = [0usize; D];
                for d in 0..D {
                    let l = local[d] as i64 + delta[d];
                    block_delta[d] = l.div_euclid(edge);
                    src_local[d] = l.rem_euclid(edge) as usize;
                }
                let src = if block_delta.iter().all(|&b| b == 0) {
                    *slot
                } else {
                    mapping
                        .shape()
                        .direction(block_delta)
                        .and_then(|dir| row.get(dir).copied())
                        .map_or(BlockSlot(BACKGROUND_SLOT), BlockSlot)
                };
                let mut cell = 0usize;
                let mut weight = 1usize;
                for &l in &src_local {
                    cell += l * weight;
                    weight *= mapping.edge();
                }
                CellRef::new(
                    self.schema,
                    view.block_data(src),
                    CellBase::Block {
                        cell,
                        block_size: view.block_size(),
                    },
                    view.block_masks(src)[cell],
                )
            }
        }
    }
}

// ── Write side ──────────────────────────────────────────────────────────

struct InsertContext<'a, const D: usize> {
    lin: &'a Linearizer<D>,
    schema: &'a Schema,
    store: &'a BlockStore,
}

impl<const D: usize> InsertContext<'_, D> {
    /// Stage `coord`, starting from its committed record when it exists.
    fn stage(&self, staging: &mut InsertBuffer, coord: [i64; D]) -> Result<Option<usize>, GridError> {
        let Some((key, offset)) = self.lin.split(coord) else {
            return Ok(None);
        };
        let index = staging.len();
        let record = staging.stage(key, offset, None)?;
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
        Ok(Some(index))
    }
}

enum OutputKind<'a, const D: usize> {
    Direct(CellMut<'a>),
    Staged {
        ctx: &'a InsertContext<'a, D>,
        staging: &'a mut InsertBuffer,
        scratch: &'a mut [u8],
        error: &'a mut Option<GridError>,
        coord: [i64; D],
        center: Option<usize>,
    },
}

/// Write access granted to a stencil for one point.
pub struct StencilOutput<'a, const D: usize> {
    schema: &'a Schema,
    kind: OutputKind<'a, D>,
}

impl<'a, const D: usize> StencilOutput<'a, D> {
    /// The center cell. In insert modes the first call stages it.
    pub fn center(&mut self) -> CellMut<'_> {
        let schema = self.schema;
        match &mut self.kind {
            OutputKind::Direct(cell) => cell.reborrow(),
            OutputKind::Staged {
                ctx,
                staging,
                scratch,
                error,
                coord,
                center,
            } => {
                if center.is_none() {
                    match ctx.stage(staging, *coord) {
                        Ok(index) => *center = index,
                        Err(err) => {
                            error.get_or_insert(err);
                        }
                    }
                }
                match *center {
                    Some(index) => CellMut::new(schema, staging.record_mut(index), CellBase::Record),
                    None => CellMut::new(schema, scratch, CellBase::Record),
                }
            }
        }
    }

    /// Stage the cell at `coord + delta`, creating it on flush if needed.
    /// `None` in in-place modes and for targets outside the domain.
    pub fn insert(&mut self, delta: [i64; D]) -> Option<CellMut<'_>> {
        if delta.iter().all(|&d| d == 0) {
            return if self.is_insert() {
                Some(self.center())
            } else {
                None
            };
        }
        let schema = self.schema;
        match &mut self.kind {
            OutputKind::Direct(_) => {
                if cfg!(debug_assertions) {
                    tracing::debug!(?delta, "insert requested from an in-place stencil");
                }
                None
            }
            OutputKind::Staged {
                ctx,
                staging,
                error,
                coord,
                ..
            } => {
                let mut target = *coord;
                for d in 0..D {
                    target[d] += delta[d];
                }
                match ctx.stage(staging, target) {
                    Ok(Some(index)) => {
                        Some(CellMut::new(schema, staging.record_mut(index), CellBase::Record))
                    }
                    Ok(None) => None,
                    Err(err) => {
                        error.get_or_insert(err);
                        None
                    }
                }
            }
        }
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OutputKind::Staged { .. })
    }
}

// ── Executors ───────────────────────────────────────────────────────────

/// Which existing cells a pass visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CellFilter {
    Interior,
    Padding,
}

impl CellFilter {
    #[inline(always)]
    fn accepts(self, mask: u8) -> bool {
        match self {
            CellFilter::Interior => block::is_interior(mask),
            CellFilter::Padding => block::is_padding(mask),
        }
    }
}

/// Borrowed grid components for one dispatch.
pub(crate) struct StencilEnv<'a, const D: usize> {
    pub lin: &'a Linearizer<D>,
    pub schema: &'a Schema,
    pub mapping: &'a GhostMapping,
    pub table: &'a NeighborTable,
}

fn try_copy(bytes: &[u8], what: &'static str) -> Result<Vec<u8>, GridError> {
    let mut out = Vec::new();
    out.try_reserve_exact(bytes.len())
        .map_err(|_| GridError::allocation(what, bytes.len()))?;
    out.extend_from_slice(bytes);
    Ok(out)
}

/// In-place pass over the cells selected by `filter`. Returns cells visited.
pub(crate) fn run_in_place<const D: usize>(
    env: &StencilEnv<'_, D>,
    store: &mut BlockStore,
    stencil: &dyn Stencil<D>,
    filter: CellFilter,
) -> Result<usize, GridError> {
    let StencilEnv {
        lin,
        schema,
        mapping,
        table,
    } = *env;
    let block_size = store.block_size();
    let block_bytes = store.block_bytes();
    let rs = schema.record_size();
    let background = vec![0u8; rs];
    let snapshot = try_copy(store.data(), "in-place stencil snapshot")?;
    let keys = store.keys().to_vec();

    let (masks, data) = store.split_data_mut();
    let view = StoreView::new(masks, &snapshot, block_size, block_bytes);

    let visited = data
        .par_chunks_mut(block_bytes)
        .enumerate()
        .map_init(
            || EnlargedBlock::new(mapping, rs),
            |ext, (row, chunk)| {
                let slot = BlockSlot(row as u32 + 1);
                let own = view.block_masks(slot);
                if !own.iter().any(|&m| filter.accepts(m)) {
                    return 0usize;
                }
                ext.gather(mapping, schema, &view, table.row(slot), slot);
                let key = keys[slot.index()];
                let mut visited = 0usize;
                for (offset, &mask) in own.iter().enumerate() {
                    if !filter.accepts(mask) {
                        continue;
                    }
                    let point = StencilPoint {
                        coord: lin.join(key, offset as u32),
                        schema,
                        background: &background,
                        source: Source::Enlarged {
                            mapping,
                            block: &*ext,
                            center: mapping.center(offset),
                        },
                    };
                    let cell = CellMut::new(
                        schema,
                        &mut *chunk,
                        CellBase::Block {
                            cell: offset,
                            block_size,
                        },
                    );
                    let mut out = StencilOutput {
                        schema,
                        kind: OutputKind::Direct(cell),
                    };
                    stencil.apply(&point, &mut out);
                    visited += 1;
                }
                visited
            },
        )
        .sum::<usize>();
    Ok(visited)
}

/// Insert-mode pass. The store is only read; staged writes come back in
/// slot order, cells in offset order within a block.
pub(crate) fn run_insert<const D: usize>(
    env: &StencilEnv<'_, D>,
    store: &BlockStore,
    stencil: &dyn Stencil<D>,
) -> Result<(InsertBuffer, usize), GridError> {
    let StencilEnv {
        lin,
        schema,
        mapping,
        table,
    } = *env;
    let rs = schema.record_size();
    let background = vec![0u8; rs];
    let view = store.view();
    let ctx = InsertContext { lin, schema, store };

    struct Acc {
        staged: InsertBuffer,
        ext: EnlargedBlock,
        scratch: Vec<u8>,
        visited: usize,
    }

    (1..store.slot_count() as u32)
        .into_par_iter()
        .map(BlockSlot)
        .try_fold(
            || Acc {
                staged: InsertBuffer::new(rs),
                ext: EnlargedBlock::new(mapping, rs),
                scratch: vec![0u8; rs],
                visited: 0,
            },
            |mut acc, slot| -> Result<Acc, GridError> {
                let own = view.block_masks(slot);
                if !own.iter().any(|&m| block::is_interior(m)) {
                    return Ok(acc);
                }
                acc.ext.gather(mapping, schema, &view, table.row(slot), slot);
                let key = store.key(slot);
                let mut error = None;
                for (offset, &mask) in own.iter().enumerate() {
                    if !block::is_interior(mask) {
                        continue;
                    }
                    let coord = lin.join(key, offset as u32);
                    let point = StencilPoint {
                        coord,
                        schema,
                        background: &background,
                        source: Source::Enlarged {
                            mapping,
                            block: &acc.ext,
                            center: mapping.center(offset),
                        },
                    };
                    let mut out = StencilOutput {
                        schema,
                        kind: OutputKind::Staged {
                            ctx: &ctx,
                            staging: &mut acc.staged,
                            scratch: &mut acc.scratch,
                            error: &mut error,
                            coord,
                            center: None,
                        },
                    };
                    stencil.apply(&point, &mut out);
                    acc.visited += 1;
                }
                match error {
                    Some(err) => Err(err),
                    None => Ok(acc),
                }
            },
        )
        .map(|acc| acc.map(|acc| (acc.staged, acc.visited)))
        .try_reduce(
            || (InsertBuffer::new(rs), 0),
            |(mut left, lv), (mut right, rv)| {
                left.append(&mut right)?;
                Ok((left, lv + rv))
            },
        )
}

/// In-place pass driven by the existing-points index.
pub(crate) fn run_in_place_no_shared<const D: usize>(
    env: &StencilEnv<'_, D>,
    store: &mut BlockStore,
    points: &ExistingPoints,
    stencil: &dyn Stencil<D>,
) -> Result<usize, GridError> {
    let StencilEnv {
        lin,
        schema,
        mapping,
        table,
    } = *env;
    let rs = schema.record_size();
    let block_size = store.block_size();
    let background = vec![0u8; rs];

    let total = points.len() * rs;
    let mut results = Vec::new();
    results
        .try_reserve_exact(total)
        .map_err(|_| GridError::allocation("no-shared stencil output", total))?;
    results.resize(total, 0u8);

    {
        let view = store.view();
        let keys = store.keys();
        results
            .par_chunks_mut(NO_SHARED_CHUNK * rs)
            .zip(points.points().par_chunks(NO_SHARED_CHUNK))
            .for_each(|(out, chunk)| {
                for (record, p) in out.chunks_exact_mut(rs).zip(chunk) {
                    schema.read_record(view.block_data(p.slot), block_size, p.offset as usize, record);
                    let point = StencilPoint {
                        coord: lin.join(keys[p.slot.index()], p.offset),
                        schema,
                        background: &background,
                        source: Source::Direct {
                            mapping,
                            view,
                            row: table.row(p.slot),
                            slot: p.slot,
                            local: lin.local_coord(p.offset),
                        },
                    };
                    let mut output = StencilOutput {
                        schema,
                        kind: OutputKind::Direct(CellMut::new(schema, record, CellBase::Record)),
                    };
                    stencil.apply(&point, &mut output);
                }
            });
    }

    let starts = points.block_starts();
    store.par_blocks_mut().for_each(|(slot, (_, data))| {
        let base = starts[slot.index() - 1] as usize;
        for (k, p) in points.block(slot).iter().enumerate() {
            let at = (base + k) * rs;
            schema.write_record(data, block_size, p.offset as usize, &results[at..at + rs]);
        }
    });
    Ok(points.len())
}
