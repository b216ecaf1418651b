//! Boundary tagging and the existing-points index.
//!
//! A cell is padding when any cell its stencil support needs is missing.
//! Tagging reads a snapshot of the status bytes so every block sees the same
//! pre-pass state, and writes only its own block.

use rayon::prelude::*;

use super::block::{self, BlockSlot};
use super::error::{GridError, MAX_SUPPORTED_RADIUS};
use super::ghost::{EnlargedBlock, GhostMapping};
use super::neighbors::NeighborTable;
use super::store::{BlockStore, StoreView};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagOptions {
    /// Also rebuild the compacted existing-points index.
    pub compute_existing_points: bool,
}

impl TagOptions {
    pub fn with_existing_points() -> Self {
        Self {
            compute_existing_points: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagReport {
    pub existing: usize,
    pub padding: usize,
    /// Size of the rebuilt existing-points index, if one was requested.
    pub existing_points: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExistingPoint {
    pub slot: BlockSlot,
    pub offset: u32,
}

/// Every existing, non-padding cell, grouped by block in slot order.
#[derive(Clone, Debug, Default)]
pub struct ExistingPoints {
    generation: u64,
    points: Vec<ExistingPoint>,
    /// Exclusive scan of per-block counts, `num_blocks + 1` entries.
    block_starts: Vec<u32>,
}

impl ExistingPoints {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn points(&self) -> &[ExistingPoint] {
        &self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn block_starts(&self) -> &[u32] {
        &self.block_starts
    }

    /// Points of one real block.
    pub fn block(&self, slot: BlockSlot) -> &[ExistingPoint] {
        if slot.is_background() || slot.index() >= self.block_starts.len() {
            return &[];
        }
        let start = self.block_starts[slot.index() - 1] as usize;
        let end = self.block_starts[slot.index()] as usize;
        &self.points[start..end]
    }
}

pub(crate) fn check_radius(radius: usize) -> Result<(), GridError> {
    if radius > MAX_SUPPORTED_RADIUS {
        tracing::warn!(
            radius,
            max = MAX_SUPPORTED_RADIUS,
            "stencil radius not supported; skipping"
        );
        return Err(GridError::UnsupportedRadius {
            radius,
            max: MAX_SUPPORTED_RADIUS,
        });
    }
    Ok(())
}

/// Set or clear the padding bit of every existing cell.
pub fn tag_boundaries<const D: usize>(
    store: &mut BlockStore,
    mapping: &GhostMapping,
    table: &NeighborTable,
) -> Result<(usize, usize), GridError> {
    check_radius(mapping.radius())?;

    let block_size = store.block_size();
    let mut snapshot = Vec::new();
    snapshot
        .try_reserve_exact(store.masks().len())
        .map_err(|_| GridError::allocation("boundary tag snapshot", store.masks().len()))?;
    snapshot.extend_from_slice(store.masks());
    let view = StoreView::masks_only(&snapshot, block_size);
    let deltas = mapping.support_deltas::<D>();

    let (existing, padding) = store.masks_mut()[block_size..]
        .par_chunks_mut(block_size)
        .enumerate()
        .map_init(
            || EnlargedBlock::masks_only(mapping),
            |buf, (row, masks)| {
                let slot = BlockSlot(row as u32 + 1);
                buf.gather_masks(mapping, &view, table.row(slot), slot);
                let mut existing = 0usize;
                let mut padding = 0usize;
                for (offset, mask) in masks.iter_mut().enumerate() {
                    if !block::exists(*mask) {
                        continue;
                    }
                    existing += 1;
                    let center = mapping.center(offset) as isize;
                    let complete = deltas
                        .iter()
                        .all(|&d| block::exists(buf.mask((center + d) as usize)));
                    if complete {
                        block::unset_padding(mask);
                    } else {
                        block::set_padding(mask);
                        padding += 1;
                    }
                }
                (existing, padding)
            },
        )
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    tracing::debug!(
        existing,
        padding,
        radius = mapping.radius(),
        shape = ?mapping.shape(),
        "tagged boundary cells"
    );
    Ok((existing, padding))
}

/// Count → exclusive scan → scatter of every existing, non-padding cell.
pub fn build_existing_points(
    store: &BlockStore,
    generation: u64,
) -> Result<ExistingPoints, GridError> {
    let block_size = store.block_size();
    let masks = &store.masks()[block_size..];

    let counts: Vec<u32> = masks
        .par_chunks(block_size)
        .map(|block| block.iter().filter(|&&m| block::is_interior(m)).count() as u32)
        .collect();

    let mut block_starts = Vec::with_capacity(counts.len() + 1);
    let mut total = 0u32;
    block_starts.push(0);
    for &c in &counts {
        total += c;
        block_starts.push(total);
    }

    let mut points = Vec::new();
    points
        .try_reserve_exact(total as usize)
        .map_err(|_| {
            GridError::allocation(
                "existing-points index",
                total as usize * std::mem::size_of::<ExistingPoint>(),
            )
        })?;
    points.resize(
        total as usize,
        ExistingPoint {
            slot: BlockSlot(0),
            offset: 0,
        },
    );

    let mut parts: Vec<&mut [ExistingPoint]> = Vec::with_capacity(counts.len());
    let mut rest = points.as_mut_slice();
    for &c in &counts {
        let (head, tail) = rest.split_at_mut(c as usize);
        parts.push(head);
        rest = tail;
    }

    parts
        .into_par_iter()
        .zip(masks.par_chunks(block_size))
        .enumerate()
        .for_each(|(row, (out, block))| {
            let slot = BlockSlot(row as u32 + 1);
            let interior = block
                .iter()
                .enumerate()
                .filter(|(_, &m)| block::is_interior(m));
            for (dst, (offset, _)) in out.iter_mut().zip(interior) {
                *dst = ExistingPoint {
                    slot,
                    offset: offset as u32,
                };
            }
        });

    Ok(ExistingPoints {
        generation,
        points,
        block_starts,
    })
}
