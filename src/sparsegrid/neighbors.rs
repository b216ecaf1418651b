//! Block adjacency: neighborhood shapes and the per-block neighbor table.
//!
//! Direction codes:
//! - `Star` (2·D directions): axis `d`, sign `s` → `2 * d + (s > 0) as usize`.
//! - `Full` (3^D directions): `Σ (delta_d + 1) * 3^d`. The center code
//!   `(3^D - 1) / 2` is self and always resolves to the background slot.

use rayon::prelude::*;

use super::block::{BlockSlot, BACKGROUND_SLOT};
use super::linearizer::Linearizer;
use super::store::BlockStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NeighborShape {
    /// Face neighbors only.
    #[default]
    Star,
    /// Every block in the surrounding 3^D cube, corners included.
    Full,
}

impl NeighborShape {
    #[inline]
    pub const fn n_neighbors(self, dim: usize) -> usize {
        match self {
            NeighborShape::Star => 2 * dim,
            NeighborShape::Full => 3usize.pow(dim as u32),
        }
    }

    /// Direction code of a block delta in `{-1, 0, 1}^D`, or `None` when the
    /// shape has no such direction (zero delta for `Star`, diagonals for `Star`).
    pub fn direction<const D: usize>(self, delta: [i64; D]) -> Option<usize> {
        debug_assert!(delta.iter().all(|d| (-1..=1).contains(d)));
        match self {
            NeighborShape::Star => {
                let mut found = None;
                for (axis, &d) in delta.iter().enumerate() {
                    if d != 0 {
                        if found.is_some() {
                            return None;
                        }
                        found = Some(2 * axis + usize::from(d > 0));
                    }
                }
                found
            }
            NeighborShape::Full => {
                let mut code = 0usize;
                let mut weight = 1usize;
                for &d in &delta {
                    code += (d + 1) as usize * weight;
                    weight *= 3;
                }
                Some(code)
            }
        }
    }

    /// Block delta for every direction code, indexed by code.
    pub fn offsets<const D: usize>(self) -> Vec<[i64; D]> {
        let n = self.n_neighbors(D);
        (0..n)
            .map(|code| match self {
                NeighborShape::Star => {
                    let mut delta = [0i64; D];
                    delta[code / 2] = if code % 2 == 0 { -1 } else { 1 };
                    delta
                }
                NeighborShape::Full => {
                    let mut delta = [0i64; D];
                    let mut rest = code;
                    for slot in delta.iter_mut() {
                        *slot = (rest % 3) as i64 - 1;
                        rest /= 3;
                    }
                    delta
                }
            })
            .collect()
    }
}

/// For every real block slot, the slot of each neighbor or `BACKGROUND_SLOT`.
///
/// Row `s - 1` belongs to slot `s`; the background slot has no row.
#[derive(Clone, Debug)]
pub struct NeighborTable {
    shape: NeighborShape,
    n_nn: usize,
    generation: u64,
    slots: Vec<u32>,
}

impl NeighborTable {
    /// One rayon task per block; each task writes only its own row.
    pub fn build<const D: usize>(
        lin: &Linearizer<D>,
        store: &BlockStore,
        shape: NeighborShape,
        generation: u64,
    ) -> Self {
        let n_nn = shape.n_neighbors(D);
        let offsets = shape.offsets::<D>();
        let mut slots = vec![BACKGROUND_SLOT; store.num_blocks() * n_nn];

        slots
            .par_chunks_mut(n_nn.max(1))
            .enumerate()
            .for_each(|(row, out)| {
                let key = store.key(BlockSlot(row as u32 + 1));
                let origin = lin.block_coord(key);
                for (dst, delta) in out.iter_mut().zip(offsets.iter()) {
                    if delta.iter().all(|&d| d == 0) {
                        *dst = BACKGROUND_SLOT;
                        continue;
                    }
                    let mut nb = origin;
                    for d in 0..D {
                        nb[d] += delta[d];
                    }
                    *dst = lin
                        .block_key(nb)
                        .and_then(|k| store.slot_of(k))
                        .map_or(BACKGROUND_SLOT, |s| s.0);
                }
            });

        tracing::debug!(
            blocks = store.num_blocks(),
            n_nn,
            ?shape,
            generation,
            "built neighbor table"
        );
        Self {
            shape,
            n_nn,
            generation,
            slots,
        }
    }

    #[inline]
    pub fn shape(&self) -> NeighborShape {
        self.shape
    }

    /// Directions per block.
    #[inline]
    pub fn n_neighbors(&self) -> usize {
        self.n_nn
    }

    /// Structural generation this table was built for.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.slots
    }

    /// Neighbor row of `slot`. The background slot's row is all background.
    #[inline]
    pub fn row(&self, slot: BlockSlot) -> &[u32] {
        if slot.is_background() {
            return &[];
        }
        let start = (slot.index() - 1) * self.n_nn;
        &self.slots[start..start + self.n_nn]
    }

    #[inline]
    pub fn get(&self, slot: BlockSlot, direction: usize) -> BlockSlot {
        BlockSlot(
            self.row(slot)
                .get(direction)
                .copied()
                .unwrap_or(BACKGROUND_SLOT),
        )
    }
}
