//! Ghost layer mapping and enlarged-block gathers.
//!
//! For a stencil radius `r` the enlarged block has edge `edge + 2r`. Its
//! positions split into the inner box (the block itself) and the skin (the
//! halo). The mapping is pure geometry, shared by every block, and lists each
//! skin position once in row-major order with the direction code of the
//! neighbor block that supplies it.
//!
//! Gathers are branchless on the neighbor side: a missing neighbor (or a
//! direction the shape does not have) reads the background slot.

use super::block::{BlockSlot, BACKGROUND_SLOT};
use super::layout::Schema;
use super::neighbors::NeighborShape;
use super::store::StoreView;

/// Skin direction for positions the neighborhood shape does not cover
/// (diagonal halo under `Star`). Such positions read the background block.
pub const NO_DIRECTION: u16 = u16::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GhostEntry {
    /// Linear position inside the enlarged block.
    pub extended_offset: u32,
    /// Neighbor direction code, or `NO_DIRECTION`.
    pub direction: u16,
    /// In-block offset of the supplying cell in the neighbor block.
    pub source_offset: u32,
}

#[derive(Clone, Debug)]
pub struct GhostMapping {
    radius: usize,
    edge: usize,
    ext_edge: usize,
    ext_size: usize,
    shape: NeighborShape,
    ext_strides: Vec<usize>,
    /// Block offset → enlarged offset.
    inner: Vec<u32>,
    skin: Vec<GhostEntry>,
}

/// `(edge + 2r)^dim - edge^dim`.
pub fn skin_len(edge: usize, radius: usize, dim: usize) -> usize {
    (edge + 2 * radius).pow(dim as u32) - edge.pow(dim as u32)
}

impl GhostMapping {
    pub fn build<const D: usize>(edge: usize, radius: usize, shape: NeighborShape) -> Self {
        let ext_edge = edge + 2 * radius;
        let ext_size = ext_edge.pow(D as u32);
        let block_size = edge.pow(D as u32);

        let mut ext_strides = Vec::with_capacity(D);
        let mut stride = 1usize;
        for _ in 0..D {
            ext_strides.push(stride);
            stride *= ext_edge;
        }

        let mut inner = vec![0u32; block_size];
        let mut skin = Vec::with_capacity(ext_size - block_size);
        let r = radius as i64;
        let e = edge as i64;

        for p in 0..ext_size {
            let mut rest = p;
            let mut local = [0i64; D];
            for slot in local.iter_mut() {
                *slot = (rest % ext_edge) as i64 - r;
                rest /= ext_edge;
            }

            let mut delta = [0i64; D];
            let mut source = 0usize;
            let mut weight = 1usize;
            for d in 0..D {
                delta[d] = if local[d] < 0 {
                    -1
                } else if local[d] >= e {
                    1
                } else {
                    0
                };
                let src = local[d] - delta[d] * e;
                source += src as usize * weight;
                weight *= edge;
            }

            if delta.iter().all(|&d| d == 0) {
                inner[source] = p as u32;
            } else {
                let direction = shape
                    .direction(delta)
                    .map_or(NO_DIRECTION, |code| code as u16);
                skin.push(GhostEntry {
                    extended_offset: p as u32,
                    direction,
                    source_offset: source as u32,
                });
            }
        }

        debug_assert_eq!(skin.len(), skin_len(edge, radius, D));
        Self {
            radius,
            edge,
            ext_edge,
            ext_size,
            shape,
            ext_strides,
            inner,
            skin,
        }
    }

    #[inline]
    pub fn radius(&self) -> usize {
        self.radius
    }

    #[inline]
    pub fn edge(&self) -> usize {
        self.edge
    }

    #[inline]
    pub fn shape(&self) -> NeighborShape {
        self.shape
    }

    /// Edge of the enlarged block.
    #[inline]
    pub fn ext_edge(&self) -> usize {
        self.ext_edge
    }

    /// Positions in the enlarged block.
    #[inline]
    pub fn ext_size(&self) -> usize {
        self.ext_size
    }

    #[inline]
    pub fn inner(&self) -> &[u32] {
        &self.inner
    }

    #[inline]
    pub fn skin(&self) -> &[GhostEntry] {
        &self.skin
    }

    /// Enlarged offset of a block offset.
    #[inline(always)]
    pub fn center(&self, offset: usize) -> usize {
        self.inner[offset] as usize
    }

    /// Offset shift inside the enlarged block for a cell delta.
    #[inline(always)]
    pub fn ext_delta<const D: usize>(&self, delta: [i64; D]) -> isize {
        delta
            .iter()
            .zip(self.ext_strides.iter())
            .map(|(&d, &s)| d as isize * s as isize)
            .sum()
    }

    /// Offset shifts of every cell a boundary check must see: the `±1..=r`
    /// axis cells for `Star`, the whole `[-r, r]^D` cube minus the center
    /// for `Full`.
    pub fn support_deltas<const D: usize>(&self) -> Vec<isize> {
        let r = self.radius as i64;
        let mut out = Vec::new();
        match self.shape {
            NeighborShape::Star => {
                for d in 0..D {
                    for k in 1..=r {
                        let mut delta = [0i64; D];
                        delta[d] = -k;
                        out.push(self.ext_delta(delta));
                        delta[d] = k;
                        out.push(self.ext_delta(delta));
                    }
                }
            }
            NeighborShape::Full => {
                let side = (2 * r + 1) as usize;
                for code in 0..side.pow(D as u32) {
                    let mut rest = code;
                    let mut delta = [0i64; D];
                    for slot in delta.iter_mut() {
                        *slot = (rest % side) as i64 - r;
                        rest /= side;
                    }
                    if delta.iter().any(|&d| d != 0) {
                        out.push(self.ext_delta(delta));
                    }
                }
            }
        }
        out
    }
}

#[inline(always)]
fn source_slot(row: &[u32], direction: u16) -> BlockSlot {
    if direction == NO_DIRECTION {
        return BlockSlot(BACKGROUND_SLOT);
    }
    BlockSlot(row.get(direction as usize).copied().unwrap_or(BACKGROUND_SLOT))
}

/// Per-worker enlarged block: status bytes plus packed records.
#[derive(Clone, Debug)]
pub struct EnlargedBlock {
    record_size: usize,
    masks: Vec<u8>,
    records: Vec<u8>,
}

impl EnlargedBlock {
    pub fn new(mapping: &GhostMapping, record_size: usize) -> Self {
        Self {
            record_size,
            masks: vec![0; mapping.ext_size()],
            records: vec![0; mapping.ext_size() * record_size],
        }
    }

    /// Masks-only variant for boundary checks.
    pub fn masks_only(mapping: &GhostMapping) -> Self {
        Self {
            record_size: 0,
            masks: vec![0; mapping.ext_size()],
            records: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn mask(&self, ext: usize) -> u8 {
        self.masks[ext]
    }

    #[inline(always)]
    pub fn record(&self, ext: usize) -> &[u8] {
        let start = ext * self.record_size;
        &self.records[start..start + self.record_size]
    }

    /// Gather status bytes of `slot` and its halo.
    pub fn gather_masks(
        &mut self,
        mapping: &GhostMapping,
        view: &StoreView<'_>,
        row: &[u32],
        slot: BlockSlot,
    ) {
        let own = view.block_masks(slot);
        for (offset, &ext) in mapping.inner().iter().enumerate() {
            self.masks[ext as usize] = own[offset];
        }
        for entry in mapping.skin() {
            let src = view.block_masks(source_slot(row, entry.direction));
            self.masks[entry.extended_offset as usize] = src[entry.source_offset as usize];
        }
    }

    /// Gather status bytes and records of `slot` and its halo.
    pub fn gather(
        &mut self,
        mapping: &GhostMapping,
        schema: &Schema,
        view: &StoreView<'_>,
        row: &[u32],
        slot: BlockSlot,
    ) {
        debug_assert_eq!(self.record_size, schema.record_size());
        self.gather_masks(mapping, view, row, slot);
        let rs = self.record_size;
        let block_size = view.block_size();
        let own = view.block_data(slot);
        for (offset, &ext) in mapping.inner().iter().enumerate() {
            let start = ext as usize * rs;
            schema.read_record(own, block_size, offset, &mut self.records[start..start + rs]);
        }
        for entry in mapping.skin() {
            let src = view.block_data(source_slot(row, entry.direction));
            let start = entry.extended_offset as usize * rs;
            schema.read_record(
                src,
                block_size,
                entry.source_offset as usize,
                &mut self.records[start..start + rs],
            );
        }
    }
}
