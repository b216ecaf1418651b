//! Coordinate linearization for the block grid.
//!
//! A point coordinate splits into a block coordinate (`coord.div_euclid(edge)`)
//! and an in-block local coordinate. Block coordinates are encoded as a single
//! `u64` key, either row-major over the block space (axis 0 fastest) or as a
//! Z-order (Morton) interleave. In-block offsets are always row-major.

use super::error::GridError;

/// Maximum cells per block. Offsets must fit the 2-byte pack field.
pub const MAX_BLOCK_CAPACITY: usize = 1 << 16;

/// Key reserved for the background block; never produced for a real block.
pub const BACKGROUND_KEY: u64 = u64::MAX;

/// How block coordinates are folded into a block key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockOrder {
    /// Axis 0 varies fastest.
    #[default]
    RowMajor,
    /// Bit-interleaved Z-order, axis 0 in the lowest bit of each group.
    Morton,
}

/// Default block edge for a given dimensionality.
pub const fn default_block_edge(dim: usize) -> usize {
    match dim {
        1 => 64,
        2 => 8,
        3 => 4,
        _ => 2,
    }
}

#[derive(Clone, Debug)]
pub struct Linearizer<const D: usize> {
    resolution: [usize; D],
    block_dims: [usize; D],
    block_strides: [u64; D],
    local_strides: [usize; D],
    edge: usize,
    block_size: usize,
    order: BlockOrder,
    /// Bits per axis in a Morton key.
    morton_bits: u32,
}

impl<const D: usize> Linearizer<D> {
    pub fn new(resolution: [usize; D], edge: usize, order: BlockOrder) -> Result<Self, GridError> {
        if D == 0 || resolution.iter().any(|&r| r == 0) {
            return Err(GridError::InvalidResolution {
                resolution: resolution.to_vec(),
            });
        }
        let block_size = edge
            .checked_pow(D as u32)
            .filter(|&size| edge > 0 && size <= MAX_BLOCK_CAPACITY)
            .ok_or(GridError::InvalidBlockEdge { edge, dim: D })?;

        let block_dims = resolution.map(|r| r.div_ceil(edge));
        let overflow = || GridError::BlockSpaceOverflow {
            block_dims: block_dims.to_vec(),
        };

        let mut block_strides = [0u64; D];
        let mut stride = 1u64;
        for d in 0..D {
            block_strides[d] = stride;
            stride = stride.checked_mul(block_dims[d] as u64).ok_or_else(overflow)?;
        }
        // `stride` is now the block-space volume; the last key is reserved.
        if stride == u64::MAX {
            return Err(overflow());
        }

        let max_axis = block_dims.iter().copied().max().unwrap_or(1);
        let morton_bits = usize::BITS - (max_axis.saturating_sub(1)).leading_zeros();
        if order == BlockOrder::Morton && (morton_bits as usize) * D >= 64 {
            return Err(overflow());
        }

        let mut local_strides = [0usize; D];
        let mut local = 1usize;
        for s in local_strides.iter_mut() {
            *s = local;
            local *= edge;
        }

        Ok(Self {
            resolution,
            block_dims,
            block_strides,
            local_strides,
            edge,
            block_size,
            order,
            morton_bits,
        })
    }

    #[inline]
    pub fn resolution(&self) -> [usize; D] {
        self.resolution
    }

    #[inline]
    pub fn block_dims(&self) -> [usize; D] {
        self.block_dims
    }

    #[inline]
    pub fn edge(&self) -> usize {
        self.edge
    }

    /// Cells per block (`edge^D`).
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn order(&self) -> BlockOrder {
        self.order
    }

    #[inline]
    pub fn contains(&self, coord: [i64; D]) -> bool {
        coord
            .iter()
            .zip(self.resolution.iter())
            .all(|(&c, &r)| c >= 0 && (c as u64) < r as u64)
    }

    #[inline]
    pub fn block_coord_of(&self, coord: [i64; D]) -> [i64; D] {
        let edge = self.edge as i64;
        coord.map(|c| c.div_euclid(edge))
    }

    #[inline]
    pub fn block_in_space(&self, block: [i64; D]) -> bool {
        block
            .iter()
            .zip(self.block_dims.iter())
            .all(|(&b, &n)| b >= 0 && (b as u64) < n as u64)
    }

    /// Encode a block coordinate, or `None` if it lies outside the block space.
    #[inline]
    pub fn block_key(&self, block: [i64; D]) -> Option<u64> {
        if !self.block_in_space(block) {
            return None;
        }
        Some(match self.order {
            BlockOrder::RowMajor => block
                .iter()
                .zip(self.block_strides.iter())
                .map(|(&b, &s)| b as u64 * s)
                .sum(),
            BlockOrder::Morton => morton_encode(&block, self.morton_bits),
        })
    }

    /// Decode a block key produced by [`Linearizer::block_key`].
    #[inline]
    pub fn block_coord(&self, key: u64) -> [i64; D] {
        match self.order {
            BlockOrder::RowMajor => {
                let mut out = [0i64; D];
                let mut rest = key;
                for d in 0..D {
                    let n = self.block_dims[d] as u64;
                    out[d] = (rest % n) as i64;
                    rest /= n;
                }
                out
            }
            BlockOrder::Morton => morton_decode(key, self.morton_bits),
        }
    }

    #[inline]
    pub fn local_offset(&self, local: [usize; D]) -> u32 {
        local
            .iter()
            .zip(self.local_strides.iter())
            .map(|(&l, &s)| l * s)
            .sum::<usize>() as u32
    }

    #[inline]
    pub fn local_coord(&self, offset: u32) -> [usize; D] {
        let mut out = [0usize; D];
        let mut rest = offset as usize;
        for slot in out.iter_mut() {
            *slot = rest % self.edge;
            rest /= self.edge;
        }
        out
    }

    /// Split a point into `(block key, in-block offset)`; `None` outside the domain.
    #[inline]
    pub fn split(&self, coord: [i64; D]) -> Option<(u64, u32)> {
        if !self.contains(coord) {
            return None;
        }
        let edge = self.edge as i64;
        let key = self.block_key(coord.map(|c| c / edge))?;
        let local = coord.map(|c| (c % edge) as usize);
        Some((key, self.local_offset(local)))
    }

    /// Inverse of [`Linearizer::split`].
    #[inline]
    pub fn join(&self, key: u64, offset: u32) -> [i64; D] {
        let block = self.block_coord(key);
        let local = self.local_coord(offset);
        let edge = self.edge as i64;
        let mut out = [0i64; D];
        for d in 0..D {
            out[d] = block[d] * edge + local[d] as i64;
        }
        out
    }
}

#[inline]
fn morton_encode<const D: usize>(block: &[i64; D], bits: u32) -> u64 {
    let mut key = 0u64;
    for bit in 0..bits {
        for (d, &b) in block.iter().enumerate() {
            key |= ((b as u64 >> bit) & 1) << (bit as usize * D + d);
        }
    }
    key
}

#[inline]
fn morton_decode<const D: usize>(key: u64, bits: u32) -> [i64; D] {
    let mut out = [0i64; D];
    for bit in 0..bits {
        for (d, slot) in out.iter_mut().enumerate() {
            *slot |= (((key >> (bit as usize * D + d)) & 1) as i64) << bit;
        }
    }
    out
}
