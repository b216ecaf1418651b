//! Block store with flat per-slot storage.
//!
//! Slot `s` owns `masks[s * block_size..][..block_size]` (one status byte per
//! cell) and `data[s * block_bytes..][..block_bytes]` (the field chunk, laid
//! out by the schema). Slot 0 is reserved as the background block: all zeros,
//! never assigned a real key, so neighbor gathers can read it unconditionally.

use rayon::prelude::*;

use super::block::{BlockSlot, BACKGROUND_SLOT};
use super::blockmap::BlockMap;
use super::error::GridError;
use super::linearizer::BACKGROUND_KEY;

#[derive(Clone)]
pub struct BlockStore {
    block_size: usize,
    block_bytes: usize,
    index: BlockMap,
    /// `keys[slot]`; `keys[0]` is `BACKGROUND_KEY`.
    keys: Vec<u64>,
    masks: Vec<u8>,
    data: Vec<u8>,
}

impl BlockStore {
    pub fn new(block_size: usize, record_size: usize) -> Self {
        let block_bytes = block_size * record_size;
        Self {
            block_size,
            block_bytes,
            index: BlockMap::new(),
            keys: vec![BACKGROUND_KEY],
            masks: vec![0; block_size],
            data: vec![0; block_bytes],
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes of field data per block.
    #[inline]
    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Number of real blocks (background excluded).
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.keys.len() - 1
    }

    /// Number of slots including the background slot.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn slot_of(&self, key: u64) -> Option<BlockSlot> {
        self.index.get(key)
    }

    #[inline]
    pub fn key(&self, slot: BlockSlot) -> u64 {
        self.keys[slot.index()]
    }

    #[inline]
    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    /// Real block slots in slot order.
    pub fn slots(&self) -> impl Iterator<Item = BlockSlot> + '_ {
        (1..self.keys.len() as u32).map(BlockSlot)
    }

    #[inline]
    pub fn masks(&self) -> &[u8] {
        &self.masks
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn block_masks(&self, slot: BlockSlot) -> &[u8] {
        let start = slot.index() * self.block_size;
        &self.masks[start..start + self.block_size]
    }

    #[inline]
    pub fn block_data(&self, slot: BlockSlot) -> &[u8] {
        let start = slot.index() * self.block_bytes;
        &self.data[start..start + self.block_bytes]
    }

    #[inline]
    pub fn block_mut(&mut self, slot: BlockSlot) -> (&mut [u8], &mut [u8]) {
        debug_assert!(!slot.is_background(), "background block is read-only");
        let m = slot.index() * self.block_size;
        let d = slot.index() * self.block_bytes;
        (
            &mut self.masks[m..m + self.block_size],
            &mut self.data[d..d + self.block_bytes],
        )
    }

    #[inline]
    pub fn masks_mut(&mut self) -> &mut [u8] {
        &mut self.masks
    }

    /// All status bytes plus the data of the real blocks, for in-place
    /// passes that rewrite fields but never structure.
    #[inline]
    pub fn split_data_mut(&mut self) -> (&[u8], &mut [u8]) {
        let block_bytes = self.block_bytes;
        (&self.masks, &mut self.data[block_bytes..])
    }

    #[inline]
    pub fn view(&self) -> StoreView<'_> {
        StoreView::new(&self.masks, &self.data, self.block_size, self.block_bytes)
    }

    /// Masks and data of the real blocks, split per block, for parallel writes.
    pub fn par_blocks_mut(
        &mut self,
    ) -> impl IndexedParallelIterator<Item = (BlockSlot, (&mut [u8], &mut [u8]))> + '_ {
        let block_size = self.block_size;
        let block_bytes = self.block_bytes;
        let masks = &mut self.masks[block_size..];
        let data = &mut self.data[block_bytes..];
        masks
            .par_chunks_mut(block_size)
            .zip(data.par_chunks_mut(block_bytes))
            .enumerate()
            .map(|(i, pair)| (BlockSlot(i as u32 + 1), pair))
    }

    /// Append slots for `new_keys` (which must not be present yet), in order.
    pub fn allocate(&mut self, new_keys: &[u64]) -> Result<(), GridError> {
        if new_keys.is_empty() {
            return Ok(());
        }
        let n = new_keys.len();
        let mask_bytes = n * self.block_size;
        let data_bytes = n * self.block_bytes;
        self.keys
            .try_reserve(n)
            .map_err(|_| GridError::allocation("block keys", n * 8))?;
        self.masks
            .try_reserve(mask_bytes)
            .map_err(|_| GridError::allocation("block status masks", mask_bytes))?;
        self.data
            .try_reserve(data_bytes)
            .map_err(|_| GridError::allocation("block data", data_bytes))?;
        self.index.try_reserve(n)?;

        for &key in new_keys {
            debug_assert!(key != BACKGROUND_KEY);
            let slot = BlockSlot(self.keys.len() as u32);
            let previous = self.index.insert(key, slot)?;
            debug_assert!(previous.is_none(), "block key {key} allocated twice");
            self.keys.push(key);
        }
        self.masks.resize(self.masks.len() + mask_bytes, 0);
        self.data.resize(self.data.len() + data_bytes, 0);
        Ok(())
    }

    /// Drop every real block; the background slot stays.
    pub fn clear(&mut self) {
        self.index.clear();
        self.keys.truncate(1);
        self.masks.truncate(self.block_size);
        self.data.truncate(self.block_bytes);
        self.masks.fill(0);
        self.data.fill(0);
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn background_is_clean(&self) -> bool {
        self.block_masks(BlockSlot(BACKGROUND_SLOT))
            .iter()
            .all(|&m| m == 0)
            && self
                .block_data(BlockSlot(BACKGROUND_SLOT))
                .iter()
                .all(|&b| b == 0)
    }
}

/// Read-only view over per-slot masks and data, built right before a
/// dispatch. The data can be a snapshot taken from the store.
#[derive(Clone, Copy)]
pub struct StoreView<'a> {
    masks: &'a [u8],
    data: &'a [u8],
    block_size: usize,
    block_bytes: usize,
}

impl<'a> StoreView<'a> {
    #[inline]
    pub fn new(masks: &'a [u8], data: &'a [u8], block_size: usize, block_bytes: usize) -> Self {
        debug_assert_eq!(masks.len() / block_size, data.len() / block_bytes);
        Self {
            masks,
            data,
            block_size,
            block_bytes,
        }
    }

    /// A view without field data; `block_data` yields empty slices.
    #[inline]
    pub fn masks_only(masks: &'a [u8], block_size: usize) -> Self {
        Self {
            masks,
            data: &[],
            block_size,
            block_bytes: 0,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline(always)]
    pub fn block_masks(&self, slot: BlockSlot) -> &'a [u8] {
        let start = slot.index() * self.block_size;
        &self.masks[start..start + self.block_size]
    }

    #[inline(always)]
    pub fn block_data(&self, slot: BlockSlot) -> &'a [u8] {
        let start = slot.index() * self.block_bytes;
        &self.data[start..start + self.block_bytes]
    }
}
