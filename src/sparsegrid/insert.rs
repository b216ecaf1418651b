//! Insert buffer and the flush merge.
//!
//! Inserts never touch the committed store. Each one appends a
//! `(block key, offset)` entry plus a full staged record to the buffer.
//! `flush` merges the batch:
//!
//! 1. stable parallel sort of entry indices by `(key, offset)`;
//! 2. per-cell dedup keeping the **last** staged entry (insertion order);
//! 3. slot allocation for unseen keys, in ascending key order;
//! 4. per-block parallel copy of winning records and exists bits.
//!
//! Each stage completes before the next one starts.

use rayon::prelude::*;

use super::block::{self, BlockSlot};
use super::error::GridError;
use super::layout::Schema;
use super::store::BlockStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedEntry {
    pub key: u64,
    pub offset: u32,
    /// Status byte of the staged copy; the exists bit is always set.
    pub mask: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries consumed from the buffer.
    pub staged: usize,
    /// Distinct cells written into the store.
    pub merged: usize,
    /// Entries dropped because a later entry targeted the same cell.
    pub duplicates: usize,
    pub new_blocks: usize,
}

#[derive(Clone, Debug)]
pub struct InsertBuffer {
    record_size: usize,
    entries: Vec<StagedEntry>,
    records: Vec<u8>,
}

impl InsertBuffer {
    pub fn new(record_size: usize) -> Self {
        Self {
            record_size,
            entries: Vec::new(),
            records: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Staged entries in insertion order.
    #[inline]
    pub fn entries(&self) -> &[StagedEntry] {
        &self.entries
    }

    #[inline]
    pub fn record(&self, index: usize) -> &[u8] {
        let start = index * self.record_size;
        &self.records[start..start + self.record_size]
    }

    #[inline]
    pub fn record_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.record_size;
        &mut self.records[start..start + self.record_size]
    }

    /// Stage a cell. The staged record starts as `initial` (the committed
    /// value) or zeros; the returned slice is that record.
    pub fn stage(
        &mut self,
        key: u64,
        offset: u32,
        initial: Option<&[u8]>,
    ) -> Result<&mut [u8], GridError> {
        self.reserve(1)?;
        let mut mask = 0u8;
        block::set_exists(&mut mask);
        self.entries.push(StagedEntry { key, offset, mask });
        let start = self.records.len();
        match initial {
            Some(record) => {
                debug_assert_eq!(record.len(), self.record_size);
                self.records.extend_from_slice(record);
            }
            None => self.records.resize(start + self.record_size, 0),
        }
        Ok(&mut self.records[start..])
    }

    /// Move all of `other`'s entries to the end of `self`, preserving order.
    pub fn append(&mut self, other: &mut InsertBuffer) -> Result<(), GridError> {
        debug_assert_eq!(self.record_size, other.record_size);
        self.reserve(other.len())?;
        self.entries.append(&mut other.entries);
        self.records.append(&mut other.records);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.records.clear();
    }

    fn reserve(&mut self, additional: usize) -> Result<(), GridError> {
        let entry_bytes = additional * std::mem::size_of::<StagedEntry>();
        let record_bytes = additional * self.record_size;
        self.entries
            .try_reserve(additional)
            .map_err(|_| GridError::allocation("insert buffer entries", entry_bytes))?;
        self.records
            .try_reserve(record_bytes)
            .map_err(|_| GridError::allocation("insert buffer records", record_bytes))?;
        Ok(())
    }
}

/// Merge the buffer into the store and empty it. An empty buffer is a no-op.
pub fn flush(
    buffer: &mut InsertBuffer,
    store: &mut BlockStore,
    schema: &Schema,
) -> Result<FlushReport, GridError> {
    if buffer.is_empty() {
        return Ok(FlushReport::default());
    }
    let staged = buffer.len();

    // 1. Sort. `par_sort_by_key` is stable, so equal cells keep insertion order.
    let mut order: Vec<u32> = Vec::new();
    order
        .try_reserve_exact(staged)
        .map_err(|_| GridError::allocation("flush sort scratch", staged * 4))?;
    order.extend(0..staged as u32);
    let entries = buffer.entries();
    order.par_sort_by_key(|&i| {
        let e = &entries[i as usize];
        (e.key, e.offset)
    });

    // 2. Dedupe: the last entry of each equal run wins.
    let mut winners: Vec<u32> = Vec::with_capacity(staged);
    for (pos, &i) in order.iter().enumerate() {
        let e = &entries[i as usize];
        let last_of_run = match order.get(pos + 1) {
            Some(&next) => {
                let n = &entries[next as usize];
                (n.key, n.offset) != (e.key, e.offset)
            }
            None => true,
        };
        if last_of_run {
            winners.push(i);
        }
    }
    let duplicates = staged - winners.len();

    // 3. Allocate unseen keys. Winners are key-sorted, so new keys are too.
    let mut new_keys: Vec<u64> = Vec::new();
    for &i in &winners {
        let key = entries[i as usize].key;
        if new_keys.last() != Some(&key) && store.slot_of(key).is_none() {
            new_keys.push(key);
        }
    }
    store.allocate(&new_keys)?;

    // 4. Per-slot spans into `winners`, then one task per touched block.
    let mut spans = vec![(0u32, 0u32); store.slot_count()];
    let mut start = 0usize;
    while start < winners.len() {
        let key = entries[winners[start] as usize].key;
        let mut end = start + 1;
        while end < winners.len() && entries[winners[end] as usize].key == key {
            end += 1;
        }
        let slot = store.slot_of(key).unwrap_or(BlockSlot(0));
        debug_assert!(!slot.is_background());
        spans[slot.index()] = (start as u32, end as u32);
        start = end;
    }

    let block_size = store.block_size();
    let buffer_ref = &*buffer;
    let winners_ref = &winners;
    store
        .par_blocks_mut()
        .for_each(|(slot, (masks, data))| {
            let (s, e) = spans[slot.index()];
            for &i in &winners_ref[s as usize..e as usize] {
                let entry = &buffer_ref.entries[i as usize];
                let cell = entry.offset as usize;
                masks[cell] |= entry.mask & block::EXISTS_BIT;
                schema.write_record(data, block_size, cell, buffer_ref.record(i as usize));
            }
        });

    let report = FlushReport {
        staged,
        merged: winners.len(),
        duplicates,
        new_blocks: new_keys.len(),
    };
    if duplicates > 0 {
        tracing::debug!(duplicates, "flush dropped duplicate cell writes (last write wins)");
    }
    tracing::debug!(
        staged = report.staged,
        merged = report.merged,
        new_blocks = report.new_blocks,
        "flush merged insert buffer"
    );
    buffer.clear();
    Ok(report)
}
