//! Pack/unpack of existing cells for halo exchange.
//!
//! Byte layout (integers little-endian, field bytes native):
//!
//! ```text
//! [u64 n]                      blocks with at least one packed point
//! [u64 key; n]                 block keys, slot order
//! [u64 start; n + 1]           exclusive scan of per-block point counts
//! per point: [selected field bytes][u16 in-block offset]
//! ```
//!
//! The total point count is the last scan entry.

use rayon::prelude::*;

use super::block::{self, BlockSlot};
use super::error::GridError;
use super::insert::InsertBuffer;
use super::layout::{FieldId, FieldSelection, Schema};
use super::linearizer::Linearizer;
use super::store::BlockStore;

const WORD: usize = std::mem::size_of::<u64>();
const OFFSET_BYTES: usize = std::mem::size_of::<u16>();

/// Half-open box `[lo, hi)` in point coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxRegion<const D: usize> {
    pub lo: [i64; D],
    pub hi: [i64; D],
}

impl<const D: usize> BoxRegion<D> {
    pub fn new(lo: [i64; D], hi: [i64; D]) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub fn contains(&self, c: [i64; D]) -> bool {
        (0..D).all(|d| c[d] >= self.lo[d] && c[d] < self.hi[d])
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        (0..D).any(|d| self.hi[d] <= self.lo[d])
    }

    /// Whether the box meets the half-open box `[lo, hi)`.
    #[inline]
    pub fn intersects(&self, lo: [i64; D], hi: [i64; D]) -> bool {
        (0..D).all(|d| self.lo[d] < hi[d] && lo[d] < self.hi[d])
    }
}

/// Field subset plus a union of boxes. No boxes means the whole grid; no
/// fields means every field.
#[derive(Clone, Debug, Default)]
pub struct PackRequest<const D: usize> {
    fields: Vec<FieldId>,
    regions: Vec<BoxRegion<D>>,
}

impl<const D: usize> PackRequest<D> {
    pub fn new(fields: Vec<FieldId>) -> Self {
        Self {
            fields,
            regions: Vec::new(),
        }
    }

    pub fn all_fields() -> Self {
        Self::new(Vec::new())
    }

    pub fn add_region(&mut self, region: BoxRegion<D>) -> &mut Self {
        self.regions.push(region);
        self
    }

    /// Drop all regions; the field subset stays.
    pub fn reset(&mut self) {
        self.regions.clear();
    }

    #[inline]
    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }

    #[inline]
    pub fn regions(&self) -> &[BoxRegion<D>] {
        &self.regions
    }

    fn selects(&self, c: [i64; D]) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r.contains(c))
    }
}

/// Per-block selected offsets, slot order, empty blocks dropped.
fn select_points<const D: usize>(
    lin: &Linearizer<D>,
    store: &BlockStore,
    request: &PackRequest<D>,
) -> Vec<(BlockSlot, Vec<u16>)> {
    let edge = lin.edge() as i64;
    let slots: Vec<BlockSlot> = store.slots().collect();
    slots
        .into_par_iter()
        .filter_map(|slot| {
            let key = store.key(slot);
            if !request.regions.is_empty() {
                let origin = lin.block_coord(key).map(|b| b * edge);
                let end = origin.map(|o| o + edge);
                if !request.regions.iter().any(|r| r.intersects(origin, end)) {
                    return None;
                }
            }
            let offsets: Vec<u16> = store
                .block_masks(slot)
                .iter()
                .enumerate()
                .filter(|&(offset, &m)| {
                    block::exists(m) && request.selects(lin.join(key, offset as u32))
                })
                .map(|(offset, _)| offset as u16)
                .collect();
            (!offsets.is_empty()).then_some((slot, offsets))
        })
        .collect()
}

fn size_of_pack(blocks: usize, points: usize, selection: &FieldSelection) -> usize {
    WORD + blocks * WORD + (blocks + 1) * WORD + points * (selection.bytes_per_point + OFFSET_BYTES)
}

/// Bytes `pack` would produce for `request`.
pub fn pack_size<const D: usize>(
    lin: &Linearizer<D>,
    store: &BlockStore,
    schema: &Schema,
    request: &PackRequest<D>,
) -> Result<usize, GridError> {
    let selection = schema.selection(&request.fields)?;
    let blocks = select_points(lin, store, request);
    let points = blocks.iter().map(|(_, o)| o.len()).sum();
    Ok(size_of_pack(blocks.len(), points, &selection))
}

pub fn pack<const D: usize>(
    lin: &Linearizer<D>,
    store: &BlockStore,
    schema: &Schema,
    request: &PackRequest<D>,
) -> Result<Vec<u8>, GridError> {
    let selection = schema.selection(&request.fields)?;
    let blocks = select_points(lin, store, request);
    let total_points: usize = blocks.iter().map(|(_, o)| o.len()).sum();
    let size = size_of_pack(blocks.len(), total_points, &selection);

    let mut out = Vec::new();
    out.try_reserve_exact(size)
        .map_err(|_| GridError::allocation("pack buffer", size))?;
    out.extend_from_slice(&(blocks.len() as u64).to_le_bytes());
    for (slot, _) in &blocks {
        out.extend_from_slice(&store.key(*slot).to_le_bytes());
    }
    let mut scan = 0u64;
    out.extend_from_slice(&scan.to_le_bytes());
    for (_, offsets) in &blocks {
        scan += offsets.len() as u64;
        out.extend_from_slice(&scan.to_le_bytes());
    }

    let header = out.len();
    out.resize(size, 0);
    let point_bytes = selection.bytes_per_point + OFFSET_BYTES;

    let mut parts: Vec<&mut [u8]> = Vec::with_capacity(blocks.len());
    let mut rest = &mut out[header..];
    for (_, offsets) in &blocks {
        let (head, tail) = rest.split_at_mut(offsets.len() * point_bytes);
        parts.push(head);
        rest = tail;
    }

    let block_size = store.block_size();
    let rs = schema.record_size();
    parts
        .into_par_iter()
        .zip(blocks.par_iter())
        .for_each_init(
            || vec![0u8; rs],
            |record, (dst, (slot, offsets))| {
                let data = store.block_data(*slot);
                for (chunk, &offset) in dst.chunks_exact_mut(point_bytes).zip(offsets) {
                    schema.read_record(data, block_size, offset as usize, record);
                    let mut at = 0;
                    for part in &selection.parts {
                        chunk[at..at + part.size].copy_from_slice(
                            &record[part.record_offset..part.record_offset + part.size],
                        );
                        at += part.size;
                    }
                    chunk[at..].copy_from_slice(&offset.to_le_bytes());
                }
            },
        );

    tracing::debug!(
        blocks = blocks.len(),
        points = total_points,
        bytes = size,
        "packed grid points"
    );
    Ok(out)
}

fn read_word(bytes: &[u8], at: usize) -> Result<u64, GridError> {
    let word = bytes
        .get(at..at + WORD)
        .ok_or_else(|| GridError::PackFormat(format!("truncated header at byte {at}")))?;
    let mut buf = [0u8; WORD];
    buf.copy_from_slice(word);
    Ok(u64::from_le_bytes(buf))
}

/// Stage every packed point into `buffer`. Fields outside the request keep
/// their committed value (or zero for new cells). Returns the point count;
/// the caller flushes. On error `buffer` is left as it was.
pub fn unpack<const D: usize>(
    lin: &Linearizer<D>,
    store: &BlockStore,
    schema: &Schema,
    fields: &[FieldId],
    bytes: &[u8],
    buffer: &mut InsertBuffer,
) -> Result<usize, GridError> {
    let selection = schema.selection(fields)?;
    let point_bytes = selection.bytes_per_point + OFFSET_BYTES;

    let n = read_word(bytes, 0)? as usize;
    let keys_at = WORD;
    let header_overflow = || GridError::PackFormat(format!("{n} blocks overflow the header size"));
    let scan_at = n
        .checked_mul(WORD)
        .and_then(|b| b.checked_add(keys_at))
        .ok_or_else(header_overflow)?;
    let payload_at = n
        .checked_add(1)
        .and_then(|words| words.checked_mul(WORD))
        .and_then(|b| b.checked_add(scan_at))
        .ok_or_else(header_overflow)?;
    if payload_at > bytes.len() {
        return Err(GridError::PackFormat(format!(
            "{n} blocks need a {payload_at}-byte header, buffer has {} bytes",
            bytes.len()
        )));
    }
    let total = read_word(bytes, payload_at - WORD)? as usize;
    let expected = total
        .checked_mul(point_bytes)
        .and_then(|b| b.checked_add(payload_at))
        .ok_or_else(|| GridError::PackFormat(format!("{total} points overflow the buffer size")))?;
    if expected != bytes.len() {
        return Err(GridError::PackFormat(format!(
            "expected {expected} bytes for {total} points, got {}",
            bytes.len()
        )));
    }

    let block_size = store.block_size();
    let mut staged = InsertBuffer::new(schema.record_size());
    let mut previous = 0usize;
    for b in 0..n {
        let key = read_word(bytes, keys_at + b * WORD)?;
        let start = read_word(bytes, scan_at + b * WORD)? as usize;
        let end = read_word(bytes, scan_at + (b + 1) * WORD)? as usize;
        if start != previous || end < start || end > total {
            return Err(GridError::PackFormat(format!(
                "point scan is not monotonic at block {b}"
            )));
        }
        previous = end;
        if lin.block_key(lin.block_coord(key)) != Some(key) {
            return Err(GridError::PackFormat(format!(
                "block key {key} lies outside the block space"
            )));
        }
        let slot = store.slot_of(key);

        for p in start..end {
            let chunk = &bytes[payload_at + p * point_bytes..payload_at + (p + 1) * point_bytes];
            let (payload, tail) = chunk.split_at(selection.bytes_per_point);
            let offset = u16::from_le_bytes([tail[0], tail[1]]) as usize;
            if offset >= block_size {
                return Err(GridError::PackFormat(format!(
                    "in-block offset {offset} exceeds block capacity {block_size}"
                )));
            }
            if !lin.contains(lin.join(key, offset as u32)) {
                return Err(GridError::PackFormat(format!(
                    "point at offset {offset} of block {key} lies outside the domain"
                )));
            }
            let record = staged.stage(key, offset as u32, None)?;
            if let Some(slot) = slot {
                if block::exists(store.block_masks(slot)[offset]) {
                    schema.read_record(store.block_data(slot), block_size, offset, record);
                }
            }
            let mut at = 0;
            for part in &selection.parts {
                record[part.record_offset..part.record_offset + part.size]
                    .copy_from_slice(&payload[at..at + part.size]);
                at += part.size;
            }
        }
    }
    buffer.append(&mut staged)?;
    Ok(total)
}
