//! `BlockMap`: an open-addressing hashmap for `block key → BlockSlot`.
//!
//! - Flat layout, 16-byte slots with a compact control word.
//! - Robin Hood probing. The sparse index only grows inside a generation,
//!   so there is no deletion path; `clear` drops everything at once.
//! - Fingerprint check in the control word to skip full key comparisons.
//! - Probe distance encoded in the control word (no per-probe hash reload).

use super::block::BlockSlot;
use super::error::GridError;

// ── Hash function ───────────────────────────────────────────────────────

const MK: u64 = 0x9e37_79b9_7f4a_7c15;

#[inline(always)]
pub(crate) fn block_hash(key: u64) -> u64 {
    // Fibonacci multiply, then fold the high half down so Morton keys
    // (which vary in the low bits per axis) still spread across buckets.
    let h = key.wrapping_mul(MK);
    h ^ (h >> 32)
}

// ── Slot layout ─────────────────────────────────────────────────────────

const EMPTY: u32 = 0;
const OCCUPIED_BIT: u32 = 0x8000_0000;
const DIST_SHIFT: u32 = 12;
const DIST_MASK: u32 = 0x7fff_f000;
const FP_MASK: u32 = 0x0000_0fff;
const MATCH_MASK: u32 = OCCUPIED_BIT | FP_MASK;
const MAX_DIST: usize = (DIST_MASK >> DIST_SHIFT) as usize;

/// Layout: key(8) + value(4) + ctrl(4) = 16 bytes.
///
/// Control word layout:
/// - bit 31: occupied flag
/// - bits 12..30: probe distance (Robin Hood DIB)
/// - bits 0..11: key fingerprint
#[derive(Clone, Copy)]
#[repr(C)]
struct Slot {
    key: u64,
    value: u32,
    ctrl: u32,
}

impl Slot {
    const EMPTY: Self = Self {
        key: 0,
        value: 0,
        ctrl: EMPTY,
    };

    #[inline(always)]
    fn is_occupied(self) -> bool {
        self.ctrl & OCCUPIED_BIT != 0
    }

    #[inline(always)]
    fn is_empty(self) -> bool {
        self.ctrl == EMPTY
    }

    #[inline(always)]
    fn distance(self) -> usize {
        ((self.ctrl & DIST_MASK) >> DIST_SHIFT) as usize
    }

    #[inline(always)]
    fn set_distance(&mut self, distance: usize) {
        assert!(
            distance <= MAX_DIST,
            "BlockMap probe distance overflow (distance={distance}, max={MAX_DIST})"
        );
        self.ctrl = (self.ctrl & !DIST_MASK) | ((distance as u32) << DIST_SHIFT);
    }

    #[inline(always)]
    fn match_ctrl(self) -> u32 {
        self.ctrl & MATCH_MASK
    }
}

// ── BlockMap ────────────────────────────────────────────────────────────

/// Maximum load factor numerator / denominator: 1/2 = 50%.
const LOAD_NUM: usize = 1;
const LOAD_DEN: usize = 2;
const MIN_SLOTS: usize = 16;

#[derive(Clone)]
pub struct BlockMap {
    slots: Vec<Slot>,
    len: usize,
    /// `capacity - 1`.  Capacity is always a power of two.
    mask: usize,
}

impl Default for BlockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMap {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::EMPTY; MIN_SLOTS],
            len: 0,
            mask: MIN_SLOTS - 1,
        }
    }

    #[cfg(test)]
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserve room for `additional` more entries without rehashing.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), GridError> {
        let required = self.len.saturating_add(additional);
        let min_slots = required
            .saturating_mul(LOAD_DEN)
            .div_ceil(LOAD_NUM)
            .checked_next_power_of_two()
            .ok_or_else(|| GridError::allocation("block index", usize::MAX))?;
        if min_slots > self.slots.len() {
            self.resize(min_slots)?;
        }
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Uses Robin Hood displacement for early exit on miss.
    #[inline(always)]
    pub fn get(&self, key: u64) -> Option<BlockSlot> {
        let hash = block_hash(key);
        let target_ctrl = match_ctrl_of(hash);
        let mask = self.mask;
        let mut pos = hash as usize & mask;
        let mut our_dist = 0usize;

        loop {
            let slot = self.slots[pos];
            if slot.is_empty() {
                return None;
            }
            if our_dist > slot.distance() {
                return None;
            }
            if slot.match_ctrl() == target_ctrl && slot.key == key {
                return Some(BlockSlot(slot.value));
            }
            pos = (pos + 1) & mask;
            our_dist += 1;
        }
    }

    #[cfg(test)]
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    // ── Insert ──────────────────────────────────────────────────────────

    /// Insert a mapping.  Returns the previous value if the key was present.
    pub fn insert(&mut self, key: u64, value: BlockSlot) -> Result<Option<BlockSlot>, GridError> {
        if self.needs_grow() {
            let new_cap = (self.slots.len() * 2).max(MIN_SLOTS);
            self.resize(new_cap)?;
        }
        Ok(self.insert_no_grow(key, value))
    }

    /// Insert without checking capacity; the caller ensures space.
    fn insert_no_grow(&mut self, key: u64, value: BlockSlot) -> Option<BlockSlot> {
        let hash = block_hash(key);
        let target_ctrl = match_ctrl_of(hash);
        let mask = self.mask;
        let mut pos = hash as usize & mask;

        let mut ins = Slot {
            key,
            value: value.0,
            ctrl: occupied_ctrl(fingerprint_of(hash), 0),
        };
        let mut inserting_original = true;

        loop {
            let slot = &mut self.slots[pos];

            if slot.is_empty() {
                *slot = ins;
                self.len += 1;
                return None;
            }

            // Exact match: update in place. Only the original key can match;
            // displaced entries are unique by construction.
            if inserting_original && slot.match_ctrl() == target_ctrl && slot.key == key {
                let old = BlockSlot(slot.value);
                slot.value = value.0;
                return Some(old);
            }

            // Robin Hood: if the existing entry is closer to home, steal its spot.
            if ins.distance() > slot.distance() {
                std::mem::swap(slot, &mut ins);
                inserting_original = false;
            }

            ins.set_distance(ins.distance() + 1);
            pos = (pos + 1) & mask;
        }
    }

    // ── Resize ──────────────────────────────────────────────────────────

    #[inline(always)]
    fn needs_grow(&self) -> bool {
        self.len * LOAD_DEN >= self.slots.len() * LOAD_NUM
    }

    fn resize(&mut self, new_cap: usize) -> Result<(), GridError> {
        debug_assert!(new_cap.is_power_of_two());
        let mut fresh = Vec::new();
        fresh.try_reserve_exact(new_cap).map_err(|_| {
            GridError::allocation("block index", new_cap * std::mem::size_of::<Slot>())
        })?;
        fresh.resize(new_cap, Slot::EMPTY);

        let old_slots = std::mem::replace(&mut self.slots, fresh);
        self.mask = new_cap - 1;
        self.len = 0;
        for slot in old_slots {
            if slot.is_occupied() {
                self.insert_no_grow(slot.key, BlockSlot(slot.value));
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.slots.resize(MIN_SLOTS, Slot::EMPTY);
        self.mask = MIN_SLOTS - 1;
        self.len = 0;
    }

    #[cfg(test)]
    /// Iterate over all `(key, slot)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, BlockSlot)> + '_ {
        self.slots
            .iter()
            .filter(|slot| slot.is_occupied())
            .map(|slot| (slot.key, BlockSlot(slot.value)))
    }
}

// ── Free helpers ────────────────────────────────────────────────────────

/// Keep at least one bit set so EMPTY remains ctrl == 0.
#[inline(always)]
fn fingerprint_of(hash: u64) -> u32 {
    ((hash >> 52) as u32 & FP_MASK) | 1
}

#[inline(always)]
fn occupied_ctrl(fp: u32, distance: usize) -> u32 {
    OCCUPIED_BIT | ((distance as u32) << DIST_SHIFT) | fp
}

#[inline(always)]
fn match_ctrl_of(hash: u64) -> u32 {
    OCCUPIED_BIT | fingerprint_of(hash)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_overwrite() {
        let mut m = BlockMap::new();
        assert!(m.get(10).is_none());

        assert_eq!(m.insert(10, BlockSlot(42)).unwrap(), None);
        assert_eq!(m.get(10), Some(BlockSlot(42)));
        assert_eq!(m.len(), 1);

        let old = m.insert(10, BlockSlot(99)).unwrap();
        assert_eq!(old, Some(BlockSlot(42)));
        assert_eq!(m.get(10), Some(BlockSlot(99)));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn grow_under_pressure() {
        let mut m = BlockMap::new();
        for i in 0..5_000u64 {
            m.insert(i * 7, BlockSlot(i as u32 + 1)).unwrap();
        }
        assert_eq!(m.len(), 5_000);
        for i in 0..5_000u64 {
            assert_eq!(m.get(i * 7), Some(BlockSlot(i as u32 + 1)));
        }
        assert!(m.get(3).is_none());
    }

    #[test]
    fn reserve_keeps_entries_reachable() {
        let mut m = BlockMap::new();
        for i in 0..20u64 {
            m.insert(i, BlockSlot(i as u32)).unwrap();
        }
        m.try_reserve(10_000).unwrap();
        for i in 0..20u64 {
            assert_eq!(m.get(i), Some(BlockSlot(i as u32)));
        }
    }

    #[test]
    fn iter_yields_all_entries_and_clear_empties() {
        let mut m = BlockMap::new();
        for i in 0..50u64 {
            m.insert(i << 20, BlockSlot(i as u32)).unwrap();
        }
        let mut collected: Vec<_> = m.iter().collect();
        collected.sort_by_key(|&(_, slot)| slot);
        assert_eq!(collected.len(), 50);
        for (i, &(key, slot)) in collected.iter().enumerate() {
            assert_eq!(key, (i as u64) << 20);
            assert_eq!(slot.0, i as u32);
        }
        m.clear();
        assert!(m.is_empty());
        assert!(m.get(0).is_none());
    }

    #[test]
    fn slot_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<Slot>(), 16);
    }

    #[test]
    fn hash_spreads_sequential_keys() {
        let mut buckets = std::collections::BTreeSet::new();
        let bucket_mask = (1u64 << 16) - 1;
        for key in 0..(1u64 << 16) {
            buckets.insert(block_hash(key) & bucket_mask);
        }
        assert!(
            buckets.len() >= 36_000,
            "sequential key bucket spread regressed: {}",
            buckets.len()
        );
    }

    #[test]
    #[should_panic(expected = "BlockMap probe distance overflow")]
    fn slot_distance_overflow_panics() {
        let mut slot = Slot {
            key: 0,
            value: 0,
            ctrl: occupied_ctrl(1, 0),
        };
        slot.set_distance(MAX_DIST + 1);
    }
}
