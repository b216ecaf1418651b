//! Block slots and per-cell status bits.

/// Dense slot of a block in the store. Slot 0 is the background block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockSlot(pub u32);

impl BlockSlot {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn is_background(self) -> bool {
        self.0 == BACKGROUND_SLOT
    }
}

/// Slot 0 is reserved as a permanently empty block so neighbor gathers can
/// use unconditional loads. A missing neighbor maps to it.
pub const BACKGROUND_SLOT: u32 = 0;

pub const EXISTS_BIT: u8 = 1 << 0;
pub const PADDING_BIT: u8 = 1 << 1;

#[inline(always)]
pub const fn exists(mask: u8) -> bool {
    mask & EXISTS_BIT != 0
}

/// Padding is only meaningful on existing cells.
#[inline(always)]
pub const fn is_padding(mask: u8) -> bool {
    mask & (EXISTS_BIT | PADDING_BIT) == (EXISTS_BIT | PADDING_BIT)
}

/// Existing and not padding.
#[inline(always)]
pub const fn is_interior(mask: u8) -> bool {
    mask & (EXISTS_BIT | PADDING_BIT) == EXISTS_BIT
}

#[inline(always)]
pub fn set_exists(mask: &mut u8) {
    *mask |= EXISTS_BIT;
}

#[inline(always)]
pub fn set_padding(mask: &mut u8) {
    *mask |= PADDING_BIT;
}

#[inline(always)]
pub fn unset_padding(mask: &mut u8) {
    *mask &= !PADDING_BIT;
}
