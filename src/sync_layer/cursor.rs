//! Positions on the frame timeline.

use crate::Frame;

/// Index of a slot in the snapshot ring. Always less than the ring capacity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// The first slot.
    pub const ZERO: SlotIndex = SlotIndex(0);

    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// The following slot, wrapping to zero after the last one.
    #[inline]
    #[must_use]
    pub const fn next(self, capacity: usize) -> SlotIndex {
        if self.0 + 1 >= capacity {
            SlotIndex(0)
        } else {
            SlotIndex(self.0 + 1)
        }
    }

    /// The preceding slot, wrapping to the last one before zero.
    #[inline]
    #[must_use]
    pub const fn prev(self, capacity: usize) -> SlotIndex {
        if self.0 == 0 {
            SlotIndex(capacity.saturating_sub(1))
        } else {
            SlotIndex(self.0 - 1)
        }
    }
}

/// A slot index paired with the frame it stands for.
///
/// The two always move together; a session has four of them (self, other, read, replay).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    /// Slot the cursor points at.
    pub index: SlotIndex,
    /// Frame the cursor stands for.
    pub frame: Frame,
}

impl Cursor {
    /// Frame 0 in slot 0.
    pub const START: Cursor = Cursor {
        index: SlotIndex::ZERO,
        frame: Frame::new(0),
    };

    /// Moves one frame forward.
    #[inline]
    pub fn advance(&mut self, capacity: usize) {
        self.index = self.index.next(capacity);
        self.frame += 1;
    }

    /// Moves one frame back.
    #[inline]
    pub fn retreat(&mut self, capacity: usize) {
        self.index = self.index.prev(capacity);
        self.frame -= 1;
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::START
    }
}
