//! The fixed ring of frame snapshots.

use crate::error::{NetplayError, NetplayResult};
use crate::sync_layer::{FrameSlot, SlotIndex};
use crate::Frame;

/// A ring of [`FrameSlot`]s, allocated once at session start.
///
/// A session needs a snapshot for every frame from the oldest unverified one up to the
/// current one, so the ring must be large enough to cover the worst case of running
/// `delay_frames` ahead of a peer that is itself `delay_frames` behind: `2 * delay + 1`.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and benchmarks.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct DeltaBuffer<I> {
    slots: Vec<FrameSlot<I>>,
    state_size: usize,
}

impl<I: Copy + Default + PartialEq> DeltaBuffer<I> {
    /// Allocates `capacity` unused slots with zeroed `state_size`-byte buffers.
    ///
    /// Fails with [`NetplayError::AllocationFailed`] instead of aborting when memory runs
    /// out, and with [`NetplayError::InvalidRequest`] for a zero capacity.
    pub fn new(capacity: usize, state_size: usize) -> NetplayResult<Self> {
        if capacity == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "snapshot ring capacity must be at least 1".to_owned(),
            });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| NetplayError::AllocationFailed {
                slots: capacity,
                state_size,
            })?;
        for _ in 0..capacity {
            let slot = FrameSlot::try_new(state_size).map_err(|_| NetplayError::AllocationFailed {
                slots: capacity,
                state_size,
            })?;
            slots.push(slot);
        }

        Ok(Self { slots, state_size })
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size of every slot's state buffer.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// The slot at `index`.
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> &FrameSlot<I> {
        &self.slots[index.get()]
    }

    /// The slot at `index`, mutably.
    pub fn slot_mut(&mut self, index: SlotIndex) -> &mut FrameSlot<I> {
        &mut self.slots[index.get()]
    }

    /// Whether the slot at `index` may hold `frame`: it already does, it was never used, or
    /// its occupant lies before `oldest_unverified` and is no longer needed for rollback.
    #[must_use]
    pub fn is_ready(&self, index: SlotIndex, frame: Frame, oldest_unverified: Frame) -> bool {
        let occupant = self.slot(index).frame();
        occupant == frame || occupant.is_null() || occupant < oldest_unverified
    }

    /// Claims the slot at `index` for `frame` if it [`is_ready`](Self::is_ready).
    ///
    /// A slot that already holds `frame` is left untouched; any other ready slot is reset.
    /// Returns `false` and changes nothing if the slot is still needed.
    pub fn prepare(&mut self, index: SlotIndex, frame: Frame, oldest_unverified: Frame) -> bool {
        if !self.is_ready(index, frame, oldest_unverified) {
            return false;
        }
        let slot = self.slot_mut(index);
        if !slot.holds(frame) {
            slot.reset_for(frame);
        }
        true
    }

    /// Finds the slot currently holding `frame`.
    #[must_use]
    pub fn find(&self, frame: Frame) -> Option<SlotIndex> {
        if frame.is_null() {
            return None;
        }
        let mut index = SlotIndex::ZERO;
        for _ in 0..self.capacity() {
            if self.slot(index).holds(frame) {
                return Some(index);
            }
            index = index.next(self.capacity());
        }
        None
    }

    /// Iterates over every slot in index order.
    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<I>> {
        self.slots.iter()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::sync_layer::Cursor;

    #[test]
    fn new_allocates_zeroed_unused_slots() {
        let buffer: DeltaBuffer<u8> = DeltaBuffer::new(5, 32).unwrap();
        assert_eq!(buffer.capacity(), 5);
        assert_eq!(buffer.state_size(), 32);
        for slot in buffer.iter() {
            assert!(slot.frame().is_null());
            assert!(slot.state().iter().all(|&b| b == 0));
            assert_eq!(slot.state().len(), 32);
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result: NetplayResult<DeltaBuffer<u8>> = DeltaBuffer::new(0, 32);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn absurd_allocation_fails_gracefully() {
        let result: NetplayResult<DeltaBuffer<u8>> = DeltaBuffer::new(2, usize::MAX / 2);
        assert!(matches!(
            result,
            Err(NetplayError::AllocationFailed { slots: 2, .. })
        ));
    }

    #[test]
    fn prepare_claims_unused_slot() {
        let mut buffer: DeltaBuffer<u8> = DeltaBuffer::new(3, 4).unwrap();
        assert!(buffer.prepare(SlotIndex::ZERO, Frame::new(0), Frame::new(0)));
        assert!(buffer.slot(SlotIndex::ZERO).holds(Frame::new(0)));
    }

    #[test]
    fn prepare_same_frame_keeps_recorded_data() {
        let mut buffer: DeltaBuffer<u8> = DeltaBuffer::new(3, 4).unwrap();
        assert!(buffer.prepare(SlotIndex::ZERO, Frame::new(0), Frame::new(0)));
        buffer.slot_mut(SlotIndex::ZERO).set_confirmed(9);

        assert!(buffer.prepare(SlotIndex::ZERO, Frame::new(0), Frame::new(0)));
        assert_eq!(buffer.slot(SlotIndex::ZERO).confirmed_input(), Some(9));
    }

    #[test]
    fn prepare_refuses_slot_still_needed() {
        let capacity = 3;
        let mut buffer: DeltaBuffer<u8> = DeltaBuffer::new(capacity, 4).unwrap();
        let mut cursor = Cursor::START;
        for _ in 0..capacity {
            assert!(buffer.prepare(cursor.index, cursor.frame, Frame::new(0)));
            cursor.advance(capacity);
        }
        // frame 3 wraps onto frame 0's slot, which has not been verified yet
        assert_eq!(cursor.index, SlotIndex::ZERO);
        assert!(!buffer.prepare(cursor.index, cursor.frame, Frame::new(0)));
        assert!(buffer.slot(SlotIndex::ZERO).holds(Frame::new(0)));

        // once frame 0 is verified the slot can be recycled
        assert!(buffer.prepare(cursor.index, cursor.frame, Frame::new(1)));
        assert!(buffer.slot(SlotIndex::ZERO).holds(Frame::new(3)));
    }

    #[test]
    fn find_locates_frames_by_occupant() {
        let capacity = 4;
        let mut buffer: DeltaBuffer<u8> = DeltaBuffer::new(capacity, 1).unwrap();
        let mut cursor = Cursor::START;
        for _ in 0..6 {
            assert!(buffer.prepare(cursor.index, cursor.frame, cursor.frame));
            cursor.advance(capacity);
        }
        assert_eq!(buffer.find(Frame::new(5)).map(SlotIndex::get), Some(1));
        assert_eq!(buffer.find(Frame::new(1)), None);
        assert_eq!(buffer.find(Frame::NULL), None);
    }
}
