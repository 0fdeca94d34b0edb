//! # Sync Layer
//!
//! The timeline of a netplay session: a ring of frame snapshots and four cursors into it.
//!
//! ```text
//!            other         read                 self
//!              │             │                    │
//!   ───────────▼─────────────▼────────────────────▼──────────▶ frames
//!    verified  │ confirmed,  │  simulated on      │ next frame
//!              │ unverified  │  predicted input   │ to simulate
//! ```
//!
//! - **self** is the next frame the local simulation will run.
//! - **read** is the first frame whose remote input has not arrived yet.
//! - **other** is the first frame not yet verified: every frame before it was simulated
//!   with the confirmed remote input (possibly after a rollback) and has been finalized.
//! - **replay** walks from `other` towards `self` while resimulating.
//!
//! Every slot from `other` to `self` holds the snapshot captured just before that frame
//! ran, which is what makes it possible to roll back to `other` at any time.
//!
//! Remote input may arrive before the local simulation reaches its frame, so `read` may
//! run ahead of `self` by up to `delay_frames`.

mod cursor;
mod delta_buffer;
mod frame_slot;

pub use cursor::{Cursor, SlotIndex};
pub use delta_buffer::DeltaBuffer;
pub use frame_slot::FrameSlot;

use crate::error::NetplayResult;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::Frame;

/// The snapshot ring and the four timeline cursors.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and benchmarks.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct SyncLayer<I> {
    buffer: DeltaBuffer<I>,
    delay_frames: usize,
    pub(crate) self_cursor: Cursor,
    pub(crate) other_cursor: Cursor,
    pub(crate) read_cursor: Cursor,
    pub(crate) replay_cursor: Cursor,
}

impl<I: Copy + Default + PartialEq> SyncLayer<I> {
    /// Allocates a ring of `2 * delay_frames + 1` slots of `state_size` bytes, with all
    /// cursors at frame 0.
    pub fn new(delay_frames: usize, state_size: usize) -> NetplayResult<Self> {
        let capacity = Self::capacity_for(delay_frames);
        let buffer = DeltaBuffer::new(capacity, state_size)?;
        Ok(Self {
            buffer,
            delay_frames,
            self_cursor: Cursor::START,
            other_cursor: Cursor::START,
            read_cursor: Cursor::START,
            replay_cursor: Cursor::START,
        })
    }

    /// Ring capacity needed for `delay_frames`.
    #[must_use]
    pub const fn capacity_for(delay_frames: usize) -> usize {
        2 * delay_frames + 1
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Latency tolerance the ring was sized for.
    #[must_use]
    pub fn delay_frames(&self) -> usize {
        self.delay_frames
    }

    /// Size of one snapshot in bytes.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.buffer.state_size()
    }

    /// The next frame to simulate.
    #[must_use]
    pub fn self_cursor(&self) -> Cursor {
        self.self_cursor
    }

    /// The oldest unverified frame.
    #[must_use]
    pub fn other_cursor(&self) -> Cursor {
        self.other_cursor
    }

    /// The first frame without remote input.
    #[must_use]
    pub fn read_cursor(&self) -> Cursor {
        self.read_cursor
    }

    /// Position of the last resimulation.
    #[must_use]
    pub fn replay_cursor(&self) -> Cursor {
        self.replay_cursor
    }

    /// The underlying ring.
    #[must_use]
    pub fn buffer(&self) -> &DeltaBuffer<I> {
        &self.buffer
    }

    /// The slot at `index`.
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> &FrameSlot<I> {
        self.buffer.slot(index)
    }

    pub(crate) fn slot_mut(&mut self, index: SlotIndex) -> &mut FrameSlot<I> {
        self.buffer.slot_mut(index)
    }

    /// Whether the slot under `self` can hold the frame about to be simulated.
    #[must_use]
    pub fn self_slot_ready(&self) -> bool {
        self.buffer.is_ready(
            self.self_cursor.index,
            self.self_cursor.frame,
            self.other_cursor.frame,
        )
    }

    /// Claims the slot under `self` for the frame about to be simulated.
    pub fn prepare_self(&mut self) -> bool {
        self.buffer.prepare(
            self.self_cursor.index,
            self.self_cursor.frame,
            self.other_cursor.frame,
        )
    }

    /// Claims the slot under `read` for incoming remote input.
    pub fn prepare_read(&mut self) -> bool {
        self.buffer.prepare(
            self.read_cursor.index,
            self.read_cursor.frame,
            self.other_cursor.frame,
        )
    }

    /// Moves `self` forward one frame.
    pub fn advance_self(&mut self) {
        let capacity = self.capacity();
        self.self_cursor.advance(capacity);
    }

    /// Moves `self` back one frame.
    pub fn retreat_self(&mut self) {
        let capacity = self.capacity();
        self.self_cursor.retreat(capacity);
    }

    /// Moves `read` forward one frame.
    pub fn advance_read(&mut self) {
        let capacity = self.capacity();
        self.read_cursor.advance(capacity);
    }

    /// Moves `other` forward one frame.
    pub fn advance_other(&mut self) {
        let capacity = self.capacity();
        self.other_cursor.advance(capacity);
    }

    /// Moves `replay` forward one frame.
    pub fn advance_replay(&mut self) {
        let capacity = self.capacity();
        self.replay_cursor.advance(capacity);
    }

    /// Number of simulated frames whose remote input has not arrived.
    #[must_use]
    pub fn frames_ahead(&self) -> usize {
        self.self_cursor.frame.frames_since(self.read_cursor.frame)
    }

    /// Slot holding `frame`, if it is still in the ring.
    #[must_use]
    pub fn find(&self, frame: Frame) -> Option<SlotIndex> {
        self.buffer.find(frame)
    }
}

impl<I: Copy + Default + PartialEq> InvariantChecker for SyncLayer<I> {
    /// Checks the invariants of the SyncLayer.
    ///
    /// # Invariants
    ///
    /// 1. The ring holds `2 * delay_frames + 1` slots
    /// 2. Every cursor's index equals its frame modulo the capacity
    /// 3. `other` is at or before both `read` and `self`
    /// 4. `read` is at most `delay_frames` ahead of `self`
    /// 5. The unverified window `other..=self` fits in the ring
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let capacity = self.capacity();
        if capacity != Self::capacity_for(self.delay_frames) {
            return Err(
                InvariantViolation::new("SyncLayer", "ring capacity does not match delay")
                    .with_details(format!(
                        "capacity={}, delay_frames={}",
                        capacity, self.delay_frames
                    )),
            );
        }

        for (name, cursor) in [
            ("self", self.self_cursor),
            ("other", self.other_cursor),
            ("read", self.read_cursor),
            ("replay", self.replay_cursor),
        ] {
            let frame = cursor.frame.as_i32();
            if frame < 0 || cursor.index.get() != frame as usize % capacity {
                return Err(InvariantViolation::new(
                    "SyncLayer",
                    "cursor index out of step with its frame",
                )
                .with_details(format!(
                    "cursor={}, index={}, frame={}",
                    name,
                    cursor.index.get(),
                    cursor.frame
                )));
            }
        }

        let (me, other, read) = (
            self.self_cursor.frame,
            self.other_cursor.frame,
            self.read_cursor.frame,
        );

        if other > read || other > me {
            return Err(
                InvariantViolation::new("SyncLayer", "other cursor leads read or self")
                    .with_details(format!("other={}, read={}, self={}", other, read, me)),
            );
        }

        if read.frames_since(me) > self.delay_frames {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "read cursor too far ahead of self",
            )
            .with_details(format!(
                "read={}, self={}, delay_frames={}",
                read, me, self.delay_frames
            )));
        }

        if me.frames_since(other) >= capacity {
            return Err(
                InvariantViolation::new("SyncLayer", "unverified frames exceed ring capacity")
                    .with_details(format!("other={}, self={}, capacity={}", other, me, capacity)),
            );
        }

        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn new_sizes_ring_from_delay() {
        let layer: SyncLayer<u8> = SyncLayer::new(4, 8).unwrap();
        assert_eq!(layer.capacity(), 9);
        assert_eq!(layer.state_size(), 8);
        assert_eq!(layer.self_cursor(), Cursor::START);
        assert_eq!(layer.other_cursor(), Cursor::START);
        assert!(layer.check_invariants().is_ok());
    }

    #[test]
    fn zero_delay_gives_single_slot_ring() {
        let layer: SyncLayer<u8> = SyncLayer::new(0, 8).unwrap();
        assert_eq!(layer.capacity(), 1);
    }

    #[test]
    fn invariant_catches_other_leading_self() {
        let mut layer: SyncLayer<u8> = SyncLayer::new(2, 1).unwrap();
        layer.advance_other();
        layer.advance_read();
        let err = layer.check_invariants().unwrap_err();
        assert!(err.invariant.contains("other cursor leads"));
    }

    #[test]
    fn invariant_catches_read_too_far_ahead() {
        let mut layer: SyncLayer<u8> = SyncLayer::new(2, 1).unwrap();
        for _ in 0..3 {
            layer.advance_read();
        }
        let err = layer.check_invariants().unwrap_err();
        assert!(err.invariant.contains("read cursor too far ahead"));
    }

    #[test]
    fn invariant_catches_overrun_window() {
        let mut layer: SyncLayer<u8> = SyncLayer::new(1, 1).unwrap();
        for _ in 0..3 {
            layer.advance_self();
        }
        let err = layer.check_invariants().unwrap_err();
        assert!(err.invariant.contains("exceed ring capacity"));
    }

    #[test]
    fn self_slot_becomes_unready_when_window_is_full() {
        let mut layer: SyncLayer<u8> = SyncLayer::new(1, 1).unwrap();
        for _ in 0..3 {
            assert!(layer.prepare_self());
            layer.advance_self();
        }
        // frame 3 would overwrite frame 0, which is still unverified
        assert!(!layer.self_slot_ready());

        layer.advance_read();
        layer.advance_other();
        assert!(layer.self_slot_ready());
    }

    #[test]
    fn frames_ahead_counts_unconfirmed_frames() {
        let mut layer: SyncLayer<u8> = SyncLayer::new(3, 1).unwrap();
        layer.advance_self();
        layer.advance_self();
        assert_eq!(layer.frames_ahead(), 2);
        layer.advance_read();
        assert_eq!(layer.frames_ahead(), 1);
    }
}
