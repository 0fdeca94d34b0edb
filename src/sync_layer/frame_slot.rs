//! One entry of the snapshot ring.

use crate::error::{NetplayError, NetplayResult};
use crate::{Frame, InputStatus};

/// Everything recorded about one frame: the serialized machine state captured just before
/// the frame was simulated, and the inputs the frame was (or will be) simulated with.
///
/// Slots are allocated once and reused in place; [`reset_for`](Self::reset_for) clears the
/// per-frame bookkeeping but keeps the state allocation.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and benchmarks.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct FrameSlot<I> {
    frame: Frame,
    state: Box<[u8]>,
    captured: bool,
    local_input: I,
    has_local: bool,
    predicted_input: I,
    confirmed_input: Option<I>,
    used_confirmed: bool,
    checksum: Option<u32>,
}

impl<I: Copy + Default + PartialEq> FrameSlot<I> {
    /// Allocates an unused slot with a zeroed state buffer of `state_size` bytes.
    pub(crate) fn try_new(state_size: usize) -> NetplayResult<Self> {
        let mut state = Vec::new();
        state
            .try_reserve_exact(state_size)
            .map_err(|_| NetplayError::AllocationFailed {
                slots: 1,
                state_size,
            })?;
        state.resize(state_size, 0);

        Ok(Self {
            frame: Frame::NULL,
            state: state.into_boxed_slice(),
            captured: false,
            local_input: I::default(),
            has_local: false,
            predicted_input: I::default(),
            confirmed_input: None,
            used_confirmed: false,
            checksum: None,
        })
    }

    /// Claims the slot for `frame`, clearing everything recorded for its previous occupant.
    pub(crate) fn reset_for(&mut self, frame: Frame) {
        self.frame = frame;
        self.captured = false;
        self.local_input = I::default();
        self.has_local = false;
        self.predicted_input = I::default();
        self.confirmed_input = None;
        self.used_confirmed = false;
        self.checksum = None;
    }

    /// The frame occupying this slot, or [`Frame::NULL`] if it was never used.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Whether this slot currently holds `frame`.
    #[must_use]
    pub fn holds(&self, frame: Frame) -> bool {
        !self.frame.is_null() && self.frame == frame
    }

    /// The serialized state. Only meaningful if [`is_captured`](Self::is_captured).
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut [u8] {
        &mut self.state
    }

    /// Whether the state buffer holds a real capture of this slot's frame.
    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.captured
    }

    pub(crate) fn set_captured(&mut self, captured: bool) {
        self.captured = captured;
    }

    /// The local input recorded for this frame, if any.
    #[must_use]
    pub fn local_input(&self) -> Option<I> {
        self.has_local.then_some(self.local_input)
    }

    pub(crate) fn record_local(&mut self, input: I) {
        self.local_input = input;
        self.has_local = true;
    }

    /// The remote input guessed for this frame.
    #[must_use]
    pub fn predicted_input(&self) -> I {
        self.predicted_input
    }

    pub(crate) fn set_predicted(&mut self, input: I) {
        self.predicted_input = input;
    }

    /// The real remote input, once received.
    #[must_use]
    pub fn confirmed_input(&self) -> Option<I> {
        self.confirmed_input
    }

    pub(crate) fn set_confirmed(&mut self, input: I) {
        self.confirmed_input = Some(input);
    }

    /// Whether the last simulation of this frame already used the confirmed input.
    #[must_use]
    pub fn used_confirmed(&self) -> bool {
        self.used_confirmed
    }

    pub(crate) fn set_used_confirmed(&mut self, used: bool) {
        self.used_confirmed = used;
    }

    /// The checksum attached to this frame: the stamped local one on the authoritative side,
    /// the received remote one on the peer.
    #[must_use]
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    pub(crate) fn set_checksum(&mut self, checksum: u32) {
        self.checksum = Some(checksum);
    }

    /// Whether the frame was simulated with the input that turned out to be correct, so it
    /// can be finalized without resimulating.
    ///
    /// Only meaningful once the confirmed input has arrived.
    #[must_use]
    pub fn prediction_holds(&self) -> bool {
        self.used_confirmed || self.confirmed_input == Some(self.predicted_input)
    }

    /// The remote input to simulate this frame with, and whether it is real.
    #[must_use]
    pub fn remote_input(&self) -> (I, InputStatus) {
        match self.confirmed_input {
            Some(input) => (input, InputStatus::Confirmed),
            None => (self.predicted_input, InputStatus::Predicted),
        }
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

    #[test]
    fn new_slot_is_unused_and_zeroed() {
        let slot: FrameSlot<u8> = FrameSlot::try_new(16).unwrap();
        assert!(slot.frame().is_null());
        assert!(!slot.holds(Frame::NULL));
        assert!(!slot.is_captured());
        assert_eq!(slot.state(), &[0u8; 16]);
        assert_eq!(slot.local_input(), None);
        assert_eq!(slot.checksum(), None);
    }

    #[test]
    fn reset_keeps_state_buffer() {
        let mut slot: FrameSlot<u8> = FrameSlot::try_new(4).unwrap();
        slot.reset_for(Frame::new(0));
        slot.state_mut().copy_from_slice(&[1, 2, 3, 4]);
        slot.set_captured(true);
        slot.record_local(5);
        slot.set_confirmed(6);
        slot.set_used_confirmed(true);
        slot.set_checksum(0xABCD);

        slot.reset_for(Frame::new(9));

        assert!(slot.holds(Frame::new(9)));
        assert_eq!(slot.state(), &[1, 2, 3, 4]);
        assert!(!slot.is_captured());
        assert_eq!(slot.local_input(), None);
        assert_eq!(slot.confirmed_input(), None);
        assert!(!slot.used_confirmed());
        assert_eq!(slot.checksum(), None);
    }

    #[test]
    fn prediction_holds_when_guess_matches() {
        let mut slot: FrameSlot<u8> = FrameSlot::try_new(0).unwrap();
        slot.reset_for(Frame::new(1));
        slot.set_predicted(3);
        assert!(!slot.prediction_holds());

        slot.set_confirmed(3);
        assert!(slot.prediction_holds());
    }

    #[test]
    fn prediction_fails_on_mismatch_unless_confirmed_was_used() {
        let mut slot: FrameSlot<u8> = FrameSlot::try_new(0).unwrap();
        slot.reset_for(Frame::new(1));
        slot.set_predicted(3);
        slot.set_confirmed(4);
        assert!(!slot.prediction_holds());

        slot.set_used_confirmed(true);
        assert!(slot.prediction_holds());
    }

    #[test]
    fn remote_input_prefers_confirmed() {
        let mut slot: FrameSlot<u8> = FrameSlot::try_new(0).unwrap();
        slot.reset_for(Frame::new(0));
        slot.set_predicted(1);
        assert_eq!(slot.remote_input(), (1, InputStatus::Predicted));

        slot.set_confirmed(2);
        assert_eq!(slot.remote_input(), (2, InputStatus::Confirmed));
    }
}
