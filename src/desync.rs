//! Desync detection through state checksums.
//!
//! Once a frame is finalized, both sides hold the snapshot taken just before it ran, built
//! from the same confirmed input history. If the simulation is deterministic those
//! snapshots are byte-identical. The authoritative side checksums its snapshot and sends
//! the value; the peer checksums its own and compares. A mismatch means the two machines
//! have diverged and the peer asks for a fresh savestate.

use tracing::{debug, warn};

use crate::checksum::crc32;
use crate::sync_layer::FrameSlot;
use crate::{Config, Frame, NetplayEvent, Role, Transport};

/// Per-session checksum bookkeeping.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and benchmarks.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct DesyncDetector {
    role: Role,
    last_handled: Frame,
    last_resync: Frame,
    checksums_sent: u64,
    comparisons: u64,
    desyncs: u64,
}

impl DesyncDetector {
    /// Creates a detector for one side of a session.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            last_handled: Frame::NULL,
            last_resync: Frame::NULL,
            checksums_sent: 0,
            comparisons: 0,
            desyncs: 0,
        }
    }

    /// Handles a frame that has just been finalized.
    ///
    /// On the authoritative side the slot's checksum is stamped and sent; on the peer it is
    /// compared against the received one, if any. Each frame is handled at most once, so
    /// replays and repeated calls never send or compare twice.
    pub fn handle_finalized<T: Config>(
        &mut self,
        slot: &mut FrameSlot<T::Input>,
        transport: &mut dyn Transport<T>,
    ) -> Option<NetplayEvent> {
        let frame = slot.frame();
        if frame.is_null() || frame <= self.last_handled || !slot.is_captured() {
            return None;
        }
        self.last_handled = frame;

        let local = crc32(slot.state());
        match self.role {
            Role::Authoritative => {
                slot.set_checksum(local);
                transport.send_checksum(frame, local);
                self.checksums_sent += 1;
                None
            }
            Role::Peer => {
                let remote = slot.checksum()?;
                self.compare(frame, local, remote, transport)
            }
        }
    }

    /// Handles a checksum that arrived for a frame this side has already finalized.
    pub fn handle_late<T: Config>(
        &mut self,
        slot: &FrameSlot<T::Input>,
        remote: u32,
        transport: &mut dyn Transport<T>,
    ) -> Option<NetplayEvent> {
        if self.role.is_authoritative() || !slot.is_captured() {
            return None;
        }
        let local = crc32(slot.state());
        self.compare(slot.frame(), local, remote, transport)
    }

    fn compare<T: Config>(
        &mut self,
        frame: Frame,
        local: u32,
        remote: u32,
        transport: &mut dyn Transport<T>,
    ) -> Option<NetplayEvent> {
        self.comparisons += 1;
        if local == remote {
            return None;
        }

        self.desyncs += 1;
        warn!(
            frame = frame.as_i32(),
            local_checksum = local,
            remote_checksum = remote,
            "Desync detected"
        );
        if frame > self.last_resync {
            self.last_resync = frame;
            debug!(frame = frame.as_i32(), "Requesting resync");
            transport.request_resync(frame);
        }
        Some(NetplayEvent::DesyncDetected {
            frame,
            local_checksum: local,
            remote_checksum: remote,
        })
    }

    /// Number of checksums sent (authoritative side).
    #[must_use]
    pub fn checksums_sent(&self) -> u64 {
        self.checksums_sent
    }

    /// Number of checksum comparisons made (peer side).
    #[must_use]
    pub fn comparisons(&self) -> u64 {
        self.comparisons
    }

    /// Number of mismatches found (peer side).
    #[must_use]
    pub fn desyncs(&self) -> u64 {
        self.desyncs
    }

    /// Latest frame handed to [`handle_finalized`](Self::handle_finalized).
    #[must_use]
    pub fn last_handled(&self) -> Frame {
        self.last_handled
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
    use crate::sync_layer::{DeltaBuffer, SlotIndex};
    use crate::{HandshakeInfo, NetplayResult};

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
    }

    #[derive(Default)]
    struct Recorder {
        checksums: Vec<(Frame, u32)>,
        resyncs: Vec<Frame>,
    }

    impl Transport<TestConfig> for Recorder {
        fn send_handshake(&mut self, _info: &HandshakeInfo) -> NetplayResult<()> {
            Ok(())
        }
        fn receive_handshake(&mut self) -> NetplayResult<HandshakeInfo> {
            unreachable!("not used by the detector")
        }
        fn send_input(&mut self, _frame: Frame, _input: &u8) {}
        fn send_checksum(&mut self, frame: Frame, checksum: u32) {
            self.checksums.push((frame, checksum));
        }
        fn send_savestate(&mut self, _frame: Frame, _state: &[u8]) {}
        fn request_resync(&mut self, frame: Frame) {
            self.resyncs.push(frame);
        }
    }

    fn captured_slot(frame: i32, fill: u8) -> FrameSlot<u8> {
        let mut buffer: DeltaBuffer<u8> = DeltaBuffer::new(1, 8).unwrap();
        assert!(buffer.prepare(SlotIndex::ZERO, Frame::new(frame), Frame::new(frame)));
        let slot = buffer.slot_mut(SlotIndex::ZERO);
        slot.state_mut().fill(fill);
        slot.set_captured(true);
        slot.clone()
    }

    #[test]
    fn authoritative_stamps_and_sends_once() {
        let mut detector = DesyncDetector::new(Role::Authoritative);
        let mut transport = Recorder::default();
        let mut slot = captured_slot(3, 0xAA);

        assert_eq!(detector.handle_finalized(&mut slot, &mut transport), None);
        assert_eq!(detector.handle_finalized(&mut slot, &mut transport), None);

        let expected = crc32(&[0xAA; 8]);
        assert_eq!(transport.checksums, vec![(Frame::new(3), expected)]);
        assert_eq!(slot.checksum(), Some(expected));
        assert_eq!(detector.checksums_sent(), 1);
    }

    #[test]
    fn uncaptured_slot_is_skipped() {
        let mut detector = DesyncDetector::new(Role::Authoritative);
        let mut transport = Recorder::default();
        let mut slot = captured_slot(0, 0);
        slot.set_captured(false);

        assert_eq!(detector.handle_finalized(&mut slot, &mut transport), None);
        assert!(transport.checksums.is_empty());
    }

    #[test]
    fn peer_matching_checksum_is_silent() {
        let mut detector = DesyncDetector::new(Role::Peer);
        let mut transport = Recorder::default();
        let mut slot = captured_slot(5, 1);
        slot.set_checksum(crc32(&[1; 8]));

        assert_eq!(detector.handle_finalized(&mut slot, &mut transport), None);
        assert!(transport.resyncs.is_empty());
        assert_eq!(detector.comparisons(), 1);
    }

    #[test]
    fn peer_mismatch_requests_resync_once_per_frame() {
        let mut detector = DesyncDetector::new(Role::Peer);
        let mut transport = Recorder::default();
        let slot = captured_slot(5, 1);

        let event = detector.handle_late(&slot, 0xDEAD_BEEF, &mut transport);
        assert!(matches!(
            event,
            Some(NetplayEvent::DesyncDetected { frame, remote_checksum: 0xDEAD_BEEF, .. })
                if frame == Frame::new(5)
        ));
        let again = detector.handle_late(&slot, 0xDEAD_BEEF, &mut transport);
        assert!(again.is_some());

        assert_eq!(transport.resyncs, vec![Frame::new(5)]);
        assert_eq!(detector.desyncs(), 2);
    }

    #[test]
    fn peer_without_remote_checksum_does_nothing() {
        let mut detector = DesyncDetector::new(Role::Peer);
        let mut transport = Recorder::default();
        let mut slot = captured_slot(2, 9);

        assert_eq!(detector.handle_finalized(&mut slot, &mut transport), None);
        assert_eq!(detector.comparisons(), 0);
        assert_eq!(detector.last_handled(), Frame::new(2));
    }
}
