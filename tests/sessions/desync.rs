#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use delta_rollback::checksum::crc32;
use delta_rollback::{
    Frame, NetplayError, NetplayEvent, NetplaySession, Role, SessionBuilder,
};

use crate::common::stubs::{
    CounterSim, Held, RecordingTransport, ScriptedInput, SharedOutbox, StubConfig, StubInput,
};
use crate::common::{forward_run, run_manual_frame};

fn host(delay: usize) -> (NetplaySession<StubConfig>, CounterSim, SharedOutbox) {
    let sim = CounterSim::new();
    let (transport, outbox) = RecordingTransport::new();
    let session = SessionBuilder::<StubConfig>::new()
        .with_role(Role::Authoritative)
        .with_delay_frames(delay)
        .unwrap()
        .start_session(Box::new(transport), &sim)
        .unwrap();
    (session, sim, outbox)
}

/// A peer session whose handshake comes from a throwaway authoritative session.
fn peer(delay: usize) -> (NetplaySession<StubConfig>, CounterSim, SharedOutbox) {
    let ((host_transport, _), (peer_transport, peer_out)) = RecordingTransport::pair();
    let sim = CounterSim::new();
    SessionBuilder::<StubConfig>::new()
        .with_delay_frames(delay)
        .unwrap()
        .start_session(Box::new(host_transport), &sim)
        .unwrap();
    let session = SessionBuilder::<StubConfig>::new()
        .with_role(Role::Peer)
        .start_session(Box::new(peer_transport), &sim)
        .unwrap();
    (session, sim, peer_out)
}

#[test]
fn authoritative_side_checksums_every_finalized_frame_once() {
    let (mut session, mut sim, outbox) = host(3);
    let remote = |frame: i32| (frame % 4) as u8;
    let mut local = ScriptedInput::new(|frame| (frame % 2) as u8);

    for frame in 0..30 {
        if frame >= 3 {
            session
                .receive_remote_input(Frame::new(frame - 3), StubInput::new(remote(frame - 3)))
                .unwrap();
        }
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }

    let confirmed = session.confirmed_frame().as_i32();
    let checksums: Vec<(Frame, u32)> = outbox.lock().unwrap().checksums.iter().copied().collect();
    let frames: Vec<i32> = checksums.iter().map(|(f, _)| f.as_i32()).collect();
    assert_eq!(frames, (0..confirmed).collect::<Vec<_>>());
    assert_eq!(session.stats().checksums_sent, confirmed as u64);

    let inputs: Vec<(u8, u8)> = (0..confirmed)
        .map(|f| ((f % 2) as u8, remote(f)))
        .collect();
    for (frame, checksum) in checksums {
        let expected = forward_run(&inputs[..frame.as_i32() as usize]);
        assert_eq!(checksum, crc32(&expected.encoded()), "frame {frame}");
    }
}

#[test]
fn peer_requests_one_resync_per_divergent_frame() {
    let (mut session, mut sim, outbox) = peer(2);
    assert_eq!(session.role(), Role::Peer);

    session
        .receive_remote_input(Frame::new(0), StubInput::new(5))
        .unwrap();
    session.receive_remote_checksum(Frame::new(0), 0xBAD).unwrap();
    run_manual_frame(&mut session, &mut sim, &mut Held(2));

    // the same bad checksum arriving again after the frame was finalized
    session.receive_remote_checksum(Frame::new(0), 0xBAD).unwrap();

    let good = crc32(&forward_run(&[(5, 2)]).encoded());
    session
        .receive_remote_input(Frame::new(1), StubInput::new(5))
        .unwrap();
    session.receive_remote_checksum(Frame::new(1), good).unwrap();
    run_manual_frame(&mut session, &mut sim, &mut Held(2));

    assert_eq!(outbox.lock().unwrap().resyncs, vec![Frame::new(0)]);
    assert_eq!(session.stats().desyncs, 2);

    let desyncs: Vec<_> = session
        .events()
        .filter_map(|e| match e {
            NetplayEvent::DesyncDetected {
                frame,
                remote_checksum,
                ..
            } => Some((frame, remote_checksum)),
            _ => None,
        })
        .collect();
    assert_eq!(desyncs, vec![(Frame::new(0), 0xBAD), (Frame::new(0), 0xBAD)]);
}

#[test]
fn peer_ignores_checksums_outside_the_ring() {
    let (mut session, mut sim, outbox) = peer(2);
    session.receive_remote_checksum(Frame::new(100), 1).unwrap();
    run_manual_frame(&mut session, &mut sim, &mut Held(0));
    assert_eq!(session.stats().desyncs, 0);
    assert!(outbox.lock().unwrap().resyncs.is_empty());
}

#[test]
fn peer_never_sends_checksums() {
    let (mut session, mut sim, outbox) = peer(2);
    for frame in 0..10 {
        session
            .receive_remote_input(Frame::new(frame), StubInput::new(1))
            .unwrap();
        run_manual_frame(&mut session, &mut sim, &mut Held(1));
    }
    assert!(outbox.lock().unwrap().checksums.is_empty());
    assert_eq!(session.stats().checksums_sent, 0);
}

#[test]
fn state_resend_fast_forwards_the_timeline() {
    let (mut session, mut sim, outbox) = host(3);
    for _ in 0..3 {
        run_manual_frame(&mut session, &mut sim, &mut Held(1));
    }
    assert_eq!(session.confirmed_frame(), Frame::new(0));

    session.request_state_resend();
    assert!(session.is_resend_pending());
    let captured = sim.encoded();
    run_manual_frame(&mut session, &mut sim, &mut Held(1));

    assert!(!session.is_resend_pending());
    assert_eq!(
        outbox.lock().unwrap().savestates,
        vec![(Frame::new(3), captured.to_vec())]
    );
    assert_eq!(session.confirmed_frame(), Frame::new(3));
    assert_eq!(session.read_frame(), Frame::new(3));

    // the peer continues from the savestate, so older input is no longer expected
    assert!(matches!(
        session.receive_remote_input(Frame::new(0), StubInput::new(1)),
        Err(NetplayError::InvalidFrame { .. })
    ));
    session
        .receive_remote_input(Frame::new(3), StubInput::new(1))
        .unwrap();
}
