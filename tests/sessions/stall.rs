#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use delta_rollback::{
    Frame, FrameOutcome, NetplayEvent, NetplaySession, PersistenceLock, ReplayPhase, Role,
    SessionBuilder,
};

use crate::common::run_manual_frame;
use crate::common::stubs::{
    CounterSim, Held, RecordingTransport, ScriptedInput, SharedOutbox, StubConfig, StubInput,
};

fn host(delay: usize) -> (NetplaySession<StubConfig>, CounterSim, SharedOutbox) {
    let lock = PersistenceLock::new();
    let sim = CounterSim::with_lock(lock.clone());
    let (transport, outbox) = RecordingTransport::new();
    let session = SessionBuilder::<StubConfig>::new()
        .with_role(Role::Authoritative)
        .with_delay_frames(delay)
        .unwrap()
        .with_persistence_lock(lock)
        .start_session(Box::new(transport), &sim)
        .unwrap();
    (session, sim, outbox)
}

#[test]
fn stall_rewind_undoes_exactly_one_frame() {
    let (mut session, mut sim, outbox) = host(2);
    let mut local = ScriptedInput::new(|frame| frame as u8 + 10);
    run_manual_frame(&mut session, &mut sim, local.at(0));
    run_manual_frame(&mut session, &mut sim, local.at(1));

    assert!(session.poll_stall());
    let before = sim.encoded();

    // the caller keeps running frames while stalled
    run_manual_frame(&mut session, &mut sim, local.at(2));

    assert_eq!(session.current_frame(), Frame::new(2));
    assert_eq!(session.phase(), ReplayPhase::Stalling);
    assert_eq!(sim.encoded(), before);
    assert_eq!(session.snapshot(Frame::new(2)), Some(&before[..]));
    assert_eq!(session.stats().stall_rewinds, 1);

    let events: Vec<_> = session.events().collect();
    assert_eq!(
        events,
        vec![
            NetplayEvent::StallStarted {
                frame: Frame::new(2)
            },
            NetplayEvent::StallRewind {
                frame: Frame::new(2)
            },
        ]
    );

    // the re-run polls again but keeps the input recorded the first time and does not resend it
    run_manual_frame(&mut session, &mut sim, local.at(7));
    assert_eq!(local.polls, 4);
    assert_eq!(session.current_frame(), Frame::new(2));
    assert_eq!(sim.history.last().map(|&(_, local, _)| local), Some(12));
    let sent_for_frame_two = outbox
        .lock()
        .unwrap()
        .inputs
        .iter()
        .filter(|(f, _)| *f == Frame::new(2))
        .count();
    assert_eq!(sent_for_frame_two, 1);
}

#[test]
fn stall_clears_once_remote_input_arrives() {
    let (mut session, mut sim, _outbox) = host(2);
    let mut held = Held(1);
    for _ in 0..2 {
        assert!(matches!(
            session.advance_frame(&mut sim, &mut held).unwrap(),
            FrameOutcome::Advanced(_)
        ));
    }

    for _ in 0..5 {
        assert_eq!(
            session.advance_frame(&mut sim, &mut held).unwrap(),
            FrameOutcome::Stalled(Frame::new(2))
        );
    }
    assert_eq!(session.stats().stalls, 1);
    assert_eq!(sim.steps, 2);

    session
        .receive_remote_input(Frame::new(0), StubInput::new(0))
        .unwrap();
    assert_eq!(
        session.advance_frame(&mut sim, &mut held).unwrap(),
        FrameOutcome::Advanced(Frame::new(2))
    );
    assert!(!session.is_stalled());
}

#[test]
fn manual_stall_flag_rewinds_after_rollback() {
    let (mut session, mut sim, _outbox) = host(3);
    let mut local = ScriptedInput::new(|_| 2);
    for frame in 0..3 {
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }
    session
        .receive_remote_input(Frame::new(0), StubInput::new(5))
        .unwrap();

    session.set_stall(true);
    run_manual_frame(&mut session, &mut sim, local.at(3));

    // the rollback ran first, then the frame it ended on was undone
    assert_eq!(session.stats().rollbacks, 1);
    assert_eq!(session.current_frame(), Frame::new(3));
    assert_eq!(sim.frame, 3);
    assert_eq!(session.snapshot(Frame::new(3)), Some(&sim.encoded()[..]));
    assert!(session.confirmed_frame() <= session.current_frame());
}

#[test]
fn disconnected_session_runs_freely() {
    let (mut session, mut sim, _outbox) = host(1);
    session.disconnect();
    let mut held = Held(3);
    for frame in 0..10 {
        assert_eq!(
            session.advance_frame(&mut sim, &mut held).unwrap(),
            FrameOutcome::Advanced(Frame::new(frame))
        );
    }
    assert_eq!(session.stats().stalls, 0);
}
