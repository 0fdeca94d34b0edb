#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;

use delta_rollback::telemetry::CollectingObserver;
use delta_rollback::{
    BlankPrediction, Frame, NetplayEvent, NetplaySession, PersistenceLock, ReplayPhase,
    RepeatLastConfirmed, Role, SessionBuilder,
};

use crate::common::stubs::{CounterSim, RecordingTransport, ScriptedInput, StubConfig, StubInput};
use crate::common::{forward_run, run_manual_frame};

fn host(delay: usize) -> (NetplaySession<StubConfig>, CounterSim) {
    let lock = PersistenceLock::new();
    let sim = CounterSim::with_lock(lock.clone());
    let (transport, _outbox) = RecordingTransport::new();
    let session = SessionBuilder::<StubConfig>::new()
        .with_role(Role::Authoritative)
        .with_delay_frames(delay)
        .unwrap()
        .with_prediction_strategy(BlankPrediction)
        .with_persistence_lock(lock)
        .start_session(Box::new(transport), &sim)
        .unwrap();
    (session, sim)
}

/// Six frames with delay 2, remote input arriving three frames late, and a misprediction
/// only at frame 2.
#[test]
fn misprediction_at_frame_two_replays_through_frame_five() {
    let (mut session, mut sim) = host(2);
    assert_eq!(session.sync_layer().capacity(), 5);

    let remote = |frame: i32| if frame == 2 { 7 } else { 0 };
    let mut local = ScriptedInput::new(|frame| frame as u8 + 1);

    for frame in 0..6 {
        if frame >= 3 {
            let late = frame - 3;
            session
                .receive_remote_input(Frame::new(late), StubInput::new(remote(late)))
                .unwrap();
        }
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }

    let stats = session.stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.frames_resimulated, 4);
    assert_eq!(stats.frames_skipped, 2);
    assert_eq!(session.current_frame(), Frame::new(6));
    assert_eq!(session.read_frame(), Frame::new(3));
    assert_eq!(session.confirmed_frame(), session.read_frame());

    let replayed: Vec<i32> = sim.history[6..].iter().map(|&(f, _, _)| f).collect();
    assert_eq!(replayed, vec![2, 3, 4, 5]);

    let events: Vec<_> = session.events().collect();
    assert_eq!(
        events,
        vec![NetplayEvent::Rollback {
            from: Frame::new(2),
            to: Frame::new(6),
        }]
    );

    let expected: Vec<(u8, u8)> = (0..6).map(|f| (f as u8 + 1, remote(f))).collect();
    assert_eq!(sim.value, forward_run(&expected).value);
    assert_eq!(sim.frame, 6);
}

#[test]
fn correct_predictions_never_resimulate() {
    let (mut session, mut sim) = host(3);
    let mut local = ScriptedInput::new(|_| 4);

    for frame in 0..40 {
        if frame >= 2 {
            session
                .receive_remote_input(Frame::new(frame - 2), StubInput::default())
                .unwrap();
        }
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }

    assert_eq!(session.stats().rollbacks, 0);
    assert_eq!(session.stats().frames_skipped, 38);
    assert_eq!(sim.steps, 40);
    assert_eq!(session.phase(), ReplayPhase::Skipping);
}

#[test]
fn every_slot_in_the_window_matches_a_forward_run_after_rollback() {
    let (mut session, mut sim) = host(4);
    let remote = |frame: i32| (frame * 3 % 5) as u8;
    let mut local = ScriptedInput::new(|frame| (frame % 3) as u8);

    for frame in 0..30 {
        if frame >= 4 {
            let late = frame - 4;
            session
                .receive_remote_input(Frame::new(late), StubInput::new(remote(late)))
                .unwrap();
        }
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }

    // every verified snapshot still in the ring is what a clean run would have captured
    let confirmed = session.confirmed_frame().as_i32();
    let inputs: Vec<(u8, u8)> = (0..confirmed)
        .map(|f| ((f % 3) as u8, remote(f)))
        .collect();
    let mut checked = 0;
    for frame in 0..=confirmed {
        if let Some(snapshot) = session.snapshot(Frame::new(frame)) {
            let expected = forward_run(&inputs[..frame as usize]);
            assert_eq!(snapshot, &expected.encoded()[..], "frame {frame}");
            checked += 1;
        }
    }
    assert!(checked > 0);
    assert!(session.stats().rollbacks > 0);
}

#[test]
fn repeat_last_confirmed_predicts_held_buttons() {
    let lock = PersistenceLock::new();
    let mut sim = CounterSim::with_lock(lock.clone());
    let (transport, _outbox) = RecordingTransport::new();
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_delay_frames(3)
        .unwrap()
        .with_prediction_strategy(RepeatLastConfirmed)
        .with_persistence_lock(lock)
        .start_session(Box::new(transport), &sim)
        .unwrap();

    // the remote player holds the same button for the whole run
    let mut local = ScriptedInput::new(|_| 0);
    for frame in 0..20 {
        if frame >= 2 {
            session
                .receive_remote_input(Frame::new(frame - 2), StubInput::new(9))
                .unwrap();
        }
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }

    // the two frames guessed before anything was confirmed keep their blank guess through
    // the first rollback, so each is corrected once its own input arrives
    assert_eq!(session.stats().rollbacks, 2);
    assert_eq!(session.stats().max_rollback_depth, 3);
    let expected: Vec<(u8, u8)> = (0..20).map(|_| (0, 9)).collect();
    assert_eq!(sim.value, forward_run(&expected).value);
}

#[test]
fn resimulation_reuses_the_recorded_prediction() {
    let lock = PersistenceLock::new();
    let mut sim = CounterSim::with_lock(lock.clone());
    let (transport, _outbox) = RecordingTransport::new();
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_role(Role::Authoritative)
        .with_delay_frames(3)
        .unwrap()
        .with_prediction_strategy(RepeatLastConfirmed)
        .with_persistence_lock(lock)
        .start_session(Box::new(transport), &sim)
        .unwrap();
    let mut local = ScriptedInput::new(|_| 1);

    for frame in 0..3 {
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }
    let predicted_at = |session: &NetplaySession<StubConfig>, frame: i32| {
        let sync = session.sync_layer();
        let index = sync.find(Frame::new(frame)).unwrap();
        sync.slot(index).predicted_input()
    };
    let before = predicted_at(&session, 1);
    assert_eq!(before, StubInput::new(0));

    // a newer confirmed input must not rewrite the guesses frames 1 and 2 ran with
    session
        .receive_remote_input(Frame::new(0), StubInput::new(5))
        .unwrap();
    run_manual_frame(&mut session, &mut sim, local.at(3));

    assert_eq!(session.stats().rollbacks, 1);
    assert_eq!(predicted_at(&session, 1), before);
    assert_eq!(predicted_at(&session, 2), StubInput::new(0));
    assert_eq!(
        sim.history[4..].to_vec(),
        vec![(0, 1, 5), (1, 1, 0), (2, 1, 0), (3, 1, 5)]
    );
    assert_eq!(
        sim.value,
        forward_run(&[(1, 5), (1, 0), (1, 0), (1, 5)]).value
    );
}

#[test]
fn forced_rewind_resimulates_correct_frames() {
    let (mut session, mut sim) = host(3);
    let mut local = ScriptedInput::new(|_| 1);
    for frame in 0..3 {
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }
    let before = sim.value;

    session.force_rewind();
    run_manual_frame(&mut session, &mut sim, local.at(3));

    assert_eq!(session.stats().rollbacks, 1);
    assert_eq!(session.stats().frames_resimulated, 4);
    assert_eq!(session.confirmed_frame(), Frame::new(0));
    assert_eq!(before, forward_run(&[(1, 0); 3]).value);
    assert_eq!(sim.value, forward_run(&[(1, 0); 4]).value);
}

#[test]
fn local_input_is_sent_once_per_frame() {
    let mut sim = CounterSim::new();
    let (transport, outbox) = RecordingTransport::new();
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_delay_frames(2)
        .unwrap()
        .start_session(Box::new(transport), &sim)
        .unwrap();
    let mut local = ScriptedInput::new(|frame| frame as u8);

    run_manual_frame(&mut session, &mut sim, local.at(0));
    session
        .receive_remote_input(Frame::new(0), StubInput::new(3))
        .unwrap();
    run_manual_frame(&mut session, &mut sim, local.at(1));

    let sent: Vec<i32> = outbox
        .lock()
        .unwrap()
        .inputs
        .iter()
        .map(|(f, _)| f.as_i32())
        .collect();
    assert_eq!(sent, vec![0, 1]);
    assert_eq!(local.polls, 2);
}

#[test]
fn no_violations_during_a_normal_run() {
    let observer = Arc::new(CollectingObserver::new());
    let lock = PersistenceLock::new();
    let mut sim = CounterSim::with_lock(lock.clone());
    let (transport, _outbox) = RecordingTransport::new();
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_delay_frames(2)
        .unwrap()
        .with_persistence_lock(lock)
        .with_violation_observer(observer.clone())
        .start_session(Box::new(transport), &sim)
        .unwrap();

    let mut local = ScriptedInput::new(|frame| (frame % 4) as u8);
    for frame in 0..50 {
        if frame >= 1 {
            session
                .receive_remote_input(Frame::new(frame - 1), StubInput::new((frame % 2) as u8))
                .unwrap();
        }
        run_manual_frame(&mut session, &mut sim, local.at(frame));
    }

    delta_rollback::assert_no_violations!(observer);
}
