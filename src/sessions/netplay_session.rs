use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::desync::DesyncDetector;
use crate::error::{NetplayError, NetplayResult};
use crate::frame_info::FrameInputs;
use crate::persistence::PersistenceLock;
use crate::prediction::PredictionStrategy;
use crate::sync_layer::{Cursor, SlotIndex, SyncLayer};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    debug_check_invariants, report_violation_to, Config, Frame, FrameStrategy, InputSource,
    NetplayEvent, ReplayPhase, Role, Simulation, SyncMode, Transport,
};

/// Events older than this are dropped if [`NetplaySession::events`] is never drained.
const EVENT_QUEUE_SIZE: usize = 100;

/// Result of [`NetplaySession::advance_frame`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was simulated.
    Advanced(Frame),
    /// The session is waiting for remote input; nothing was simulated.
    Stalled(Frame),
}

/// Running counters for a session.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames completed through Post-Step, not counting resimulations.
    pub frames_simulated: u64,
    /// Frames finalized without resimulating because the prediction was right.
    pub frames_skipped: u64,
    /// Number of rollbacks.
    pub rollbacks: u64,
    /// Frames simulated again during rollbacks.
    pub frames_resimulated: u64,
    /// Deepest rollback so far, in frames.
    pub max_rollback_depth: usize,
    /// Number of times the session started waiting for remote input.
    pub stalls: u64,
    /// Frames undone by the stall rewind.
    pub stall_rewinds: u64,
    /// Checksums sent to the peer.
    pub checksums_sent: u64,
    /// Checksum mismatches found.
    pub desyncs: u64,
}

/// One side of a rollback netplay connection.
///
/// The session owns the snapshot ring and the timeline cursors. The caller owns the
/// simulation and brackets every frame it runs with [`pre_step`](Self::pre_step) and
/// [`post_step`](Self::post_step):
///
/// ```ignore
/// if !session.poll_stall() {
///     session.pre_step(&mut emulator, &mut gamepad);
///     let inputs = session.frame_inputs().expect("pre_step recorded inputs");
///     emulator.run_one_step(&inputs);
///     session.post_step(&mut emulator);
/// }
/// ```
///
/// or lets [`advance_frame`](Self::advance_frame) do all of the above.
///
/// Create sessions with [`SessionBuilder`](crate::SessionBuilder).
pub struct NetplaySession<T>
where
    T: Config,
{
    sync: SyncLayer<T::Input>,
    role: Role,
    strategy: FrameStrategy,
    sync_mode: SyncMode,
    phase: ReplayPhase,
    /// How many frames may run ahead of `read` before stalling.
    stall_frames: usize,
    connected: bool,
    replaying: bool,
    force_rewind: bool,
    force_resend: bool,
    stall: bool,
    /// Set between Pre-Step and Post-Step.
    can_poll: bool,
    transport: Box<dyn Transport<T>>,
    persistence: PersistenceLock,
    prediction: Box<dyn PredictionStrategy<T::Input>>,
    desync: DesyncDetector,
    last_confirmed_input: Option<T::Input>,
    stats: SessionStats,
    events: VecDeque<NetplayEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for NetplaySession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("role", &self.role)
            .field("strategy", &self.strategy)
            .field("sync_mode", &self.sync_mode)
            .field("phase", &self.phase)
            .field("self", &self.sync.self_cursor)
            .field("other", &self.sync.other_cursor)
            .field("read", &self.sync.read_cursor)
            .field("capacity", &self.sync.capacity())
            .field("stall_frames", &self.stall_frames)
            .field("connected", &self.connected)
            .field("stall", &self.stall)
            .field("force_rewind", &self.force_rewind)
            .field("force_resend", &self.force_resend)
            .field("stats", &self.stats)
            .field("pending_events", &self.events.len())
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Config> NetplaySession<T> {
    pub(crate) fn new(
        sync: SyncLayer<T::Input>,
        role: Role,
        strategy: FrameStrategy,
        transport: Box<dyn Transport<T>>,
        persistence: PersistenceLock,
        prediction: Box<dyn PredictionStrategy<T::Input>>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let mut session = Self {
            sync,
            role,
            strategy,
            sync_mode: SyncMode::Rollback,
            phase: ReplayPhase::Playing,
            stall_frames: 0,
            connected: true,
            replaying: false,
            force_rewind: false,
            force_resend: false,
            stall: false,
            can_poll: false,
            transport,
            persistence,
            prediction,
            desync: DesyncDetector::new(role),
            last_confirmed_input: None,
            stats: SessionStats::default(),
            events: VecDeque::with_capacity(EVENT_QUEUE_SIZE),
            violation_observer,
        };
        session.stall_frames = session.default_stall_frames();
        session
    }

    // ##################
    // #   FRAME LOOP   #
    // ##################

    /// Prepares the frame about to be simulated.
    ///
    /// Captures the simulation into the frame's slot, polls the local input once, records it
    /// (sending it to the peer the first time this frame is seen) and decides which remote input the
    /// frame runs with: the real one if it has arrived, a prediction otherwise.
    ///
    /// A failed capture does not abort the frame. The session switches to
    /// [`SyncMode::Lockstep`] and emits [`NetplayEvent::SerializationLost`].
    pub fn pre_step<S, P>(&mut self, sim: &mut S, input: &mut P)
    where
        S: Simulation<T> + ?Sized,
        P: InputSource<T> + ?Sized,
    {
        let Cursor { index, frame } = self.sync.self_cursor;

        if self.sync.prepare_self() {
            let slot = self.sync.slot_mut(index);
            match sim.serialize(slot.state_mut()) {
                Ok(()) => {
                    slot.set_captured(true);
                    if self.force_resend {
                        self.broadcast_savestate();
                    }
                }
                Err(err) => {
                    slot.set_captured(false);
                    self.enter_lockstep(frame, &err);
                }
            }
        } else {
            let occupant = self.sync.slot(index).frame();
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::StateManagement,
                "no free snapshot slot for frame {}: slot still holds unverified frame {}",
                frame,
                occupant;
                frame = frame
            );
        }

        self.can_poll = true;
        let polled = input.poll_local_input();
        if self.sync.slot(index).holds(frame) {
            self.record_inputs(index, frame, polled);
        }
    }

    /// Reconciles the timeline after a frame has been simulated.
    ///
    /// Verifies frames whose remote input has arrived, rolls back and resimulates if a
    /// prediction turned out wrong, and undoes the frame again if the session was stalled.
    pub fn post_step<S>(&mut self, sim: &mut S)
    where
        S: Simulation<T> + ?Sized,
    {
        debug_check_invariants!(self.sync, "post_step entry", to = &self.violation_observer);

        let ran = self.sync.self_cursor.frame;
        if !self.can_poll {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "post_step for frame {} without a matching pre_step",
                ran;
                frame = ran
            );
        }
        self.can_poll = false;

        self.sync.advance_self();
        self.stats.frames_simulated += 1;
        self.phase = ReplayPhase::Playing;

        if !self.connected {
            // nothing left to verify against, every frame is final
            let me = self.sync.self_cursor;
            self.sync.other_cursor = me;
            if self.sync.read_cursor.frame < me.frame {
                self.sync.read_cursor = me;
            }
            return;
        }

        if self.is_spectated_host() && self.sync.read_cursor.frame < self.sync.self_cursor.frame {
            self.sync.read_cursor = self.sync.self_cursor;
        }

        match self.sync_mode {
            SyncMode::Lockstep => self.follow_confirmed(ran),
            SyncMode::Rollback => {
                if !self.force_rewind {
                    self.skip_verified();
                }
                let other = self.sync.other_cursor.frame;
                if self.force_rewind
                    || (other < self.sync.read_cursor.frame && other < self.sync.self_cursor.frame)
                {
                    self.replay(sim);
                }
            }
        }

        if self.stall {
            self.stall_rewind(sim);
        }

        debug_check_invariants!(self.sync, "post_step exit", to = &self.violation_observer);
    }

    /// Runs one frame: polls for a stall, then Pre-Step, one simulation step under the
    /// persistence lock, and Post-Step.
    pub fn advance_frame<S, P>(&mut self, sim: &mut S, input: &mut P) -> NetplayResult<FrameOutcome>
    where
        S: Simulation<T> + ?Sized,
        P: InputSource<T> + ?Sized,
    {
        let frame = self.sync.self_cursor.frame;
        if self.poll_stall() {
            return Ok(FrameOutcome::Stalled(frame));
        }

        self.pre_step(sim, input);
        let Some(inputs) = self.frame_inputs() else {
            self.can_poll = false;
            return Err(NetplayError::BufferFull { frame });
        };
        {
            let _guard = self.persistence.acquire();
            sim.run_one_step(&inputs);
        }
        self.post_step(sim);

        Ok(FrameOutcome::Advanced(frame))
    }

    /// The inputs recorded by the last Pre-Step for the frame about to be simulated.
    #[must_use]
    pub fn frame_inputs(&self) -> Option<FrameInputs<T::Input>> {
        let Cursor { index, frame } = self.sync.self_cursor;
        let slot = self.sync.slot(index);
        if !slot.holds(frame) || slot.local_input().is_none() {
            return None;
        }
        Some(self.inputs_at(index))
    }

    // ##################
    // #  REMOTE INPUT  #
    // ##################

    /// Stores the peer's input for `frame`, which must be the next frame without remote
    /// input ([`read_frame`](Self::read_frame)).
    ///
    /// # Errors
    /// - [`NetplayError::NotConnected`] if the session is disconnected.
    /// - [`NetplayError::InvalidRequest`] on the authoritative side of a spectator session.
    /// - [`NetplayError::InvalidFrame`] if `frame` is not the expected one.
    /// - [`NetplayError::BufferFull`] if the input arrives too far ahead of the local
    ///   simulation. Keep it and deliver it again after advancing.
    pub fn receive_remote_input(&mut self, frame: Frame, input: T::Input) -> NetplayResult<()> {
        if !self.connected {
            return Err(NetplayError::NotConnected);
        }
        if self.is_spectated_host() {
            return Err(NetplayError::InvalidRequest {
                info: "a spectated session does not accept remote input".to_owned(),
            });
        }

        let read = self.sync.read_cursor;
        if frame != read.frame {
            return Err(NetplayError::InvalidFrame {
                frame,
                reason: format!("expected remote input for frame {}", read.frame),
            });
        }
        let me = self.sync.self_cursor.frame;
        if frame.frames_since(me) >= self.sync.delay_frames() || !self.sync.prepare_read() {
            return Err(NetplayError::BufferFull { frame });
        }

        self.sync.slot_mut(read.index).set_confirmed(input);
        self.sync.advance_read();
        self.last_confirmed_input = Some(input);
        trace!(frame = frame.as_i32(), "Remote input confirmed");
        Ok(())
    }

    /// Stores the authoritative side's checksum for `frame`.
    ///
    /// If this side has already finalized `frame` and still holds its snapshot, the
    /// comparison happens immediately; otherwise it happens when the frame is finalized.
    /// Checksums for frames no longer (or not yet) in the ring are ignored.
    ///
    /// # Errors
    /// - [`NetplayError::NotConnected`] if the session is disconnected.
    /// - [`NetplayError::InvalidRequest`] on the authoritative side.
    pub fn receive_remote_checksum(&mut self, frame: Frame, checksum: u32) -> NetplayResult<()> {
        if !self.connected {
            return Err(NetplayError::NotConnected);
        }
        if self.role.is_authoritative() {
            return Err(NetplayError::InvalidRequest {
                info: "the authoritative side does not verify checksums".to_owned(),
            });
        }

        let Some(index) = self.sync.find(frame) else {
            trace!(frame = frame.as_i32(), "Checksum for a frame outside the ring ignored");
            return Ok(());
        };

        let finalized = frame < self.sync.other_cursor.frame;
        let slot = self.sync.slot_mut(index);
        slot.set_checksum(checksum);
        if finalized {
            let event = self
                .desync
                .handle_late(slot, checksum, self.transport.as_mut());
            if let Some(event) = event {
                self.push_event(event);
            }
            self.stats.desyncs = self.desync.desyncs();
        }
        Ok(())
    }

    // ##################
    // #     FLAGS      #
    // ##################

    /// Decides whether the next frame must wait for remote input, and remembers the
    /// decision for the next Post-Step.
    ///
    /// The session stalls when it has run `stall_frames` frames past the last confirmed
    /// remote input, or when the next frame's slot still holds an unverified frame.
    pub fn poll_stall(&mut self) -> bool {
        let me = self.sync.self_cursor.frame;
        let window = i32::try_from(self.stall_frames).unwrap_or(i32::MAX);
        let limit = self.sync.read_cursor.frame.as_i32().saturating_add(window);
        let should_stall = self.connected
            && !self.is_spectated_host()
            && (me.as_i32() >= limit || !self.sync.self_slot_ready());

        if should_stall && !self.stall {
            self.stats.stalls += 1;
            debug!(
                frame = me.as_i32(),
                read = self.sync.read_cursor.frame.as_i32(),
                "Stalling for remote input"
            );
            self.push_event(NetplayEvent::StallStarted { frame: me });
        }
        self.stall = should_stall;
        should_stall
    }

    /// Sets or clears the stall flag directly. A set flag makes the next Post-Step undo
    /// the frame it follows.
    pub fn set_stall(&mut self, stall: bool) {
        self.stall = stall;
    }

    /// Makes the next Post-Step resimulate from the oldest unverified frame, even if every
    /// prediction was right.
    pub fn force_rewind(&mut self) {
        self.force_rewind = true;
    }

    /// Makes the next Pre-Step send the captured state to the peer and treat every frame up
    /// to it as verified.
    pub fn request_state_resend(&mut self) {
        self.force_resend = true;
    }

    /// Leaves [`SyncMode::Lockstep`] and restores the normal stall window. Call this once the
    /// simulation can be serialized again.
    pub fn reset_sync_mode(&mut self) {
        if self.sync_mode == SyncMode::Lockstep {
            info!("Leaving lockstep mode, rollback re-enabled");
        }
        self.sync_mode = SyncMode::Rollback;
        self.stall_frames = self.default_stall_frames();
    }

    /// Marks the session disconnected. Post-Step stops reconciling and remote data is
    /// rejected; the local simulation can keep running.
    pub fn disconnect(&mut self) {
        if self.connected {
            info!(frame = self.sync.self_cursor.frame.as_i32(), "Netplay session disconnected");
        }
        self.connected = false;
        self.stall = false;
    }

    // ##################
    // #   ACCESSORS    #
    // ##################

    /// The next frame to simulate (the `self` cursor).
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync.self_cursor.frame
    }

    /// The oldest frame not yet verified (the `other` cursor).
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync.other_cursor.frame
    }

    /// The next frame whose remote input is expected (the `read` cursor).
    #[must_use]
    pub fn read_frame(&self) -> Frame {
        self.sync.read_cursor.frame
    }

    /// Where the last resimulation ended (the `replay` cursor).
    #[must_use]
    pub fn replay_frame(&self) -> Frame {
        self.sync.replay_cursor.frame
    }

    /// The snapshot ring and cursors.
    #[doc(hidden)]
    #[must_use]
    pub fn sync_layer(&self) -> &SyncLayer<T::Input> {
        &self.sync
    }

    /// The captured state for `frame`, if it is still in the ring.
    #[must_use]
    pub fn snapshot(&self, frame: Frame) -> Option<&[u8]> {
        let index = self.sync.find(frame)?;
        let slot = self.sync.slot(index);
        slot.is_captured().then(|| slot.state())
    }

    /// Which side of the pairing this is.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The engine variant.
    #[must_use]
    pub fn strategy(&self) -> FrameStrategy {
        self.strategy
    }

    /// Whether rollback is available.
    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// The last phase Post-Step went through.
    #[must_use]
    pub fn phase(&self) -> ReplayPhase {
        self.phase
    }

    /// Latency tolerance agreed in the handshake.
    #[must_use]
    pub fn delay_frames(&self) -> usize {
        self.sync.delay_frames()
    }

    /// Current stall window.
    #[must_use]
    pub fn stall_frames(&self) -> usize {
        self.stall_frames
    }

    /// Whether the session is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a resimulation is in progress.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Whether the stall flag is set.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.stall
    }

    /// Whether a state resend is pending.
    #[must_use]
    pub fn is_resend_pending(&self) -> bool {
        self.force_resend
    }

    /// Running counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// The lock held around every simulation step the session drives.
    #[must_use]
    pub fn persistence_lock(&self) -> &PersistenceLock {
        &self.persistence
    }

    /// Drains pending events.
    pub fn events(&mut self) -> impl Iterator<Item = NetplayEvent> + '_ {
        self.events.drain(..)
    }

    // ##################
    // #    INTERNAL    #
    // ##################

    fn is_spectated_host(&self) -> bool {
        self.strategy == FrameStrategy::Spectator && self.role.is_authoritative()
    }

    fn is_viewer(&self) -> bool {
        self.strategy == FrameStrategy::Spectator && !self.role.is_authoritative()
    }

    fn default_stall_frames(&self) -> usize {
        if self.is_viewer() {
            0
        } else {
            self.sync.delay_frames()
        }
    }

    fn push_event(&mut self, event: NetplayEvent) {
        if self.events.len() >= EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Records `polled` as the frame's local input unless a re-run of the frame already did.
    fn record_inputs(&mut self, index: SlotIndex, frame: Frame, polled: T::Input) {
        let viewer = self.is_viewer();
        let spectated_host = self.is_spectated_host();
        let slot = self.sync.slot_mut(index);

        if slot.local_input().is_none() {
            // the viewer's port is fed the neutral input on both ends
            let local = if viewer { T::Input::default() } else { polled };
            slot.record_local(local);
            if !viewer {
                self.transport.send_input(frame, &local);
            }
        }

        if spectated_host && slot.confirmed_input().is_none() {
            slot.set_confirmed(T::Input::default());
        }

        match slot.confirmed_input() {
            Some(confirmed) => {
                slot.set_predicted(confirmed);
                slot.set_used_confirmed(true);
            }
            None => {
                let guess = self.prediction.predict(frame, self.last_confirmed_input);
                slot.set_predicted(guess);
                slot.set_used_confirmed(false);
            }
        }
    }

    fn inputs_at(&self, index: SlotIndex) -> FrameInputs<T::Input> {
        let slot = self.sync.slot(index);
        let (remote, remote_status) = slot.remote_input();
        FrameInputs {
            frame: slot.frame(),
            local: slot.local_input().unwrap_or_default(),
            remote,
            remote_status,
            role: self.role,
        }
    }

    fn enter_lockstep(&mut self, frame: Frame, err: &NetplayError) {
        self.stall_frames = 0;
        if self.sync_mode == SyncMode::Lockstep {
            return;
        }
        self.sync_mode = SyncMode::Lockstep;
        warn!(
            frame = frame.as_i32(),
            error = %err,
            "Simulation cannot be serialized, falling back to lockstep"
        );
        self.push_event(NetplayEvent::SerializationLost { frame });
    }

    /// Sends the state just captured at `self` and treats everything before it as verified.
    fn broadcast_savestate(&mut self) {
        let me = self.sync.self_cursor;
        if self.sync.other_cursor.frame < me.frame {
            self.sync.other_cursor = me;
        }
        if self.sync.read_cursor.frame < me.frame {
            self.sync.read_cursor = me;
        }
        let state = self.sync.slot(me.index).state();
        self.transport.send_savestate(me.frame, state);
        self.force_resend = false;
        debug!(frame = me.frame.as_i32(), "Savestate sent to peer");
    }

    fn finalize(&mut self, index: SlotIndex) {
        let slot = self.sync.slot_mut(index);
        let event = self
            .desync
            .handle_finalized(slot, self.transport.as_mut());
        if let Some(event) = event {
            self.push_event(event);
        }
        self.stats.checksums_sent = self.desync.checksums_sent();
        self.stats.desyncs = self.desync.desyncs();
    }

    /// Lockstep: every frame ran on whatever input it had, so `other` simply follows the
    /// confirmed input.
    fn follow_confirmed(&mut self, ran: Frame) {
        if self.sync.read_cursor.frame <= ran && !self.stall {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "frame {} ran on predicted input while rollback is unavailable",
                ran;
                frame = ran
            );
        }

        let target = self.sync.read_cursor.frame.min(self.sync.self_cursor.frame);
        while self.sync.other_cursor.frame < target {
            let Cursor { index, frame } = self.sync.other_cursor;
            if self.sync.slot(index).holds(frame) {
                self.finalize(index);
            }
            self.sync.advance_other();
        }
    }

    /// Finalizes frames whose prediction turned out right.
    fn skip_verified(&mut self) {
        let mut skipped = 0;
        loop {
            let Cursor { index, frame } = self.sync.other_cursor;
            if frame >= self.sync.read_cursor.frame || frame >= self.sync.self_cursor.frame {
                break;
            }
            let slot = self.sync.slot(index);
            if !slot.holds(frame) || !slot.prediction_holds() {
                break;
            }
            self.finalize(index);
            self.sync.advance_other();
            skipped += 1;
        }

        if skipped > 0 {
            self.phase = ReplayPhase::Skipping;
            self.stats.frames_skipped += skipped;
            trace!(
                skipped,
                other = self.sync.other_cursor.frame.as_i32(),
                "Verified predicted frames"
            );
        }
    }

    /// Loads the snapshot at `other` and resimulates up to `self`.
    fn replay<S>(&mut self, sim: &mut S)
    where
        S: Simulation<T> + ?Sized,
    {
        let start = self.sync.other_cursor;
        let me = self.sync.self_cursor.frame;
        let target = if self.sync.read_cursor.frame < me {
            self.sync.read_cursor
        } else {
            self.sync.self_cursor
        };

        if start.frame >= me {
            self.force_rewind = false;
            return;
        }

        self.replaying = true;
        self.phase = ReplayPhase::Replaying;

        if !self.load_slot(sim, start) {
            // nothing to roll back to; accept the mispredicted frames as they are
            while self.sync.other_cursor.frame < target.frame {
                self.sync.advance_other();
            }
            self.replaying = false;
            self.force_rewind = false;
            return;
        }

        self.sync.replay_cursor = start;
        let mut resimulated = 0usize;
        while self.sync.replay_cursor.frame < me {
            let Cursor { index, frame } = self.sync.replay_cursor;
            if !self.sync.slot(index).holds(frame) {
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Critical,
                    ViolationKind::StateManagement,
                    "resimulation reached frame {} with no recorded inputs",
                    frame;
                    frame = frame
                );
                break;
            }

            // unconfirmed frames replay the prediction recorded when they first ran
            let slot = self.sync.slot_mut(index);
            if slot.confirmed_input().is_some() {
                slot.set_used_confirmed(true);
            }

            match sim.serialize(slot.state_mut()) {
                Ok(()) => slot.set_captured(true),
                Err(err) => {
                    slot.set_captured(false);
                    self.enter_lockstep(frame, &err);
                }
            }

            if frame < target.frame {
                self.finalize(index);
            }

            let inputs = self.inputs_at(index);
            {
                let _guard = self.persistence.acquire();
                sim.run_one_step(&inputs);
            }

            self.sync.advance_replay();
            resimulated += 1;
        }

        self.sync.other_cursor = target;
        self.replaying = false;
        self.force_rewind = false;

        self.stats.rollbacks += 1;
        self.stats.frames_resimulated += resimulated as u64;
        self.stats.max_rollback_depth = self.stats.max_rollback_depth.max(resimulated);
        debug!(
            from = start.frame.as_i32(),
            to = me.as_i32(),
            resimulated,
            "Rolled back"
        );
        self.push_event(NetplayEvent::Rollback {
            from: start.frame,
            to: me,
        });
    }

    /// Undoes the frame that just ran.
    fn stall_rewind<S>(&mut self, sim: &mut S)
    where
        S: Simulation<T> + ?Sized,
    {
        self.phase = ReplayPhase::Stalling;
        let mut me = self.sync.self_cursor;
        me.retreat(self.sync.capacity());

        // without a snapshot the frame cannot be undone, so the timeline keeps it
        if !self.load_slot(sim, me) {
            return;
        }
        self.sync.retreat_self();
        self.stats.stall_rewinds += 1;
        debug!(frame = me.frame.as_i32(), "Stall rewind");
        self.push_event(NetplayEvent::StallRewind { frame: me.frame });

        if self.sync.other_cursor.frame > me.frame {
            self.sync.other_cursor = me;
        }
    }

    /// Restores the simulation from the slot under `cursor`. Reports and returns `false` if
    /// the slot holds no usable capture.
    fn load_slot<S>(&mut self, sim: &mut S, cursor: Cursor) -> bool
    where
        S: Simulation<T> + ?Sized,
    {
        let slot = self.sync.slot(cursor.index);
        if !slot.holds(cursor.frame) || !slot.is_captured() {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "no snapshot to load for frame {}",
                cursor.frame;
                frame = cursor.frame
            );
            return false;
        }
        if let Err(err) = sim.deserialize(slot.state()) {
            report_violation_to!(
                &self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "failed to load snapshot for frame {}: {}",
                cursor.frame,
                err;
                frame = cursor.frame
            );
            return false;
        }
        true
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
    use crate::telemetry::CollectingObserver;
    use crate::{BlankPrediction, HandshakeInfo, InputStatus, SessionBuilder};

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
    }

    #[derive(Default)]
    struct Accumulator {
        value: u64,
    }

    impl Simulation<TestConfig> for Accumulator {
        fn serialized_size(&self) -> usize {
            8
        }
        fn serialize(&mut self, buf: &mut [u8]) -> NetplayResult<()> {
            buf.copy_from_slice(&self.value.to_le_bytes());
            Ok(())
        }
        fn deserialize(&mut self, buf: &[u8]) -> NetplayResult<()> {
            let bytes: [u8; 8] = buf.try_into().map_err(|_| NetplayError::SerializationError {
                context: "bad length".to_owned(),
            })?;
            self.value = u64::from_le_bytes(bytes);
            Ok(())
        }
        fn run_one_step(&mut self, inputs: &FrameInputs<u8>) {
            self.value = self
                .value
                .wrapping_mul(31)
                .wrapping_add(u64::from(inputs.local) + 7 * u64::from(inputs.remote));
        }
    }

    struct Constant(u8);

    impl InputSource<TestConfig> for Constant {
        fn poll_local_input(&mut self) -> u8 {
            self.0
        }
    }

    struct Silent;

    impl Transport<TestConfig> for Silent {
        fn send_handshake(&mut self, _info: &HandshakeInfo) -> NetplayResult<()> {
            Ok(())
        }
        fn receive_handshake(&mut self) -> NetplayResult<HandshakeInfo> {
            Err(NetplayError::NotConnected)
        }
        fn send_input(&mut self, _frame: Frame, _input: &u8) {}
        fn send_checksum(&mut self, _frame: Frame, _checksum: u32) {}
        fn send_savestate(&mut self, _frame: Frame, _state: &[u8]) {}
        fn request_resync(&mut self, _frame: Frame) {}
    }

    fn session(delay: usize) -> NetplaySession<TestConfig> {
        SessionBuilder::<TestConfig>::new()
            .with_delay_frames(delay)
            .unwrap()
            .with_prediction_strategy(BlankPrediction)
            .start_session(Box::new(Silent), &Accumulator::default())
            .unwrap()
    }

    fn step(session: &mut NetplaySession<TestConfig>, sim: &mut Accumulator, local: u8) {
        session.pre_step(sim, &mut Constant(local));
        let inputs = session.frame_inputs().unwrap();
        sim.run_one_step(&inputs);
        session.post_step(sim);
    }

    #[test]
    fn new_session_starts_at_frame_zero() {
        let session = session(2);
        assert_eq!(session.current_frame(), Frame::new(0));
        assert_eq!(session.confirmed_frame(), Frame::new(0));
        assert_eq!(session.read_frame(), Frame::new(0));
        assert_eq!(session.phase(), ReplayPhase::Playing);
        assert_eq!(session.stall_frames(), 2);
        assert!(session.frame_inputs().is_none());
    }

    #[test]
    fn pre_step_captures_and_predicts() {
        let mut session = session(2);
        let mut sim = Accumulator { value: 42 };
        session.pre_step(&mut sim, &mut Constant(3));

        let inputs = session.frame_inputs().unwrap();
        assert_eq!(inputs.local, 3);
        assert_eq!(inputs.remote, 0);
        assert_eq!(inputs.remote_status, InputStatus::Predicted);
        assert_eq!(session.snapshot(Frame::new(0)), Some(&42u64.to_le_bytes()[..]));
    }

    #[test]
    fn confirmed_input_is_used_directly() {
        let mut session = session(2);
        let mut sim = Accumulator::default();
        session.receive_remote_input(Frame::new(0), 9).unwrap();
        session.pre_step(&mut sim, &mut Constant(1));

        let inputs = session.frame_inputs().unwrap();
        assert_eq!(inputs.remote, 9);
        assert_eq!(inputs.remote_status, InputStatus::Confirmed);
    }

    #[test]
    fn correct_prediction_is_skipped_not_replayed() {
        let mut session = session(2);
        let mut sim = Accumulator::default();
        step(&mut session, &mut sim, 1);
        session.receive_remote_input(Frame::new(0), 0).unwrap();
        step(&mut session, &mut sim, 1);

        assert_eq!(session.phase(), ReplayPhase::Skipping);
        assert_eq!(session.confirmed_frame(), Frame::new(1));
        assert_eq!(session.stats().rollbacks, 0);
        assert_eq!(session.stats().frames_skipped, 1);
    }

    #[test]
    fn misprediction_rolls_back_and_matches_forward_run() {
        let mut session = session(2);
        let mut sim = Accumulator::default();
        step(&mut session, &mut sim, 1);
        step(&mut session, &mut sim, 2);
        session.receive_remote_input(Frame::new(0), 5).unwrap();
        step(&mut session, &mut sim, 3);

        let mut expected = Accumulator::default();
        for (frame, local, remote) in [(0, 1, 5), (1, 2, 0), (2, 3, 0)] {
            expected.run_one_step(&FrameInputs {
                frame: Frame::new(frame),
                local,
                remote,
                remote_status: InputStatus::Confirmed,
                role: Role::Authoritative,
            });
        }
        assert_eq!(sim.value, expected.value);
        assert_eq!(session.stats().rollbacks, 1);
        assert_eq!(session.stats().frames_resimulated, 3);
        assert_eq!(session.confirmed_frame(), Frame::new(1));
        assert!(matches!(
            session.events().last(),
            Some(NetplayEvent::Rollback { from, to }) if from == Frame::new(0) && to == Frame::new(3)
        ));
    }

    #[test]
    fn receive_rejects_out_of_order_frames() {
        let mut session = session(2);
        assert!(matches!(
            session.receive_remote_input(Frame::new(1), 0),
            Err(NetplayError::InvalidFrame { .. })
        ));
        session.receive_remote_input(Frame::new(0), 0).unwrap();
        assert!(matches!(
            session.receive_remote_input(Frame::new(0), 0),
            Err(NetplayError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn receive_rejects_input_too_far_ahead() {
        let mut session = session(2);
        session.receive_remote_input(Frame::new(0), 0).unwrap();
        session.receive_remote_input(Frame::new(1), 0).unwrap();
        assert!(matches!(
            session.receive_remote_input(Frame::new(2), 0),
            Err(NetplayError::BufferFull { .. })
        ));
        assert_eq!(session.read_frame(), Frame::new(2));
    }

    #[test]
    fn disconnected_session_rejects_remote_data() {
        let mut session = session(2);
        session.disconnect();
        assert!(!session.is_connected());
        assert_eq!(
            session.receive_remote_input(Frame::new(0), 0),
            Err(NetplayError::NotConnected)
        );
        assert_eq!(
            session.receive_remote_checksum(Frame::new(0), 0),
            Err(NetplayError::NotConnected)
        );
        assert!(!session.poll_stall());
    }

    #[test]
    fn authoritative_side_rejects_checksums() {
        let mut session = session(2);
        assert!(matches!(
            session.receive_remote_checksum(Frame::new(0), 1),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn poll_stall_after_window_is_used_up() {
        let mut session = session(2);
        let mut sim = Accumulator::default();
        assert!(!session.poll_stall());
        step(&mut session, &mut sim, 0);
        assert!(!session.poll_stall());
        step(&mut session, &mut sim, 0);
        assert!(session.poll_stall());
        assert!(session.poll_stall());
        assert_eq!(session.stats().stalls, 1);
        assert!(matches!(
            session.events().next(),
            Some(NetplayEvent::StallStarted { frame }) if frame == Frame::new(2)
        ));

        session.receive_remote_input(Frame::new(0), 0).unwrap();
        assert!(!session.poll_stall());
    }

    #[test]
    fn advance_frame_reports_stall_without_simulating() {
        let mut session = session(1);
        let mut sim = Accumulator::default();
        assert_eq!(
            session.advance_frame(&mut sim, &mut Constant(1)).unwrap(),
            FrameOutcome::Advanced(Frame::new(0))
        );
        let before = sim.value;
        assert_eq!(
            session.advance_frame(&mut sim, &mut Constant(1)).unwrap(),
            FrameOutcome::Stalled(Frame::new(1))
        );
        assert_eq!(sim.value, before);
        assert_eq!(session.stats().frames_simulated, 1);
    }

    #[test]
    fn post_step_without_pre_step_is_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_violation_observer(observer.clone())
            .start_session(Box::new(Silent), &Accumulator::default())
            .unwrap();
        session.post_step(&mut Accumulator::default());
        assert!(observer.has_violation(ViolationKind::FrameSync));
    }

    #[test]
    fn event_queue_drops_oldest() {
        let mut session = session(2);
        for frame in 0..(EVENT_QUEUE_SIZE as i32 + 5) {
            session.push_event(NetplayEvent::StallStarted {
                frame: Frame::new(frame),
            });
        }
        let events: Vec<_> = session.events().collect();
        assert_eq!(events.len(), EVENT_QUEUE_SIZE);
        assert_eq!(
            events[0],
            NetplayEvent::StallStarted {
                frame: Frame::new(5)
            }
        );
        assert_eq!(session.events().count(), 0);
    }

    #[test]
    fn reset_sync_mode_restores_stall_window() {
        let mut session = session(3);
        session.enter_lockstep(Frame::new(0), &NetplayError::NotConnected);
        assert_eq!(session.sync_mode(), SyncMode::Lockstep);
        assert_eq!(session.stall_frames(), 0);

        session.reset_sync_mode();
        assert_eq!(session.sync_mode(), SyncMode::Rollback);
        assert_eq!(session.stall_frames(), 3);
    }
}
