//! Drivers shared by the integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::VecDeque;

use delta_rollback::{
    Frame, FrameInputs, InputSource, InputStatus, NetplayError, NetplaySession, Role,
    SessionBuilder, Simulation,
};

use super::stubs::{CounterSim, Held, RecordingTransport, SharedOutbox, StubConfig, StubInput};

/// Routes session logs to the test harness output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Runs one frame by hand: Pre-Step, one step under the persistence lock, Post-Step.
pub fn run_manual_frame<P>(
    session: &mut NetplaySession<StubConfig>,
    sim: &mut CounterSim,
    input: &mut P,
) where
    P: InputSource<StubConfig>,
{
    session.pre_step(sim, input);
    let inputs = session
        .frame_inputs()
        .expect("pre_step should record inputs for the current frame");
    {
        let _guard = session.persistence_lock().acquire();
        sim.run_one_step(&inputs);
    }
    session.post_step(sim);
}

/// The machine a from-scratch run over `(port 0, port 1)` inputs would produce.
pub fn forward_run(inputs: &[(u8, u8)]) -> CounterSim {
    let mut sim = CounterSim::new();
    for (frame, &(first, second)) in inputs.iter().enumerate() {
        sim.run_one_step(&FrameInputs {
            frame: Frame::new(frame as i32),
            local: StubInput::new(first),
            remote: StubInput::new(second),
            remote_status: InputStatus::Confirmed,
            role: Role::Authoritative,
        });
    }
    sim
}

/// An authoritative session and a peer session joined by a link with a fixed delay, measured
/// in ticks.
pub struct LinkedPair {
    pub host: NetplaySession<StubConfig>,
    pub peer: NetplaySession<StubConfig>,
    pub host_sim: CounterSim,
    pub peer_sim: CounterSim,
    host_out: SharedOutbox,
    peer_out: SharedOutbox,
    latency: usize,
    tick: usize,
    to_peer: VecDeque<(usize, Frame, StubInput)>,
    to_host: VecDeque<(usize, Frame, StubInput)>,
    checksums: VecDeque<(usize, Frame, u32)>,
}

impl LinkedPair {
    pub fn new(delay_frames: usize, latency: usize) -> Self {
        init_tracing();
        let ((host_transport, host_out), (peer_transport, peer_out)) = RecordingTransport::pair();
        let host_sim = CounterSim::new();
        let peer_sim = CounterSim::new();
        let host = SessionBuilder::<StubConfig>::new()
            .with_role(Role::Authoritative)
            .with_delay_frames(delay_frames)
            .unwrap()
            .start_session(Box::new(host_transport), &host_sim)
            .unwrap();
        let peer = SessionBuilder::<StubConfig>::new()
            .with_role(Role::Peer)
            .start_session(Box::new(peer_transport), &peer_sim)
            .unwrap();

        Self {
            host,
            peer,
            host_sim,
            peer_sim,
            host_out,
            peer_out,
            latency,
            tick: 0,
            to_peer: VecDeque::new(),
            to_host: VecDeque::new(),
            checksums: VecDeque::new(),
        }
    }

    /// Delivers whatever has been in flight long enough, then advances both sides once.
    pub fn tick(&mut self, host_buttons: u8, peer_buttons: u8) {
        self.collect();
        self.deliver();
        self.host
            .advance_frame(&mut self.host_sim, &mut Held(host_buttons))
            .unwrap();
        self.peer
            .advance_frame(&mut self.peer_sim, &mut Held(peer_buttons))
            .unwrap();
        self.tick += 1;
    }

    /// Number of resync requests the peer has sent.
    pub fn resyncs(&self) -> usize {
        self.peer_out.lock().unwrap().resyncs.len()
    }

    fn collect(&mut self) {
        let now = self.tick;
        let mut host_out = self.host_out.lock().unwrap();
        self.to_peer
            .extend(host_out.inputs.drain(..).map(|(f, i)| (now, f, i)));
        self.checksums
            .extend(host_out.checksums.drain(..).map(|(f, c)| (now, f, c)));
        drop(host_out);

        let mut peer_out = self.peer_out.lock().unwrap();
        self.to_host
            .extend(peer_out.inputs.drain(..).map(|(f, i)| (now, f, i)));
    }

    fn deliver(&mut self) {
        let ready = |sent: usize| sent + self.latency <= self.tick;

        while let Some(&(sent, frame, input)) = self.to_peer.front() {
            if !ready(sent) {
                break;
            }
            match self.peer.receive_remote_input(frame, input) {
                Ok(()) => {
                    self.to_peer.pop_front();
                }
                Err(NetplayError::BufferFull { .. }) => break,
                Err(err) => panic!("peer rejected input for frame {frame}: {err}"),
            }
        }

        while let Some(&(sent, frame, input)) = self.to_host.front() {
            if !ready(sent) {
                break;
            }
            match self.host.receive_remote_input(frame, input) {
                Ok(()) => {
                    self.to_host.pop_front();
                }
                Err(NetplayError::BufferFull { .. }) => break,
                Err(err) => panic!("host rejected input for frame {frame}: {err}"),
            }
        }

        while let Some(&(sent, frame, checksum)) = self.checksums.front() {
            if !ready(sent) {
                break;
            }
            self.peer.receive_remote_checksum(frame, checksum).unwrap();
            self.checksums.pop_front();
        }
    }
}
