//! Simulation, input and transport stubs.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::use_self,
    dead_code
)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use delta_rollback::{
    Config, Frame, FrameInputs, HandshakeInfo, InputSource, NetplayError, NetplayResult,
    PersistenceLock, Simulation, Transport,
};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct StubInput {
    pub buttons: u8,
}

impl StubInput {
    pub const fn new(buttons: u8) -> Self {
        Self { buttons }
    }
}

#[derive(Debug)]
pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
}

pub const STATE_SIZE: usize = 12;

/// A deterministic machine whose whole state is a running hash of every input it has seen.
#[derive(Debug, Default)]
pub struct CounterSim {
    pub value: u64,
    pub frame: i32,
    pub steps: usize,
    pub serializes: usize,
    pub loads: usize,
    /// Makes every `serialize` call fail while set.
    pub fail_serialize: bool,
    /// When set, every step asserts the lock is held.
    pub lock: Option<PersistenceLock>,
    /// `(frame, port 0, port 1)` for every step, including resimulated ones.
    pub history: Vec<(i32, u8, u8)>,
}

impl CounterSim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock(lock: PersistenceLock) -> Self {
        Self {
            lock: Some(lock),
            ..Self::default()
        }
    }

    /// The bytes `serialize` would produce right now.
    pub fn encoded(&self) -> [u8; STATE_SIZE] {
        let mut buf = [0; STATE_SIZE];
        buf[..8].copy_from_slice(&self.value.to_le_bytes());
        buf[8..].copy_from_slice(&self.frame.to_le_bytes());
        buf
    }
}

impl Simulation<StubConfig> for CounterSim {
    fn serialized_size(&self) -> usize {
        STATE_SIZE
    }

    fn serialize(&mut self, buf: &mut [u8]) -> NetplayResult<()> {
        if self.fail_serialize {
            return Err(NetplayError::SerializationError {
                context: "serialization disabled".to_owned(),
            });
        }
        self.serializes += 1;
        buf.copy_from_slice(&self.encoded());
        Ok(())
    }

    fn deserialize(&mut self, buf: &[u8]) -> NetplayResult<()> {
        if buf.len() != STATE_SIZE {
            return Err(NetplayError::SerializationError {
                context: format!("expected {} bytes, got {}", STATE_SIZE, buf.len()),
            });
        }
        self.value = u64::from_le_bytes(buf[..8].try_into().unwrap());
        self.frame = i32::from_le_bytes(buf[8..].try_into().unwrap());
        self.loads += 1;
        Ok(())
    }

    fn run_one_step(&mut self, inputs: &FrameInputs<StubInput>) {
        assert_eq!(
            inputs.frame.as_i32(),
            self.frame,
            "stepped with inputs for the wrong frame"
        );
        if let Some(lock) = &self.lock {
            assert!(lock.is_held(), "step ran outside the persistence lock");
        }
        let [first, second] = inputs.ordered();
        self.value = self
            .value
            .wrapping_mul(1_000_003)
            .wrapping_add(u64::from(first.buttons) * 7 + u64::from(second.buttons) * 13 + 1);
        self.frame += 1;
        self.steps += 1;
        self.history
            .push((inputs.frame.as_i32(), first.buttons, second.buttons));
    }
}

/// Feeds `script(frame)` as local input, counting polls.
pub struct ScriptedInput<F> {
    script: F,
    next_frame: i32,
    pub polls: usize,
}

impl<F: FnMut(i32) -> u8> ScriptedInput<F> {
    pub fn new(script: F) -> Self {
        Self {
            script,
            next_frame: 0,
            polls: 0,
        }
    }

    /// Sets the frame the next poll is for.
    pub fn at(&mut self, frame: i32) -> &mut Self {
        self.next_frame = frame;
        self
    }
}

impl<F: FnMut(i32) -> u8> InputSource<StubConfig> for ScriptedInput<F> {
    fn poll_local_input(&mut self) -> StubInput {
        self.polls += 1;
        let buttons = (self.script)(self.next_frame);
        self.next_frame += 1;
        StubInput::new(buttons)
    }
}

/// Always feeds the same input.
pub struct Held(pub u8);

impl InputSource<StubConfig> for Held {
    fn poll_local_input(&mut self) -> StubInput {
        StubInput::new(self.0)
    }
}

/// Everything a session sent.
#[derive(Debug, Default)]
pub struct Outbox {
    pub handshakes: Vec<HandshakeInfo>,
    pub inputs: VecDeque<(Frame, StubInput)>,
    pub checksums: VecDeque<(Frame, u32)>,
    pub savestates: Vec<(Frame, Vec<u8>)>,
    pub resyncs: Vec<Frame>,
}

pub type SharedOutbox = Arc<Mutex<Outbox>>;

/// Records traffic into an [`Outbox`] and answers the handshake from another one.
pub struct RecordingTransport {
    outbox: SharedOutbox,
    inbox: Option<SharedOutbox>,
}

impl RecordingTransport {
    /// A transport whose traffic can be inspected through the returned outbox.
    pub fn new() -> (Self, SharedOutbox) {
        let outbox = SharedOutbox::default();
        (
            Self {
                outbox: Arc::clone(&outbox),
                inbox: None,
            },
            outbox,
        )
    }

    /// Two transports, each receiving its handshake from the other's outbox.
    pub fn pair() -> ((Self, SharedOutbox), (Self, SharedOutbox)) {
        let a = SharedOutbox::default();
        let b = SharedOutbox::default();
        (
            (
                Self {
                    outbox: Arc::clone(&a),
                    inbox: Some(Arc::clone(&b)),
                },
                Arc::clone(&a),
            ),
            (
                Self {
                    outbox: Arc::clone(&b),
                    inbox: Some(Arc::clone(&a)),
                },
                b,
            ),
        )
    }
}

impl Transport<StubConfig> for RecordingTransport {
    fn send_handshake(&mut self, info: &HandshakeInfo) -> NetplayResult<()> {
        self.outbox.lock().unwrap().handshakes.push(*info);
        Ok(())
    }

    fn receive_handshake(&mut self) -> NetplayResult<HandshakeInfo> {
        let inbox = self.inbox.as_ref().ok_or(NetplayError::NotConnected)?;
        let handshake = inbox.lock().unwrap().handshakes.first().copied();
        handshake.ok_or(NetplayError::HandshakeFailed {
            reason: "no handshake sent".to_owned(),
        })
    }

    fn send_input(&mut self, frame: Frame, input: &StubInput) {
        self.outbox.lock().unwrap().inputs.push_back((frame, *input));
    }

    fn send_checksum(&mut self, frame: Frame, checksum: u32) {
        self.outbox
            .lock()
            .unwrap()
            .checksums
            .push_back((frame, checksum));
    }

    fn send_savestate(&mut self, frame: Frame, state: &[u8]) {
        self.outbox
            .lock()
            .unwrap()
            .savestates
            .push((frame, state.to_vec()));
    }

    fn request_resync(&mut self, frame: Frame) {
        self.outbox.lock().unwrap().resyncs.push(frame);
    }
}
