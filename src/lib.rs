//! # Delta Rollback
//!
//! Delta Rollback is the frame-synchronization core of a rollback netplay engine for
//! emulators. Each side runs ahead of the network on predicted input, records a full
//! serialized snapshot of the emulated machine every frame, and when the real remote input
//! arrives and contradicts the prediction it loads the last verified snapshot and resimulates
//! forward with the corrected input.
//!
//! The crate owns the timeline and nothing else. The emulator, the socket and the input
//! devices are supplied by the caller through the [`Simulation`], [`Transport`] and
//! [`InputSource`] traits; the core calls them from [`NetplaySession::pre_step`] and
//! [`NetplaySession::post_step`], which bracket every emulated frame.
//!
//! ```ignore
//! let mut session = SessionBuilder::<MyConfig>::new()
//!     .with_role(Role::Authoritative)
//!     .with_delay_frames(4)?
//!     .start_session(Box::new(transport), &emulator)?;
//!
//! loop {
//!     // feed whatever the network delivered since the last tick
//!     for (frame, input) in socket.drain_inputs() {
//!         session.receive_remote_input(frame, input)?;
//!     }
//!     session.advance_frame(&mut emulator, &mut gamepad)?;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::fmt::Debug;

pub use error::{NetplayError, NetplayResult};
pub use frame_info::FrameInputs;
pub use persistence::{PersistenceGuard, PersistenceLock};
pub use prediction::{BlankPrediction, PredictionStrategy, RepeatLastConfirmed};
pub use serde::{de::DeserializeOwned, Serialize};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{NetplayConfig, DEFAULT_DELAY_FRAMES, MAX_DELAY_FRAMES};
pub use sessions::netplay_session::{FrameOutcome, NetplaySession, SessionStats};

pub mod checksum;
#[doc(hidden)]
pub mod desync;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
pub mod persistence;
pub mod prelude;
#[doc(hidden)]
pub mod prediction;
#[doc(hidden)]
pub mod sync;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod netplay_session;
}

/// Internal module exposing implementation details for testing and benchmarking.
///
/// **This module is NOT part of the public API.** Nothing here is covered by semver.
/// It exists so the ring buffer and cursor bookkeeping can be exercised directly by
/// property tests and benchmarks without going through a full session.
#[doc(hidden)]
pub mod __internal {
    pub use crate::desync::DesyncDetector;
    pub use crate::sync_layer::{Cursor, DeltaBuffer, FrameSlot, SlotIndex, SyncLayer};
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Version of the handshake exchanged in [`HandshakeInfo`]. Peers with a different version
/// are rejected during bootstrap.
pub const PROTOCOL_VERSION: u32 = 1;

/// A frame is a single step of emulation.
///
/// Frame numbers start at 0 and increase by one per simulated step. The only time a
/// frame count goes backwards is the single-step stall rewind performed by
/// [`NetplaySession::post_step`].
///
/// The special value [`Frame::NULL`] marks a ring slot that has never held a frame.
///
/// # Examples
///
/// ```
/// use delta_rollback::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Number of frames from `earlier` to `self`, or `0` if `earlier` is not before `self`.
    #[inline]
    #[must_use]
    pub const fn frames_since(self, earlier: Frame) -> usize {
        if self.0 > earlier.0 {
            (self.0 - earlier.0) as usize
        } else {
            0
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_add(rhs))
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl std::ops::SubAssign<i32> for Frame {
    #[inline]
    fn sub_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_sub(rhs);
    }
}

// #############
// #   ENUMS   #
// #############

/// Which side of the pairing this session is.
///
/// The authoritative side's checksums are ground truth for desync detection, and its
/// handshake dictates the delay window. Its input is always fed to the simulation on
/// port 0, see [`FrameInputs::ordered`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// The host. Sends checksums and the handshake.
    #[default]
    Authoritative,
    /// The client. Verifies checksums and requests a resync on mismatch.
    Peer,
}

impl Role {
    /// Returns `true` for [`Role::Authoritative`].
    #[inline]
    #[must_use]
    pub const fn is_authoritative(self) -> bool {
        matches!(self, Role::Authoritative)
    }
}

/// The engine variant driving Pre-Step and Post-Step.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FrameStrategy {
    /// Two players, each predicting the other and rolling back on mispredictions.
    #[default]
    Normal,
    /// One player streaming input to a viewer. The authoritative side never waits for
    /// remote input; the viewer never predicts and never sends input.
    Spectator,
}

/// Whether rollback is available.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Snapshots are being captured; mispredictions are corrected by rollback.
    #[default]
    Rollback,
    /// The simulation failed to serialize. Nothing can be rolled back, so the tolerated
    /// stall window is zero and every frame waits for confirmed remote input.
    ///
    /// This mode persists until [`NetplaySession::reset_sync_mode`] is called.
    Lockstep,
}

/// The last phase the post-step state machine entered.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReplayPhase {
    /// Nothing to reconcile.
    #[default]
    Playing,
    /// Verified at least one predicted frame without resimulating.
    Skipping,
    /// Loaded a snapshot and resimulated.
    Replaying,
    /// Undid the just-completed frame.
    Stalling,
}

/// Whether the remote half of a [`FrameInputs`] is real.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The remote input for this frame has been received.
    Confirmed,
    /// The remote input for this frame is a prediction.
    Predicted,
}

/// Notifications emitted by a [`NetplaySession`]. Drain them with
/// [`NetplaySession::events`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// A misprediction was corrected by loading `from` and resimulating up to `to`.
    Rollback {
        /// First resimulated frame.
        from: Frame,
        /// The frame the simulation stands at after resimulation.
        to: Frame,
    },
    /// The local checksum for `frame` differs from the authoritative one. A resync has
    /// been requested through the transport.
    DesyncDetected {
        /// Frame of the checksums.
        frame: Frame,
        /// Checksum computed locally.
        local_checksum: u32,
        /// Checksum received from the authoritative side.
        remote_checksum: u32,
    },
    /// The simulation could not be serialized; the session fell back to
    /// [`SyncMode::Lockstep`].
    SerializationLost {
        /// Frame whose capture failed.
        frame: Frame,
    },
    /// The session started waiting for remote input.
    StallStarted {
        /// Local frame at which the stall began.
        frame: Frame,
    },
    /// The post-step stall rewind undid a frame that should not have been run.
    StallRewind {
        /// The frame the simulation was rewound to.
        frame: Frame,
    },
}

// #############
// #  STRUCTS  #
// #############

/// Session parameters agreed on during bootstrap. The authoritative side sends it and the
/// peer adopts it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HandshakeInfo {
    /// Must equal [`PROTOCOL_VERSION`] on both sides.
    pub protocol_version: u32,
    /// Latency tolerance in frames. Ring capacity is `2 * delay_frames + 1`.
    pub delay_frames: u32,
    /// Size of one serialized simulation state. Both sides must agree.
    pub state_size: u64,
    /// Engine variant.
    pub strategy: FrameStrategy,
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// # Example
///
/// ```
/// use delta_rollback::Config;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Copy, Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
/// struct Joypad {
///     buttons: u16,
/// }
///
/// struct EmuConfig;
///
/// impl Config for EmuConfig {
///     type Input = Joypad;
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait Config: 'static + Send + Sync {
    /// Input for one player for one frame. [`Default`] is the neutral input used before
    /// anything has been confirmed.
    type Input: Copy + Clone + PartialEq + Default + Debug + Serialize + DeserializeOwned + Send + Sync;
}

/// Compile time parameterization for sessions.
#[cfg(not(feature = "sync-send"))]
pub trait Config: 'static {
    /// Input for one player for one frame. [`Default`] is the neutral input used before
    /// anything has been confirmed.
    type Input: Copy + Clone + PartialEq + Default + Debug + Serialize + DeserializeOwned;
}

/// The emulated machine, as far as rollback is concerned.
///
/// The simulation must be deterministic: loading a state produced by
/// [`serialize`](Simulation::serialize) and running the same inputs must reproduce the
/// same bytes on every peer.
pub trait Simulation<T: Config> {
    /// Size in bytes of one serialized state. Queried once, at session bootstrap.
    fn serialized_size(&self) -> usize;

    /// Writes the full machine state into `buf`, which is exactly
    /// [`serialized_size`](Simulation::serialized_size) bytes long.
    fn serialize(&mut self, buf: &mut [u8]) -> NetplayResult<()>;

    /// Restores the machine from a buffer previously filled by `serialize`.
    fn deserialize(&mut self, buf: &[u8]) -> NetplayResult<()>;

    /// Emulates exactly one frame using `inputs`.
    fn run_one_step(&mut self, inputs: &FrameInputs<T::Input>);
}

/// Local input collection, polled once per pre-step.
pub trait InputSource<T: Config> {
    /// Samples the local controller for the frame about to be simulated.
    fn poll_local_input(&mut self) -> T::Input;
}

/// The network side of a session.
///
/// All sends are fire-and-forget; the core never waits on the network. Received data is
/// pushed back into the session by the caller through
/// [`NetplaySession::receive_remote_input`] and
/// [`NetplaySession::receive_remote_checksum`].
#[cfg(feature = "sync-send")]
pub trait Transport<T: Config>: Send + Sync {
    /// Sends the session parameters (authoritative side).
    fn send_handshake(&mut self, info: &HandshakeInfo) -> NetplayResult<()>;
    /// Receives the session parameters (peer side).
    fn receive_handshake(&mut self) -> NetplayResult<HandshakeInfo>;
    /// Sends the local input for `frame`.
    fn send_input(&mut self, frame: Frame, input: &T::Input);
    /// Sends the checksum of the finalized state at `frame`.
    fn send_checksum(&mut self, frame: Frame, checksum: u32);
    /// Sends a full serialized state to the peer.
    fn send_savestate(&mut self, frame: Frame, state: &[u8]);
    /// Asks the authoritative side for a fresh savestate after a desync at `frame`.
    fn request_resync(&mut self, frame: Frame);
}

/// The network side of a session.
///
/// All sends are fire-and-forget; the core never waits on the network. Received data is
/// pushed back into the session by the caller through
/// [`NetplaySession::receive_remote_input`] and
/// [`NetplaySession::receive_remote_checksum`].
#[cfg(not(feature = "sync-send"))]
pub trait Transport<T: Config> {
    /// Sends the session parameters (authoritative side).
    fn send_handshake(&mut self, info: &HandshakeInfo) -> NetplayResult<()>;
    /// Receives the session parameters (peer side).
    fn receive_handshake(&mut self) -> NetplayResult<HandshakeInfo>;
    /// Sends the local input for `frame`.
    fn send_input(&mut self, frame: Frame, input: &T::Input);
    /// Sends the checksum of the finalized state at `frame`.
    fn send_checksum(&mut self, frame: Frame, checksum: u32);
    /// Sends a full serialized state to the peer.
    fn send_savestate(&mut self, frame: Frame, state: &[u8]);
    /// Asks the authoritative side for a fresh savestate after a desync at `frame`.
    fn request_resync(&mut self, frame: Frame);
}

// ###################
// # UNIT TESTS      #
// ###################
