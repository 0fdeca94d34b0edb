//! Convenient re-exports for common usage.
//!
//! ```rust
//! use delta_rollback::prelude::*;
//!
//! struct MyConfig;
//!
//! impl Config for MyConfig {
//!     type Input = u16;
//! }
//!
//! let builder = SessionBuilder::<MyConfig>::new()
//!     .with_role(Role::Peer)
//!     .with_prediction_strategy(BlankPrediction);
//! # drop(builder);
//! ```

pub use crate::{
    BlankPrediction, Config, Frame, FrameInputs, FrameOutcome, FrameStrategy, HandshakeInfo,
    InputSource, InputStatus, NetplayConfig, NetplayError, NetplayEvent, NetplayResult,
    NetplaySession, PersistenceLock, PredictionStrategy, RepeatLastConfirmed, ReplayPhase, Role,
    SessionBuilder, SessionStats, Simulation, SyncMode, Transport,
};
