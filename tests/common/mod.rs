//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: a counting simulation, scripted input sources and transports
//! - `test_utils`: drivers that push sessions through frames and deliver network traffic
//!
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::{CounterSim, StubConfig};
//! ```

pub mod stubs;
pub mod test_utils;

#[allow(unused_imports)]
pub use test_utils::{forward_run, init_tracing, run_manual_frame, LinkedPair};
