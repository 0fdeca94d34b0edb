//! Synchronization primitives abstraction for loom testing compatibility.
//!
//! Production code uses `parking_lot` and `std::sync::Arc`; under `--cfg loom` the same
//! names resolve to `loom::sync` so the persistence lock can be model checked.
//!
//! ```ignore
//! // Instead of:
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! // Use:
//! use crate::sync::{Arc, Mutex};
//! ```
//!
//! Run loom tests from the isolated `loom-tests/` crate:
//! ```bash
//! cd loom-tests
//! RUSTFLAGS="--cfg loom" cargo test --release
//! ```

/// When running under loom (`RUSTFLAGS="--cfg loom"`), use loom's types
#[cfg(loom)]
pub(crate) mod inner {
    pub use loom::sync::Arc;
    pub use loom::sync::Mutex;
    pub use loom::sync::MutexGuard;
}

/// In production, use parking_lot for performance
#[cfg(not(loom))]
pub(crate) mod inner {
    pub use parking_lot::Mutex;
    pub use parking_lot::MutexGuard;
    pub use std::sync::Arc;
}

pub(crate) use inner::*;
