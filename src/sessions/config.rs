//! Session configuration.
//!
//! | Preset | `delay_frames` | Use |
//! |--------|----------------|-----|
//! | [`NetplayConfig::lan`] | 4 | Same building, sub-10ms RTT |
//! | [`NetplayConfig::internet`] (default) | 16 | Typical broadband |
//! | [`NetplayConfig::high_latency`] | 32 | Intercontinental, mobile |
//!
//! ```
//! use delta_rollback::{FrameStrategy, NetplayConfig};
//!
//! let config = NetplayConfig {
//!     strategy: FrameStrategy::Spectator,
//!     ..NetplayConfig::lan()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.ring_capacity(), 9);
//! ```

use crate::error::{NetplayError, NetplayResult};
use crate::FrameStrategy;

/// Largest accepted `delay_frames`. Bounds the ring at 257 snapshots.
pub const MAX_DELAY_FRAMES: usize = 128;

/// Default latency tolerance.
pub const DEFAULT_DELAY_FRAMES: usize = 16;

/// Parameters the authoritative side announces in its handshake.
///
/// New fields may be added in future versions; construct with
/// `..NetplayConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[must_use = "NetplayConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct NetplayConfig {
    /// How many frames the local simulation may run ahead of the last confirmed remote
    /// input before stalling. The snapshot ring holds `2 * delay_frames + 1` states.
    ///
    /// Default: 16
    pub delay_frames: usize,

    /// Engine variant.
    ///
    /// Default: [`FrameStrategy::Normal`]
    pub strategy: FrameStrategy,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            delay_frames: DEFAULT_DELAY_FRAMES,
            strategy: FrameStrategy::Normal,
        }
    }
}

impl NetplayConfig {
    /// Creates a new `NetplayConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Short window for local networks. Keeps rollbacks shallow and memory small.
    pub fn lan() -> Self {
        Self {
            delay_frames: 4,
            ..Self::default()
        }
    }

    /// The default window, sized for typical internet latency.
    pub fn internet() -> Self {
        Self::default()
    }

    /// Long window for high or jittery latency, at the cost of deeper rollbacks.
    pub fn high_latency() -> Self {
        Self {
            delay_frames: 32,
            ..Self::default()
        }
    }

    /// Number of snapshot slots this configuration allocates.
    #[must_use]
    pub const fn ring_capacity(&self) -> usize {
        2 * self.delay_frames + 1
    }

    /// Checks that `delay_frames` lies in `1..=MAX_DELAY_FRAMES`.
    pub fn validate(&self) -> NetplayResult<()> {
        if self.delay_frames == 0 || self.delay_frames > MAX_DELAY_FRAMES {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "delay_frames must be between 1 and {}, got {}",
                    MAX_DELAY_FRAMES, self.delay_frames
                ),
            });
        }
        Ok(())
    }
}
