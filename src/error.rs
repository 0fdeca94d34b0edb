use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::Frame;

/// Convenience alias used throughout the crate.
pub type NetplayResult<T> = Result<T, NetplayError>;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// Conditions the session can recover from by itself (a failed snapshot capture, a checksum
/// mismatch, a stall) are not errors; they surface as mode changes, [`NetplayEvent`]s or
/// telemetry violations instead.
///
/// [`Result<(), NetplayError>`]: std::result::Result
/// [`NetplayEvent`]: crate::NetplayEvent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// The snapshot ring could not be allocated. No session is produced.
    AllocationFailed {
        /// Number of slots requested.
        slots: usize,
        /// Size of each slot's state buffer in bytes.
        state_size: usize,
    },
    /// The handshake could not be exchanged, or the peer is incompatible.
    HandshakeFailed {
        /// Further specifies why the handshake failed.
        reason: String,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Remote data was delivered to a session that is not connected.
    NotConnected,
    /// Remote input arrived for a frame other than the next expected one.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// Remote input arrived so far ahead that its ring slot still holds an unverified frame.
    /// The caller should hold on to the input and retry after the session has advanced.
    BufferFull {
        /// The frame whose input could not be stored.
        frame: Frame,
    },
    /// Serialization or deserialization of the simulation failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::AllocationFailed { slots, state_size } => {
                write!(
                    f,
                    "Failed to allocate {} frame slots of {} bytes each",
                    slots, state_size
                )
            }
            NetplayError::HandshakeFailed { reason } => {
                write!(f, "Handshake failed: {}", reason)
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetplayError::NotConnected => {
                write!(f, "The session is not connected.")
            }
            NetplayError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            }
            NetplayError::BufferFull { frame } => {
                write!(
                    f,
                    "No free frame slot for remote input at frame {}; the session must advance first",
                    frame
                )
            }
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
        }
    }
}

impl Error for NetplayError {}
