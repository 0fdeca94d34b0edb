use crate::{Frame, InputStatus, Role};

/// The inputs handed to [`Simulation::run_one_step`](crate::Simulation::run_one_step) for a
/// single frame.
///
/// Each side of a session sees itself as "local", so the two peers hold the same pair of
/// inputs in opposite fields. Use [`ordered`](Self::ordered) to get them in a layout both
/// sides agree on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameInputs<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame these inputs belong to.
    pub frame: Frame,
    /// Input of the player at this end of the session.
    pub local: I,
    /// Input of the player at the other end, confirmed or predicted.
    pub remote: I,
    /// Whether `remote` is the real input.
    pub remote_status: InputStatus,
    /// Which side of the pairing `local` came from.
    pub role: Role,
}

impl<I: Copy + Clone + PartialEq> FrameInputs<I> {
    /// Returns the inputs indexed by controller port: the authoritative side's input on port 0,
    /// the peer's on port 1. Identical on both ends of a session.
    #[must_use]
    pub fn ordered(&self) -> [I; 2] {
        match self.role {
            Role::Authoritative => [self.local, self.remote],
            Role::Peer => [self.remote, self.local],
        }
    }

    /// Returns `true` if the remote input is a prediction.
    #[must_use]
    pub fn is_predicted(&self) -> bool {
        self.remote_status == InputStatus::Predicted
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

    fn inputs(role: Role) -> FrameInputs<u8> {
        FrameInputs {
            frame: Frame::new(3),
            local: 1,
            remote: 2,
            remote_status: InputStatus::Confirmed,
            role,
        }
    }

    #[test]
    fn authoritative_input_is_always_port_zero() {
        assert_eq!(inputs(Role::Authoritative).ordered(), [1, 2]);
        assert_eq!(inputs(Role::Peer).ordered(), [2, 1]);
    }

    #[test]
    fn mirrored_views_agree_on_ordering() {
        let host = FrameInputs {
            frame: Frame::new(0),
            local: 10u8,
            remote: 20,
            remote_status: InputStatus::Confirmed,
            role: Role::Authoritative,
        };
        let client = FrameInputs {
            local: 20,
            remote: 10,
            role: Role::Peer,
            ..host
        };
        assert_eq!(host.ordered(), client.ordered());
    }

    #[test]
    fn predicted_status() {
        let mut frame_inputs = inputs(Role::Peer);
        assert!(!frame_inputs.is_predicted());
        frame_inputs.remote_status = InputStatus::Predicted;
        assert!(frame_inputs.is_predicted());
    }
}
