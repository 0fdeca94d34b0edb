//! Guessing the remote input for frames it has not arrived for yet.
//!
//! The guess is stored in the frame's slot. When the real input arrives, Post-Step compares
//! the two: a correct guess lets the frame be finalized without resimulating, a wrong one
//! triggers a rollback. Better guesses mean fewer rollbacks, nothing more; any strategy is
//! correct as long as it is a pure function of its arguments.
//!
//! ```
//! use delta_rollback::{Frame, PredictionStrategy};
//!
//! /// Predicts that a held direction stays held but releases every button.
//! struct HoldDirection;
//!
//! impl PredictionStrategy<u16> for HoldDirection {
//!     fn predict(&self, _frame: Frame, last_confirmed: Option<u16>) -> u16 {
//!         last_confirmed.map_or(0, |input| input & 0x00F0)
//!     }
//! }
//!
//! assert_eq!(HoldDirection.predict(Frame::new(3), Some(0x00FF)), 0x00F0);
//! ```

use crate::Frame;

/// Produces the remote input to simulate when the confirmed one is not known yet.
///
/// Implementations must be deterministic: the same arguments must always produce the same
/// input, otherwise the mispredictions seen by each side stop matching.
pub trait PredictionStrategy<I: Copy + Default>: Send + Sync {
    /// Predicts the remote input for `frame`, given the most recent confirmed remote input
    /// (`None` until the first one arrives).
    fn predict(&self, frame: Frame, last_confirmed: Option<I>) -> I;
}

/// Repeats the last confirmed remote input. Used when no strategy is configured.
///
/// Controllers are sampled every frame, and a button held on one frame is usually still
/// held on the next, so this guesses right most of the time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepeatLastConfirmed;

impl<I: Copy + Default> PredictionStrategy<I> for RepeatLastConfirmed {
    fn predict(&self, _frame: Frame, last_confirmed: Option<I>) -> I {
        last_confirmed.unwrap_or_default()
    }
}

/// Always predicts the neutral input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlankPrediction;

impl<I: Copy + Default> PredictionStrategy<I> for BlankPrediction {
    fn predict(&self, _frame: Frame, _last_confirmed: Option<I>) -> I {
        I::default()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
    struct Pad {
        buttons: u8,
    }

    #[test]
    fn blank_prediction_ignores_history() {
        let strategy = BlankPrediction;
        let result: Pad = strategy.predict(Frame::new(0), Some(Pad { buttons: 42 }));
        assert_eq!(result, Pad::default());

        let result: Pad = strategy.predict(Frame::new(10), None);
        assert_eq!(result, Pad::default());
    }

    #[test]
    fn repeat_last_confirmed_repeats() {
        let strategy = RepeatLastConfirmed;
        let result: Pad = strategy.predict(Frame::new(5), Some(Pad { buttons: 99 }));
        assert_eq!(result.buttons, 99);

        let result: Pad = strategy.predict(Frame::new(0), None);
        assert_eq!(result, Pad::default());
    }

    #[test]
    fn strategies_are_usable_as_trait_objects() {
        let strategies: Vec<Box<dyn PredictionStrategy<Pad>>> =
            vec![Box::new(RepeatLastConfirmed), Box::new(BlankPrediction)];
        let last = Some(Pad { buttons: 7 });
        let guesses: Vec<Pad> = strategies
            .iter()
            .map(|s| s.predict(Frame::new(1), last))
            .collect();
        assert_eq!(guesses, vec![Pad { buttons: 7 }, Pad::default()]);
    }
}
