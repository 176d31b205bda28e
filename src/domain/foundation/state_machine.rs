//! Lifecycle transitions shared by outbox rows and consumer loops.

use super::ValidationError;

/// A status enum with a fixed set of legal moves.
///
/// Implementors list the successors of each state; everything else is
/// derived from that list. Override `can_transition_to` only when a
/// `matches!` table is cheaper than building the vector.
pub trait StateMachine: Sized + Copy + PartialEq + std::fmt::Debug {
    /// States reachable in one step from `self`.
    fn valid_transitions(&self) -> Vec<Self>;

    fn can_transition_to(&self, target: &Self) -> bool {
        self.valid_transitions().contains(target)
    }

    /// Moves to `target`, or reports the illegal move as a validation error.
    fn transition_to(&self, target: Self) -> Result<Self, ValidationError> {
        if !self.can_transition_to(&target) {
            return Err(ValidationError::invalid_format(
                "status",
                format!("illegal transition {:?} -> {:?}", self, target),
            ));
        }
        Ok(target)
    }

    /// A state with no successors.
    fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}
