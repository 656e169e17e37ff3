//! The consumer-facing surface of the engine: constraint registration and the [`Relaxation`]
//! facade driving propagation, separation, enforcement, and branching.

mod relaxation;

pub use relaxation::PropagationOutcome;
pub use relaxation::Relaxation;
pub use relaxation::RelaxationStatistics;

use std::fmt::Display;

use crate::containers::StorageKey;

/// Identifier of a constraint registered on a [`Relaxation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstraintId(u32);

impl StorageKey for ConstraintId {
    fn index(&self) -> usize {
        self.0 as usize
    }

    fn create_from_index(index: usize) -> Self {
        ConstraintId(index as u32)
    }
}

impl Display for ConstraintId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}
