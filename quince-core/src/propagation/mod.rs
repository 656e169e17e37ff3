//! Forward and reverse interval propagation over the expression DAG, driven by the version tags
//! of the variable store.

mod engine;
mod reverse;

pub use engine::ActivityEngine;
pub use reverse::ReverseContext;
use thiserror::Error;

use crate::expr::NodeId;
use crate::expr::ResourceExhaustion;
use crate::variables::EmptyDomain;
use crate::variables::VarId;

/// A local infeasibility discovered by propagation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    #[error("the activity of node {0} became empty")]
    EmptyActivity(NodeId),
    #[error("the domain of variable {0} became empty")]
    EmptyDomain(VarId),
}

impl From<EmptyDomain> for Inconsistency {
    fn from(EmptyDomain(variable): EmptyDomain) -> Inconsistency {
        Inconsistency::EmptyDomain(variable)
    }
}

/// The result of a propagation step: either it did not find anything or it derived an
/// [`Inconsistency`].
pub type PropagationStatus = Result<(), Inconsistency>;

/// Errors a whole propagation pass can end with.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PropagationError {
    #[error(transparent)]
    Infeasible(#[from] Inconsistency),
    #[error(transparent)]
    ResourceExhaustion(#[from] ResourceExhaustion),
}
