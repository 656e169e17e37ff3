//! Cut generation and the multi-round enforcement protocol for violated nonlinear nodes.

mod context;
mod cut;
mod enforcement;

pub use context::EnforceContext;
pub use context::EnforceOutcome;
pub use cut::Cut;
pub use cut::CutError;
pub use cut::RowPrep;
pub use enforcement::EnforcementLoop;
pub use enforcement::EnforcementStatistics;

use crate::basic_types::Solution;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;

/// The violation of a node against its relaxation variable in a solution, per side.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Violation {
    /// By how much the node's value exceeds the relaxation variable (the separate-above side).
    pub above: f64,
    /// By how much the relaxation variable exceeds the node's value (the separate-below side).
    pub below: f64,
}

impl Violation {
    pub fn total(&self) -> f64 {
        self.above.max(self.below)
    }

    /// The violation relative to the magnitude of `value`.
    pub fn relative(&self, value: f64) -> f64 {
        self.total() / 1.0_f64.max(value.abs())
    }
}

/// How much `node` disagrees with its relaxation variable at `solution`, on the sides its locks
/// make relevant. `None` when the node has no relaxation variable or cannot be evaluated.
pub fn node_violation(
    graph: &ExpressionGraph,
    node: NodeId,
    solution: &Solution,
) -> Option<Violation> {
    let aux = graph.relaxation_variable(node)?;
    let value = graph.evaluate(node, solution)?;
    let z = solution.value(aux);
    let stored = graph.node(node);
    let above = if stored.positive_locks > 0 {
        (value - z).max(0.0)
    } else {
        0.0
    };
    let below = if stored.negative_locks > 0 {
        (z - value).max(0.0)
    } else {
        0.0
    };
    Some(Violation { above, below })
}
