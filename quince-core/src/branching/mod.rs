//! Turning accumulated violation scores into a branching decision.

mod pseudocosts;
mod selector;

pub use pseudocosts::Pseudocosts;
pub use selector::BranchingDecision;
pub use selector::BranchingSelector;

use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::options::ScoreAggregation;

/// Fold a new violation score into the node's branching score, per the configured aggregation.
pub(crate) fn accumulate_score(
    graph: &mut ExpressionGraph,
    node: NodeId,
    score: f64,
    aggregation: ScoreAggregation,
) {
    let stored = graph.node_mut(node);
    let count = stored.branch_score_count;
    stored.branch_score = match aggregation {
        ScoreAggregation::Average => {
            (stored.branch_score * f64::from(count) + score) / f64::from(count + 1)
        }
        ScoreAggregation::Maximum => {
            if count == 0 {
                score
            } else {
                stored.branch_score.max(score)
            }
        }
        ScoreAggregation::Sum => stored.branch_score + score,
    };
    stored.branch_score_count = count + 1;
}
