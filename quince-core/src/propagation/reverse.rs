use std::collections::VecDeque;

use log::trace;

use super::Inconsistency;
use super::PropagationStatus;
use crate::basic_types::Interval;
use crate::expr::ExprKind;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::options::PropagationOptions;
use crate::variables::VariableStore;

/// The context handed to [`crate::handlers::NonlinearHandler::reverse_propagate`]: a view of the
/// graph and variable store through which deduced child bounds are recorded and the worklist is
/// fed.
#[derive(Debug)]
pub struct ReverseContext<'a> {
    pub(crate) graph: &'a mut ExpressionGraph,
    pub(crate) variables: &'a mut VariableStore,
    pub(crate) queue: &'a mut VecDeque<NodeId>,
    pub(crate) options: &'a PropagationOptions,
    /// Tag scoping the recorded bounds to the current propagation call.
    pub(crate) prop_tag: u64,
}

impl ReverseContext<'_> {
    pub fn graph(&self) -> &ExpressionGraph {
        self.graph
    }

    pub fn variables(&self) -> &VariableStore {
        self.variables
    }

    /// A sound enclosure of `node` as currently known: the bounds recorded during this
    /// propagation call if any, otherwise the node's valid activity, otherwise the entire line.
    pub fn child_activity(&self, node: NodeId) -> Interval {
        match *self.graph.kind(node) {
            ExprKind::Variable(variable) => self.variables.bounds(variable),
            ExprKind::Constant(value) => Interval::point(value),
            _ => {
                let stored = self.graph.node(node);
                if stored.prop_bounds_tag == self.prop_tag {
                    return stored.prop_bounds;
                }
                if stored.activity_tag >= self.variables.last_bound_relax_tag() {
                    stored.activity
                } else {
                    Interval::entire()
                }
            }
        }
    }

    /// Intersect the known enclosure of `node` with `bounds`. A deduction that clears the
    /// betterness test is recorded and, for expression nodes, enqueued for further reverse
    /// propagation; an empty intersection is an [`Inconsistency`].
    pub fn tighten_node(&mut self, node: NodeId, bounds: Interval) -> PropagationStatus {
        match *self.graph.kind(node) {
            ExprKind::Variable(variable) => {
                let bounds = if self.variables.is_integral(variable) {
                    bounds.round_inward(self.options.feasibility_epsilon)
                } else {
                    bounds
                };
                let _ = self.variables.tighten_bounds(variable, bounds)?;
                Ok(())
            }
            ExprKind::Constant(value) => {
                if bounds.contains_within(value, self.options.feasibility_epsilon) {
                    Ok(())
                } else {
                    Err(Inconsistency::EmptyActivity(node))
                }
            }
            _ => self.tighten_expression(node, bounds, false),
        }
    }

    /// Entry point for an externally requested propagation: the seed node is enqueued even when
    /// the intersection does not clear the betterness test, so that its handlers' reverse rules
    /// (which may encode domain restrictions the bounds alone do not) run at least once.
    pub(crate) fn seed(&mut self, node: NodeId, bounds: Interval) -> PropagationStatus {
        match *self.graph.kind(node) {
            ExprKind::Variable(_) | ExprKind::Constant(_) => self.tighten_node(node, bounds),
            _ => self.tighten_expression(node, bounds, true),
        }
    }

    fn tighten_expression(
        &mut self,
        node: NodeId,
        bounds: Interval,
        force: bool,
    ) -> PropagationStatus {
        let current = self.child_activity(node);
        let mut tightened = current.intersect(&bounds);
        if self.graph.is_integral(node) {
            tightened = tightened.round_inward(self.options.feasibility_epsilon);
        }
        if tightened.is_empty() {
            trace!("reverse propagation emptied the activity of {node}");
            return Err(Inconsistency::EmptyActivity(node));
        }
        if !force && !tightened.is_better_than(&current, self.options.bound_improvement_epsilon) {
            return Ok(());
        }

        let fresh_activity =
            self.graph.node(node).activity_tag >= self.variables.last_bound_relax_tag();
        let stored = self.graph.node_mut(node);
        stored.prop_bounds = tightened;
        stored.prop_bounds_tag = self.prop_tag;
        if fresh_activity {
            stored.activity = stored.activity.intersect(&tightened);
        }
        if !stored.in_prop_queue {
            stored.in_prop_queue = true;
            self.queue.push_back(node);
        }

        if let Some(aux) = self.graph.relaxation_variable(node) {
            let _ = self.variables.tighten_relaxation_bounds(aux, tightened)?;
        }
        Ok(())
    }
}
