use enumset::EnumSet;

use super::handler::Capability;
use super::handler::EstimateOutcome;
use super::handler::Estimator;
use super::handler::HandlerClaim;
use super::handler::NlHandlerExprData;
use super::handler::NonlinearHandler;
use crate::api::ConstraintId;
use crate::basic_types::Interval;
use crate::basic_types::Solution;
use crate::expr::Curvature;
use crate::expr::ExprKind;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::propagation::PropagationStatus;
use crate::propagation::ReverseContext;
use crate::variables::VariableStore;

/// The built-in bootstrap handler.
///
/// It participates at the lowest priority and claims whatever capabilities remain unclaimed, so
/// detection always terminates with full coverage. Its implementations are fully generic over
/// the expression kinds: interval evaluation and reverse rules come straight from the kind
/// callbacks, and estimators are tangent cuts where the node's curvature matches the requested
/// side and secant cuts for the opposite side of a bounded univariate kind. Where it cannot
/// estimate it registers the node as a branching candidate.
#[derive(Debug)]
pub struct DefaultHandler;

/// Value of `child` as seen by the relaxation: the child's own variable value when it has one,
/// a deep evaluation otherwise (only before relaxation variables exist).
pub(crate) fn child_value(
    graph: &ExpressionGraph,
    child: NodeId,
    solution: &Solution,
) -> Option<f64> {
    match *graph.kind(child) {
        ExprKind::Constant(value) => Some(value),
        _ => match graph.node_variable(child) {
            Some(variable) => Some(solution.value(variable)),
            None => graph.evaluate(child, solution),
        },
    }
}

fn child_interval(
    graph: &ExpressionGraph,
    variables: &VariableStore,
    child: NodeId,
) -> Interval {
    match *graph.kind(child) {
        ExprKind::Variable(variable) => variables.bounds(variable),
        ExprKind::Constant(value) => Interval::point(value),
        _ => graph.activity(child),
    }
}

impl NonlinearHandler for DefaultHandler {
    fn name(&self) -> &str {
        "default"
    }

    fn detection_priority(&self) -> i32 {
        i32::MIN
    }

    fn enforcement_priority(&self) -> i32 {
        i32::MIN
    }

    fn detect(
        &self,
        _graph: &ExpressionGraph,
        _variables: &VariableStore,
        _node: NodeId,
        _constraint: Option<ConstraintId>,
        required: EnumSet<Capability>,
    ) -> Option<HandlerClaim> {
        if required.is_empty() {
            return None;
        }
        Some(HandlerClaim {
            claimed: required,
            data: None,
        })
    }

    fn eval_aux(
        &self,
        graph: &ExpressionGraph,
        _variables: &VariableStore,
        node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
        solution: &Solution,
    ) -> Option<f64> {
        let child_values: Option<Vec<f64>> = graph
            .children(node)
            .iter()
            .map(|&child| child_value(graph, child, solution))
            .collect();
        graph.kind(node).evaluate(&child_values?)
    }

    fn interval_evaluate(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
        child_activities: &[Interval],
    ) -> Option<Interval> {
        let lookup = |variable| variables.bounds(variable);
        Some(graph.kind(node).interval_evaluate(child_activities, &lookup))
    }

    fn reverse_propagate(
        &self,
        ctx: &mut ReverseContext<'_>,
        node: NodeId,
        bounds: Interval,
        _data: Option<&dyn NlHandlerExprData>,
    ) -> PropagationStatus {
        let children = ctx.graph().children(node).to_vec();
        let child_activities: Vec<Interval> = children
            .iter()
            .map(|&child| ctx.child_activity(child))
            .collect();
        for (index, &child) in children.iter().enumerate() {
            let deduced =
                ctx.graph()
                    .kind(node)
                    .reverse_interval(&bounds, index, &child_activities);
            if deduced.is_entire() {
                continue;
            }
            ctx.tighten_node(child, deduced)?;
        }
        Ok(())
    }

    fn estimate(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
        solution: &Solution,
        overestimate: bool,
    ) -> EstimateOutcome {
        match graph.kind(node) {
            // A sum over children with variables is linear in those variables: exact on both
            // sides.
            ExprKind::Sum {
                coefficients,
                constant,
            } => {
                let mut terms = Vec::new();
                let mut offset = *constant;
                for (&child, &coefficient) in graph.children(node).iter().zip(coefficients) {
                    match *graph.kind(child) {
                        ExprKind::Constant(value) => offset += coefficient * value,
                        _ => match graph.node_variable(child) {
                            Some(variable) => terms.push((variable, coefficient)),
                            None => return EstimateOutcome::DidNotFind,
                        },
                    }
                }
                EstimateOutcome::Found(Estimator {
                    terms,
                    constant: offset,
                })
            }
            _ if graph.children(node).len() == 1 => {
                self.estimate_univariate(graph, variables, node, solution, overestimate)
            }
            // Multilinear shapes are the business of specialised handlers; without one the only
            // way forward is a tighter bound on the node.
            _ => EstimateOutcome::BranchOn(vec![node]),
        }
    }
}

impl DefaultHandler {
    fn estimate_univariate(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        node: NodeId,
        solution: &Solution,
        overestimate: bool,
    ) -> EstimateOutcome {
        let child = graph.children(node)[0];
        let Some(variable) = graph.node_variable(child) else {
            return EstimateOutcome::DidNotFind;
        };
        let kind = graph.kind(node);
        let interval = child_interval(graph, variables, child);
        let curvature = kind.curvature(&[Curvature::Linear], &[interval]);

        let tangent_matches = match curvature {
            Curvature::Linear => true,
            Curvature::Convex => !overestimate,
            Curvature::Concave => overestimate,
            Curvature::Unknown => return EstimateOutcome::BranchOn(vec![node]),
        };

        if tangent_matches {
            // Gradient cut: f(x0) + f'(x0) (x - x0) lies on the correct side of a function
            // whose curvature matches.
            let x0 = match child_value(graph, child, solution) {
                Some(value) => value.clamp(interval.lower(), interval.upper()),
                None => interval.midpoint(),
            };
            let (Some(value), Some(slope)) = (
                kind.evaluate(&[x0]),
                kind.backward_differentiate(0, &[x0]),
            ) else {
                return EstimateOutcome::BranchOn(vec![node]);
            };
            if !slope.is_finite() || !value.is_finite() {
                return EstimateOutcome::BranchOn(vec![node]);
            }
            return EstimateOutcome::Found(Estimator {
                terms: vec![(variable, slope)],
                constant: value - slope * x0,
            });
        }

        // Secant cut on the opposite side, available only over a bounded child interval.
        if !interval.is_finite() || interval.width() <= 0.0 {
            return EstimateOutcome::BranchOn(vec![node]);
        }
        let (Some(at_lower), Some(at_upper)) = (
            kind.evaluate(&[interval.lower()]),
            kind.evaluate(&[interval.upper()]),
        ) else {
            return EstimateOutcome::BranchOn(vec![node]);
        };
        let slope = (at_upper - at_lower) / interval.width();
        if !slope.is_finite() {
            return EstimateOutcome::BranchOn(vec![node]);
        }
        EstimateOutcome::Found(Estimator {
            terms: vec![(variable, slope)],
            constant: at_lower - slope * interval.lower(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::KeyedVec;

    fn setup() -> (ExpressionGraph, VariableStore, NodeId, NodeId) {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 2.0, false));
        let square = graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        (graph, variables, x, square)
    }

    fn point(variables: &VariableStore, values: &[f64]) -> Solution {
        let mut stored = KeyedVec::default();
        for (index, _) in variables.variables().enumerate() {
            let _ = stored.push(values.get(index).copied().unwrap_or(0.0));
        }
        Solution::new(stored)
    }

    #[test]
    fn tangent_underestimates_a_convex_square() {
        let (graph, variables, x, square) = setup();
        let solution = point(&variables, &[1.0]);
        let outcome =
            DefaultHandler.estimate(&graph, &variables, square, None, &solution, false);
        let EstimateOutcome::Found(estimator) = outcome else {
            panic!("expected a tangent estimator");
        };
        // Tangent at x0 = 1: 2x - 1.
        assert_eq!(estimator.terms, vec![(graph.node_variable(x).unwrap(), 2.0)]);
        assert_eq!(estimator.constant, -1.0);
        // Under the curve at a different point.
        assert!(estimator.constant + estimator.terms[0].1 * 2.0 <= 4.0);
    }

    #[test]
    fn secant_overestimates_a_convex_square() {
        let (graph, variables, _x, square) = setup();
        let solution = point(&variables, &[0.5]);
        let outcome = DefaultHandler.estimate(&graph, &variables, square, None, &solution, true);
        let EstimateOutcome::Found(estimator) = outcome else {
            panic!("expected a secant estimator");
        };
        // Secant over [-1, 2]: slope (4 - 1) / 3 = 1, offset 2.
        assert_eq!(estimator.terms[0].1, 1.0);
        assert_eq!(estimator.constant, 2.0);
        // Above the curve at the current point.
        assert!(estimator.value_at(&solution) >= 0.25);
    }

    #[test]
    fn unknown_curvature_registers_a_branching_candidate() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(0.0, 10.0, false));
        let sine = graph.create(ExprKind::Sine, vec![x]);
        let solution = point(&variables, &[1.0]);
        let outcome = DefaultHandler.estimate(&graph, &variables, sine, None, &solution, false);
        assert!(matches!(outcome, EstimateOutcome::BranchOn(nodes) if nodes == vec![sine]));
    }

    #[test]
    fn aux_evaluation_uses_child_variable_values() {
        let (mut graph, mut variables, _x, square) = setup();
        // Nest the square under an exponential; give the square a relaxation variable.
        let exponential = graph.create(ExprKind::Exponential, vec![square]);
        let aux = variables.new_relaxation_variable(Interval::new(0.0, 4.0));
        graph.node_mut(square).relaxation_variable = Some(aux);

        // x = 2 (so the square's true value is 4) but the aux variable sits at 1: the aux
        // evaluation of the exponential must believe exp(1), not exp(4).
        let solution = point(&variables, &[2.0, 1.0]);
        let value = DefaultHandler
            .eval_aux(&graph, &variables, exponential, None, &solution)
            .unwrap();
        assert!((value - 1.0_f64.exp()).abs() < 1e-12);
    }
}
