use std::collections::VecDeque;

use log::trace;

use super::Inconsistency;
use super::PropagationError;
use super::PropagationStatus;
use super::ReverseContext;
use crate::basic_types::Interval;
use crate::expr::ExprKind;
use crate::expr::ExpressionGraph;
use crate::expr::IteratorPool;
use crate::expr::NodeId;
use crate::handlers::Capability;
use crate::handlers::HandlerCallback;
use crate::handlers::HandlerRegistry;
use crate::options::PropagationOptions;
use crate::quince_assert_moderate;
use crate::variables::VariableStore;

/// The forward/reverse interval propagation engine.
///
/// Forward propagation walks a constraint root bottom-up through a pooled iterator and refreshes
/// the activity of every stale node; reverse propagation drains a worklist of nodes whose bounds
/// were tightened from above. Both directions report local infeasibility as [`Inconsistency`]
/// and leave every surviving activity a sound enclosure.
#[derive(Debug)]
pub struct ActivityEngine {
    pool: IteratorPool,
    queue: VecDeque<NodeId>,
    /// Guard against re-entrant draining: a nested reverse request only enqueues.
    draining: bool,
    /// Tag scoping reverse-propagation bounds to one propagation call.
    prop_tag: u64,
    options: PropagationOptions,
}

impl ActivityEngine {
    pub fn new(options: PropagationOptions) -> ActivityEngine {
        ActivityEngine {
            pool: IteratorPool::new(options.iterator_pool_capacity),
            queue: VecDeque::new(),
            draining: false,
            prop_tag: 0,
            options,
        }
    }

    /// The node's activity if it is still valid for the current variable bounds.
    pub fn activity_if_valid(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        node: NodeId,
    ) -> Option<Interval> {
        match *graph.kind(node) {
            ExprKind::Variable(variable) => Some(variables.bounds(variable)),
            ExprKind::Constant(value) => Some(Interval::point(value)),
            _ => {
                let stored = graph.node(node);
                (stored.activity_tag >= variables.last_bound_relax_tag())
                    .then_some(stored.activity)
            }
        }
    }

    /// Evaluate the activity of `root`, refreshing every stale node below it. With `force`, a
    /// valid-but-not-current activity is also recomputed from the current bounds; without it,
    /// valid activities are reused as they are.
    ///
    /// Refreshed activities are pushed into the bounds of the relaxation variables standing in
    /// for their nodes.
    pub fn evaluate_activity(
        &mut self,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
        root: NodeId,
        force: bool,
    ) -> Result<Interval, PropagationError> {
        let mut iterator = self.pool.acquire()?;
        iterator.start(graph, root);
        let mut status = Ok(());
        while let Some(node) = iterator.next(graph) {
            status = self.refresh_node(graph, variables, registry, node, force);
            if status.is_err() {
                iterator.abort(graph);
                break;
            }
        }
        self.pool.release(iterator);
        status?;
        Ok(graph.activity(root))
    }

    fn refresh_node(
        &mut self,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
        node: NodeId,
        force: bool,
    ) -> PropagationStatus {
        match *graph.kind(node) {
            ExprKind::Variable(variable) => {
                let mut bounds = variables.bounds(variable);
                if variables.is_integral(variable) {
                    bounds = bounds.round_inward(self.options.feasibility_epsilon);
                    if bounds.is_empty() {
                        return Err(Inconsistency::EmptyDomain(variable));
                    }
                }
                let stored = graph.node_mut(node);
                stored.activity = bounds;
                stored.activity_tag = variables.current_bounds_tag();
                return Ok(());
            }
            ExprKind::Constant(value) => {
                let stored = graph.node_mut(node);
                stored.activity = Interval::point(value);
                stored.activity_tag = variables.current_bounds_tag();
                return Ok(());
            }
            _ => {}
        }

        let stale = graph.node(node).activity_tag < variables.last_bound_relax_tag();
        let fresh = graph.node(node).activity_tag == variables.current_bounds_tag();
        if !stale && (fresh || !force) {
            return Ok(());
        }

        // A stale activity is unsound and discarded; a valid one only ever narrows.
        let mut activity = if stale {
            Interval::entire()
        } else {
            graph.activity(node)
        };
        let child_activities: Vec<Interval> = graph
            .children(node)
            .iter()
            .map(|&child| graph.activity(child))
            .collect();

        let records = std::mem::take(&mut graph.node_mut(node).records);
        let mut evaluated = false;
        for record in &records {
            if !record.capabilities.contains(Capability::Activity) {
                continue;
            }
            let enclosure = registry.timed(record.handler, HandlerCallback::IntervalEvaluate, {
                let graph = &*graph;
                let variables = &*variables;
                let child_activities = &child_activities;
                move |handler| {
                    handler.interval_evaluate(
                        graph,
                        variables,
                        node,
                        record.data.as_deref(),
                        child_activities,
                    )
                }
            });
            if let Some(enclosure) = enclosure {
                activity = activity.intersect(&enclosure);
                evaluated = true;
            }
        }
        graph.node_mut(node).records = records;

        if !evaluated {
            // Pre-detection, or every claiming handler deferred: the kind's own rule.
            let lookup = |variable| variables.bounds(variable);
            let enclosure = graph.kind(node).interval_evaluate(&child_activities, &lookup);
            activity = activity.intersect(&enclosure);
        }
        if graph.is_integral(node) {
            activity = activity.round_inward(self.options.feasibility_epsilon);
        }
        if activity.is_empty() {
            trace!("forward propagation emptied the activity of {node}");
            return Err(Inconsistency::EmptyActivity(node));
        }

        let stored = graph.node_mut(node);
        stored.activity = activity;
        if let Some(aux) = stored.relaxation_variable {
            let _ = variables.tighten_relaxation_bounds(aux, activity)?;
        }
        // The tag is taken after the auxiliary push, which itself advances the counter.
        graph.node_mut(node).activity_tag = variables.current_bounds_tag();
        Ok(())
    }

    /// Reverse-propagate externally tightened `bounds` for `node` to a fixpoint.
    ///
    /// The deduction is recorded through the betterness test and the worklist drained until
    /// empty or infeasible; on an early stop the remaining entries are dequeued unprocessed. A
    /// request made while the queue is draining (from inside a handler) only enqueues.
    pub fn reverse_propagate(
        &mut self,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
        node: NodeId,
        bounds: Interval,
    ) -> PropagationStatus {
        if !self.draining {
            self.prop_tag += 1;
        }
        let mut ctx = ReverseContext {
            graph: &mut *graph,
            variables: &mut *variables,
            queue: &mut self.queue,
            options: &self.options,
            prop_tag: self.prop_tag,
        };
        let seeded = ctx.seed(node, bounds);
        if self.draining {
            return seeded;
        }
        self.draining = true;
        let result = seeded.and_then(|_| self.drain(graph, variables, registry));
        self.draining = false;
        if result.is_err() {
            while let Some(leftover) = self.queue.pop_front() {
                graph.node_mut(leftover).in_prop_queue = false;
            }
        }
        result
    }

    fn drain(
        &mut self,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
    ) -> PropagationStatus {
        while let Some(node) = self.queue.pop_front() {
            let stored = graph.node_mut(node);
            quince_assert_moderate!(stored.in_prop_queue);
            stored.in_prop_queue = false;
            quince_assert_moderate!(stored.prop_bounds_tag == self.prop_tag);
            let bounds = stored.prop_bounds;

            let records = std::mem::take(&mut graph.node_mut(node).records);
            let mut status = Ok(());
            for record in &records {
                if !record.capabilities.contains(Capability::Activity) {
                    continue;
                }
                let mut ctx = ReverseContext {
                    graph: &mut *graph,
                    variables: &mut *variables,
                    queue: &mut self.queue,
                    options: &self.options,
                    prop_tag: self.prop_tag,
                };
                status = registry.timed(record.handler, HandlerCallback::ReversePropagate, {
                    move |handler| {
                        handler.reverse_propagate(&mut ctx, node, bounds, record.data.as_deref())
                    }
                });
                if status.is_err() {
                    break;
                }
            }
            graph.node_mut(node).records = records;
            status?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::KeyedVec;
    use crate::handlers::detector::detect_node;

    fn engine() -> ActivityEngine {
        ActivityEngine::new(PropagationOptions::default())
    }

    struct Setup {
        graph: ExpressionGraph,
        variables: VariableStore,
        registry: HandlerRegistry,
    }

    impl Setup {
        fn new() -> Setup {
            Setup {
                graph: ExpressionGraph::new(),
                variables: VariableStore::new(),
                registry: HandlerRegistry::new(),
            }
        }

        fn detect(&mut self, root: NodeId) {
            for node in self.graph.post_order(root) {
                let _ = detect_node(
                    &mut self.graph,
                    &self.variables,
                    &mut self.registry,
                    node,
                    None,
                    false,
                );
            }
        }
    }

    #[test]
    fn forward_propagation_is_idempotent() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let x = setup
            .graph
            .variable(setup.variables.new_variable(-1.0, 2.0, false));
        let square = setup.graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        let exponential = setup.graph.create(ExprKind::Exponential, vec![square]);

        let first = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                exponential,
                false,
            )
            .unwrap();
        let tag = setup.graph.node(square).activity_tag;
        let second = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                exponential,
                false,
            )
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(setup.graph.node(square).activity_tag, tag);
        assert_eq!(setup.graph.activity(square), Interval::new(0.0, 4.0));
    }

    #[test]
    fn tightening_a_bound_never_widens_an_activity() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let v = setup.variables.new_variable(-1.0, 2.0, false);
        let x = setup.graph.variable(v);
        let square = setup.graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);

        let before = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                square,
                false,
            )
            .unwrap();
        let _ = setup
            .variables
            .tighten_bounds(v, Interval::new(0.0, 1.0))
            .unwrap();
        let after = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                square,
                true,
            )
            .unwrap();
        assert!(after.lower() >= before.lower());
        assert!(after.upper() <= before.upper());
    }

    #[test]
    fn sampled_points_lie_inside_the_activity() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let v = setup.variables.new_variable(0.25, 3.0, false);
        let x = setup.graph.variable(v);
        let log = setup.graph.create(ExprKind::Logarithm, vec![x]);
        let sum = setup.graph.create(
            ExprKind::Sum {
                coefficients: vec![2.0, -1.0],
                constant: 0.5,
            },
            vec![x, log],
        );
        setup.graph.release(log);

        let activity = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                sum,
                false,
            )
            .unwrap();
        for sample in [0.25, 0.5, 1.0, 2.0, 3.0] {
            let mut values = KeyedVec::default();
            let _ = values.push(sample);
            let solution = crate::basic_types::Solution::new(values);
            let value = setup.graph.evaluate(sum, &solution).unwrap();
            assert!(
                activity.contains_within(value, 1e-9),
                "{value} escapes {activity}"
            );
        }
    }

    #[test]
    fn integral_activities_are_rounded_inward() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let v = setup.variables.new_variable(0.2, 2.6, true);
        let x = setup.graph.variable(v);
        let tripled = setup.graph.create(
            ExprKind::Sum {
                coefficients: vec![3.0],
                constant: 0.0,
            },
            vec![x],
        );
        setup.graph.analyze_structure(tripled, &setup.variables);
        let activity = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                tripled,
                false,
            )
            .unwrap();
        // x rounds inward to [1, 2], so 3x is [3, 6].
        assert_eq!(activity, Interval::new(3.0, 6.0));
    }

    #[test]
    fn reverse_propagation_narrows_the_log_argument() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let v = setup.variables.new_variable(-2.0, 5.0, false);
        let w = setup.graph.variable(v);
        let log = setup.graph.create(ExprKind::Logarithm, vec![w]);
        setup.graph.add_locks(log, 1, 0);
        setup.detect(log);

        let _ = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                log,
                false,
            )
            .unwrap();
        let status = engine.reverse_propagate(
            &mut setup.graph,
            &mut setup.variables,
            &mut setup.registry,
            log,
            Interval::new(f64::NEG_INFINITY, 5.0_f64.ln()),
        );
        assert_eq!(status, Ok(()));
        let bounds = setup.variables.bounds(v);
        assert!(bounds.lower() >= 0.0);
        assert!((bounds.upper() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn reverse_propagation_reports_an_impossible_log() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let v = setup.variables.new_variable(-2.0, -1.0, false);
        let w = setup.graph.variable(v);
        let log = setup.graph.create(ExprKind::Logarithm, vec![w]);
        setup.graph.add_locks(log, 1, 0);
        setup.detect(log);

        let result = engine.evaluate_activity(
            &mut setup.graph,
            &mut setup.variables,
            &mut setup.registry,
            log,
            false,
        );
        assert!(matches!(
            result,
            Err(PropagationError::Infeasible(Inconsistency::EmptyActivity(node))) if node == log
        ));
    }

    #[test]
    fn early_stop_dequeues_leftover_nodes() {
        let mut setup = Setup::new();
        let mut engine = engine();
        let v = setup.variables.new_variable(0.0, 1.0, false);
        let x = setup.graph.variable(v);
        // exp(x) - exp(x), with the exponential shared: the two reverse deductions through the
        // sum contradict each other once the first one has narrowed the shared child.
        let exp = setup.graph.create(ExprKind::Exponential, vec![x]);
        let sum = setup.graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, -1.0],
                constant: 0.0,
            },
            vec![exp, exp],
        );
        setup.graph.add_locks(sum, 1, 1);
        setup.detect(sum);
        let _ = engine
            .evaluate_activity(
                &mut setup.graph,
                &mut setup.variables,
                &mut setup.registry,
                sum,
                false,
            )
            .unwrap();

        let status = engine.reverse_propagate(
            &mut setup.graph,
            &mut setup.variables,
            &mut setup.registry,
            sum,
            Interval::new(1.5, 1.6),
        );
        assert!(status.is_err());
        for node in setup.graph.post_order(sum) {
            assert!(!setup.graph.node(node).in_prop_queue);
        }
    }
}
