use std::cmp::Ordering;

use log::debug;
use log::trace;

use super::Cut;
use super::EnforceContext;
use super::EnforceOutcome;
use super::RowPrep;
use super::Violation;
use super::node_violation;
use crate::basic_types::Interval;
use crate::basic_types::Solution;
use crate::branching::accumulate_score;
use crate::create_statistics_struct;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::handlers::Capability;
use crate::handlers::EstimateOutcome;
use crate::handlers::Estimator;
use crate::handlers::HandlerCallback;
use crate::handlers::HandlerRegistry;
use crate::options::RelaxationOptions;
use crate::propagation::ActivityEngine;
use crate::statistics::CumulativeMovingAverage;
use crate::variables::VarId;
use crate::variables::VariableStore;

create_statistics_struct!(
    /// Counters of the enforcement loop, exposed on the facade.
    EnforcementStatistics {
        num_rounds: u64,
        num_cuts_added: u64,
        num_cuts_rejected: u64,
        num_weak_cuts_rejected: u64,
        num_branch_candidates: u64,
        num_domain_reductions: u64,
        average_cut_violation: CumulativeMovingAverage,
    }
);

#[derive(Debug, Clone, Copy)]
struct NodeResult {
    outcome: EnforceOutcome,
    weak_rejected: bool,
}

/// The multi-round separation/enforcement protocol.
///
/// Each call is one globally numbered round over the violated nodes it is given. Per node, the
/// claiming handlers are consulted in record order: a direct `enforce` first, an `estimate`
/// turned into a cut on fallback, with the weak-cut policy deciding which cuts survive the first
/// attempt. Shared subexpressions are processed at most once per round.
#[derive(Debug, Default)]
pub struct EnforcementLoop {
    round: u64,
    pub(crate) statistics: EnforcementStatistics,
}

impl EnforcementLoop {
    pub fn statistics(&self) -> &EnforcementStatistics {
        &self.statistics
    }

    /// Run one enforcement round over `nodes`, collecting cuts and branching candidates.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enforce_nodes(
        &mut self,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
        engine: &mut ActivityEngine,
        options: &RelaxationOptions,
        solution: &Solution,
        nodes: &[NodeId],
        cuts: &mut Vec<Cut>,
        branch_candidates: &mut Vec<NodeId>,
    ) -> EnforceOutcome {
        self.round += 1;
        self.statistics.num_rounds += 1;
        let epsilon = options.propagation.feasibility_epsilon;

        let mut violated: Vec<(NodeId, Violation)> = Vec::new();
        for &node in nodes {
            if graph.node(node).last_enforce_round == Some(self.round) {
                continue;
            }
            let Some(violation) = node_violation(graph, node, solution) else {
                continue;
            };
            if violation.total() <= epsilon {
                continue;
            }
            graph.node_mut(node).last_enforce_round = Some(self.round);
            violated.push((node, violation));
        }
        if violated.is_empty() {
            return EnforceOutcome::DidNotFind;
        }
        violated.sort_by(|a, b| {
            b.1.total()
                .partial_cmp(&a.1.total())
                .unwrap_or(Ordering::Equal)
        });
        let worst = violated[0].1.total();

        let mut outcome = EnforceOutcome::DidNotFind;
        let mut weak_retries: Vec<(NodeId, Violation)> = Vec::new();
        for &(node, violation) in &violated {
            let result = self.enforce_node(
                graph,
                variables,
                registry,
                engine,
                options,
                solution,
                node,
                violation,
                false,
                cuts,
                branch_candidates,
            );
            if result.outcome == EnforceOutcome::Cutoff {
                return EnforceOutcome::Cutoff;
            }
            outcome = outcome.join(result.outcome);
            let close_to_worst =
                violation.total() * options.enforcement.weak_cut_min_violation_factor >= worst;
            if result.weak_rejected && result.outcome == EnforceOutcome::DidNotFind && close_to_worst
            {
                weak_retries.push((node, violation));
            }
        }

        for (node, violation) in weak_retries {
            trace!("retrying {node} with weak cuts allowed");
            let result = self.enforce_node(
                graph,
                variables,
                registry,
                engine,
                options,
                solution,
                node,
                violation,
                true,
                cuts,
                branch_candidates,
            );
            if result.outcome == EnforceOutcome::Cutoff {
                return EnforceOutcome::Cutoff;
            }
            outcome = outcome.join(result.outcome);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn enforce_node(
        &mut self,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
        engine: &mut ActivityEngine,
        options: &RelaxationOptions,
        solution: &Solution,
        node: NodeId,
        violation: Violation,
        allow_weak: bool,
        cuts: &mut Vec<Cut>,
        branch_candidates: &mut Vec<NodeId>,
    ) -> NodeResult {
        let mut result = NodeResult {
            outcome: EnforceOutcome::DidNotFind,
            weak_rejected: false,
        };
        let (Some(aux), Some(value)) = (
            graph.relaxation_variable(node),
            graph.evaluate(node, solution),
        ) else {
            return result;
        };
        let z = solution.value(aux);
        let overestimate = violation.below > violation.above;
        let side = if overestimate {
            Capability::SeparateBelow
        } else {
            Capability::SeparateAbove
        };

        let mut records = std::mem::take(&mut graph.node_mut(node).records);
        // Every claiming handler's own belief of the node value; the representative is the one
        // farthest from the relaxation variable.
        for record in &mut records {
            if (record.capabilities
                & (Capability::SeparateAbove | Capability::SeparateBelow))
                .is_empty()
            {
                continue;
            }
            let data = record.data.as_deref();
            let aux_value = registry.timed(record.handler, HandlerCallback::EvalAux, {
                let graph = &*graph;
                let variables = &*variables;
                move |handler| handler.eval_aux(graph, variables, node, data, solution)
            });
            record.aux_value = aux_value;
        }
        let representative = records
            .iter()
            .filter_map(|record| record.aux_value)
            .chain(std::iter::once(value))
            .max_by(|a, b| {
                (a - z)
                    .abs()
                    .partial_cmp(&(b - z).abs())
                    .unwrap_or(Ordering::Equal)
            })
            .unwrap_or(value);
        let representative_gap = (representative - z).abs();

        for record in &mut records {
            if !record.capabilities.contains(side) {
                continue;
            }
            // A handler whose own violation is marginal compared to the violation against the
            // original variables has nothing useful to separate.
            if let Some(handler_value) = record.aux_value {
                let handler_violation = if overestimate {
                    z - handler_value
                } else {
                    handler_value - z
                };
                if handler_violation
                    < options.enforcement.enforce_aux_viol_factor * violation.total()
                {
                    continue;
                }
            }

            if !record.separation_initialised {
                let data = record.data.as_deref();
                registry.timed(record.handler, HandlerCallback::InitSeparation, {
                    let graph = &*graph;
                    let variables = &*variables;
                    move |handler| handler.init_separation(graph, variables, node, data)
                });
                record.separation_initialised = true;
            }

            let mut ctx = EnforceContext::new(
                graph,
                variables,
                solution,
                &options.enforcement,
                allow_weak,
            );
            let data = record.data.as_deref();
            let direct = registry.timed(record.handler, HandlerCallback::Enforce, {
                let ctx = &mut ctx;
                move |handler| handler.enforce(ctx, node, data)
            });
            let EnforceContext {
                cuts: new_cuts,
                bound_requests,
                branch_requests,
                ..
            } = ctx;
            let applied = self.apply_requests(
                new_cuts,
                bound_requests,
                branch_requests,
                graph,
                variables,
                registry,
                engine,
                solution,
                cuts,
                branch_candidates,
            );
            let mut record_outcome = direct.join(applied);
            if record_outcome == EnforceOutcome::Cutoff {
                graph.node_mut(node).records = records;
                return NodeResult {
                    outcome: EnforceOutcome::Cutoff,
                    weak_rejected: result.weak_rejected,
                };
            }

            if record_outcome == EnforceOutcome::DidNotFind {
                let data = record.data.as_deref();
                let estimate = registry.timed(record.handler, HandlerCallback::Estimate, {
                    let graph = &*graph;
                    let variables = &*variables;
                    move |handler| {
                        handler.estimate(graph, variables, node, data, solution, overestimate)
                    }
                });
                match estimate {
                    EstimateOutcome::Found(estimator) => {
                        let estimator_value = estimator.value_at(solution);
                        let closed_gap = (estimator_value - z).abs();
                        let weak = closed_gap
                            < options.enforcement.weak_cut_threshold * representative_gap;
                        if weak && !allow_weak {
                            trace!("weak cut for {node} rejected under the strict policy");
                            self.statistics.num_weak_cuts_rejected += 1;
                            result.weak_rejected = true;
                        } else {
                            record_outcome = record_outcome.join(self.cut_from_estimator(
                                &estimator,
                                aux,
                                overestimate,
                                variables,
                                options,
                                solution,
                                allow_weak,
                                cuts,
                            ));
                        }
                    }
                    EstimateOutcome::BranchOn(candidates) => {
                        for candidate in candidates {
                            accumulate_score(
                                graph,
                                candidate,
                                violation.total(),
                                options.branching.aggregation,
                            );
                            branch_candidates.push(candidate);
                            self.statistics.num_branch_candidates += 1;
                        }
                        record_outcome = record_outcome.join(EnforceOutcome::Branched);
                    }
                    EstimateOutcome::DidNotFind => {}
                }
            }

            if record_outcome != EnforceOutcome::DidNotFind {
                record.last_result_round = Some(self.round);
            }
            result.outcome = result.outcome.join(record_outcome);
            if result.outcome >= EnforceOutcome::Separated {
                break;
            }
        }
        graph.node_mut(node).records = records;
        result
    }

    /// Append the relaxation-variable term to an estimator and clean the row into a cut.
    ///
    /// An underestimator `e(x) <= node` separates the above side as `e(x) - z <= 0`; an
    /// overestimator mirrors it.
    #[allow(clippy::too_many_arguments)]
    fn cut_from_estimator(
        &mut self,
        estimator: &Estimator,
        aux: VarId,
        overestimate: bool,
        variables: &VariableStore,
        options: &RelaxationOptions,
        solution: &Solution,
        allow_weak: bool,
        cuts: &mut Vec<Cut>,
    ) -> EnforceOutcome {
        let mut row = RowPrep::new();
        let sign = if overestimate { -1.0 } else { 1.0 };
        for &(variable, coefficient) in &estimator.terms {
            row.add_term(variable, sign * coefficient);
        }
        row.add_term(aux, -sign);
        row.add_rhs(-sign * estimator.constant);

        let cut = match row.cleanup(variables, &options.enforcement.cuts) {
            Ok(cut) => cut,
            Err(error) => {
                debug!("cut construction failed: {error}");
                self.statistics.num_cuts_rejected += 1;
                return EnforceOutcome::DidNotFind;
            }
        };
        let cut_violation = cut.violation(solution);
        let threshold = if allow_weak {
            options.enforcement.min_weak_cut_violation
        } else {
            options.enforcement.min_cut_violation
        };
        if cut_violation < threshold {
            debug!("cleaned-up cut no longer separates (violation {cut_violation:e})");
            self.statistics.num_cuts_rejected += 1;
            return EnforceOutcome::DidNotFind;
        }
        self.statistics.num_cuts_added += 1;
        self.statistics.average_cut_violation.add_term(cut_violation);
        cuts.push(cut);
        EnforceOutcome::Separated
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_requests(
        &mut self,
        new_cuts: Vec<Cut>,
        bound_requests: Vec<(NodeId, Interval)>,
        branch_requests: Vec<NodeId>,
        graph: &mut ExpressionGraph,
        variables: &mut VariableStore,
        registry: &mut HandlerRegistry,
        engine: &mut ActivityEngine,
        solution: &Solution,
        cuts: &mut Vec<Cut>,
        branch_candidates: &mut Vec<NodeId>,
    ) -> EnforceOutcome {
        let mut outcome = EnforceOutcome::DidNotFind;
        for cut in new_cuts {
            self.statistics.num_cuts_added += 1;
            self.statistics
                .average_cut_violation
                .add_term(cut.violation(solution));
            cuts.push(cut);
            outcome = outcome.join(EnforceOutcome::Separated);
        }
        for (node, bounds) in bound_requests {
            let before = variables.current_bounds_tag();
            match engine.reverse_propagate(graph, variables, registry, node, bounds) {
                Ok(()) => {
                    if variables.current_bounds_tag() > before {
                        self.statistics.num_domain_reductions += 1;
                        outcome = outcome.join(EnforceOutcome::ReducedDomain);
                    }
                }
                Err(inconsistency) => {
                    debug!("enforcement bound request proved infeasibility: {inconsistency}");
                    return EnforceOutcome::Cutoff;
                }
            }
        }
        for node in branch_requests {
            branch_candidates.push(node);
            self.statistics.num_branch_candidates += 1;
            outcome = outcome.join(EnforceOutcome::Branched);
        }
        outcome
    }
}
