use super::Pseudocosts;
use crate::basic_types::Random;
use crate::basic_types::Solution;
use crate::containers::HashMap;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::options::RelaxationOptions;
use crate::options::ScoreRedistribution;
use crate::variables::VarId;
use crate::variables::VariableStore;

/// The variable to branch on and the point at which to split its domain.
///
/// For integral variables the reference point is never itself integral, so the two children
/// `[lb, floor(reference)]` and `[ceil(reference), ub]` are both strictly smaller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchingDecision {
    pub variable: VarId,
    pub reference: f64,
}

/// Turns the branching scores accumulated on nodes during enforcement into a concrete decision.
///
/// Node scores are first redistributed onto variables, then combined with domain-width, dual,
/// pseudocost, and variable-type information into a single weighted score per candidate variable.
#[derive(Debug, Default)]
pub struct BranchingSelector {
    pseudocosts: Pseudocosts,
}

// Stand-in width for variables with an unbounded domain, so width-based weights stay finite.
const UNBOUNDED_WIDTH: f64 = 1e12;

impl BranchingSelector {
    pub fn new() -> BranchingSelector {
        BranchingSelector::default()
    }

    /// Record the improvement observed after a branch on `variable` was explored.
    pub fn record_pseudocost(&mut self, variable: VarId, gain: f64) {
        self.pseudocosts.record(variable, gain);
    }

    /// Select a variable to branch on from the nodes in `candidates`, or `None` when every
    /// variable the candidates depend on is already fixed.
    pub fn select(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        solution: &Solution,
        options: &RelaxationOptions,
        random: &mut dyn Random,
        candidates: &[NodeId],
    ) -> Option<BranchingDecision> {
        let violation_scores = self.redistribute(graph, variables, solution, options, candidates);
        if violation_scores.is_empty() {
            return None;
        }

        // Deterministic candidate order; the hash map iteration order must not leak into the
        // decision.
        let mut candidates: Vec<(VarId, f64)> = violation_scores.into_iter().collect();
        candidates.sort_by_key(|(variable, _)| *variable);

        let max_violation = candidates
            .iter()
            .map(|(_, score)| *score)
            .fold(f64::EPSILON, f64::max);
        let scored: Vec<(VarId, f64)> = candidates
            .into_iter()
            .map(|(variable, violation_score)| {
                let score = self.weighted_score(
                    variables,
                    solution,
                    options,
                    variable,
                    violation_score / max_violation,
                );
                (variable, score)
            })
            .collect();

        let best = scored
            .iter()
            .map(|(_, score)| *score)
            .fold(f64::NEG_INFINITY, f64::max);
        let threshold = best - options.branching.tie_break_factor * best.abs();
        let tied: Vec<VarId> = scored
            .iter()
            .filter(|(_, score)| *score >= threshold)
            .map(|(variable, _)| *variable)
            .collect();
        let variable = if tied.len() == 1 {
            tied[0]
        } else {
            tied[random.generate_usize_in_range(0..tied.len())]
        };

        Some(BranchingDecision {
            variable,
            reference: self.reference_point(variables, solution, options, variable),
        })
    }

    /// Spread the branching score of each candidate node onto the variables it depends on.
    fn redistribute(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        solution: &Solution,
        options: &RelaxationOptions,
        candidates: &[NodeId],
    ) -> HashMap<VarId, f64> {
        let epsilon = options.propagation.feasibility_epsilon;
        let mut scores: HashMap<VarId, f64> = HashMap::default();
        for &node in candidates {
            let score = graph.node(node).branch_score;

            if options.branching.branch_on_relaxation_variables {
                if let Some(aux) = graph.relaxation_variable(node) {
                    if !variables.is_fixed(aux, epsilon) {
                        *scores.entry(aux).or_insert(0.0) += score;
                        continue;
                    }
                }
            }

            let targets: Vec<VarId> = graph
                .collect_variables(node)
                .into_iter()
                .filter(|&variable| !variables.is_fixed(variable, epsilon))
                .collect();
            if targets.is_empty() {
                continue;
            }
            let weights: Vec<f64> = targets
                .iter()
                .map(|&variable| {
                    redistribution_weight(
                        variables,
                        solution,
                        variable,
                        options.branching.redistribution,
                    )
                })
                .collect();
            let total: f64 = weights.iter().sum();
            for (index, &variable) in targets.iter().enumerate() {
                let share = if total > 0.0 {
                    weights[index] / total
                } else {
                    1.0 / targets.len() as f64
                };
                *scores.entry(variable).or_insert(0.0) += score * share;
            }
        }
        scores
    }

    fn weighted_score(
        &self,
        variables: &VariableStore,
        solution: &Solution,
        options: &RelaxationOptions,
        variable: VarId,
        normalized_violation: f64,
    ) -> f64 {
        let branching = &options.branching;
        let width = finite_width(variables, variable);
        let domain_score = width / (1.0 + width);
        let dual_score = solution
            .reduced_cost(variable)
            .map(|cost| cost.abs() / (1.0 + cost.abs()))
            .unwrap_or(0.0);
        let pseudocost_score = self
            .pseudocosts
            .estimate(variable, branching.pseudocost_reliability)
            .map(|gain| gain.abs() / (1.0 + gain.abs()))
            .unwrap_or(0.0);
        let vartype_score = if variables.is_integral(variable) {
            1.0
        } else {
            0.0
        };

        branching.violation_weight * normalized_violation
            + branching.domain_weight * domain_score
            + branching.dual_weight * dual_score
            + branching.pseudocost_weight * pseudocost_score
            + branching.vartype_weight * vartype_score
    }

    fn reference_point(
        &self,
        variables: &VariableStore,
        solution: &Solution,
        options: &RelaxationOptions,
        variable: VarId,
    ) -> f64 {
        let bounds = variables.bounds(variable);
        let value = solution.value(variable);
        let mut reference = if bounds.is_finite() {
            value + options.branching.midpoint_pull * (bounds.midpoint() - value)
        } else {
            value
        };
        reference = reference.clamp(bounds.lower(), bounds.upper());
        if variables.is_integral(variable) && reference.round() == reference {
            // Nudge integral points off the grid so the floor/ceiling split is proper.
            reference += if reference < bounds.midpoint() {
                0.5
            } else {
                -0.5
            };
        }
        reference
    }
}

fn finite_width(variables: &VariableStore, variable: VarId) -> f64 {
    let width = variables.bounds(variable).width();
    if width.is_finite() {
        width
    } else {
        UNBOUNDED_WIDTH
    }
}

fn redistribution_weight(
    variables: &VariableStore,
    solution: &Solution,
    variable: VarId,
    redistribution: ScoreRedistribution,
) -> f64 {
    match redistribution {
        ScoreRedistribution::Even => 1.0,
        ScoreRedistribution::Midness => {
            let bounds = variables.bounds(variable);
            if !bounds.is_finite() || bounds.width() == 0.0 {
                return 1.0;
            }
            let offset = (solution.value(variable) - bounds.midpoint()).abs();
            (1.0 - 2.0 * offset / bounds.width()).clamp(0.0, 1.0)
        }
        ScoreRedistribution::Width => finite_width(variables, variable),
        ScoreRedistribution::LogWidth => (1.0 + finite_width(variables, variable)).ln(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_types::TestRandom;
    use crate::basic_types::Interval;
    use crate::branching::accumulate_score;
    use crate::containers::KeyedVec;
    use crate::expr::ExprKind;
    use crate::options::ScoreAggregation;

    struct Setup {
        graph: ExpressionGraph,
        variables: VariableStore,
    }

    impl Setup {
        fn new() -> Setup {
            Setup {
                graph: ExpressionGraph::new(),
                variables: VariableStore::new(),
            }
        }

        fn scored_node(&mut self, variable: VarId, score: f64) -> NodeId {
            let leaf = self.graph.variable(variable);
            let node = self.graph.create(ExprKind::Exponential, vec![leaf]);
            accumulate_score(&mut self.graph, node, score, ScoreAggregation::Sum);
            node
        }

        fn solution(&self, values: &[f64]) -> Solution {
            let mut stored = KeyedVec::default();
            for &value in values {
                let _ = stored.push(value);
            }
            Solution::new(stored)
        }
    }

    fn violation_only_options() -> RelaxationOptions {
        let mut options = RelaxationOptions::default();
        options.branching.violation_weight = 1.0;
        options.branching.domain_weight = 0.0;
        options.branching.dual_weight = 0.0;
        options.branching.pseudocost_weight = 0.0;
        options.branching.vartype_weight = 0.0;
        options.branching.tie_break_factor = 0.0;
        options
    }

    #[test]
    fn the_most_violated_variable_is_selected() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(0.0, 4.0, false);
        let y = setup.variables.new_variable(0.0, 2.0, false);
        let node_x = setup.scored_node(x, 3.0);
        let node_y = setup.scored_node(y, 1.0);
        let solution = setup.solution(&[1.0, 1.0]);
        let options = violation_only_options();
        let mut random = TestRandom::default();

        let decision = BranchingSelector::new()
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node_x, node_y],
            )
            .expect("a candidate exists");

        assert_eq!(decision.variable, x);
        // Solution value 1 pulled towards the midpoint 2 by the configured factor.
        let expected = 1.0 + options.branching.midpoint_pull * (2.0 - 1.0);
        assert!((decision.reference - expected).abs() < 1e-12);
    }

    #[test]
    fn ties_are_broken_through_the_random_source() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(0.0, 4.0, false);
        let y = setup.variables.new_variable(0.0, 4.0, false);
        let node_x = setup.scored_node(x, 2.0);
        let node_y = setup.scored_node(y, 2.0);
        let solution = setup.solution(&[1.0, 1.0]);
        let options = violation_only_options();
        let mut random = TestRandom {
            usizes: vec![1],
            ..Default::default()
        };

        let decision = BranchingSelector::new()
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node_x, node_y],
            )
            .expect("a candidate exists");

        assert_eq!(decision.variable, y);
    }

    #[test]
    fn fixed_variables_are_never_selected() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(1.0, 1.0, false);
        let y = setup.variables.new_variable(0.0, 2.0, false);
        let node_x = setup.scored_node(x, 5.0);
        let node_y = setup.scored_node(y, 1.0);
        let solution = setup.solution(&[1.0, 1.0]);
        let options = violation_only_options();
        let mut random = TestRandom::default();

        let decision = BranchingSelector::new()
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node_x, node_y],
            )
            .expect("y is still free");

        assert_eq!(decision.variable, y);
    }

    #[test]
    fn no_decision_when_all_variables_are_fixed() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(1.0, 1.0, false);
        let node_x = setup.scored_node(x, 5.0);
        let solution = setup.solution(&[1.0]);
        let options = violation_only_options();
        let mut random = TestRandom::default();

        let decision = BranchingSelector::new().select(
            &setup.graph,
            &setup.variables,
            &solution,
            &options,
            &mut random,
            &[node_x],
        );

        assert_eq!(decision, None);
    }

    #[test]
    fn midness_redistribution_favours_central_variables() {
        let mut setup = Setup::new();
        // One node depending on both variables; x sits at its midpoint, y at its bound.
        let x = setup.variables.new_variable(0.0, 4.0, false);
        let y = setup.variables.new_variable(0.0, 4.0, false);
        let leaf_x = setup.graph.variable(x);
        let leaf_y = setup.graph.variable(y);
        let sum = setup.graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 1.0],
                constant: 0.0,
            },
            vec![leaf_x, leaf_y],
        );
        let node = setup.graph.create(ExprKind::Exponential, vec![sum]);
        accumulate_score(&mut setup.graph, node, 4.0, ScoreAggregation::Sum);
        let solution = setup.solution(&[2.0, 0.0]);
        let mut options = violation_only_options();
        options.branching.redistribution = ScoreRedistribution::Midness;
        let mut random = TestRandom::default();

        let decision = BranchingSelector::new()
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node],
            )
            .expect("a candidate exists");

        assert_eq!(decision.variable, x);
    }

    #[test]
    fn reliable_pseudocosts_break_equal_violations() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(0.0, 4.0, false);
        let y = setup.variables.new_variable(0.0, 4.0, false);
        let node_x = setup.scored_node(x, 2.0);
        let node_y = setup.scored_node(y, 2.0);
        let solution = setup.solution(&[1.0, 1.0]);
        let mut options = violation_only_options();
        options.branching.pseudocost_weight = 1.0;
        options.branching.pseudocost_reliability = 2;
        let mut random = TestRandom::default();

        let mut selector = BranchingSelector::new();
        selector.record_pseudocost(y, 3.0);
        selector.record_pseudocost(y, 5.0);

        let decision = selector
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node_x, node_y],
            )
            .expect("a candidate exists");

        assert_eq!(decision.variable, y);
    }

    #[test]
    fn integral_reference_points_fall_between_values() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(0.0, 4.0, true);
        let node_x = setup.scored_node(x, 1.0);
        // Value 2 with the midpoint at 2: the pull leaves an integral reference which must be
        // nudged off the grid.
        let solution = setup.solution(&[2.0]);
        let options = violation_only_options();
        let mut random = TestRandom::default();

        let decision = BranchingSelector::new()
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node_x],
            )
            .expect("a candidate exists");

        assert_eq!(decision.variable, x);
        assert_ne!(decision.reference.round(), decision.reference);
        assert!(decision.reference > 0.0 && decision.reference < 4.0);
    }

    #[test]
    fn relaxation_variables_are_branched_on_directly_when_enabled() {
        let mut setup = Setup::new();
        let x = setup.variables.new_variable(0.0, 4.0, false);
        let node = setup.scored_node(x, 2.0);
        let aux = setup
            .variables
            .new_relaxation_variable(Interval::new(0.0, 10.0));
        setup.graph.node_mut(node).relaxation_variable = Some(aux);
        let solution = setup.solution(&[1.0, 3.0]);
        let mut options = violation_only_options();
        options.branching.branch_on_relaxation_variables = true;
        let mut random = TestRandom::default();

        let decision = BranchingSelector::new()
            .select(
                &setup.graph,
                &setup.variables,
                &solution,
                &options,
                &mut random,
                &[node],
            )
            .expect("a candidate exists");

        assert_eq!(decision.variable, aux);
    }
}
