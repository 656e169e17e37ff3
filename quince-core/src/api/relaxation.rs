use log::debug;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use super::ConstraintId;
use crate::basic_types::Interval;
use crate::basic_types::Random;
use crate::basic_types::Solution;
use crate::branching::BranchingDecision;
use crate::branching::BranchingSelector;
use crate::branching::accumulate_score;
use crate::containers::KeyedVec;
use crate::create_statistics_struct;
use crate::enforce::Cut;
use crate::enforce::EnforceOutcome;
use crate::enforce::EnforcementLoop;
use crate::enforce::EnforcementStatistics;
use crate::enforce::Violation;
use crate::enforce::node_violation;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::expr::ResourceExhaustion;
use crate::expr::merge_subexpressions;
use crate::expr::simplify_roots;
use crate::handlers::HandlerRegistry;
use crate::handlers::NonlinearHandler;
use crate::handlers::detector::detect_node;
use crate::options::RelaxationOptions;
use crate::propagation::ActivityEngine;
use crate::propagation::Inconsistency;
use crate::propagation::PropagationError;
use crate::quince_assert_simple;
use crate::statistics::Statistic;
use crate::statistics::StatisticLogger;
use crate::variables::VarId;
use crate::variables::VariableStore;

create_statistics_struct!(
    /// Top-level counters of the facade.
    RelaxationStatistics {
        num_propagation_calls: u64,
        num_propagation_conflicts: u64,
        num_enforce_calls: u64,
    }
);

/// What a propagation pass concluded about the current variable bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    Feasible,
    Infeasible(Inconsistency),
}

#[derive(Debug)]
struct RelaxConstraint {
    root: NodeId,
    /// The admissible range of the root expression: `sides.lower() <= e(x) <= sides.upper()`.
    sides: Interval,
}

/// A finite right-hand side bounds the expression above, so the expression must not exceed its
/// relaxation variable (a positive lock); a finite left-hand side is the mirror image.
fn lock_amounts(sides: Interval) -> (i32, i32) {
    let positive = i32::from(sides.upper().is_finite());
    let negative = i32::from(sides.lower().is_finite());
    (positive, negative)
}

/// The relaxation engine facade: owns the expression graph, the variable store, the handler
/// registry, and the propagation/enforcement/branching machinery.
///
/// Lifecycle: create variables and expressions, register constraints (and any third-party
/// handlers), then drive the engine through [`Relaxation::propagate`], [`Relaxation::separate`]
/// or [`Relaxation::enforce`], and [`Relaxation::select_branching`]. The first propagation call
/// canonicalizes the graph, runs detection, and creates the relaxation variables; constraints
/// can no longer be added after that point.
#[derive(Debug)]
pub struct Relaxation {
    graph: ExpressionGraph,
    variables: VariableStore,
    registry: HandlerRegistry,
    engine: ActivityEngine,
    enforcement: EnforcementLoop,
    selector: BranchingSelector,
    options: RelaxationOptions,
    pub(crate) random: Box<dyn Random>,
    constraints: KeyedVec<ConstraintId, Option<RelaxConstraint>>,
    /// The nodes carrying a relaxation variable, in detection order.
    enforced_nodes: Vec<NodeId>,
    cuts: Vec<Cut>,
    branch_candidates: Vec<NodeId>,
    statistics: RelaxationStatistics,
    started: bool,
}

impl Default for Relaxation {
    fn default() -> Self {
        Relaxation::with_options(RelaxationOptions::default())
    }
}

impl Relaxation {
    pub fn new() -> Relaxation {
        Relaxation::default()
    }

    pub fn with_options(options: RelaxationOptions) -> Relaxation {
        Relaxation {
            graph: ExpressionGraph::new(),
            variables: VariableStore::new(),
            registry: HandlerRegistry::new(),
            engine: ActivityEngine::new(options.propagation),
            enforcement: EnforcementLoop::default(),
            selector: BranchingSelector::new(),
            options,
            random: Box::new(SmallRng::seed_from_u64(42)),
            constraints: KeyedVec::default(),
            enforced_nodes: Vec::new(),
            cuts: Vec::new(),
            branch_candidates: Vec::new(),
            statistics: RelaxationStatistics::default(),
            started: false,
        }
    }

    pub fn graph(&self) -> &ExpressionGraph {
        &self.graph
    }

    /// Mutable access for expression building. Structural changes after the first propagation
    /// call are not supported.
    pub fn graph_mut(&mut self) -> &mut ExpressionGraph {
        &mut self.graph
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn options(&self) -> &RelaxationOptions {
        &self.options
    }

    pub fn new_variable(&mut self, lower: f64, upper: f64, integral: bool) -> VarId {
        self.variables.new_variable(lower, upper, integral)
    }

    /// Intersect the domain of `variable` with `bounds`, e.g. after a branching decision.
    pub fn tighten_variable(
        &mut self,
        variable: VarId,
        bounds: Interval,
    ) -> Result<bool, Inconsistency> {
        Ok(self.variables.tighten_bounds(variable, bounds)?)
    }

    /// Register a third-party handler. Must happen before the first propagation call.
    pub fn register_handler(&mut self, handler: Box<dyn NonlinearHandler>) {
        quince_assert_simple!(
            !self.started,
            "handlers must be registered before the engine starts"
        );
        self.registry.register(handler);
    }

    /// Register the constraint `lower <= e(x) <= upper` over the expression rooted at `root`.
    /// The facade takes over one ownership of `root` from the caller.
    pub fn add_constraint(&mut self, root: NodeId, lower: f64, upper: f64) -> ConstraintId {
        quince_assert_simple!(
            !self.started,
            "constraints must be added before the engine starts"
        );
        quince_assert_simple!(lower <= upper, "a constraint must have a nonempty range");
        self.constraints.push(Some(RelaxConstraint {
            root,
            sides: Interval::new(lower, upper),
        }))
    }

    /// Remove a constraint, releasing its expression. Nodes shared with other constraints stay
    /// alive; the rest is torn down bottom-up.
    pub fn remove_constraint(&mut self, constraint: ConstraintId) {
        let Some(removed) = self.constraints[constraint].take() else {
            return;
        };
        if self.started {
            let (positive, negative) = lock_amounts(removed.sides);
            if positive != 0 || negative != 0 {
                self.graph.add_locks(removed.root, -positive, -negative);
            }
        }
        self.graph.release(removed.root);
        let graph = &self.graph;
        self.enforced_nodes.retain(|&node| graph.is_live(node));
    }

    pub fn constraint_root(&self, constraint: ConstraintId) -> NodeId {
        self.constraints[constraint]
            .as_ref()
            .expect("the constraint was removed")
            .root
    }

    fn live_constraints(&self) -> Vec<(ConstraintId, NodeId, Interval)> {
        self.constraints
            .keys()
            .filter_map(|id| {
                self.constraints[id]
                    .as_ref()
                    .map(|constraint| (id, constraint.root, constraint.sides))
            })
            .collect()
    }

    /// One-time engine start: canonicalize the graph, apply the constraint locks, analyze
    /// integrality and curvature, compute first activities, run detection, and create the
    /// relaxation variables.
    fn start(&mut self) -> Result<(), PropagationError> {
        if self.started {
            return Ok(());
        }
        let ids: Vec<ConstraintId> = self
            .constraints
            .keys()
            .filter(|&id| self.constraints[id].is_some())
            .collect();
        let mut roots: Vec<NodeId> = ids
            .iter()
            .map(|&id| self.constraints[id].as_ref().expect("filtered to live").root)
            .collect();

        let replacements = simplify_roots(&mut self.graph, &mut roots)
            + merge_subexpressions(&mut self.graph, &mut roots);
        debug!("canonicalization performed {replacements} replacements");
        for (&id, &root) in ids.iter().zip(&roots) {
            self.constraints[id].as_mut().expect("filtered to live").root = root;
        }

        for (&id, &root) in ids.iter().zip(&roots) {
            let sides = self.constraints[id].as_ref().expect("filtered to live").sides;
            let (positive, negative) = lock_amounts(sides);
            if positive != 0 || negative != 0 {
                self.graph.add_locks(root, positive, negative);
            }
            // First analysis run: integrality must be known before the first forward pass so
            // integral activities are rounded inward.
            self.graph.analyze_structure(root, &self.variables);
        }
        for &root in &roots {
            let _ = self.engine.evaluate_activity(
                &mut self.graph,
                &mut self.variables,
                &mut self.registry,
                root,
                true,
            )?;
        }
        for &root in &roots {
            // The curvature rules consult child activities, so the analysis is refined once
            // activities are known.
            self.graph.analyze_structure(root, &self.variables);
        }

        for (&id, &root) in ids.iter().zip(&roots) {
            for node in self.graph.post_order(root) {
                let result = detect_node(
                    &mut self.graph,
                    &self.variables,
                    &mut self.registry,
                    node,
                    Some(id),
                    false,
                );
                if result.needs_relaxation_variable
                    && self.graph.relaxation_variable(node).is_none()
                {
                    let aux = self
                        .variables
                        .new_relaxation_variable(self.graph.activity(node));
                    self.graph.node_mut(node).relaxation_variable = Some(aux);
                    self.enforced_nodes.push(node);
                }
            }
        }

        self.started = true;
        Ok(())
    }

    /// Propagate all constraints to a fixpoint: forward activity evaluation per constraint
    /// followed by reverse propagation of the constraint sides.
    pub fn propagate(&mut self) -> Result<PropagationOutcome, ResourceExhaustion> {
        self.statistics.num_propagation_calls += 1;
        match self.propagate_inner(false) {
            Ok(()) => Ok(PropagationOutcome::Feasible),
            Err(PropagationError::Infeasible(inconsistency)) => {
                self.statistics.num_propagation_conflicts += 1;
                debug!("propagation found an inconsistency: {inconsistency}");
                Ok(PropagationOutcome::Infeasible(inconsistency))
            }
            Err(PropagationError::ResourceExhaustion(exhaustion)) => Err(exhaustion),
        }
    }

    fn propagate_inner(&mut self, force: bool) -> Result<(), PropagationError> {
        self.start()?;
        for (_, root, sides) in self.live_constraints() {
            let _ = self.engine.evaluate_activity(
                &mut self.graph,
                &mut self.variables,
                &mut self.registry,
                root,
                force,
            )?;
            self.engine.reverse_propagate(
                &mut self.graph,
                &mut self.variables,
                &mut self.registry,
                root,
                sides,
            )?;
        }
        Ok(())
    }

    /// Run one separation round over the nodes carrying relaxation variables. Cuts accumulate
    /// until collected through [`Relaxation::take_cuts`]; branching candidates until the next
    /// [`Relaxation::select_branching`].
    pub fn separate(&mut self, solution: &Solution) -> EnforceOutcome {
        quince_assert_simple!(
            self.started,
            "propagation must run before the first separation round"
        );
        let Relaxation {
            graph,
            variables,
            registry,
            engine,
            enforcement,
            options,
            enforced_nodes,
            cuts,
            branch_candidates,
            ..
        } = self;
        enforcement.enforce_nodes(
            graph,
            variables,
            registry,
            engine,
            options,
            solution,
            enforced_nodes,
            cuts,
            branch_candidates,
        )
    }

    /// Separate, and degrade gracefully when no handler finds anything for a violated point:
    /// re-propagate from the current bounds, then fall back to branching on a still-unfixed
    /// variable under a violated constraint, and only declare a cutoff when every such variable
    /// is fixed.
    pub fn enforce(&mut self, solution: &Solution) -> EnforceOutcome {
        self.statistics.num_enforce_calls += 1;
        let outcome = self.separate(solution);
        if outcome != EnforceOutcome::DidNotFind {
            return outcome;
        }
        let violated = self.violated_constraints(solution);
        if violated.is_empty() {
            return EnforceOutcome::DidNotFind;
        }

        let tag_before = self.variables.current_bounds_tag();
        match self.propagate_inner(true) {
            Err(PropagationError::Infeasible(_)) => return EnforceOutcome::Cutoff,
            // Out of iterators; the branching fallback below still applies.
            Err(PropagationError::ResourceExhaustion(_)) | Ok(()) => {}
        }
        if self.variables.current_bounds_tag() > tag_before {
            return EnforceOutcome::ReducedDomain;
        }

        let epsilon = self.options.propagation.feasibility_epsilon;
        let mut branched = false;
        for (root, amount) in violated {
            let has_free_variable = self
                .graph
                .collect_variables(root)
                .into_iter()
                .any(|variable| !self.variables.is_fixed(variable, epsilon));
            if has_free_variable {
                accumulate_score(
                    &mut self.graph,
                    root,
                    amount,
                    self.options.branching.aggregation,
                );
                self.branch_candidates.push(root);
                branched = true;
            }
        }
        if branched {
            EnforceOutcome::Branched
        } else {
            // Every variable under every violated constraint is fixed; the point cannot be
            // repaired.
            EnforceOutcome::Cutoff
        }
    }

    /// The live constraints whose root expression evaluates outside its sides at `solution`,
    /// with the amount by which they do. A domain error during evaluation counts as violated.
    fn violated_constraints(&self, solution: &Solution) -> Vec<(NodeId, f64)> {
        let epsilon = self.options.propagation.feasibility_epsilon;
        let mut violated = Vec::new();
        for (_, root, sides) in self.live_constraints() {
            let amount = match self.graph.evaluate(root, solution) {
                Some(value) => (value - sides.upper()).max(sides.lower() - value).max(0.0),
                None => 1.0,
            };
            if amount > epsilon {
                violated.push((root, amount));
            }
        }
        violated
    }

    /// Turn the accumulated branching candidates into a decision, consuming them.
    pub fn select_branching(&mut self, solution: &Solution) -> Option<BranchingDecision> {
        let candidates = std::mem::take(&mut self.branch_candidates);
        self.selector.select(
            &self.graph,
            &self.variables,
            solution,
            &self.options,
            self.random.as_mut(),
            &candidates,
        )
    }

    /// Record the improvement observed after exploring a branch on `variable`.
    pub fn record_pseudocost(&mut self, variable: VarId, gain: f64) {
        self.selector.record_pseudocost(variable, gain);
    }

    /// Collect the cuts found since the last call.
    pub fn take_cuts(&mut self) -> Vec<Cut> {
        std::mem::take(&mut self.cuts)
    }

    /// How much `node` disagrees with its relaxation variable at `solution`.
    pub fn violation(&self, node: NodeId, solution: &Solution) -> Option<Violation> {
        node_violation(&self.graph, node, solution)
    }

    pub fn statistics(&self) -> &RelaxationStatistics {
        &self.statistics
    }

    pub fn enforcement_statistics(&self) -> &EnforcementStatistics {
        self.enforcement.statistics()
    }

    /// Log all statistics through the configured statistic writer.
    pub fn log_statistics(&self) {
        let logger = StatisticLogger::new("relaxation");
        self.statistics.log(logger.attach_to_prefix("engine"));
        self.enforcement
            .statistics()
            .log(logger.attach_to_prefix("enforcement"));
        self.registry
            .log_statistics(&logger.attach_to_prefix("handlers"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprKind;

    fn solution_for(relaxation: &Relaxation, values: &[f64]) -> Solution {
        let mut stored = KeyedVec::default();
        for (index, _) in relaxation.variables().variables().enumerate() {
            let _ = stored.push(values.get(index).copied().unwrap_or(0.0));
        }
        Solution::new(stored)
    }

    #[test]
    fn propagation_narrows_a_log_argument() {
        let mut relaxation = Relaxation::new();
        let w = relaxation.new_variable(-2.0, 5.0, false);
        let leaf = relaxation.graph_mut().variable(w);
        let log = relaxation
            .graph_mut()
            .create(ExprKind::Logarithm, vec![leaf]);
        let _ = relaxation.add_constraint(log, f64::NEG_INFINITY, 5.0_f64.ln());

        let outcome = relaxation.propagate().expect("pool is large enough");
        assert_eq!(outcome, PropagationOutcome::Feasible);
        let bounds = relaxation.variables().bounds(w);
        assert!(bounds.lower() >= 0.0);
        assert!(bounds.upper() <= 5.0);
    }

    #[test]
    fn an_impossible_constraint_is_reported_infeasible() {
        let mut relaxation = Relaxation::new();
        let w = relaxation.new_variable(-2.0, -1.0, false);
        let leaf = relaxation.graph_mut().variable(w);
        let log = relaxation
            .graph_mut()
            .create(ExprKind::Logarithm, vec![leaf]);
        let _ = relaxation.add_constraint(log, f64::NEG_INFINITY, 1.0);

        let outcome = relaxation.propagate().expect("pool is large enough");
        assert!(matches!(outcome, PropagationOutcome::Infeasible(_)));
        assert_eq!(relaxation.statistics().num_propagation_conflicts, 1);
    }

    #[test]
    fn separation_produces_a_cut_that_removes_the_point() {
        let mut relaxation = Relaxation::new();
        let x = relaxation.new_variable(-1.0, 2.0, false);
        let leaf = relaxation.graph_mut().variable(x);
        let square = relaxation
            .graph_mut()
            .create(ExprKind::Power { exponent: 2.0 }, vec![leaf]);
        let _ = relaxation.add_constraint(square, f64::NEG_INFINITY, 2.0);
        let _ = relaxation.propagate().expect("pool is large enough");

        // The square got a relaxation variable during startup.
        let aux = relaxation.graph().relaxation_variable(square).unwrap();
        assert!(relaxation.variables().is_relaxation_variable(aux));

        // x = 1 but the relaxation variable claims 0.2: the point sits below the parabola.
        let solution = solution_for(&relaxation, &[1.0, 0.2]);
        let outcome = relaxation.separate(&solution);
        assert_eq!(outcome, EnforceOutcome::Separated);

        let cuts = relaxation.take_cuts();
        assert_eq!(cuts.len(), 1);
        assert!(cuts[0].violation(&solution) > 0.0);
        assert!(relaxation.take_cuts().is_empty());
    }

    #[test]
    fn unseparable_nodes_lead_to_a_branching_decision() {
        let mut relaxation = Relaxation::new();
        let x = relaxation.new_variable(0.0, 10.0, false);
        let leaf = relaxation.graph_mut().variable(x);
        let sine = relaxation.graph_mut().create(ExprKind::Sine, vec![leaf]);
        let _ = relaxation.add_constraint(sine, f64::NEG_INFINITY, -0.9);
        let _ = relaxation.propagate().expect("pool is large enough");

        let solution = solution_for(&relaxation, &[1.0, -0.9]);
        let outcome = relaxation.separate(&solution);
        assert_eq!(outcome, EnforceOutcome::Branched);

        let decision = relaxation
            .select_branching(&solution)
            .expect("the sine registered a candidate");
        assert_eq!(decision.variable, x);
        let bounds = relaxation.variables().bounds(x);
        assert!(bounds.contains(decision.reference));
    }

    #[test]
    fn enforce_degrades_to_branching_on_a_violated_linear_constraint() {
        let mut relaxation = Relaxation::new();
        let x = relaxation.new_variable(0.0, 3.0, false);
        let y = relaxation.new_variable(0.0, 3.0, false);
        let leaf_x = relaxation.graph_mut().variable(x);
        let leaf_y = relaxation.graph_mut().variable(y);
        let sum = relaxation.graph_mut().create(
            ExprKind::Sum {
                coefficients: vec![1.0, 1.0],
                constant: 0.0,
            },
            vec![leaf_x, leaf_y],
        );
        let _ = relaxation.add_constraint(sum, f64::NEG_INFINITY, 3.0);
        let _ = relaxation.propagate().expect("pool is large enough");

        // The sum's relaxation variable agrees with its value, so no node is violated; the
        // constraint itself still is.
        let aux = relaxation.graph().relaxation_variable(sum).unwrap();
        let mut solution = solution_for(&relaxation, &[2.0, 2.0]);
        solution.set_value(aux, 4.0);

        let outcome = relaxation.enforce(&solution);
        assert_eq!(outcome, EnforceOutcome::Branched);
        let decision = relaxation.select_branching(&solution);
        assert!(decision.is_some());
    }

    #[test]
    fn removing_a_constraint_releases_its_expression() {
        let mut relaxation = Relaxation::new();
        let x = relaxation.new_variable(0.0, 1.0, false);
        let leaf = relaxation.graph_mut().variable(x);
        let exp = relaxation
            .graph_mut()
            .create(ExprKind::Exponential, vec![leaf]);
        let constraint = relaxation.add_constraint(exp, f64::NEG_INFINITY, 2.0);
        // The facade holds the only ownership of the exponential.
        relaxation.graph_mut().release(leaf);

        assert_eq!(relaxation.graph().num_nodes(), 2);
        relaxation.remove_constraint(constraint);
        assert_eq!(relaxation.graph().num_nodes(), 0);
    }

    #[test]
    fn facade_counters_track_the_calls() {
        let mut relaxation = Relaxation::new();
        let x = relaxation.new_variable(-1.0, 2.0, false);
        let leaf = relaxation.graph_mut().variable(x);
        let square = relaxation
            .graph_mut()
            .create(ExprKind::Power { exponent: 2.0 }, vec![leaf]);
        let _ = relaxation.add_constraint(square, f64::NEG_INFINITY, 4.0);
        let _ = relaxation.propagate().expect("pool is large enough");
        assert_eq!(relaxation.statistics().num_propagation_calls, 1);

        let solution = solution_for(&relaxation, &[1.0, 0.2]);
        let _ = relaxation.enforce(&solution);
        assert_eq!(relaxation.statistics().num_enforce_calls, 1);
        assert_eq!(relaxation.enforcement_statistics().num_rounds, 1);
        assert_eq!(relaxation.enforcement_statistics().num_cuts_added, 1);
        let average: crate::statistics::CumulativeMovingAverage =
            relaxation.enforcement_statistics().average_cut_violation;
        assert!(average.value() > 0.0);
    }
}
