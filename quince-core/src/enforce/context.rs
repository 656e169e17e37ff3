use super::Cut;
use super::CutError;
use super::RowPrep;
use crate::basic_types::Interval;
use crate::basic_types::Solution;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::options::EnforcementOptions;
use crate::variables::VariableStore;

/// What an enforcement attempt produced, as a join-semilattice: combined results keep the
/// strongest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnforceOutcome {
    DidNotFind,
    /// A node was registered as a branching candidate.
    Branched,
    /// A variable or node bound was tightened.
    ReducedDomain,
    /// A violated cut was found.
    Separated,
    /// The current bounds admit no solution; short-circuits everything else.
    Cutoff,
}

impl EnforceOutcome {
    pub fn join(self, other: EnforceOutcome) -> EnforceOutcome {
        self.max(other)
    }
}

/// The context handed to [`crate::handlers::NonlinearHandler::enforce`]. Cuts, bound requests,
/// and branching candidates are collected here; the enforcement loop applies them after the
/// handler returns (bound requests in particular trigger reverse propagation, which the handler
/// must not re-enter).
#[derive(Debug)]
pub struct EnforceContext<'a> {
    pub(crate) graph: &'a ExpressionGraph,
    pub(crate) variables: &'a VariableStore,
    pub(crate) solution: &'a Solution,
    pub(crate) options: &'a EnforcementOptions,
    pub(crate) allow_weak_cuts: bool,
    pub(crate) cuts: Vec<Cut>,
    pub(crate) bound_requests: Vec<(NodeId, Interval)>,
    pub(crate) branch_requests: Vec<NodeId>,
}

impl<'a> EnforceContext<'a> {
    pub(crate) fn new(
        graph: &'a ExpressionGraph,
        variables: &'a VariableStore,
        solution: &'a Solution,
        options: &'a EnforcementOptions,
        allow_weak_cuts: bool,
    ) -> EnforceContext<'a> {
        EnforceContext {
            graph,
            variables,
            solution,
            options,
            allow_weak_cuts,
            cuts: Vec::new(),
            bound_requests: Vec::new(),
            branch_requests: Vec::new(),
        }
    }

    pub fn graph(&self) -> &ExpressionGraph {
        self.graph
    }

    pub fn variables(&self) -> &VariableStore {
        self.variables
    }

    pub fn solution(&self) -> &Solution {
        self.solution
    }

    pub fn allow_weak_cuts(&self) -> bool {
        self.allow_weak_cuts
    }

    /// Clean up `row` and store it if it separates the current point strongly enough.
    pub fn add_cut(&mut self, row: RowPrep) -> Result<(), CutError> {
        let cut = row.cleanup(self.variables, &self.options.cuts)?;
        let violation = cut.violation(self.solution);
        let threshold = if self.allow_weak_cuts {
            self.options.min_weak_cut_violation
        } else {
            self.options.min_cut_violation
        };
        if violation < threshold {
            return Err(CutError::InsufficientViolation(violation));
        }
        self.cuts.push(cut);
        Ok(())
    }

    /// Request `bounds` on `node`; reverse-propagated by the loop after the handler returns.
    pub fn request_bounds(&mut self, node: NodeId, bounds: Interval) {
        self.bound_requests.push((node, bounds));
    }

    /// Register `node` as a candidate the branching selector should consider.
    pub fn register_branch_candidate(&mut self, node: NodeId) {
        self.branch_requests.push(node);
    }
}
