use std::fmt::Debug;

use downcast_rs::Downcast;
use downcast_rs::impl_downcast;
use enumset::EnumSet;
use enumset::EnumSetType;

use crate::api::ConstraintId;
use crate::basic_types::Interval;
use crate::basic_types::Solution;
use crate::containers::StorageKey;
use crate::enforce::EnforceContext;
use crate::enforce::EnforceOutcome;
use crate::expr::ExpressionGraph;
use crate::expr::NodeId;
use crate::propagation::PropagationStatus;
use crate::propagation::ReverseContext;
use crate::variables::VarId;
use crate::variables::VariableStore;

/// The capabilities a nonlinear handler can take responsibility for on a node.
///
/// `SeparateAbove` is required when the node is locked positive (the node value must not exceed
/// its relaxation variable); cuts for that side underestimate the node. `SeparateBelow` is the
/// mirror image. `Activity` enrolls the node's handler in interval propagation.
#[derive(Debug, EnumSetType)]
pub enum Capability {
    Activity,
    SeparateBelow,
    SeparateAbove,
}

/// Identifier of a handler in the [`super::HandlerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

impl StorageKey for HandlerId {
    fn index(&self) -> usize {
        self.0 as usize
    }

    fn create_from_index(index: usize) -> Self {
        HandlerId(index as u32)
    }
}

// Handler-private per-node detection data is opaque to the engine; the owning handler downcasts
// it back to its concrete type in later callbacks.
impl_downcast!(NlHandlerExprData);

/// Private data a handler attaches to a node during detection.
pub trait NlHandlerExprData: Downcast + Debug {}

/// What a handler claims during detection.
#[derive(Debug)]
pub struct HandlerClaim {
    /// The capabilities the handler takes on; trimmed by the detector to the still-unclaimed
    /// remainder (first claimant wins).
    pub claimed: EnumSet<Capability>,
    pub data: Option<Box<dyn NlHandlerExprData>>,
}

/// A linear estimator `constant + sum_i terms[i].1 * terms[i].0` of a node over the current
/// activities: an underestimator when produced for the separate-above side, an overestimator for
/// separate-below.
#[derive(Debug, Clone)]
pub struct Estimator {
    pub terms: Vec<(VarId, f64)>,
    pub constant: f64,
}

impl Estimator {
    pub fn value_at(&self, solution: &Solution) -> f64 {
        self.constant
            + self
                .terms
                .iter()
                .map(|(variable, coefficient)| coefficient * solution.value(*variable))
                .sum::<f64>()
    }
}

/// Result of an estimation request.
#[derive(Debug)]
pub enum EstimateOutcome {
    Found(Estimator),
    /// The handler cannot separate further without a tighter bound on these nodes; they become
    /// branching candidates.
    BranchOn(Vec<NodeId>),
    DidNotFind,
}

/// The participation of one handler on one node.
///
/// Records are either wholly absent (the node has not been detected) or together cover every
/// capability the node requires exactly once.
#[derive(Debug)]
pub struct EnforcementRecord {
    pub(crate) handler: HandlerId,
    pub(crate) data: Option<Box<dyn NlHandlerExprData>>,
    pub(crate) capabilities: EnumSet<Capability>,
    /// Cached auxiliary value from the last enforcement evaluation; `None` is invalid.
    pub(crate) aux_value: Option<f64>,
    pub(crate) separation_initialised: bool,
    /// The enforcement round in which this record last produced a result.
    pub(crate) last_result_round: Option<u64>,
}

impl EnforcementRecord {
    pub(crate) fn new(
        handler: HandlerId,
        capabilities: EnumSet<Capability>,
        data: Option<Box<dyn NlHandlerExprData>>,
    ) -> EnforcementRecord {
        EnforcementRecord {
            handler,
            data,
            capabilities,
            aux_value: None,
            separation_initialised: false,
            last_result_round: None,
        }
    }
}

/// A pluggable strategy for bounding, separating, or propagating through a family of expression
/// shapes.
///
/// This is the engine's open extension point, dispatched through trait objects, in contrast to
/// the closed `match`-based dispatch over [`crate::expr::ExprKind`]. Handlers are stateless
/// between calls (per-node state goes into [`NlHandlerExprData`]); the engine times and counts
/// every callback for statistics.
pub trait NonlinearHandler: Debug {
    fn name(&self) -> &str;

    /// Priority during detection; higher priorities are asked first.
    fn detection_priority(&self) -> i32;

    /// Priority during enforcement; higher priorities are tried first on a violated node.
    fn enforcement_priority(&self) -> i32;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Decide which of the still-unclaimed `required` capabilities this handler takes on for
    /// `node`, optionally attaching private data. `None` declines the node entirely.
    fn detect(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        node: NodeId,
        constraint: Option<ConstraintId>,
        required: EnumSet<Capability>,
    ) -> Option<HandlerClaim>;

    /// The handler's own belief of the node's value at `solution`: evaluated from the immediate
    /// children's (auxiliary) variable values, not from the original variables.
    fn eval_aux(
        &self,
        graph: &ExpressionGraph,
        variables: &VariableStore,
        node: NodeId,
        data: Option<&dyn NlHandlerExprData>,
        solution: &Solution,
    ) -> Option<f64>;

    /// An interval enclosure of the node from the children's activities; `None` defers to the
    /// node's own kind rule.
    fn interval_evaluate(
        &self,
        _graph: &ExpressionGraph,
        _variables: &VariableStore,
        _node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
        _child_activities: &[Interval],
    ) -> Option<Interval> {
        None
    }

    /// Tighten the children of `node` from `bounds` on the node itself, by enqueueing them
    /// through the context.
    fn reverse_propagate(
        &self,
        _ctx: &mut ReverseContext<'_>,
        _node: NodeId,
        _bounds: Interval,
        _data: Option<&dyn NlHandlerExprData>,
    ) -> PropagationStatus {
        Ok(())
    }

    /// Produce a linear estimator of `node` at `solution`: an underestimator when
    /// `overestimate` is false, an overestimator otherwise.
    fn estimate(
        &self,
        _graph: &ExpressionGraph,
        _variables: &VariableStore,
        _node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
        _solution: &Solution,
        _overestimate: bool,
    ) -> EstimateOutcome {
        EstimateOutcome::DidNotFind
    }

    /// Direct enforcement of a violated node: may add a cut, tighten a bound, or register
    /// branching candidates through the context. The default defers to estimation.
    fn enforce(
        &self,
        _ctx: &mut EnforceContext<'_>,
        _node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
    ) -> EnforceOutcome {
        EnforceOutcome::DidNotFind
    }

    /// Called once per node before the first separation round.
    fn init_separation(
        &self,
        _graph: &ExpressionGraph,
        _variables: &VariableStore,
        _node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
    ) {
    }

    /// Called when separation ends for a node that was initialised.
    fn exit_separation(
        &self,
        _graph: &ExpressionGraph,
        _variables: &VariableStore,
        _node: NodeId,
        _data: Option<&dyn NlHandlerExprData>,
    ) {
    }
}
