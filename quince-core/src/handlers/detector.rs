use enumset::EnumSet;
use itertools::Itertools;
use log::debug;
use log::trace;

use super::handler::Capability;
use super::handler::EnforcementRecord;
use super::registry::HandlerCallback;
use super::registry::HandlerRegistry;
use crate::api::ConstraintId;
use crate::expr::ExprKind;
use crate::expr::ExpressionGraph;
use crate::quince_assert_simple;
use crate::variables::VariableStore;
use crate::expr::NodeId;

/// Outcome of the detection pass for one node.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DetectionResult {
    /// Whether some handler claimed a separation capability, which triggers the lazy creation
    /// of a relaxation variable at solve start.
    pub(crate) needs_relaxation_variable: bool,
    /// Whether some handler claimed the activity capability, enrolling the node in propagation.
    pub(crate) participates_in_propagation: bool,
}

/// The required capability set of a node follows from usage: separate-above if the node is
/// locked positive (it must not exceed its relaxation variable), separate-below symmetrically,
/// and activity whenever the node participates in propagation at all.
pub(crate) fn required_capabilities(
    graph: &ExpressionGraph,
    node: NodeId,
) -> EnumSet<Capability> {
    let mut required = EnumSet::empty();
    let positive = graph.node(node).positive_locks;
    let negative = graph.node(node).negative_locks;
    if positive > 0 {
        required |= Capability::SeparateAbove;
    }
    if negative > 0 {
        required |= Capability::SeparateBelow;
    }
    if positive + negative > 0 {
        required |= Capability::Activity;
    }
    required
}

/// Run detection for `node`: ask each enabled handler, in descending detection priority, which
/// of the still-unclaimed required capabilities it takes on. The first claimant of a capability
/// wins; claims are trimmed to the unclaimed remainder. Once all handlers have been asked every
/// required capability must be covered, except during engine bootstrap where partial coverage is
/// tolerated.
///
/// Detection runs once per node: a node that already carries records is left untouched.
pub(crate) fn detect_node(
    graph: &mut ExpressionGraph,
    variables: &VariableStore,
    registry: &mut HandlerRegistry,
    node: NodeId,
    constraint: Option<ConstraintId>,
    bootstrap: bool,
) -> DetectionResult {
    if matches!(
        graph.kind(node),
        ExprKind::Variable(_) | ExprKind::Constant(_)
    ) {
        return DetectionResult::default();
    }
    if !graph.node(node).records.is_empty() {
        return summarize(graph, node);
    }
    let required = required_capabilities(graph, node);
    if required.is_empty() {
        return DetectionResult::default();
    }

    let mut claimed: EnumSet<Capability> = EnumSet::empty();
    let mut records: Vec<EnforcementRecord> = Vec::new();
    for id in registry.handler_ids().collect::<Vec<_>>() {
        if claimed.is_superset(required) {
            break;
        }
        if !registry.handler(id).is_enabled() {
            continue;
        }
        let unclaimed = required - claimed;
        let claim = registry.timed(id, HandlerCallback::Detect, |handler| {
            handler.detect(graph, variables, node, constraint, unclaimed)
        });
        let Some(claim) = claim else {
            continue;
        };
        // First claimant wins: trim to what is still unclaimed.
        let granted = claim.claimed & unclaimed;
        if granted.is_empty() {
            continue;
        }
        trace!(
            "handler {} claims {granted:?} on node {node}",
            registry.handler(id).name()
        );
        claimed |= granted;
        records.push(EnforcementRecord::new(id, granted, claim.data));
    }

    if !bootstrap {
        quince_assert_simple!(
            claimed.is_superset(required),
            "detection left required capabilities {:?} unclaimed on node {node}",
            required - claimed
        );
    } else if !claimed.is_superset(required) {
        debug!(
            "bootstrap detection left {:?} unclaimed on node {node}",
            required - claimed
        );
    }

    // Strongest handlers first during enforcement: sort by enforcement priority, ties broken by
    // detection priority, then name.
    let records = records
        .into_iter()
        .sorted_by(|a, b| {
            let handler_a = registry.handler(a.handler);
            let handler_b = registry.handler(b.handler);
            handler_b
                .enforcement_priority()
                .cmp(&handler_a.enforcement_priority())
                .then_with(|| {
                    handler_b
                        .detection_priority()
                        .cmp(&handler_a.detection_priority())
                })
                .then_with(|| handler_a.name().cmp(handler_b.name()))
        })
        .collect();
    graph.node_mut(node).records = records;
    summarize(graph, node)
}

fn summarize(graph: &ExpressionGraph, node: NodeId) -> DetectionResult {
    let mut result = DetectionResult::default();
    for record in &graph.node(node).records {
        if record
            .capabilities
            .contains(Capability::SeparateAbove)
            || record.capabilities.contains(Capability::SeparateBelow)
        {
            result.needs_relaxation_variable = true;
        }
        if record.capabilities.contains(Capability::Activity) {
            result.participates_in_propagation = true;
        }
    }
    result
}
