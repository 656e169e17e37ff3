use std::cmp::Ordering;
use std::fmt::Display;

use log::trace;

use super::kind::Curvature;
use super::kind::ExprKind;
use super::kind::Monotonicity;
use super::quadratic::QuadraticForm;
use crate::basic_types::Interval;
use crate::basic_types::Solution;
use crate::containers::HashMap;
use crate::containers::HashSet;
use crate::containers::KeyedVec;
use crate::containers::StorageKey;
use crate::handlers::EnforcementRecord;
use crate::quince_assert_moderate;
use crate::quince_assert_simple;
use crate::variables::VarId;
use crate::variables::VariableStore;

/// Identifier of a node in an [`ExpressionGraph`]. Stable for the lifetime of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl StorageKey for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }

    fn create_from_index(index: usize) -> Self {
        NodeId(index as u32)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Big-M metadata attached to a node: an indicator variable together with the activity the node
/// takes when the indicator is off. The engine stores and lifecycle-manages these; only
/// perspective-style handlers consume them.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorTerm {
    pub indicator: VarId,
    pub off_activity: Interval,
}

/// A node of the expression DAG.
#[derive(Debug)]
pub(crate) struct ExprNode {
    pub(crate) kind: ExprKind,
    pub(crate) children: Vec<NodeId>,
    /// Number of owners: parents, constraint roots, and transient pass/iterator captures.
    pub(crate) use_count: u32,
    /// The relaxation variable standing in for this node in the linear relaxation, created
    /// lazily at solve start when some handler claims a separation capability.
    pub(crate) relaxation_variable: Option<VarId>,
    pub(crate) activity: Interval,
    /// Version tag of the activity; compared against the store's counters for staleness.
    pub(crate) activity_tag: u64,
    /// Bounds recorded for reverse propagation, scoped to a single propagation call by
    /// `prop_bounds_tag`. Kept separate from the activity tag on purpose.
    pub(crate) prop_bounds: Interval,
    pub(crate) prop_bounds_tag: u64,
    pub(crate) in_prop_queue: bool,
    /// How many enclosing constraints require the node bounded above.
    pub(crate) positive_locks: u32,
    /// How many enclosing constraints require the node bounded below.
    pub(crate) negative_locks: u32,
    pub(crate) integral: bool,
    pub(crate) curvature: Curvature,
    /// Write-once quadratic-form cache; never invalidated while the node lives.
    pub(crate) quadratic_checked: bool,
    pub(crate) quadratic: Option<Box<QuadraticForm>>,
    pub(crate) records: Vec<EnforcementRecord>,
    pub(crate) indicator_terms: Vec<IndicatorTerm>,
    /// The globally numbered enforcement round in which this node was last processed, so shared
    /// subexpressions are not enforced twice in one round.
    pub(crate) last_enforce_round: Option<u64>,
    pub(crate) branch_score: f64,
    pub(crate) branch_score_count: u32,
}

impl ExprNode {
    fn new(kind: ExprKind, children: Vec<NodeId>) -> ExprNode {
        ExprNode {
            kind,
            children,
            use_count: 1,
            relaxation_variable: None,
            activity: Interval::entire(),
            activity_tag: 0,
            prop_bounds: Interval::entire(),
            prop_bounds_tag: 0,
            in_prop_queue: false,
            positive_locks: 0,
            negative_locks: 0,
            integral: false,
            curvature: Curvature::Unknown,
            quadratic_checked: false,
            quadratic: None,
            records: Vec::new(),
            indicator_terms: Vec::new(),
            last_enforce_round: None,
            branch_score: 0.0,
            branch_score_count: 0,
        }
    }
}

/// Arena-backed reference-counted DAG of expression nodes with structural sharing.
///
/// Nodes are addressed by stable [`NodeId`]s; freed slots are recycled through a free list.
/// Ownership is manual: [`ExpressionGraph::capture`] and [`ExpressionGraph::release`] maintain
/// the use counts, and releasing a node more often than it was captured is a contract violation.
/// Variable nodes are hash-consed per variable id.
#[derive(Debug, Default)]
pub struct ExpressionGraph {
    slots: KeyedVec<NodeId, Option<ExprNode>>,
    free_list: Vec<NodeId>,
    variable_nodes: HashMap<VarId, NodeId>,
}

impl ExpressionGraph {
    pub fn new() -> ExpressionGraph {
        ExpressionGraph::default()
    }

    pub(crate) fn node(&self, id: NodeId) -> &ExprNode {
        self.slots[id]
            .as_ref()
            .expect("node ids always refer to live nodes")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut ExprNode {
        self.slots[id]
            .as_mut()
            .expect("node ids always refer to live nodes")
    }

    pub fn kind(&self, id: NodeId) -> &ExprKind {
        &self.node(id).kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn use_count(&self, id: NodeId) -> u32 {
        self.node(id).use_count
    }

    pub fn activity(&self, id: NodeId) -> Interval {
        self.node(id).activity
    }

    pub fn relaxation_variable(&self, id: NodeId) -> Option<VarId> {
        self.node(id).relaxation_variable
    }

    /// The variable the node contributes to a linear row: the variable itself for variable
    /// nodes, the relaxation variable otherwise (if one exists).
    pub fn node_variable(&self, id: NodeId) -> Option<VarId> {
        match self.node(id).kind {
            ExprKind::Variable(variable) => Some(variable),
            _ => self.node(id).relaxation_variable,
        }
    }

    pub fn is_integral(&self, id: NodeId) -> bool {
        self.node(id).integral
    }

    pub fn curvature(&self, id: NodeId) -> Curvature {
        self.node(id).curvature
    }

    /// Whether `id` currently refers to a live node. Only meaningful directly after a release;
    /// freed slots are recycled by later allocations.
    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        id.index() < self.slots.len() && self.slots[id].is_some()
    }

    /// The number of live nodes (occupied slots).
    pub fn num_nodes(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .keys()
            .filter(|id| self.slots[*id].is_some())
    }

    /// Create a node of the given kind, capturing each child. The returned node has use count 1,
    /// owned by the caller.
    pub fn create(&mut self, kind: ExprKind, children: Vec<NodeId>) -> NodeId {
        if let Some(arity) = kind.arity() {
            quince_assert_simple!(
                children.len() == arity,
                "kind {} expects {arity} children",
                kind.name()
            );
        }
        if let ExprKind::Sum { coefficients, .. } = &kind {
            quince_assert_simple!(coefficients.len() == children.len());
        }
        if let ExprKind::Variable(variable) = kind {
            return self.variable(variable);
        }
        for child in &children {
            self.capture(*child);
        }
        self.allocate(ExprNode::new(kind, children))
    }

    /// The hash-consed node for `variable`, created on first use. The caller owns one capture of
    /// the returned node either way.
    pub fn variable(&mut self, variable: VarId) -> NodeId {
        if let Some(&existing) = self.variable_nodes.get(&variable) {
            self.capture(existing);
            return existing;
        }
        let id = self.allocate(ExprNode::new(ExprKind::Variable(variable), Vec::new()));
        let _ = self.variable_nodes.insert(variable, id);
        id
    }

    pub fn constant(&mut self, value: f64) -> NodeId {
        self.allocate(ExprNode::new(ExprKind::Constant(value), Vec::new()))
    }

    fn allocate(&mut self, node: ExprNode) -> NodeId {
        if let Some(id) = self.free_list.pop() {
            quince_assert_moderate!(self.slots[id].is_none());
            self.slots[id] = Some(node);
            id
        } else {
            self.slots.push(Some(node))
        }
    }

    pub fn capture(&mut self, id: NodeId) {
        self.node_mut(id).use_count += 1;
    }

    /// Give up one ownership of `id`. When a node's count reaches zero its enforcement data and
    /// payload are freed and its children released through an explicit stack (never recursion,
    /// so arbitrarily deep expressions cannot overflow the call stack), each child being
    /// physically freed only once its own count reaches zero.
    pub fn release(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node_mut(current);
            quince_assert_simple!(
                node.use_count > 0,
                "node {current} released more often than captured"
            );
            node.use_count -= 1;
            if node.use_count > 0 {
                continue;
            }
            let node = self.slots[current]
                .take()
                .expect("the slot was just accessed");
            if let ExprKind::Variable(variable) = node.kind {
                let _ = self.variable_nodes.remove(&variable);
            }
            trace!("freeing node {current} ({})", node.kind.name());
            // Enforcement records and payload are dropped here; children follow.
            stack.extend(node.children);
            self.free_list.push(current);
        }
    }

    /// Replace the `index`-th child of `node`, capturing the new child before releasing the old
    /// one. A self-replacement is a no-op.
    pub fn replace_child(&mut self, node: NodeId, index: usize, new_child: NodeId) {
        let old_child = self.node(node).children[index];
        if old_child == new_child {
            return;
        }
        self.capture(new_child);
        self.node_mut(node).children[index] = new_child;
        self.release(old_child);
    }

    /// Evaluate `root` at `solution`. `None` is a domain error somewhere in the subgraph,
    /// propagated explicitly through sums and products.
    pub fn evaluate(&self, root: NodeId, solution: &Solution) -> Option<f64> {
        let mut values: HashMap<NodeId, Option<f64>> = HashMap::default();
        let mut stack = vec![(root, false)];
        while let Some((current, expanded)) = stack.pop() {
            if values.contains_key(&current) {
                continue;
            }
            if !expanded {
                stack.push((current, true));
                for &child in &self.node(current).children {
                    stack.push((child, false));
                }
                continue;
            }
            let node = self.node(current);
            let value = match node.kind {
                ExprKind::Variable(variable) => Some(solution.value(variable)),
                ExprKind::Constant(value) => Some(value),
                _ => {
                    let child_values: Option<Vec<f64>> = node
                        .children
                        .iter()
                        .map(|child| values[child])
                        .collect();
                    child_values.and_then(|child_values| node.kind.evaluate(&child_values))
                }
            };
            let _ = values.insert(current, value);
        }
        values[&root]
    }

    /// The distinct original variables occurring under `root`, in first-visit order.
    pub fn collect_variables(&self, root: NodeId) -> Vec<VarId> {
        let mut seen_nodes: HashSet<NodeId> = HashSet::default();
        let mut seen_variables: HashSet<VarId> = HashSet::default();
        let mut variables = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if !seen_nodes.insert(current) {
                continue;
            }
            if let ExprKind::Variable(variable) = self.node(current).kind {
                if seen_variables.insert(variable) {
                    variables.push(variable);
                }
            }
            stack.extend(self.node(current).children.iter().copied());
        }
        variables
    }

    /// Structural comparison implementing the documented total order: constants < sums <
    /// products < powers < variables < remaining kinds by name; within a kind, lexicographic
    /// comparison of children, then of the payload. Iterative, like [`Self::release`]; a
    /// node's payload is compared only after its entire child subtree.
    pub fn compare_nodes(&self, a: NodeId, b: NodeId) -> Ordering {
        enum Step {
            Pair(NodeId, NodeId),
            Payload(NodeId, NodeId),
        }

        let mut stack = vec![Step::Pair(a, b)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Pair(a, b) => {
                    if a == b {
                        continue;
                    }
                    let node_a = self.node(a);
                    let node_b = self.node(b);
                    let by_rank = node_a.kind.order_rank().cmp(&node_b.kind.order_rank());
                    if by_rank != Ordering::Equal {
                        return by_rank;
                    }
                    if node_a.kind.order_rank() == 5 {
                        let by_name = node_a.kind.name().cmp(node_b.kind.name());
                        if by_name != Ordering::Equal {
                            return by_name;
                        }
                    }
                    let by_len = node_a.children.len().cmp(&node_b.children.len());
                    if by_len != Ordering::Equal {
                        return by_len;
                    }
                    stack.push(Step::Payload(a, b));
                    // Reversed so the first child pair is popped, and settled, first.
                    for (&child_a, &child_b) in
                        node_a.children.iter().zip(&node_b.children).rev()
                    {
                        stack.push(Step::Pair(child_a, child_b));
                    }
                }
                Step::Payload(a, b) => {
                    let by_payload = self.node(a).kind.compare_payload(&self.node(b).kind);
                    if by_payload != Ordering::Equal {
                        return by_payload;
                    }
                }
            }
        }
        Ordering::Equal
    }

    /// Whether `a` and `b` are structurally identical: same kind and payload and pairwise equal
    /// children. Canonicalization sorts commutative children, so lexicographic equality doubles
    /// as sorted equality.
    pub fn nodes_equal(&self, a: NodeId, b: NodeId) -> bool {
        self.compare_nodes(a, b) == Ordering::Equal
    }

    /// Add (or, with negative arguments, remove) locks on `root` and propagate them to its
    /// children according to the per-kind monotonicity: an increasing child inherits the locks,
    /// a decreasing child inherits them swapped, and an unknown one inherits both directions.
    pub(crate) fn add_locks(&mut self, root: NodeId, positive: i32, negative: i32) {
        let mut stack = vec![(root, positive, negative)];
        while let Some((current, positive, negative)) = stack.pop() {
            {
                let node = self.node_mut(current);
                let new_positive = node.positive_locks as i32 + positive;
                let new_negative = node.negative_locks as i32 + negative;
                quince_assert_simple!(
                    new_positive >= 0 && new_negative >= 0,
                    "lock counts must never drop below zero"
                );
                node.positive_locks = new_positive as u32;
                node.negative_locks = new_negative as u32;
            }
            let child_intervals: Vec<Interval> = self
                .node(current)
                .children
                .iter()
                .map(|&child| self.node(child).activity)
                .collect();
            let children = self.node(current).children.clone();
            for (index, child) in children.into_iter().enumerate() {
                let (child_positive, child_negative) = match self
                    .node(current)
                    .kind
                    .child_monotonicity(index, &child_intervals)
                {
                    Monotonicity::Increasing => (positive, negative),
                    Monotonicity::Decreasing => (negative, positive),
                    Monotonicity::Unknown => (positive + negative, positive + negative),
                };
                if child_positive != 0 || child_negative != 0 {
                    stack.push((child, child_positive, child_negative));
                }
            }
        }
    }

    /// Bottom-up integrality and curvature analysis over the subgraph rooted at `root`.
    /// Run after canonicalization, before detection.
    pub(crate) fn analyze_structure(&mut self, root: NodeId, variables: &VariableStore) {
        for current in self.post_order(root) {
            let node = self.node(current);
            let child_integral: Vec<bool> = node
                .children
                .iter()
                .map(|&child| self.node(child).integral)
                .collect();
            let child_curvatures: Vec<Curvature> = node
                .children
                .iter()
                .map(|&child| self.node(child).curvature)
                .collect();
            let child_activities: Vec<Interval> = node
                .children
                .iter()
                .map(|&child| self.node(child).activity)
                .collect();
            let integral = match node.kind {
                ExprKind::Variable(variable) => variables.is_integral(variable),
                _ => node.kind.integrality(&child_integral),
            };
            let curvature = node.kind.curvature(&child_curvatures, &child_activities);
            let node = self.node_mut(current);
            node.integral = integral;
            node.curvature = curvature;
        }
    }

    /// The nodes under `root` in post order (children strictly before parents), each node once.
    ///
    /// This materializes the order into a `Vec` and is meant for passes that restructure the
    /// graph; the propagation engine uses the pooled [`super::GraphIterator`]s instead.
    pub(crate) fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::default();
        let mut stack = vec![(root, false)];
        while let Some((current, expanded)) = stack.pop() {
            if seen.contains(&current) {
                continue;
            }
            if expanded {
                let _ = seen.insert(current);
                order.push(current);
                continue;
            }
            stack.push((current, true));
            for &child in &self.node(current).children {
                stack.push((child, false));
            }
        }
        order
    }

    /// Deep-copy the subgraph rooted at `root` into `target`, preserving structural sharing.
    /// The returned node is owned by the caller.
    pub fn copy_into(&self, root: NodeId, target: &mut ExpressionGraph) -> NodeId {
        let mut mapping: HashMap<NodeId, NodeId> = HashMap::default();
        for current in self.post_order(root) {
            let node = self.node(current);
            let children: Vec<NodeId> = node.children.iter().map(|child| mapping[child]).collect();
            let copy = target.create(node.kind.clone(), children.clone());
            // `create` captured the children on behalf of the copy; drop the pass ownership of
            // each mapped child so only the parent edge remains.
            for child in children {
                target.release(child);
            }
            let _ = mapping.insert(current, copy);
        }
        mapping[&root]
    }

    pub fn set_indicator_terms(&mut self, node: NodeId, terms: Vec<IndicatorTerm>) {
        self.node_mut(node).indicator_terms = terms;
    }

    pub fn indicator_terms(&self, node: NodeId) -> &[IndicatorTerm] {
        &self.node(node).indicator_terms
    }

    pub fn clear_indicator_terms(&mut self, node: NodeId) {
        self.node_mut(node).indicator_terms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_variables(n: usize) -> (ExpressionGraph, VariableStore, Vec<NodeId>) {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let nodes = (0..n)
            .map(|_| {
                let variable = variables.new_variable(-1.0, 1.0, false);
                graph.variable(variable)
            })
            .collect();
        (graph, variables, nodes)
    }

    #[test]
    fn releasing_a_fresh_node_restores_child_use_counts() {
        let (mut graph, _variables, nodes) = graph_with_variables(2);
        let x = nodes[0];
        let y = nodes[1];
        assert_eq!(graph.use_count(x), 1);

        let product = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, y]);
        assert_eq!(graph.use_count(x), 2);
        assert_eq!(graph.use_count(y), 2);

        graph.release(product);
        assert_eq!(graph.use_count(x), 1);
        assert_eq!(graph.use_count(y), 1);
    }

    #[test]
    fn variable_nodes_are_hash_consed() {
        let (mut graph, _variables, nodes) = graph_with_variables(1);
        let node = nodes[0];
        let ExprKind::Variable(variable) = *graph.kind(node) else {
            panic!("expected a variable node");
        };
        let again = graph.variable(variable);
        assert_eq!(node, again);
        assert_eq!(graph.use_count(node), 2);
        graph.release(again);
        assert_eq!(graph.use_count(node), 1);
    }

    #[test]
    fn released_variable_slot_is_recycled() {
        let (mut graph, mut variables, nodes) = graph_with_variables(1);
        graph.release(nodes[0]);
        assert_eq!(graph.num_nodes(), 0);
        let z = variables.new_variable(0.0, 1.0, false);
        let node = graph.variable(z);
        assert_eq!(node, nodes[0]);
    }

    #[test]
    fn replace_child_is_a_noop_on_self_replacement() {
        let (mut graph, _variables, nodes) = graph_with_variables(2);
        let absolute = graph.create(ExprKind::AbsoluteValue, vec![nodes[0]]);
        graph.replace_child(absolute, 0, nodes[0]);
        assert_eq!(graph.use_count(nodes[0]), 2);

        graph.replace_child(absolute, 0, nodes[1]);
        assert_eq!(graph.use_count(nodes[0]), 1);
        assert_eq!(graph.use_count(nodes[1]), 2);
    }

    #[test]
    #[should_panic(expected = "released more often than captured")]
    fn over_release_is_a_contract_violation() {
        let (mut graph, _variables, nodes) = graph_with_variables(1);
        graph.release(nodes[0]);
        graph.release(nodes[0]);
    }

    #[test]
    fn evaluation_propagates_domain_errors() {
        let (mut graph, variables, nodes) = graph_with_variables(1);
        let log = graph.create(ExprKind::Logarithm, vec![nodes[0]]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0],
                constant: 5.0,
            },
            vec![log],
        );

        let mut values = KeyedVec::default();
        for _ in variables.variables() {
            let _ = values.push(-1.0);
        }
        let solution = Solution::new(values);
        assert_eq!(graph.evaluate(sum, &solution), None);

        let mut values = KeyedVec::default();
        for _ in variables.variables() {
            let _ = values.push(1.0);
        }
        let solution = Solution::new(values);
        assert_eq!(graph.evaluate(sum, &solution), Some(5.0));
    }

    #[test]
    fn post_order_visits_children_before_parents() {
        let (mut graph, _variables, nodes) = graph_with_variables(2);
        let product = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![nodes[0], nodes[1]]);
        let exponential = graph.create(ExprKind::Exponential, vec![product]);
        let order = graph.post_order(exponential);
        let position = |id: NodeId| order.iter().position(|&other| other == id).unwrap();
        assert!(position(nodes[0]) < position(product));
        assert!(position(nodes[1]) < position(product));
        assert!(position(product) < position(exponential));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn copy_into_preserves_structural_sharing() {
        let (mut graph, _variables, nodes) = graph_with_variables(1);
        let square = graph.create(ExprKind::Power { exponent: 2.0 }, vec![nodes[0]]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 1.0],
                constant: 0.0,
            },
            vec![square, square],
        );

        let mut target = ExpressionGraph::new();
        let copy = graph.copy_into(sum, &mut target);
        let children = target.children(copy).to_vec();
        assert_eq!(children[0], children[1]);
    }

    #[test]
    fn comparison_handles_deeply_nested_chains() {
        let (mut graph, _variables, nodes) = graph_with_variables(2);
        let depth = 100_000;
        let mut left = nodes[0];
        let mut right = nodes[0];
        for _ in 0..depth {
            left = graph.create(ExprKind::AbsoluteValue, vec![left]);
            right = graph.create(ExprKind::AbsoluteValue, vec![right]);
        }
        assert_eq!(graph.compare_nodes(left, right), Ordering::Equal);

        // A chain over a different leaf orders by the payload at the very bottom.
        let mut other = nodes[1];
        for _ in 0..depth {
            other = graph.create(ExprKind::AbsoluteValue, vec![other]);
        }
        let forward = graph.compare_nodes(left, other);
        assert_ne!(forward, Ordering::Equal);
        assert_eq!(graph.compare_nodes(other, left), forward.reverse());
    }

    #[test]
    fn locks_swap_direction_through_negative_coefficients() {
        let (mut graph, _variables, nodes) = graph_with_variables(1);
        let exponential = graph.create(ExprKind::Exponential, vec![nodes[0]]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![-1.0],
                constant: 0.0,
            },
            vec![exponential],
        );
        graph.add_locks(sum, 1, 0);
        assert_eq!(graph.node(sum).positive_locks, 1);
        assert_eq!(graph.node(exponential).negative_locks, 1);
        assert_eq!(graph.node(exponential).positive_locks, 0);
        // exp is increasing, so the variable inherits the exponential's locks unchanged.
        assert_eq!(graph.node(nodes[0]).negative_locks, 1);
    }
}
