//! The simplification half of canonicalization: constant folding, sum and product flattening,
//! like-term merging, power collapses, and sorting of commutative children by the documented
//! total order. The common-subexpression merge lives in the cse module; together they establish
//! the normal form the rest of the engine relies on.

use log::debug;

use super::graph::ExpressionGraph;
use super::graph::NodeId;
use super::kind::ExprKind;
use crate::basic_types::interval::is_integral;
use crate::containers::HashMap;

/// Simplify the subgraphs under `roots` bottom-up, updating the roots in place. Returns the
/// number of nodes that were replaced by a simpler equivalent.
pub(crate) fn simplify_roots(graph: &mut ExpressionGraph, roots: &mut [NodeId]) -> u32 {
    let mut pass = SimplifyPass {
        graph,
        mapping: HashMap::default(),
        pass_owned: Vec::new(),
        replacements: 0,
    };
    for root in roots.iter() {
        pass.run(*root);
    }
    // Re-point the roots before the pass gives up its ownership, so a mapped node that several
    // roots share stays alive throughout.
    for root in roots.iter_mut() {
        if let Some(&mapped) = pass.mapping.get(root) {
            if mapped != *root {
                pass.graph.capture(mapped);
                pass.graph.release(*root);
                *root = mapped;
            }
        }
    }
    let replacements = pass.replacements;
    for node in std::mem::take(&mut pass.pass_owned) {
        pass.graph.release(node);
    }
    if replacements > 0 {
        debug!("simplification replaced {replacements} nodes");
    }
    replacements
}

struct SimplifyPass<'a> {
    graph: &'a mut ExpressionGraph,
    /// Original node to its canonical equivalent (identity for already-canonical nodes).
    mapping: HashMap<NodeId, NodeId>,
    /// Nodes the pass holds one ownership of, released when the pass ends.
    pass_owned: Vec<NodeId>,
    replacements: u32,
}

impl SimplifyPass<'_> {
    fn run(&mut self, root: NodeId) {
        for node in self.graph.post_order(root) {
            if self.mapping.contains_key(&node) {
                continue;
            }
            let simplified = self.simplify_node(node);
            if simplified != node {
                self.replacements += 1;
            }
            let _ = self.mapping.insert(node, simplified);
        }
    }

    fn mapped_children(&self, node: NodeId) -> Vec<NodeId> {
        self.graph
            .children(node)
            .iter()
            .map(|child| *self.mapping.get(child).unwrap_or(child))
            .collect()
    }

    /// Build a node and take pass ownership of it.
    fn make(&mut self, kind: ExprKind, children: Vec<NodeId>) -> NodeId {
        let node = self.graph.create(kind, children);
        self.pass_owned.push(node);
        node
    }

    /// Reuse an existing node as a simplification result, taking pass ownership.
    fn reuse(&mut self, node: NodeId) -> NodeId {
        self.graph.capture(node);
        self.pass_owned.push(node);
        node
    }

    /// Map `node` to itself when the mapped children and local rules change nothing, otherwise
    /// to a freshly built canonical equivalent.
    fn simplify_node(&mut self, node: NodeId) -> NodeId {
        let kind = self.graph.kind(node).clone();
        let children = self.mapped_children(node);

        // Constant folding applies uniformly when every child is a constant.
        if !children.is_empty()
            && children
                .iter()
                .all(|&child| matches!(self.graph.kind(child), ExprKind::Constant(_)))
        {
            let child_values: Vec<f64> = children
                .iter()
                .map(|&child| match self.graph.kind(child) {
                    ExprKind::Constant(value) => *value,
                    _ => unreachable!("all children are constants"),
                })
                .collect();
            if let Some(value) = kind.evaluate(&child_values) {
                return self.make(ExprKind::Constant(value), Vec::new());
            }
        }

        match kind {
            ExprKind::Variable(_) | ExprKind::Constant(_) => node,
            ExprKind::Sum {
                coefficients,
                constant,
            } => self.simplify_sum(node, &coefficients, constant, &children),
            ExprKind::Product { coefficient } => {
                self.simplify_product(node, coefficient, &children)
            }
            ExprKind::Power { exponent } => self.simplify_power(node, exponent, children[0]),
            ExprKind::SignedPower { exponent } => {
                if exponent == 1.0 {
                    return self.reuse(children[0]);
                }
                self.keep_or_rebuild(node, ExprKind::SignedPower { exponent }, children)
            }
            other => self.keep_or_rebuild(node, other, children),
        }
    }

    fn simplify_sum(
        &mut self,
        node: NodeId,
        coefficients: &[f64],
        mut constant: f64,
        children: &[NodeId],
    ) -> NodeId {
        let mut terms: Vec<(NodeId, f64)> = Vec::new();
        for (&child, &coefficient) in children.iter().zip(coefficients) {
            if coefficient == 0.0 {
                continue;
            }
            match self.graph.kind(child).clone() {
                ExprKind::Constant(value) => constant += coefficient * value,
                ExprKind::Sum {
                    coefficients: inner_coefficients,
                    constant: inner_constant,
                } => {
                    constant += coefficient * inner_constant;
                    let inner_children = self.graph.children(child).to_vec();
                    for (inner_child, inner_coefficient) in
                        inner_children.into_iter().zip(inner_coefficients)
                    {
                        terms.push((inner_child, coefficient * inner_coefficient));
                    }
                }
                _ => terms.push((child, coefficient)),
            }
        }

        terms.sort_by(|(a, _), (b, _)| self.graph.compare_nodes(*a, *b));
        // Merge structurally equal children by summing their coefficients.
        let mut merged: Vec<(NodeId, f64)> = Vec::new();
        for (child, coefficient) in terms {
            if let Some((last, last_coefficient)) = merged.last_mut() {
                if self.graph.nodes_equal(*last, child) {
                    *last_coefficient += coefficient;
                    continue;
                }
            }
            merged.push((child, coefficient));
        }
        merged.retain(|(_, coefficient)| *coefficient != 0.0);

        if merged.is_empty() {
            return self.make(ExprKind::Constant(constant), Vec::new());
        }
        if merged.len() == 1 && merged[0].1 == 1.0 && constant == 0.0 {
            return self.reuse(merged[0].0);
        }
        let (new_children, new_coefficients): (Vec<NodeId>, Vec<f64>) =
            merged.into_iter().unzip();
        self.keep_or_rebuild(
            node,
            ExprKind::Sum {
                coefficients: new_coefficients,
                constant,
            },
            new_children,
        )
    }

    fn simplify_product(
        &mut self,
        node: NodeId,
        mut coefficient: f64,
        children: &[NodeId],
    ) -> NodeId {
        let mut factors: Vec<NodeId> = Vec::new();
        for &child in children {
            match self.graph.kind(child).clone() {
                ExprKind::Constant(value) => coefficient *= value,
                ExprKind::Product {
                    coefficient: inner_coefficient,
                } => {
                    coefficient *= inner_coefficient;
                    factors.extend(self.graph.children(child).iter().copied());
                }
                _ => factors.push(child),
            }
        }
        if coefficient == 0.0 {
            return self.make(ExprKind::Constant(0.0), Vec::new());
        }

        factors.sort_by(|a, b| self.graph.compare_nodes(*a, *b));
        // Collapse runs of structurally equal factors into powers.
        let mut collapsed: Vec<NodeId> = Vec::new();
        let mut index = 0;
        while index < factors.len() {
            let mut run = 1;
            while index + run < factors.len()
                && self.graph.nodes_equal(factors[index], factors[index + run])
            {
                run += 1;
            }
            if run == 1 {
                collapsed.push(factors[index]);
            } else {
                let power = self.make(
                    ExprKind::Power {
                        exponent: run as f64,
                    },
                    vec![factors[index]],
                );
                collapsed.push(power);
            }
            index += run;
        }
        // Collapsing runs into powers can break the sort order (powers rank before variables).
        collapsed.sort_by(|a, b| self.graph.compare_nodes(*a, *b));

        if collapsed.is_empty() {
            return self.make(ExprKind::Constant(coefficient), Vec::new());
        }
        if collapsed.len() == 1 {
            if coefficient == 1.0 {
                return self.reuse(collapsed[0]);
            }
            return self.make(
                ExprKind::Sum {
                    coefficients: vec![coefficient],
                    constant: 0.0,
                },
                collapsed,
            );
        }
        self.keep_or_rebuild(node, ExprKind::Product { coefficient }, collapsed)
    }

    fn simplify_power(&mut self, node: NodeId, exponent: f64, child: NodeId) -> NodeId {
        if exponent == 0.0 {
            return self.make(ExprKind::Constant(1.0), Vec::new());
        }
        if exponent == 1.0 {
            return self.reuse(child);
        }
        // (x^a)^b collapses only for integer exponents, where it is unconditionally valid.
        if let ExprKind::Power {
            exponent: inner_exponent,
        } = *self.graph.kind(child)
        {
            if is_integral(exponent) && is_integral(inner_exponent) {
                let grandchild = self.graph.children(child)[0];
                return self.make(
                    ExprKind::Power {
                        exponent: exponent * inner_exponent,
                    },
                    vec![grandchild],
                );
            }
        }
        self.keep_or_rebuild(node, ExprKind::Power { exponent }, vec![child])
    }

    /// Keep the original node if the canonical kind and children are unchanged, otherwise build
    /// the replacement.
    fn keep_or_rebuild(&mut self, node: NodeId, kind: ExprKind, children: Vec<NodeId>) -> NodeId {
        if *self.graph.kind(node) == kind && self.graph.children(node) == children.as_slice() {
            return node;
        }
        self.make(kind, children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableStore;

    fn setup(n: usize) -> (ExpressionGraph, VariableStore, Vec<NodeId>) {
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
    fn constants_fold_through_any_kind() {
        let (mut graph, _variables, _nodes) = setup(0);
        let two = graph.constant(2.0);
        let exponential = graph.create(ExprKind::Exponential, vec![two]);
        let mut roots = [exponential];
        let replacements = simplify_roots(&mut graph, &mut roots);
        assert!(replacements > 0);
        match graph.kind(roots[0]) {
            ExprKind::Constant(value) => assert!((value - 2.0_f64.exp()).abs() < 1e-12),
            other => panic!("expected a constant, got {other:?}"),
        }
    }

    #[test]
    fn repeated_product_factors_collapse_into_a_power() {
        let (mut graph, _variables, nodes) = setup(1);
        let x = nodes[0];
        let product = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, x]);
        let mut roots = [product];
        let _ = simplify_roots(&mut graph, &mut roots);
        match graph.kind(roots[0]) {
            ExprKind::Power { exponent } => assert_eq!(*exponent, 2.0),
            other => panic!("expected a power, got {other:?}"),
        }
        assert_eq!(graph.children(roots[0]), &[x]);
    }

    #[test]
    fn nested_sums_flatten_and_merge_like_terms() {
        let (mut graph, _variables, nodes) = setup(2);
        let (x, y) = (nodes[0], nodes[1]);
        // 2*(x + y) + 3*x + 1  =>  5*x + 2*y + 1
        let inner = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 1.0],
                constant: 0.0,
            },
            vec![x, y],
        );
        let outer = graph.create(
            ExprKind::Sum {
                coefficients: vec![2.0, 3.0],
                constant: 1.0,
            },
            vec![inner, x],
        );
        let mut roots = [outer];
        let _ = simplify_roots(&mut graph, &mut roots);
        let ExprKind::Sum {
            coefficients,
            constant,
        } = graph.kind(roots[0]).clone()
        else {
            panic!("expected a sum");
        };
        assert_eq!(constant, 1.0);
        assert_eq!(graph.children(roots[0]), &[x, y]);
        assert_eq!(coefficients, vec![5.0, 2.0]);
    }

    #[test]
    fn trivial_powers_disappear() {
        let (mut graph, _variables, nodes) = setup(1);
        let x = nodes[0];
        let identity = graph.create(ExprKind::Power { exponent: 1.0 }, vec![x]);
        let mut roots = [identity];
        let _ = simplify_roots(&mut graph, &mut roots);
        assert_eq!(roots[0], x);
    }

    #[test]
    fn integer_power_of_power_collapses() {
        let (mut graph, _variables, nodes) = setup(1);
        let x = nodes[0];
        let squared = graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        let fourth = graph.create(ExprKind::Power { exponent: 2.0 }, vec![squared]);
        let mut roots = [fourth];
        let _ = simplify_roots(&mut graph, &mut roots);
        match graph.kind(roots[0]) {
            ExprKind::Power { exponent } => assert_eq!(*exponent, 4.0),
            other => panic!("expected a power, got {other:?}"),
        }
        assert_eq!(graph.children(roots[0]), &[x]);
    }

    #[test]
    fn simplification_is_idempotent() {
        let (mut graph, _variables, nodes) = setup(2);
        let (x, y) = (nodes[0], nodes[1]);
        let product = graph.create(ExprKind::Product { coefficient: 2.0 }, vec![y, x, x]);
        let mut roots = [product];
        let first = simplify_roots(&mut graph, &mut roots);
        assert!(first > 0);
        let second = simplify_roots(&mut graph, &mut roots);
        assert_eq!(second, 0);
    }
}
