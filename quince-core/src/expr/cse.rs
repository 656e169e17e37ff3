//! The common-subexpression merge half of canonicalization: every node is hashed bottom-up and
//! looked up by structural equality; the first node of an equality class is kept and every later
//! structurally identical node is replaced by it wherever it appears as a child or constraint
//! root.

use std::hash::Hash;
use std::hash::Hasher;

use fnv::FnvHasher;
use log::debug;

use super::graph::ExpressionGraph;
use super::graph::NodeId;
use crate::containers::HashMap;

/// Merge structurally identical subexpressions under `roots`, updating the roots in place.
/// Returns the number of replacements performed.
pub(crate) fn merge_subexpressions(graph: &mut ExpressionGraph, roots: &mut [NodeId]) -> u32 {
    let mut replacements = 0;
    // Structural hash to the equality classes seen so far (buckets resolve collisions).
    let mut buckets: HashMap<u64, Vec<NodeId>> = HashMap::default();
    // Duplicate to kept representative.
    let mut kept: HashMap<NodeId, NodeId> = HashMap::default();

    for root in roots.iter() {
        for node in graph.post_order(*root) {
            if kept.contains_key(&node) {
                continue;
            }
            // Children were processed first; re-point any that were duplicates. After this the
            // node's identity is determined by its kind payload and child ids alone.
            let children = graph.children(node).to_vec();
            for (index, child) in children.into_iter().enumerate() {
                if let Some(&representative) = kept.get(&child) {
                    if representative != child {
                        graph.replace_child(node, index, representative);
                        replacements += 1;
                    }
                }
            }

            let hash = structural_hash(graph, node);
            let bucket = buckets.entry(hash).or_default();
            let representative = bucket
                .iter()
                .copied()
                .find(|&candidate| graph.nodes_equal(candidate, node));
            match representative {
                Some(representative) => {
                    let _ = kept.insert(node, representative);
                }
                None => {
                    bucket.push(node);
                    let _ = kept.insert(node, node);
                }
            }
        }
    }

    for root in roots.iter_mut() {
        if let Some(&representative) = kept.get(root) {
            if representative != *root {
                graph.capture(representative);
                graph.release(*root);
                *root = representative;
                replacements += 1;
            }
        }
    }
    if replacements > 0 {
        debug!("common-subexpression merge performed {replacements} replacements");
    }
    replacements
}

/// Kind-specific structural hash mixed with the (already canonical) child ids.
fn structural_hash(graph: &ExpressionGraph, node: NodeId) -> u64 {
    let mut hasher = FnvHasher::default();
    graph.kind(node).hash_payload(&mut hasher);
    for child in graph.children(node) {
        child.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprKind;
    use crate::variables::VariableStore;

    #[test]
    fn duplicate_squares_are_merged() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let first = graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        let second = graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 1.0],
                constant: 0.0,
            },
            vec![first, second],
        );
        // Drop the construction ownerships so the duplicate can actually be freed on merge.
        graph.release(first);
        graph.release(second);

        let mut roots = [sum];
        let replacements = merge_subexpressions(&mut graph, &mut roots);
        assert_eq!(replacements, 1);
        let children = graph.children(roots[0]).to_vec();
        assert_eq!(children[0], children[1]);

        // A second pass finds nothing left to merge.
        assert_eq!(merge_subexpressions(&mut graph, &mut roots), 0);
    }

    #[test]
    fn merging_respects_payload_differences() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let square = graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        let cube = graph.create(ExprKind::Power { exponent: 3.0 }, vec![x]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 1.0],
                constant: 0.0,
            },
            vec![square, cube],
        );
        graph.release(square);
        graph.release(cube);

        let mut roots = [sum];
        assert_eq!(merge_subexpressions(&mut graph, &mut roots), 0);
    }

    #[test]
    fn identical_roots_collapse_onto_one_node() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let first = graph.create(ExprKind::Exponential, vec![x]);
        let second = graph.create(ExprKind::Exponential, vec![x]);

        let mut roots = [first, second];
        let replacements = merge_subexpressions(&mut graph, &mut roots);
        assert_eq!(replacements, 1);
        assert_eq!(roots[0], roots[1]);
        assert_eq!(graph.use_count(roots[0]), 2);
    }
}
