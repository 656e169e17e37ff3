use thiserror::Error;

use super::graph::ExpressionGraph;
use super::graph::NodeId;
use crate::quince_assert_simple;

/// The fixed-capacity pool of graph iterators was exhausted; this points at runaway nesting of
/// traversals rather than a legitimately deep workload.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the graph iterator pool is exhausted (capacity {capacity})")]
pub struct ResourceExhaustion {
    pub capacity: usize,
}

#[derive(Debug)]
struct DfsEntry {
    node: NodeId,
    next_child: usize,
}

/// An explicit-position post-order traversal over the DAG.
///
/// The traversal state lives in the iterator itself, not on the call stack, so a handler
/// callback invoked mid-traversal can start a nested traversal (e.g. reverse propagation
/// triggered from inside forward propagation) without corrupting the outer one. Every node on
/// the active path is captured while the iterator visits it and released when the visit ends.
///
/// On a DAG, a shared node is yielded once per parent edge; consumers that need each node once
/// (like forward propagation) skip repeats through their version tags.
#[derive(Debug, Default)]
pub struct GraphIterator {
    stack: Vec<DfsEntry>,
}

impl GraphIterator {
    /// Position the iterator at `root`. Any in-progress traversal is aborted first.
    pub fn start(&mut self, graph: &mut ExpressionGraph, root: NodeId) {
        self.abort(graph);
        graph.capture(root);
        self.stack.push(DfsEntry {
            node: root,
            next_child: 0,
        });
    }

    /// The next node in post order: children strictly before parents.
    pub fn next(&mut self, graph: &mut ExpressionGraph) -> Option<NodeId> {
        loop {
            let depth = self.stack.len();
            let entry = self.stack.last()?;
            let children = graph.children(entry.node);
            if entry.next_child < children.len() {
                let child = children[entry.next_child];
                self.stack[depth - 1].next_child += 1;
                graph.capture(child);
                self.stack.push(DfsEntry {
                    node: child,
                    next_child: 0,
                });
                continue;
            }
            let entry = self.stack.pop().expect("the stack is nonempty");
            graph.release(entry.node);
            return Some(entry.node);
        }
    }

    /// Stop a traversal early, releasing the iterator's captures on the active path.
    pub fn abort(&mut self, graph: &mut ExpressionGraph) {
        while let Some(entry) = self.stack.pop() {
            graph.release(entry.node);
        }
    }

    fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }
}

/// A small pool of traversal-state objects with a hard capacity.
///
/// Exhaustion is surfaced as a [`ResourceExhaustion`] error instead of growing silently: the
/// number of concurrently active traversals is bounded by design, and running out signals a bug
/// (e.g. an iterator never being returned).
#[derive(Debug)]
pub struct IteratorPool {
    available: Vec<GraphIterator>,
    capacity: usize,
    active: usize,
}

impl IteratorPool {
    pub fn new(capacity: usize) -> IteratorPool {
        IteratorPool {
            available: Vec::new(),
            capacity,
            active: 0,
        }
    }

    pub fn acquire(&mut self) -> Result<GraphIterator, ResourceExhaustion> {
        if self.active == self.capacity {
            return Err(ResourceExhaustion {
                capacity: self.capacity,
            });
        }
        self.active += 1;
        Ok(self.available.pop().unwrap_or_default())
    }

    /// Return an iterator to the pool. It must be idle (finished or aborted).
    pub fn release(&mut self, iterator: GraphIterator) {
        quince_assert_simple!(self.active > 0, "released an iterator into an empty pool");
        quince_assert_simple!(
            iterator.is_idle(),
            "an iterator must be finished or aborted before it is returned"
        );
        self.active -= 1;
        self.available.push(iterator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprKind;
    use crate::variables::VariableStore;

    #[test]
    fn post_order_yields_children_before_parents() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(0.0, 1.0, false));
        let exponential = graph.create(ExprKind::Exponential, vec![x]);

        let mut pool = IteratorPool::new(2);
        let mut iterator = pool.acquire().unwrap();
        iterator.start(&mut graph, exponential);
        assert_eq!(iterator.next(&mut graph), Some(x));
        assert_eq!(iterator.next(&mut graph), Some(exponential));
        assert_eq!(iterator.next(&mut graph), None);
        pool.release(iterator);
    }

    #[test]
    fn iteration_captures_the_active_path() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(0.0, 1.0, false));
        let exponential = graph.create(ExprKind::Exponential, vec![x]);

        let mut pool = IteratorPool::new(2);
        let mut iterator = pool.acquire().unwrap();
        iterator.start(&mut graph, exponential);
        // Root captured by the iterator.
        assert_eq!(graph.use_count(exponential), 2);
        let _ = iterator.next(&mut graph);
        let _ = iterator.next(&mut graph);
        assert_eq!(graph.use_count(exponential), 1);
        assert_eq!(graph.use_count(x), 2);
        pool.release(iterator);
    }

    #[test]
    fn aborting_mid_traversal_releases_captures() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(0.0, 1.0, false));
        let exponential = graph.create(ExprKind::Exponential, vec![x]);

        let mut pool = IteratorPool::new(2);
        let mut iterator = pool.acquire().unwrap();
        iterator.start(&mut graph, exponential);
        iterator.abort(&mut graph);
        assert_eq!(graph.use_count(exponential), 1);
        assert_eq!(graph.use_count(x), 2);
        pool.release(iterator);
    }

    #[test]
    fn pool_exhaustion_is_an_error() {
        let mut pool = IteratorPool::new(1);
        let first = pool.acquire().unwrap();
        let error = pool.acquire().map(|_| ()).unwrap_err();
        assert_eq!(error, ResourceExhaustion { capacity: 1 });
        pool.release(first);
        assert!(pool.acquire().is_ok());
    }
}
