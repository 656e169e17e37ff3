use super::graph::ExpressionGraph;
use super::graph::NodeId;
use super::kind::ExprKind;

/// A quadratic-form decomposition of a node: `constant + linear + squares + bilinear`.
///
/// Terms reference the argument nodes (after canonicalization these are typically variable
/// nodes). The decomposition is computed at most once per node and cached on the node for its
/// lifetime; it is never silently invalidated, which is safe because it is only requested after
/// canonicalization has fixed the structure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuadraticForm {
    pub constant: f64,
    /// `coefficient * argument`.
    pub linear_terms: Vec<(NodeId, f64)>,
    /// `coefficient * argument^2`.
    pub square_terms: Vec<(NodeId, f64)>,
    /// `coefficient * first * second` with `first != second`.
    pub bilinear_terms: Vec<(NodeId, NodeId, f64)>,
}

impl ExpressionGraph {
    /// The quadratic form of `node`, if it has one. Computed on first request and cached on the
    /// node (write-once, tied to the node's lifetime).
    pub fn quadratic_form(&mut self, node: NodeId) -> Option<&QuadraticForm> {
        if !self.node(node).quadratic_checked {
            let form = compute_quadratic_form(self, node);
            let slot = self.node_mut(node);
            slot.quadratic_checked = true;
            slot.quadratic = form.map(Box::new);
        }
        self.node(node).quadratic.as_deref()
    }
}

fn compute_quadratic_form(graph: &ExpressionGraph, node: NodeId) -> Option<QuadraticForm> {
    let mut form = QuadraticForm::default();
    match graph.kind(node) {
        ExprKind::Sum {
            coefficients,
            constant,
        } => {
            form.constant = *constant;
            let children = graph.children(node).to_vec();
            for (&child, &coefficient) in children.iter().zip(coefficients) {
                add_term(graph, &mut form, child, coefficient)?;
            }
        }
        _ => add_term(graph, &mut form, node, 1.0)?,
    }
    Some(form)
}

/// Classify a single term of the sum; anything beyond degree two fails the decomposition.
fn add_term(
    graph: &ExpressionGraph,
    form: &mut QuadraticForm,
    term: NodeId,
    coefficient: f64,
) -> Option<()> {
    match graph.kind(term) {
        ExprKind::Constant(value) => {
            form.constant += coefficient * value;
        }
        ExprKind::Variable(_) => {
            form.linear_terms.push((term, coefficient));
        }
        ExprKind::Power { exponent } if *exponent == 2.0 => {
            let argument = graph.children(term)[0];
            if !is_atom(graph, argument) {
                return None;
            }
            form.square_terms.push((argument, coefficient));
        }
        ExprKind::Product {
            coefficient: product_coefficient,
        } => {
            let factors = graph.children(term);
            if factors.len() != 2 {
                return None;
            }
            let (first, second) = (factors[0], factors[1]);
            if !is_atom(graph, first) || !is_atom(graph, second) {
                return None;
            }
            let weight = coefficient * product_coefficient;
            if first == second {
                form.square_terms.push((first, weight));
            } else {
                form.bilinear_terms.push((first, second, weight));
            }
        }
        _ => return None,
    }
    Some(())
}

fn is_atom(graph: &ExpressionGraph, node: NodeId) -> bool {
    matches!(graph.kind(node), ExprKind::Variable(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableStore;

    #[test]
    fn sum_of_squares_and_bilinear_term_decomposes() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let y = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let x_squared = graph.create(ExprKind::Power { exponent: 2.0 }, vec![x]);
        let y_squared = graph.create(ExprKind::Power { exponent: 2.0 }, vec![y]);
        let cross = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, y]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 2.0, 1.0],
                constant: 0.0,
            },
            vec![x_squared, cross, y_squared],
        );

        let form = graph.quadratic_form(sum).unwrap().clone();
        assert_eq!(form.square_terms, vec![(x, 1.0), (y, 1.0)]);
        assert_eq!(form.bilinear_terms, vec![(x, y, 2.0)]);
        assert!(form.linear_terms.is_empty());
    }

    #[test]
    fn cubic_term_fails_the_decomposition() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let cubed = graph.create(ExprKind::Power { exponent: 3.0 }, vec![x]);
        assert!(graph.quadratic_form(cubed).is_none());
        // The negative result is cached as well.
        assert!(graph.quadratic_form(cubed).is_none());
    }
}
