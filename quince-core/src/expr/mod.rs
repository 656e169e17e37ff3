//! The expression DAG: kinds, the reference-counted arena, pooled iterators, and the
//! canonicalization passes.

mod cse;
mod graph;
mod iterator;
mod kind;
mod quadratic;
mod simplify;

pub use graph::ExpressionGraph;
pub use graph::IndicatorTerm;
pub use graph::NodeId;
pub use iterator::GraphIterator;
pub use iterator::IteratorPool;
pub use iterator::ResourceExhaustion;
pub use kind::Curvature;
pub use kind::ExprKind;
pub use kind::Monotonicity;
pub use quadratic::QuadraticForm;

pub(crate) use cse::merge_subexpressions;
pub(crate) use simplify::simplify_roots;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableStore;

    /// Canonicalization (simplify + merge) is confluent: a second run performs no replacements.
    #[test]
    fn canonicalization_is_confluent() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let y = graph.variable(variables.new_variable(-1.0, 1.0, false));

        // x*x + 2*x*y + y*y, built naively with duplicated squares.
        let xx = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, x]);
        let xy = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, y]);
        let yy = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![y, y]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 2.0, 1.0],
                constant: 0.0,
            },
            vec![xx, xy, yy],
        );
        graph.release(xx);
        graph.release(xy);
        graph.release(yy);

        let mut roots = [sum];
        let first = simplify_roots(&mut graph, &mut roots)
            + merge_subexpressions(&mut graph, &mut roots);
        assert!(first > 0);
        let second = simplify_roots(&mut graph, &mut roots)
            + merge_subexpressions(&mut graph, &mut roots);
        assert_eq!(second, 0);
    }

    /// The scenario from the engine requirements: canonicalizing `x*x + 2*x*y + y*y` merges the
    /// duplicate squares and the quadratic accessor reports one square term per variable and a
    /// single bilinear term with coefficient 2.
    #[test]
    fn binomial_square_has_the_expected_quadratic_form() {
        let mut graph = ExpressionGraph::new();
        let mut variables = VariableStore::new();
        let x = graph.variable(variables.new_variable(-1.0, 1.0, false));
        let y = graph.variable(variables.new_variable(-1.0, 1.0, false));

        let xx = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, x]);
        let xy = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![x, y]);
        let yy = graph.create(ExprKind::Product { coefficient: 1.0 }, vec![y, y]);
        let sum = graph.create(
            ExprKind::Sum {
                coefficients: vec![1.0, 2.0, 1.0],
                constant: 0.0,
            },
            vec![xx, xy, yy],
        );
        graph.release(xx);
        graph.release(xy);
        graph.release(yy);

        let mut roots = [sum];
        let _ = simplify_roots(&mut graph, &mut roots);
        let _ = merge_subexpressions(&mut graph, &mut roots);

        let form = graph.quadratic_form(roots[0]).unwrap().clone();
        assert_eq!(form.square_terms.len(), 2);
        assert!(form.square_terms.contains(&(x, 1.0)));
        assert!(form.square_terms.contains(&(y, 1.0)));
        assert_eq!(form.bilinear_terms, vec![(x, y, 2.0)]);
        assert!(form.linear_terms.is_empty());
        assert_eq!(form.constant, 0.0);
    }
}
