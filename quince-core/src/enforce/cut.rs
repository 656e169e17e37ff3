use itertools::Itertools;
use log::debug;
use thiserror::Error;

use crate::basic_types::Solution;
use crate::options::CutOptions;
use crate::variables::VarId;
use crate::variables::VariableStore;

/// A globally valid linear inequality `sum_i terms[i].1 * terms[i].0 <= rhs`, produced from an
/// estimator of a nonlinear node or directly by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Cut {
    pub terms: Vec<(VarId, f64)>,
    pub rhs: f64,
}

impl Cut {
    /// By how much `solution` violates the cut; positive means the cut separates the point.
    pub fn violation(&self, solution: &Solution) -> f64 {
        let activity: f64 = self
            .terms
            .iter()
            .map(|(variable, coefficient)| coefficient * solution.value(*variable))
            .sum();
        activity - self.rhs
    }
}

/// Why a candidate cut was discarded during cleanup.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum CutError {
    #[error("the cut has no terms left after cleanup")]
    Empty,
    #[error("cannot eliminate the coefficient of {0} against an unbounded domain")]
    UnboundedElimination(VarId),
    #[error("the coefficient range {0:e} exceeds the configured limit")]
    CoefficientRange(f64),
    #[error("the cleaned-up cut no longer separates the point (violation {0:e})")]
    InsufficientViolation(f64),
}

/// An under-construction cut row. Terms are appended freely (duplicates allowed) and the row is
/// turned into a [`Cut`] by [`RowPrep::cleanup`], which merges duplicates, eliminates tiny
/// coefficients against finite variable bounds, enforces the coefficient-range limit, and
/// rescales by a power of two.
#[derive(Debug, Default, Clone)]
pub struct RowPrep {
    terms: Vec<(VarId, f64)>,
    rhs: f64,
}

impl RowPrep {
    pub fn new() -> RowPrep {
        RowPrep::default()
    }

    pub fn add_term(&mut self, variable: VarId, coefficient: f64) {
        self.terms.push((variable, coefficient));
    }

    pub fn add_rhs(&mut self, value: f64) {
        self.rhs += value;
    }

    pub fn cleanup(mut self, variables: &VariableStore, options: &CutOptions) -> Result<Cut, CutError> {
        // Merge duplicate variables.
        self.terms.sort_by_key(|(variable, _)| *variable);
        let mut merged: Vec<(VarId, f64)> = Vec::with_capacity(self.terms.len());
        for (variable, chunk) in &self.terms.iter().chunk_by(|(variable, _)| *variable) {
            let coefficient: f64 = chunk.map(|(_, coefficient)| *coefficient).sum();
            if coefficient != 0.0 {
                merged.push((variable, coefficient));
            }
        }

        // Eliminate tiny coefficients against the variable bound that keeps the row valid for
        // the <= sense.
        let mut rhs = self.rhs;
        let mut terms = Vec::with_capacity(merged.len());
        for (variable, coefficient) in merged {
            if coefficient.abs() >= options.min_coefficient {
                terms.push((variable, coefficient));
                continue;
            }
            let bounds = variables.bounds(variable);
            let substituted = if coefficient > 0.0 {
                bounds.upper()
            } else {
                bounds.lower()
            };
            if !substituted.is_finite() {
                debug!("cut rejected: tiny coefficient of {variable} over an unbounded domain");
                return Err(CutError::UnboundedElimination(variable));
            }
            rhs -= coefficient * substituted;
        }
        if terms.is_empty() {
            return Err(CutError::Empty);
        }

        let max_magnitude = terms
            .iter()
            .map(|(_, coefficient)| coefficient.abs())
            .fold(0.0_f64, f64::max);
        let min_magnitude = terms
            .iter()
            .map(|(_, coefficient)| coefficient.abs())
            .fold(f64::INFINITY, f64::min);
        let range = max_magnitude / min_magnitude;
        if range > options.max_coefficient_range {
            debug!("cut rejected: coefficient range {range:e}");
            return Err(CutError::CoefficientRange(range));
        }

        // Power-of-two rescaling is exact and brings the largest magnitude into [1, 2).
        let scale = (-max_magnitude.log2().floor()).exp2();
        if scale.is_finite() && scale != 1.0 {
            for (_, coefficient) in &mut terms {
                *coefficient *= scale;
            }
            rhs *= scale;
        }

        Ok(Cut { terms, rhs })
    }
}
