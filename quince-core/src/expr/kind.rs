use std::cmp::Ordering;
use std::hash::Hash;
use std::hash::Hasher;

use crate::basic_types::Interval;
use crate::basic_types::interval::entropy_value;
use crate::basic_types::interval::is_integral;
use crate::basic_types::interval::signed_pow_value;
use crate::variables::VarId;

/// The closed set of expression kinds.
///
/// This is deliberately a tagged union dispatched with `match`, not a trait object: the set of
/// kinds is fixed, only the nonlinear handlers (see the handlers module) form an open extension
/// point. Kind-specific payloads live in the variants; children are stored on the node itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Variable(VarId),
    Constant(f64),
    /// `constant + sum_i coefficients[i] * child_i`.
    Sum { coefficients: Vec<f64>, constant: f64 },
    /// `coefficient * prod_i child_i`.
    Product { coefficient: f64 },
    /// `child ^ exponent` for a real exponent.
    Power { exponent: f64 },
    /// `sign(child) * |child| ^ exponent` for `exponent > 1`.
    SignedPower { exponent: f64 },
    Exponential,
    Logarithm,
    AbsoluteValue,
    Sine,
    Cosine,
    Entropy,
}

/// Curvature of an expression over its current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Curvature {
    #[default]
    Unknown,
    Convex,
    Concave,
    /// Both convex and concave.
    Linear,
}

impl Curvature {
    pub fn is_convex(self) -> bool {
        matches!(self, Curvature::Convex | Curvature::Linear)
    }

    pub fn is_concave(self) -> bool {
        matches!(self, Curvature::Concave | Curvature::Linear)
    }

    fn negate(self) -> Curvature {
        match self {
            Curvature::Convex => Curvature::Concave,
            Curvature::Concave => Curvature::Convex,
            other => other,
        }
    }

    fn combine(self, other: Curvature) -> Curvature {
        match (self, other) {
            (Curvature::Linear, c) | (c, Curvature::Linear) => c,
            (a, b) if a == b => a,
            _ => Curvature::Unknown,
        }
    }
}

/// Monotonicity of an expression in one of its children, used to propagate constraint locks
/// down the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonicity {
    Increasing,
    Decreasing,
    Unknown,
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Variable(_) => "variable",
            ExprKind::Constant(_) => "constant",
            ExprKind::Sum { .. } => "sum",
            ExprKind::Product { .. } => "product",
            ExprKind::Power { .. } => "power",
            ExprKind::SignedPower { .. } => "signed-power",
            ExprKind::Exponential => "exponential",
            ExprKind::Logarithm => "logarithm",
            ExprKind::AbsoluteValue => "absolute-value",
            ExprKind::Sine => "sine",
            ExprKind::Cosine => "cosine",
            ExprKind::Entropy => "entropy",
        }
    }

    /// Rank in the documented total order: constants < sums < products < powers < variables <
    /// all remaining kinds (which compare lexicographically by name).
    pub(crate) fn order_rank(&self) -> u8 {
        match self {
            ExprKind::Constant(_) => 0,
            ExprKind::Sum { .. } => 1,
            ExprKind::Product { .. } => 2,
            ExprKind::Power { .. } | ExprKind::SignedPower { .. } => 3,
            ExprKind::Variable(_) => 4,
            _ => 5,
        }
    }

    /// Compare the payloads of two kinds of the same variant (children are compared separately
    /// by the graph-level comparison).
    pub(crate) fn compare_payload(&self, other: &ExprKind) -> Ordering {
        match (self, other) {
            (ExprKind::Constant(a), ExprKind::Constant(b)) => total_compare(*a, *b),
            (ExprKind::Variable(a), ExprKind::Variable(b)) => a.cmp(b),
            (
                ExprKind::Sum {
                    coefficients: ca,
                    constant: ka,
                },
                ExprKind::Sum {
                    coefficients: cb,
                    constant: kb,
                },
            ) => compare_slices(ca, cb).then_with(|| total_compare(*ka, *kb)),
            (ExprKind::Product { coefficient: a }, ExprKind::Product { coefficient: b }) => {
                total_compare(*a, *b)
            }
            (ExprKind::Power { exponent: a }, ExprKind::Power { exponent: b })
            | (ExprKind::SignedPower { exponent: a }, ExprKind::SignedPower { exponent: b }) => {
                total_compare(*a, *b)
            }
            _ => self.name().cmp(other.name()),
        }
    }

    pub(crate) fn hash_payload<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ExprKind::Variable(id) => id.hash(state),
            ExprKind::Constant(value) => value.to_bits().hash(state),
            ExprKind::Sum {
                coefficients,
                constant,
            } => {
                for coefficient in coefficients {
                    coefficient.to_bits().hash(state);
                }
                constant.to_bits().hash(state);
            }
            ExprKind::Product { coefficient } => coefficient.to_bits().hash(state),
            ExprKind::Power { exponent } | ExprKind::SignedPower { exponent } => {
                exponent.to_bits().hash(state);
            }
            _ => {}
        }
    }

    /// The number of children this kind expects, if fixed.
    pub(crate) fn arity(&self) -> Option<usize> {
        match self {
            ExprKind::Variable(_) | ExprKind::Constant(_) => Some(0),
            ExprKind::Sum { .. } | ExprKind::Product { .. } => None,
            _ => Some(1),
        }
    }

    /// Evaluate the kind at the given child values. `None` is the sentinel for a domain error
    /// (logarithm of a nonpositive value and friends); it is propagated explicitly by the
    /// callers through sums and products.
    pub fn evaluate(&self, child_values: &[f64]) -> Option<f64> {
        let value = match self {
            ExprKind::Variable(_) => return None,
            ExprKind::Constant(value) => *value,
            ExprKind::Sum {
                coefficients,
                constant,
            } => {
                constant
                    + coefficients
                        .iter()
                        .zip(child_values)
                        .map(|(coefficient, value)| coefficient * value)
                        .sum::<f64>()
            }
            ExprKind::Product { coefficient } => {
                coefficient * child_values.iter().product::<f64>()
            }
            ExprKind::Power { exponent } => {
                let base = child_values[0];
                if base < 0.0 && !is_integral(*exponent) {
                    return None;
                }
                if base == 0.0 && *exponent < 0.0 {
                    return None;
                }
                if base < 0.0 {
                    let magnitude = base.abs().powf(*exponent);
                    if (*exponent as i64) % 2 == 0 {
                        magnitude
                    } else {
                        -magnitude
                    }
                } else {
                    base.powf(*exponent)
                }
            }
            ExprKind::SignedPower { exponent } => signed_pow_value(child_values[0], *exponent),
            ExprKind::Exponential => child_values[0].exp(),
            ExprKind::Logarithm => {
                if child_values[0] <= 0.0 {
                    return None;
                }
                child_values[0].ln()
            }
            ExprKind::AbsoluteValue => child_values[0].abs(),
            ExprKind::Sine => child_values[0].sin(),
            ExprKind::Cosine => child_values[0].cos(),
            ExprKind::Entropy => {
                if child_values[0] < 0.0 {
                    return None;
                }
                entropy_value(child_values[0])
            }
        };
        if value.is_nan() { None } else { Some(value) }
    }

    /// Interval evaluation from the children's activities. Variables consult the provided bound
    /// lookup instead.
    pub fn interval_evaluate(
        &self,
        child_intervals: &[Interval],
        variable_bounds: &dyn Fn(VarId) -> Interval,
    ) -> Interval {
        match self {
            ExprKind::Variable(id) => variable_bounds(*id),
            ExprKind::Constant(value) => Interval::point(*value),
            ExprKind::Sum {
                coefficients,
                constant,
            } => coefficients
                .iter()
                .zip(child_intervals)
                .fold(Interval::point(*constant), |acc, (coefficient, child)| {
                    acc.add(&child.scale(*coefficient))
                }),
            ExprKind::Product { coefficient } => child_intervals
                .iter()
                .fold(Interval::point(*coefficient), |acc, child| acc.mul(child)),
            ExprKind::Power { exponent } => child_intervals[0].pow(*exponent),
            ExprKind::SignedPower { exponent } => child_intervals[0].signed_pow(*exponent),
            ExprKind::Exponential => child_intervals[0].exp(),
            ExprKind::Logarithm => child_intervals[0].ln(),
            ExprKind::AbsoluteValue => child_intervals[0].abs(),
            ExprKind::Sine => child_intervals[0].sin(),
            ExprKind::Cosine => child_intervals[0].cos(),
            ExprKind::Entropy => child_intervals[0].entropy(),
        }
    }

    /// First-order backward derivative with respect to child `child_index`, evaluated at the
    /// given child values. `None` where the derivative does not exist.
    pub fn backward_differentiate(&self, child_index: usize, child_values: &[f64]) -> Option<f64> {
        let derivative = match self {
            ExprKind::Variable(_) | ExprKind::Constant(_) => return None,
            ExprKind::Sum { coefficients, .. } => coefficients[child_index],
            ExprKind::Product { coefficient } => {
                coefficient
                    * child_values
                        .iter()
                        .enumerate()
                        .filter(|(index, _)| *index != child_index)
                        .map(|(_, value)| value)
                        .product::<f64>()
            }
            ExprKind::Power { exponent } => {
                let base = child_values[0];
                let inner = ExprKind::Power {
                    exponent: exponent - 1.0,
                }
                .evaluate(&[base])?;
                exponent * inner
            }
            ExprKind::SignedPower { exponent } => exponent * child_values[0].abs().powf(exponent - 1.0),
            ExprKind::Exponential => child_values[0].exp(),
            ExprKind::Logarithm => {
                if child_values[0] <= 0.0 {
                    return None;
                }
                child_values[0].recip()
            }
            ExprKind::AbsoluteValue => child_values[0].signum(),
            ExprKind::Sine => child_values[0].cos(),
            ExprKind::Cosine => -child_values[0].sin(),
            ExprKind::Entropy => {
                if child_values[0] <= 0.0 {
                    return None;
                }
                -(child_values[0].ln() + 1.0)
            }
        };
        if derivative.is_nan() {
            None
        } else {
            Some(derivative)
        }
    }

    /// Deduce an enclosure for child `child_index` from bounds on the node itself and the
    /// activities of the other children. The result still has to be intersected with the
    /// child's own activity by the caller; returning [`Interval::entire`] means the kind has no
    /// inverse rule for this child.
    pub fn reverse_interval(
        &self,
        node_bounds: &Interval,
        child_index: usize,
        child_intervals: &[Interval],
    ) -> Interval {
        match self {
            ExprKind::Variable(_) | ExprKind::Constant(_) => Interval::entire(),
            ExprKind::Sum {
                coefficients,
                constant,
            } => {
                let coefficient = coefficients[child_index];
                if coefficient == 0.0 {
                    return Interval::entire();
                }
                // bounds = constant + c_i * x_i + rest  =>  x_i = (bounds - constant - rest) / c_i
                let rest = coefficients
                    .iter()
                    .zip(child_intervals)
                    .enumerate()
                    .filter(|(index, _)| *index != child_index)
                    .fold(Interval::point(0.0), |acc, (_, (c, child))| {
                        acc.add(&child.scale(*c))
                    });
                node_bounds
                    .add_scalar(-constant)
                    .sub(&rest)
                    .scale(coefficient.recip())
            }
            ExprKind::Product { coefficient } => {
                let rest = child_intervals
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index != child_index)
                    .fold(Interval::point(*coefficient), |acc, (_, child)| {
                        acc.mul(child)
                    });
                node_bounds.div(&rest)
            }
            ExprKind::Power { exponent } => {
                if !is_integral(*exponent) {
                    // Fractional powers require a nonnegative base.
                    if *exponent > 0.0 {
                        let range = node_bounds.intersect(&Interval::new(0.0, f64::INFINITY));
                        range.pow(exponent.recip())
                    } else {
                        Interval::new(0.0, f64::INFINITY)
                    }
                } else if (*exponent as i64) % 2 != 0 {
                    if *exponent > 0.0 {
                        node_bounds.signed_pow_inverse(*exponent)
                    } else {
                        Interval::entire()
                    }
                } else if *exponent > 0.0 {
                    // Even powers: |x| <= bounds.upper ^ (1/n).
                    let range = node_bounds.intersect(&Interval::new(0.0, f64::INFINITY));
                    if range.is_empty() {
                        return Interval::empty();
                    }
                    let magnitude = range.upper().powf(exponent.recip());
                    Interval::new(-magnitude, magnitude)
                } else {
                    Interval::entire()
                }
            }
            ExprKind::SignedPower { exponent } => node_bounds.signed_pow_inverse(*exponent),
            ExprKind::Exponential => node_bounds.ln(),
            // The child of a logarithm must be positive even when the node bounds say nothing.
            ExprKind::Logarithm => node_bounds
                .exp()
                .intersect(&Interval::new(0.0, f64::INFINITY)),
            ExprKind::AbsoluteValue => {
                let range = node_bounds.intersect(&Interval::new(0.0, f64::INFINITY));
                if range.is_empty() {
                    return Interval::empty();
                }
                Interval::new(-range.upper(), range.upper())
            }
            // No inverse trigonometric deduction; only the domain is enforced.
            ExprKind::Sine | ExprKind::Cosine => Interval::entire(),
            ExprKind::Entropy => Interval::new(0.0, f64::INFINITY),
        }
    }

    /// Bottom-up curvature rule.
    pub fn curvature(
        &self,
        child_curvatures: &[Curvature],
        child_activities: &[Interval],
    ) -> Curvature {
        match self {
            ExprKind::Variable(_) | ExprKind::Constant(_) => Curvature::Linear,
            ExprKind::Sum { coefficients, .. } => coefficients
                .iter()
                .zip(child_curvatures)
                .map(|(coefficient, curvature)| {
                    if *coefficient >= 0.0 {
                        *curvature
                    } else {
                        curvature.negate()
                    }
                })
                .fold(Curvature::Linear, Curvature::combine),
            ExprKind::Product { coefficient } => {
                if child_curvatures.len() == 1 {
                    if *coefficient >= 0.0 {
                        child_curvatures[0]
                    } else {
                        child_curvatures[0].negate()
                    }
                } else {
                    Curvature::Unknown
                }
            }
            ExprKind::Power { exponent } => {
                if child_curvatures[0] != Curvature::Linear {
                    return Curvature::Unknown;
                }
                let child = &child_activities[0];
                if is_integral(*exponent) && (*exponent as i64) % 2 == 0 && *exponent > 0.0 {
                    Curvature::Convex
                } else if child.lower() >= 0.0 {
                    if *exponent >= 1.0 || *exponent < 0.0 {
                        Curvature::Convex
                    } else {
                        Curvature::Concave
                    }
                } else if child.upper() <= 0.0 && is_integral(*exponent) {
                    // Odd power on the negative side is concave.
                    if *exponent > 1.0 {
                        Curvature::Concave
                    } else {
                        Curvature::Unknown
                    }
                } else {
                    Curvature::Unknown
                }
            }
            ExprKind::SignedPower { .. } => {
                if child_curvatures[0] != Curvature::Linear {
                    return Curvature::Unknown;
                }
                let child = &child_activities[0];
                if child.lower() >= 0.0 {
                    Curvature::Convex
                } else if child.upper() <= 0.0 {
                    Curvature::Concave
                } else {
                    Curvature::Unknown
                }
            }
            ExprKind::Exponential => {
                if child_curvatures[0].is_convex() {
                    Curvature::Convex
                } else {
                    Curvature::Unknown
                }
            }
            ExprKind::Logarithm | ExprKind::Entropy => {
                if child_curvatures[0] == Curvature::Linear {
                    Curvature::Concave
                } else {
                    Curvature::Unknown
                }
            }
            ExprKind::AbsoluteValue => {
                if child_curvatures[0] == Curvature::Linear {
                    Curvature::Convex
                } else {
                    Curvature::Unknown
                }
            }
            ExprKind::Sine | ExprKind::Cosine => Curvature::Unknown,
        }
    }

    /// Bottom-up integrality rule. Variable integrality is supplied by the caller from the
    /// variable store.
    pub fn integrality(&self, child_integral: &[bool]) -> bool {
        match self {
            ExprKind::Variable(_) => false,
            ExprKind::Constant(value) => is_integral(*value),
            ExprKind::Sum {
                coefficients,
                constant,
            } => {
                is_integral(*constant)
                    && coefficients.iter().all(|c| is_integral(*c))
                    && child_integral.iter().all(|integral| *integral)
            }
            ExprKind::Product { coefficient } => {
                is_integral(*coefficient) && child_integral.iter().all(|integral| *integral)
            }
            ExprKind::Power { exponent } | ExprKind::SignedPower { exponent } => {
                child_integral[0] && is_integral(*exponent) && *exponent >= 0.0
            }
            _ => false,
        }
    }

    /// Monotonicity in child `child_index` over the given child activities.
    pub fn child_monotonicity(
        &self,
        child_index: usize,
        child_intervals: &[Interval],
    ) -> Monotonicity {
        match self {
            ExprKind::Variable(_) | ExprKind::Constant(_) => Monotonicity::Unknown,
            ExprKind::Sum { coefficients, .. } => {
                if coefficients[child_index] >= 0.0 {
                    Monotonicity::Increasing
                } else {
                    Monotonicity::Decreasing
                }
            }
            ExprKind::Product { coefficient } => {
                let mut sign = coefficient.signum();
                for (index, child) in child_intervals.iter().enumerate() {
                    if index == child_index {
                        continue;
                    }
                    if child.lower() >= 0.0 {
                        // sign unchanged
                    } else if child.upper() <= 0.0 {
                        sign = -sign;
                    } else {
                        return Monotonicity::Unknown;
                    }
                }
                if sign >= 0.0 {
                    Monotonicity::Increasing
                } else {
                    Monotonicity::Decreasing
                }
            }
            ExprKind::Power { exponent } => {
                if is_integral(*exponent) && (*exponent as i64) % 2 != 0 && *exponent > 0.0 {
                    Monotonicity::Increasing
                } else if child_intervals[0].lower() >= 0.0 {
                    if *exponent > 0.0 {
                        Monotonicity::Increasing
                    } else {
                        Monotonicity::Decreasing
                    }
                } else if child_intervals[0].upper() <= 0.0 && is_integral(*exponent) {
                    if (*exponent as i64) % 2 == 0 && *exponent > 0.0 {
                        Monotonicity::Decreasing
                    } else {
                        Monotonicity::Unknown
                    }
                } else {
                    Monotonicity::Unknown
                }
            }
            ExprKind::SignedPower { .. } | ExprKind::Exponential | ExprKind::Logarithm => {
                Monotonicity::Increasing
            }
            ExprKind::AbsoluteValue | ExprKind::Sine | ExprKind::Cosine | ExprKind::Entropy => {
                Monotonicity::Unknown
            }
        }
    }

    /// Whether the order of children carries no meaning (so canonicalization may sort them).
    pub(crate) fn is_commutative(&self) -> bool {
        matches!(self, ExprKind::Sum { .. } | ExprKind::Product { .. })
    }
}

fn compare_slices(a: &[f64], b: &[f64]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| {
        a.iter()
            .zip(b)
            .map(|(x, y)| total_compare(*x, *y))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    })
}

pub(crate) fn total_compare(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}
