use std::f64::consts::FRAC_PI_2;
use std::f64::consts::PI;
use std::fmt::Display;

/// A closed interval `[lower, upper]` of [`f64`]s, the engine's representation of an activity:
/// a sound enclosure of the values an expression can take over the current variable bounds.
///
/// An interval with `lower > upper` is empty; [`Interval::empty`] produces the canonical empty
/// interval. Infinite bounds are permitted and denote one-sided or entire enclosures.
///
/// All operations are outward-directed: the result is always a superset of the exact image, so
/// composing them preserves soundness. None of them are guaranteed to be tight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    lower: f64,
    upper: f64,
}

impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "[empty]")
        } else {
            write!(f, "[{}, {}]", self.lower, self.upper)
        }
    }
}

impl Interval {
    pub fn new(lower: f64, upper: f64) -> Interval {
        Interval { lower, upper }
    }

    /// The interval `(-inf, inf)`.
    pub fn entire() -> Interval {
        Interval {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// The canonical empty interval.
    pub fn empty() -> Interval {
        Interval {
            lower: f64::INFINITY,
            upper: f64::NEG_INFINITY,
        }
    }

    /// The degenerate interval `[value, value]`.
    pub fn point(value: f64) -> Interval {
        Interval {
            lower: value,
            upper: value,
        }
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower > self.upper
    }

    pub fn is_point(&self) -> bool {
        self.lower == self.upper
    }

    pub fn is_entire(&self) -> bool {
        self.lower == f64::NEG_INFINITY && self.upper == f64::INFINITY
    }

    pub fn is_finite(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite()
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn midpoint(&self) -> f64 {
        if self.is_finite() {
            0.5 * (self.lower + self.upper)
        } else if self.lower.is_finite() {
            self.lower
        } else if self.upper.is_finite() {
            self.upper
        } else {
            0.0
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Whether `value` lies in the interval inflated by `tolerance` on both sides.
    pub fn contains_within(&self, value: f64, tolerance: f64) -> bool {
        self.lower - tolerance <= value && value <= self.upper + tolerance
    }

    pub fn intersect(&self, other: &Interval) -> Interval {
        Interval {
            lower: self.lower.max(other.lower),
            upper: self.upper.min(other.upper),
        }
    }

    pub fn hull(&self, other: &Interval) -> Interval {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Interval {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Whether `self` improves on `old` enough to be worth propagating further: a bound became
    /// finite, the interval became a single point, or a bound moved by a relative amount of at
    /// least `epsilon`.
    pub fn is_better_than(&self, old: &Interval, epsilon: f64) -> bool {
        if self.is_empty() {
            return !old.is_empty();
        }
        if (old.lower.is_infinite() && self.lower.is_finite())
            || (old.upper.is_infinite() && self.upper.is_finite())
        {
            return true;
        }
        if self.is_point() && !old.is_point() {
            return true;
        }
        let scale_lower = 1.0_f64.max(old.lower.abs());
        let scale_upper = 1.0_f64.max(old.upper.abs());
        self.lower - old.lower > epsilon * scale_lower
            || old.upper - self.upper > epsilon * scale_upper
    }

    /// Shrink to the integer points contained in the interval. Used for integral expressions;
    /// `feasibility_epsilon` absorbs bounds that are integral up to rounding noise.
    pub fn round_inward(&self, feasibility_epsilon: f64) -> Interval {
        if self.is_empty() {
            return *self;
        }
        let lower = if self.lower.is_finite() {
            (self.lower - feasibility_epsilon).ceil()
        } else {
            self.lower
        };
        let upper = if self.upper.is_finite() {
            (self.upper + feasibility_epsilon).floor()
        } else {
            self.upper
        };
        Interval { lower, upper }
    }

    pub fn negate(&self) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        Interval {
            lower: -self.upper,
            upper: -self.lower,
        }
    }

    pub fn add(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        Interval {
            lower: add_down(self.lower, other.lower),
            upper: add_up(self.upper, other.upper),
        }
    }

    pub fn sub(&self, other: &Interval) -> Interval {
        self.add(&other.negate())
    }

    pub fn add_scalar(&self, value: f64) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        Interval {
            lower: add_down(self.lower, value),
            upper: add_up(self.upper, value),
        }
    }

    pub fn scale(&self, factor: f64) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        if factor >= 0.0 {
            Interval {
                lower: mul_bound(self.lower, factor),
                upper: mul_bound(self.upper, factor),
            }
        } else {
            Interval {
                lower: mul_bound(self.upper, factor),
                upper: mul_bound(self.lower, factor),
            }
        }
    }

    pub fn mul(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        let candidates = [
            mul_bound(self.lower, other.lower),
            mul_bound(self.lower, other.upper),
            mul_bound(self.upper, other.lower),
            mul_bound(self.upper, other.upper),
        ];
        Interval {
            lower: candidates.iter().copied().fold(f64::INFINITY, f64::min),
            upper: candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// Sound division: an enclosure of `{ a / b : a in self, b in other }`. When the divisor
    /// straddles zero the result is the entire line.
    pub fn div(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        if other.contains(0.0) {
            return Interval::entire();
        }
        let candidates = [
            self.lower / other.lower,
            self.lower / other.upper,
            self.upper / other.lower,
            self.upper / other.upper,
        ];
        Interval {
            lower: candidates.iter().copied().fold(f64::INFINITY, f64::min),
            upper: candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    pub fn exp(&self) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        Interval {
            lower: self.lower.exp(),
            upper: self.upper.exp(),
        }
    }

    /// The image of the natural logarithm over the positive part of the interval; empty if the
    /// interval contains no positive value.
    pub fn ln(&self) -> Interval {
        if self.is_empty() || self.upper <= 0.0 {
            return Interval::empty();
        }
        let lower = if self.lower <= 0.0 {
            f64::NEG_INFINITY
        } else {
            self.lower.ln()
        };
        Interval {
            lower,
            upper: self.upper.ln(),
        }
    }

    pub fn abs(&self) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        if self.lower >= 0.0 {
            *self
        } else if self.upper <= 0.0 {
            self.negate()
        } else {
            Interval {
                lower: 0.0,
                upper: self.upper.max(-self.lower),
            }
        }
    }

    /// The image of `x^exponent`. Integer exponents use even/odd symmetry; fractional exponents
    /// are only defined on the nonnegative part of the interval (empty if there is none).
    pub fn pow(&self, exponent: f64) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        if exponent == 0.0 {
            return Interval::point(1.0);
        }
        if exponent == 1.0 {
            return *self;
        }
        if is_integral(exponent) {
            let n = exponent as i32;
            if n > 0 && n % 2 != 0 {
                // Odd powers are monotone.
                return Interval {
                    lower: pow_bound(self.lower, exponent),
                    upper: pow_bound(self.upper, exponent),
                };
            }
            if n > 0 {
                // Even powers map through the absolute value.
                let abs = self.abs();
                return Interval {
                    lower: pow_bound(abs.lower, exponent),
                    upper: pow_bound(abs.upper, exponent),
                };
            }
            // Negative integer exponents reciprocate; straddling zero blows up.
            if self.contains(0.0) {
                return Interval::entire();
            }
            let reciprocal = Interval::point(1.0).div(self);
            return reciprocal.pow(-exponent);
        }
        // Fractional exponent: restricted to x >= 0.
        if self.upper < 0.0 {
            return Interval::empty();
        }
        let lower = self.lower.max(0.0);
        if exponent > 0.0 {
            Interval {
                lower: pow_bound(lower, exponent),
                upper: pow_bound(self.upper, exponent),
            }
        } else if lower == 0.0 {
            Interval {
                lower: pow_bound(self.upper, exponent),
                upper: f64::INFINITY,
            }
        } else {
            Interval {
                lower: pow_bound(self.upper, exponent),
                upper: pow_bound(lower, exponent),
            }
        }
    }

    /// The image of the signed power `sign(x) * |x|^exponent` (monotone for `exponent > 1`).
    pub fn signed_pow(&self, exponent: f64) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        Interval {
            lower: signed_pow_value(self.lower, exponent),
            upper: signed_pow_value(self.upper, exponent),
        }
    }

    /// The preimage of the signed power: the `x` interval such that `sign(x) * |x|^exponent`
    /// lies in `self`.
    pub fn signed_pow_inverse(&self, exponent: f64) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        Interval {
            lower: signed_pow_value(self.lower, 1.0 / exponent),
            upper: signed_pow_value(self.upper, 1.0 / exponent),
        }
    }

    /// The image of `sin` over the interval, computed from the endpoints and the contained
    /// critical points.
    pub fn sin(&self) -> Interval {
        if self.is_empty() {
            return Interval::empty();
        }
        if !self.is_finite() || self.width() >= 2.0 * PI {
            return Interval::new(-1.0, 1.0);
        }
        let mut lower = self.lower.sin().min(self.upper.sin());
        let mut upper = self.lower.sin().max(self.upper.sin());
        // Critical points of sin are at pi/2 + k*pi.
        let first = ((self.lower - FRAC_PI_2) / PI).ceil() as i64;
        let last = ((self.upper - FRAC_PI_2) / PI).floor() as i64;
        for k in first..=last {
            if k % 2 == 0 {
                upper = 1.0;
            } else {
                lower = -1.0;
            }
        }
        Interval { lower, upper }
    }

    pub fn cos(&self) -> Interval {
        self.add_scalar(FRAC_PI_2).sin()
    }

    /// The image of the entropy function `-x * ln(x)` over the nonnegative part of the interval
    /// (with `0 * ln(0) = 0`); empty if the interval is entirely negative.
    pub fn entropy(&self) -> Interval {
        if self.is_empty() || self.upper < 0.0 {
            return Interval::empty();
        }
        let lower_x = self.lower.max(0.0);
        if !self.upper.is_finite() {
            // -x ln x decreases without bound as x grows.
            let upper = if lower_x <= std::f64::consts::E.recip() {
                std::f64::consts::E.recip()
            } else {
                entropy_value(lower_x)
            };
            return Interval {
                lower: f64::NEG_INFINITY,
                upper,
            };
        }
        let at_lower = entropy_value(lower_x);
        let at_upper = entropy_value(self.upper);
        let lower = at_lower.min(at_upper);
        let mut upper = at_lower.max(at_upper);
        // The single maximum of -x ln x is at x = 1/e.
        let stationary = std::f64::consts::E.recip();
        if lower_x <= stationary && stationary <= self.upper {
            upper = upper.max(entropy_value(stationary));
        }
        Interval { lower, upper }
    }
}

pub(crate) fn entropy_value(x: f64) -> f64 {
    if x == 0.0 { 0.0 } else { -x * x.ln() }
}

pub(crate) fn signed_pow_value(x: f64, exponent: f64) -> f64 {
    x.signum() * x.abs().powf(exponent)
}

pub(crate) fn is_integral(value: f64) -> bool {
    value.is_finite() && value.round() == value
}

fn pow_bound(base: f64, exponent: f64) -> f64 {
    if base == f64::NEG_INFINITY && is_integral(exponent) {
        // powf is only defined for nonnegative bases; mirror through the odd/even symmetry.
        if (exponent as i64) % 2 == 0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    } else if base < 0.0 && is_integral(exponent) {
        let magnitude = base.abs().powf(exponent);
        if (exponent as i64) % 2 == 0 {
            magnitude
        } else {
            -magnitude
        }
    } else {
        base.powf(exponent)
    }
}

// inf + (-inf) never occurs for valid interval bounds of the same side; saturate defensively
// towards the sound direction anyway.
fn add_down(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum.is_nan() { f64::NEG_INFINITY } else { sum }
}

fn add_up(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum.is_nan() { f64::INFINITY } else { sum }
}

/// Multiplication where `0 * inf = 0`, the convention that keeps `0 * [l, inf]` the point zero
/// instead of poisoning the enclosure with NaN.
fn mul_bound(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        0.0
    } else {
        a * b
    }
}
