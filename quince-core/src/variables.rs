//! The variable store: original decision variables, lazily created relaxation variables, their
//! f64 bound intervals and integrality, and the two global bound-revision counters that drive
//! activity staleness.

use std::fmt::Display;

use log::trace;

use crate::basic_types::Interval;
use crate::containers::KeyedVec;
use crate::containers::StorageKey;
use crate::quince_assert_simple;

/// Identifier of a variable in the [`VariableStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);

impl StorageKey for VarId {
    fn index(&self) -> usize {
        self.0 as usize
    }

    fn create_from_index(index: usize) -> Self {
        VarId(index as u32)
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Raised when tightening a variable bound makes its domain empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyDomain(pub VarId);

#[derive(Debug, Clone)]
struct Variable {
    bounds: Interval,
    integral: bool,
    /// Relaxation variables are locked in both directions: only the engine itself may move
    /// their bounds, through [`VariableStore::tighten_relaxation_bounds`].
    is_relaxation: bool,
}

/// Owns every variable the engine knows about.
///
/// Bound mutations go through this store so that the two version counters are bumped
/// consistently: `current_bounds_tag` moves on every bound change, `last_bound_relax_tag` only
/// when a bound is relaxed (widened). Nodes compare their activity tag against these counters to
/// decide staleness; see the propagation module.
#[derive(Debug, Default)]
pub struct VariableStore {
    variables: KeyedVec<VarId, Variable>,
    current_bounds_tag: u64,
    last_bound_relax_tag: u64,
}

impl VariableStore {
    pub fn new() -> VariableStore {
        VariableStore {
            variables: KeyedVec::default(),
            // Tag 0 is reserved so that a node with activity_tag 0 is always stale.
            current_bounds_tag: 1,
            last_bound_relax_tag: 1,
        }
    }

    /// Register an original decision variable.
    pub fn new_variable(&mut self, lower: f64, upper: f64, integral: bool) -> VarId {
        quince_assert_simple!(lower <= upper, "a variable must have a nonempty domain");
        self.variables.push(Variable {
            bounds: Interval::new(lower, upper),
            integral,
            is_relaxation: false,
        })
    }

    /// Register a relaxation (auxiliary) variable with bounds taken from the activity of the
    /// node it stands in for.
    pub(crate) fn new_relaxation_variable(&mut self, activity: Interval) -> VarId {
        self.variables.push(Variable {
            bounds: activity,
            integral: false,
            is_relaxation: true,
        })
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = VarId> + '_ {
        self.variables.keys()
    }

    pub fn bounds(&self, variable: VarId) -> Interval {
        self.variables[variable].bounds
    }

    pub fn is_integral(&self, variable: VarId) -> bool {
        self.variables[variable].integral
    }

    pub fn is_relaxation_variable(&self, variable: VarId) -> bool {
        self.variables[variable].is_relaxation
    }

    /// Whether the domain of `variable` is a single point (up to `epsilon`).
    pub fn is_fixed(&self, variable: VarId, epsilon: f64) -> bool {
        let bounds = self.variables[variable].bounds;
        bounds.is_finite() && bounds.width() <= epsilon
    }

    pub fn current_bounds_tag(&self) -> u64 {
        self.current_bounds_tag
    }

    pub fn last_bound_relax_tag(&self) -> u64 {
        self.last_bound_relax_tag
    }

    /// Intersect the domain of an original variable with `bounds`. Returns whether the domain
    /// changed, or [`EmptyDomain`] if the intersection is empty.
    pub fn tighten_bounds(
        &mut self,
        variable: VarId,
        bounds: Interval,
    ) -> Result<bool, EmptyDomain> {
        quince_assert_simple!(
            !self.variables[variable].is_relaxation,
            "the bounds of a relaxation variable are locked against outside mutation"
        );
        self.tighten_impl(variable, bounds)
    }

    /// Bound updates on relaxation variables, reserved for the engine.
    pub(crate) fn tighten_relaxation_bounds(
        &mut self,
        variable: VarId,
        bounds: Interval,
    ) -> Result<bool, EmptyDomain> {
        quince_assert_simple!(self.variables[variable].is_relaxation);
        self.tighten_impl(variable, bounds)
    }

    fn tighten_impl(&mut self, variable: VarId, bounds: Interval) -> Result<bool, EmptyDomain> {
        let current = self.variables[variable].bounds;
        let tightened = current.intersect(&bounds);
        if tightened.is_empty() {
            trace!("domain of {variable} emptied by intersection with {bounds}");
            return Err(EmptyDomain(variable));
        }
        if tightened == current {
            return Ok(false);
        }
        self.variables[variable].bounds = tightened;
        self.current_bounds_tag += 1;
        Ok(true)
    }

    /// Replace the domain of `variable` outright. Widening moves the relaxation tag forward,
    /// which invalidates every previously computed activity.
    pub fn relax_bounds(&mut self, variable: VarId, bounds: Interval) {
        quince_assert_simple!(!bounds.is_empty());
        let current = self.variables[variable].bounds;
        if bounds == current {
            return;
        }
        self.variables[variable].bounds = bounds;
        self.current_bounds_tag += 1;
        if bounds.lower() < current.lower() || bounds.upper() > current.upper() {
            self.last_bound_relax_tag = self.current_bounds_tag;
        }
    }
}
