//! Configuration of the relaxation engine. All options are immutable after setup: the engine
//! takes a [`RelaxationOptions`] by value when it is created and never mutates it.

/// How a node aggregates the branching scores it receives over time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ScoreAggregation {
    #[default]
    Average,
    Maximum,
    Sum,
}

/// How the branching score of an expression node is redistributed onto the decision variables it
/// depends on when branching on relaxation variables is disabled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ScoreRedistribution {
    /// Every variable under the node receives an equal share.
    Even,
    /// Weighted by how close the variable's solution value is to the middle of its domain.
    #[default]
    Midness,
    /// Weighted by domain width.
    Width,
    /// Weighted by the logarithm of the domain width.
    LogWidth,
}

#[derive(Debug, Clone, Copy)]
pub struct PropagationOptions {
    /// Tolerance under which a value is considered feasible for a bound; also absorbs rounding
    /// noise when integral activities are rounded inward.
    pub feasibility_epsilon: f64,
    /// Relative bound movement below which a tightening is not worth propagating further.
    pub bound_improvement_epsilon: f64,
    /// Hard cap on the number of simultaneously active graph iterators.
    pub iterator_pool_capacity: usize,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        PropagationOptions {
            feasibility_epsilon: 1e-6,
            bound_improvement_epsilon: 1e-9,
            iterator_pool_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CutOptions {
    /// Coefficients whose magnitude falls below this value are eliminated against a finite
    /// variable bound during cut cleanup.
    pub min_coefficient: f64,
    /// Maximum allowed ratio between the largest and smallest coefficient magnitude in a cut;
    /// rows beyond it are rejected as numerically unreliable.
    pub max_coefficient_range: f64,
}

impl Default for CutOptions {
    fn default() -> Self {
        CutOptions {
            min_coefficient: 1e-9,
            max_coefficient_range: 1e7,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnforcementOptions {
    /// A cut is classified as weak when the gap its estimator closes is below this fraction of
    /// the full violation gap.
    pub weak_cut_threshold: f64,
    /// Weak cuts are retried on a node whose violation is within this factor of the globally
    /// worst violation.
    pub weak_cut_min_violation_factor: f64,
    /// A handler whose auxiliary violation is below this fraction of the violation against the
    /// original variables is skipped.
    pub enforce_aux_viol_factor: f64,
    /// Minimum violation a cleaned-up cut must retain to be accepted.
    pub min_cut_violation: f64,
    /// Minimum violation when weak cuts are allowed.
    pub min_weak_cut_violation: f64,
    pub cuts: CutOptions,
}

impl Default for EnforcementOptions {
    fn default() -> Self {
        EnforcementOptions {
            weak_cut_threshold: 0.2,
            weak_cut_min_violation_factor: 2.0,
            enforce_aux_viol_factor: 1e-2,
            min_cut_violation: 1e-6,
            min_weak_cut_violation: 1e-7,
            cuts: CutOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchingOptions {
    pub aggregation: ScoreAggregation,
    pub redistribution: ScoreRedistribution,
    /// Whether relaxation variables are themselves branching candidates. When disabled, node
    /// scores are redistributed onto the decision variables below the node.
    pub branch_on_relaxation_variables: bool,
    /// Candidates within this factor of the best weighted score tie-break at random.
    pub tie_break_factor: f64,
    pub violation_weight: f64,
    pub domain_weight: f64,
    pub dual_weight: f64,
    pub pseudocost_weight: f64,
    pub vartype_weight: f64,
    /// A pseudocost estimate is only trusted after this many observations.
    pub pseudocost_reliability: u32,
    /// How far the branching reference point is pulled from the solution value towards the
    /// domain midpoint, for continuous domains.
    pub midpoint_pull: f64,
}

impl Default for BranchingOptions {
    fn default() -> Self {
        BranchingOptions {
            aggregation: ScoreAggregation::default(),
            redistribution: ScoreRedistribution::default(),
            branch_on_relaxation_variables: false,
            tie_break_factor: 0.05,
            violation_weight: 1.0,
            domain_weight: 0.25,
            dual_weight: 0.25,
            pseudocost_weight: 1.0,
            vartype_weight: 0.5,
            pseudocost_reliability: 8,
            midpoint_pull: 0.35,
        }
    }
}

/// The full engine configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelaxationOptions {
    pub propagation: PropagationOptions,
    pub enforcement: EnforcementOptions,
    pub branching: BranchingOptions,
}
