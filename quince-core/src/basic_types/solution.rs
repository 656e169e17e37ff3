use crate::containers::KeyedVec;
use crate::containers::StorageKey;
use crate::variables::VarId;

/// A primal point over the variable store: one value per variable (original and relaxation),
/// optionally accompanied by reduced costs from the linear relaxation.
///
/// The engine never solves the linear relaxation itself; the consumer hands the current LP point
/// in through this structure when it asks for separation or enforcement.
#[derive(Debug, Clone, Default)]
pub struct Solution {
    values: KeyedVec<VarId, f64>,
    reduced_costs: Option<KeyedVec<VarId, f64>>,
}

impl Solution {
    pub fn new(values: KeyedVec<VarId, f64>) -> Solution {
        Solution {
            values,
            reduced_costs: None,
        }
    }

    pub fn with_reduced_costs(
        values: KeyedVec<VarId, f64>,
        reduced_costs: KeyedVec<VarId, f64>,
    ) -> Solution {
        Solution {
            values,
            reduced_costs: Some(reduced_costs),
        }
    }

    /// The value of `variable` in this point. Variables created after the point was captured
    /// (e.g. relaxation variables introduced later) evaluate to zero.
    pub fn value(&self, variable: VarId) -> f64 {
        if variable.index() < self.values.len() {
            self.values[variable]
        } else {
            0.0
        }
    }

    pub fn set_value(&mut self, variable: VarId, value: f64) {
        self.values[variable] = value;
    }

    /// The reduced cost of `variable`, if duals were attached to this point.
    pub fn reduced_cost(&self, variable: VarId) -> Option<f64> {
        self.reduced_costs.as_ref().and_then(|costs| {
            if variable.index() < costs.len() {
                Some(costs[variable])
            } else {
                None
            }
        })
    }
}
