use crate::containers::KeyedVec;
use crate::containers::StorageKey;
use crate::variables::VarId;

/// Per-variable pseudocosts: the average improvement observed when branching on the variable,
/// trusted only after enough observations.
#[derive(Debug, Default)]
pub struct Pseudocosts {
    entries: KeyedVec<VarId, Entry>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    count: u32,
    average_gain: f64,
}

impl Pseudocosts {
    /// Record the improvement observed after branching on `variable`.
    pub fn record(&mut self, variable: VarId, gain: f64) {
        self.grow_to(variable);
        let entry = &mut self.entries[variable];
        entry.average_gain = (entry.average_gain * f64::from(entry.count) + gain)
            / f64::from(entry.count + 1);
        entry.count += 1;
    }

    /// The pseudocost estimate for `variable`, or `None` while it is unreliable.
    pub fn estimate(&self, variable: VarId, reliability: u32) -> Option<f64> {
        if variable.index() >= self.entries.len() {
            return None;
        }
        let entry = self.entries[variable];
        (entry.count >= reliability).then_some(entry.average_gain)
    }

    fn grow_to(&mut self, variable: VarId) {
        while self.entries.len() <= variable.index() {
            let _ = self.entries.push(Entry::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_are_withheld_until_reliable() {
        let mut pseudocosts = Pseudocosts::default();
        let x = VarId::create_from_index(0);
        pseudocosts.record(x, 2.0);
        assert_eq!(pseudocosts.estimate(x, 2), None);
        pseudocosts.record(x, 4.0);
        assert_eq!(pseudocosts.estimate(x, 2), Some(3.0));
    }

    #[test]
    fn unseen_variables_have_no_estimate() {
        let pseudocosts = Pseudocosts::default();
        assert_eq!(pseudocosts.estimate(VarId::create_from_index(5), 1), None);
    }
}
