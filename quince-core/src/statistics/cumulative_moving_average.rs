use std::fmt::Display;
use std::fmt::Formatter;

/// A running mean over `f64` terms.
///
/// Used for the quality counters of the enforcement loop, such as the average violation of the
/// cuts it emits. Displays as its current value so it can sit directly in a statistics struct.
#[derive(Default, Debug, Copy, Clone)]
pub struct CumulativeMovingAverage {
    sum: f64,
    num_terms: u64,
}

impl CumulativeMovingAverage {
    /// Folds the next term into the average.
    pub fn add_term(&mut self, new_term: f64) {
        self.sum += new_term;
        self.num_terms += 1;
    }

    /// The current average; zero while no terms have been recorded.
    pub fn value(&self) -> f64 {
        if self.num_terms > 0 {
            self.sum / self.num_terms as f64
        } else {
            0.0
        }
    }
}

impl Display for CumulativeMovingAverage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::CumulativeMovingAverage;

    #[test]
    fn an_empty_average_is_zero() {
        let average = CumulativeMovingAverage::default();
        assert_eq!(average.value(), 0.0);
    }

    #[test]
    fn the_average_tracks_the_running_mean() {
        let mut average = CumulativeMovingAverage::default();
        average.add_term(1.0);
        assert_eq!(average.value(), 1.0);
        average.add_term(2.0);
        assert_eq!(average.value(), 1.5);
        average.add_term(3.0);
        assert_eq!(average.value(), 2.0);
    }

    #[test]
    fn a_constant_sequence_averages_to_itself() {
        let mut average = CumulativeMovingAverage::default();
        for _ in 0..1000 {
            average.add_term(0.25);
            assert_eq!(average.value(), 0.25);
        }
    }
}
