use std::fmt::Display;

use super::statistic_logging::log_statistic;

/// A name-prefix carrier for logging grouped statistics.
///
/// The facade creates one logger per component (the engine counters, the enforcement loop, one
/// per registered handler) by extending a base prefix segment by segment; every value written
/// through the resulting logger comes out as `segment_segment_..._field=value`.
#[derive(Debug, Default, Clone)]
pub struct StatisticLogger {
    /// The prefix segments, joined with underscores when a statistic is written.
    segments: Vec<String>,
}

impl StatisticLogger {
    pub fn new(name_prefix: impl Display) -> Self {
        StatisticLogger {
            segments: vec![name_prefix.to_string()],
        }
    }

    /// A new logger whose prefix extends this one by `addition`.
    pub fn attach_to_prefix(&self, addition: impl Display) -> Self {
        let mut segments = self.segments.clone();
        segments.push(addition.to_string());
        StatisticLogger { segments }
    }
}

impl std::fmt::Write for StatisticLogger {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        log_statistic(self.segments.join("_"), s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::StatisticLogger;

    #[test]
    fn attaching_extends_the_prefix_without_mutating_the_original() {
        let base = StatisticLogger::new("relaxation");
        let extended = base.attach_to_prefix("enforcement");
        assert_eq!(base.segments, vec!["relaxation".to_owned()]);
        assert_eq!(
            extended.segments,
            vec!["relaxation".to_owned(), "enforcement".to_owned()]
        );
    }
}
