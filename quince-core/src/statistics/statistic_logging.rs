//! The process-wide statistic writer.
//!
//! The engine never decides where its statistics go; the embedding solver calls
//! [`configure_statistic_logging`] once, and every statistic logged afterwards is written as a
//! single `{PREFIX} {NAME}={VALUE}` line to the configured destination. Without that call,
//! logging statistics is a no-op.

use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Write;
use std::io::stdout;
use std::sync::OnceLock;
use std::sync::RwLock;

use convert_case::Case;
use convert_case::Casing;

/// The destination and formatting of statistic lines, fixed for the rest of the process by the
/// first call to [`configure_statistic_logging`].
pub struct StatisticOptions {
    /// Printed in front of every statistic line.
    statistic_prefix: &'static str,
    /// The casing applied to statistic names; `None` keeps the snake-cased field names the
    /// statistics structs generate.
    statistics_casing: Option<Case>,
    statistics_writer: Box<dyn Write + Send + Sync>,
}

impl Debug for StatisticOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticOptions")
            .field("statistic_prefix", &self.statistic_prefix)
            .field("statistics_casing", &self.statistics_casing)
            .field("statistics_writer", &"<Writer>")
            .finish()
    }
}

static STATISTIC_OPTIONS: OnceLock<RwLock<StatisticOptions>> = OnceLock::new();

/// Configures statistic logging for the rest of the process; the first call wins.
///
/// When no writer is given, lines are written to stdout.
pub fn configure_statistic_logging(
    prefix: &'static str,
    casing: Option<Case>,
    writer: Option<Box<dyn Write + Send + Sync>>,
) {
    let _ = STATISTIC_OPTIONS.get_or_init(|| {
        RwLock::from(StatisticOptions {
            statistic_prefix: prefix,
            statistics_casing: casing,
            statistics_writer: writer.unwrap_or(Box::new(stdout())),
        })
    });
}

/// Writes one `{PREFIX} {NAME}={VALUE}` line through the configured writer, applying the
/// configured casing to `name`. Does nothing while logging is unconfigured.
pub fn log_statistic(name: impl Display, value: impl Display) {
    if let Some(statistic_options_lock) = STATISTIC_OPTIONS.get() {
        if let Ok(mut statistic_options) = statistic_options_lock.write() {
            let name = if let Some(casing) = &statistic_options.statistics_casing {
                name.to_string().to_case(*casing)
            } else {
                name.to_string()
            };
            let prefix = statistic_options.statistic_prefix;
            let _ = writeln!(
                statistic_options.statistics_writer,
                "{prefix} {name}={value}"
            );
        }
    }
}

/// Whether statistic logging has been configured. Callers with expensive statistics to gather
/// can skip the work entirely when it has not.
pub fn should_log_statistics() -> bool {
    STATISTIC_OPTIONS.get().is_some()
}
