//! Log configuration.
//!
//! [`LogConfig`] holds the recognized options of a table handle. Some of them
//! can be overridden per table through `metaData.configuration` properties
//! (for example `delta.checkpointInterval`); [`LogConfig::with_table_properties`]
//! resolves the effective configuration for a snapshot.
//!
//! Retention windows are written as calendar intervals, e.g.
//! `interval 30 days`, and parsed into a [`CalendarInterval`].
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use snafu::prelude::*;

use crate::transaction_log::{IsolationLevel, RetryPolicy};

/// Table property overriding [`LogConfig::checkpoint_interval`].
pub const CHECKPOINT_INTERVAL_KEY: &str = "delta.checkpointInterval";
/// Table property overriding [`LogConfig::log_retention`].
pub const LOG_RETENTION_KEY: &str = "delta.logRetentionDuration";
/// Table property overriding [`LogConfig::expired_log_cleanup_enabled`].
pub const ENABLE_EXPIRED_LOG_CLEANUP_KEY: &str = "delta.enableExpiredLogCleanup";
/// Table property overriding [`LogConfig::isolation_level`].
pub const ISOLATION_LEVEL_KEY: &str = "delta.isolationLevel";

/// Errors produced when parsing a calendar interval (e.g. `interval 30 days`).
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseIntervalError {
    /// The spec string was empty or only whitespace.
    #[snafu(display("interval spec is empty"))]
    Empty,

    /// The spec was not `[interval] <number> <unit>`.
    #[snafu(display("interval spec '{spec}' is not of the form '[interval] <number> <unit>'"))]
    Malformed {
        /// The original spec string.
        spec: String,
    },

    /// The numeric portion of the spec failed to parse.
    #[snafu(display("invalid interval value in '{spec}': {source}"))]
    InvalidNumber {
        /// The original spec string.
        spec: String,
        /// The parse error returned by `u32::from_str`.
        source: std::num::ParseIntError,
    },

    /// The parsed numeric value was zero.
    #[snafu(display("interval value must be > 0 in '{spec}'"))]
    NonPositive {
        /// The original spec string.
        spec: String,
    },

    /// Months and years have no fixed length.
    #[snafu(display("interval unit '{unit}' in '{spec}' has no fixed length (use days or weeks)"))]
    AmbiguousUnit {
        /// The original spec string.
        spec: String,
        /// The rejected unit.
        unit: String,
    },

    /// The spec used an unsupported unit.
    #[snafu(display(
        "unknown interval unit '{unit}' in '{spec}' (expected second|minute|hour|day|week)"
    ))]
    UnknownUnit {
        /// The original spec string.
        spec: String,
        /// The unrecognized unit.
        unit: String,
    },
}

/// A fixed-length calendar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarInterval {
    /// A number of seconds.
    Seconds(u32),
    /// A number of minutes.
    Minutes(u32),
    /// A number of hours.
    Hours(u32),
    /// A number of days.
    Days(u32),
    /// A number of weeks.
    Weeks(u32),
}

impl CalendarInterval {
    /// Parse `interval 30 days`, `30 days`, `12 hours`, `1 week`, ...
    pub fn parse(spec: &str) -> Result<Self, ParseIntervalError> {
        spec.parse()
    }

    /// Length of the interval.
    pub fn as_duration(&self) -> TimeDelta {
        let (amount, unit_secs) = match *self {
            CalendarInterval::Seconds(n) => (n, 1),
            CalendarInterval::Minutes(n) => (n, 60),
            CalendarInterval::Hours(n) => (n, 3_600),
            CalendarInterval::Days(n) => (n, 86_400),
            CalendarInterval::Weeks(n) => (n, 604_800),
        };
        // u32::MAX weeks is still well inside TimeDelta's range.
        TimeDelta::seconds(i64::from(amount) * unit_secs)
    }

    /// The instant one interval before `now`.
    pub fn cutoff_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.as_duration())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl FromStr for CalendarInterval {
    type Err = ParseIntervalError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let spec = input.trim();
        ensure!(!spec.is_empty(), EmptySnafu);

        let mut words: Vec<&str> = spec.split_whitespace().collect();
        if words
            .first()
            .is_some_and(|w| w.eq_ignore_ascii_case("interval"))
        {
            words.remove(0);
        }

        let [num_str, unit_str] = words.as_slice() else {
            return MalformedSnafu { spec }.fail();
        };

        let value: u32 = num_str.parse().context(InvalidNumberSnafu { spec })?;
        ensure!(value > 0, NonPositiveSnafu { spec });

        let unit = unit_str.to_ascii_lowercase();
        match unit.as_str() {
            "second" | "seconds" => Ok(CalendarInterval::Seconds(value)),
            "minute" | "minutes" => Ok(CalendarInterval::Minutes(value)),
            "hour" | "hours" => Ok(CalendarInterval::Hours(value)),
            "day" | "days" => Ok(CalendarInterval::Days(value)),
            "week" | "weeks" => Ok(CalendarInterval::Weeks(value)),
            "month" | "months" | "year" | "years" => AmbiguousUnitSnafu {
                spec,
                unit: *unit_str,
            }
            .fail(),
            _ => UnknownUnitSnafu {
                spec,
                unit: *unit_str,
            }
            .fail(),
        }
    }
}

impl fmt::Display for CalendarInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (n, unit) = match *self {
            CalendarInterval::Seconds(n) => (n, "second"),
            CalendarInterval::Minutes(n) => (n, "minute"),
            CalendarInterval::Hours(n) => (n, "hour"),
            CalendarInterval::Days(n) => (n, "day"),
            CalendarInterval::Weeks(n) => (n, "week"),
        };
        let plural = if n == 1 { "" } else { "s" };
        write!(f, "interval {n} {unit}{plural}")
    }
}

/// Errors produced when resolving table-property overrides.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// An interval-valued property did not parse.
    #[snafu(display("invalid value for {key}: {source}"))]
    InvalidInterval {
        /// Property key.
        key: String,
        /// Parse failure.
        source: ParseIntervalError,
    },

    /// An integer-valued property did not parse.
    #[snafu(display("invalid value '{value}' for {key}: {source}"))]
    InvalidInteger {
        /// Property key.
        key: String,
        /// Offending value.
        value: String,
        /// Parse failure.
        source: std::num::ParseIntError,
    },

    /// A boolean-valued property was neither `true` nor `false`.
    #[snafu(display("invalid value '{value}' for {key}: expected true or false"))]
    InvalidBool {
        /// Property key.
        key: String,
        /// Offending value.
        value: String,
    },

    /// An isolation level property named no known level.
    #[snafu(display("invalid value for {key}: {msg}"))]
    InvalidIsolationLevel {
        /// Property key.
        key: String,
        /// Parse failure.
        msg: String,
    },
}

/// Recognized options of a table handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Append a `commitInfo` action to every commit.
    pub commit_info_enabled: bool,

    /// Record file and byte counts in `commitInfo.operationMetrics`.
    pub history_metrics_enabled: bool,

    /// Write a checkpoint every N versions (0 = never).
    pub checkpoint_interval: u64,

    /// Split checkpoints into parts of at most this many actions (None = single file).
    pub checkpoint_part_size: Option<usize>,

    /// How long checkpoint-covered commit files are kept.
    pub log_retention: CalendarInterval,

    /// Run log cleanup after writing a checkpoint.
    pub expired_log_cleanup_enabled: bool,

    /// Isolation level for new transactions.
    pub isolation_level: IsolationLevel,

    /// Commit retry policy.
    pub retry: RetryPolicy,

    /// Number of snapshots kept in the per-handle cache.
    pub snapshot_cache_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            commit_info_enabled: true,
            history_metrics_enabled: true,
            checkpoint_interval: 10,
            checkpoint_part_size: None,
            log_retention: CalendarInterval::Days(30),
            expired_log_cleanup_enabled: true,
            isolation_level: IsolationLevel::WriteSerializable,
            retry: RetryPolicy::default(),
            snapshot_cache_capacity: 8,
        }
    }
}

impl LogConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether commits carry a `commitInfo` action.
    #[must_use]
    pub const fn commit_info_enabled(mut self, value: bool) -> Self {
        self.commit_info_enabled = value;
        self
    }

    /// Sets whether commits record operation metrics.
    #[must_use]
    pub const fn history_metrics_enabled(mut self, value: bool) -> Self {
        self.history_metrics_enabled = value;
        self
    }

    /// Sets the checkpoint interval in versions.
    #[must_use]
    pub const fn checkpoint_interval(mut self, versions: u64) -> Self {
        self.checkpoint_interval = versions;
        self
    }

    /// Sets the maximum number of actions per checkpoint part.
    #[must_use]
    pub const fn checkpoint_part_size(mut self, actions: Option<usize>) -> Self {
        self.checkpoint_part_size = actions;
        self
    }

    /// Sets the log retention window.
    #[must_use]
    pub const fn log_retention(mut self, interval: CalendarInterval) -> Self {
        self.log_retention = interval;
        self
    }

    /// Sets whether expired log files are cleaned up after checkpoints.
    #[must_use]
    pub const fn expired_log_cleanup_enabled(mut self, value: bool) -> Self {
        self.expired_log_cleanup_enabled = value;
        self
    }

    /// Sets the isolation level of new transactions.
    #[must_use]
    pub const fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Sets the commit retry policy.
    #[must_use]
    pub const fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the snapshot cache capacity.
    #[must_use]
    pub const fn snapshot_cache_capacity(mut self, snapshots: usize) -> Self {
        self.snapshot_cache_capacity = snapshots;
        self
    }

    /// Whether a checkpoint is due right after committing `version`.
    pub fn checkpoint_due(&self, version: u64) -> bool {
        self.checkpoint_interval > 0 && version > 0 && version % self.checkpoint_interval == 0
    }

    /// Apply `delta.*` overrides from a table's configuration.
    ///
    /// Unknown keys are ignored; a recognized key with a malformed value is an
    /// error.
    pub fn with_table_properties(
        &self,
        properties: &BTreeMap<String, String>,
    ) -> Result<LogConfig, ConfigError> {
        let mut config = self.clone();

        if let Some(value) = properties.get(CHECKPOINT_INTERVAL_KEY) {
            config.checkpoint_interval =
                value.trim().parse().context(InvalidIntegerSnafu {
                    key: CHECKPOINT_INTERVAL_KEY,
                    value: value.as_str(),
                })?;
        }

        if let Some(value) = properties.get(LOG_RETENTION_KEY) {
            config.log_retention = value.parse().context(InvalidIntervalSnafu {
                key: LOG_RETENTION_KEY,
            })?;
        }

        if let Some(value) = properties.get(ENABLE_EXPIRED_LOG_CLEANUP_KEY) {
            config.expired_log_cleanup_enabled = parse_bool(ENABLE_EXPIRED_LOG_CLEANUP_KEY, value)?;
        }

        if let Some(value) = properties.get(ISOLATION_LEVEL_KEY) {
            config.isolation_level = value
                .parse()
                .map_err(|msg| ConfigError::InvalidIsolationLevel {
                    key: ISOLATION_LEVEL_KEY.to_string(),
                    msg,
                })?;
        }

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => InvalidBoolSnafu { key, value }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LogConfig::default();
        assert!(config.commit_info_enabled);
        assert!(config.history_metrics_enabled);
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.log_retention, CalendarInterval::Days(30));
        assert_eq!(config.isolation_level, IsolationLevel::WriteSerializable);
        assert_eq!(config.snapshot_cache_capacity, 8);
    }

    #[test]
    fn builder_pattern() {
        let config = LogConfig::new()
            .commit_info_enabled(false)
            .checkpoint_interval(3)
            .log_retention(CalendarInterval::Hours(1));

        assert!(!config.commit_info_enabled);
        assert_eq!(config.checkpoint_interval, 3);
        assert_eq!(config.log_retention.as_duration(), TimeDelta::hours(1));
    }

    #[test]
    fn checkpoint_due_only_on_positive_multiples() {
        let config = LogConfig::new().checkpoint_interval(5);
        assert!(!config.checkpoint_due(0));
        assert!(!config.checkpoint_due(4));
        assert!(config.checkpoint_due(5));
        assert!(config.checkpoint_due(10));
        assert!(!LogConfig::new().checkpoint_interval(0).checkpoint_due(10));
    }

    #[test]
    fn parse_interval_accepts_calendar_forms() {
        assert_eq!(
            CalendarInterval::parse("interval 30 days"),
            Ok(CalendarInterval::Days(30))
        );
        assert_eq!(
            CalendarInterval::parse("  INTERVAL 1 Week "),
            Ok(CalendarInterval::Weeks(1))
        );
        assert_eq!(
            CalendarInterval::parse("12 hours"),
            Ok(CalendarInterval::Hours(12))
        );
        assert_eq!(
            CalendarInterval::parse("1 second"),
            Ok(CalendarInterval::Seconds(1))
        );
    }

    #[test]
    fn parse_interval_rejects_bad_specs() {
        assert_eq!(CalendarInterval::parse("  "), Err(ParseIntervalError::Empty));
        assert!(matches!(
            CalendarInterval::parse("interval days"),
            Err(ParseIntervalError::Malformed { .. })
        ));
        assert!(matches!(
            CalendarInterval::parse("x days"),
            Err(ParseIntervalError::InvalidNumber { .. })
        ));
        assert!(matches!(
            CalendarInterval::parse("0 days"),
            Err(ParseIntervalError::NonPositive { .. })
        ));
        assert!(matches!(
            CalendarInterval::parse("interval 1 month"),
            Err(ParseIntervalError::AmbiguousUnit { .. })
        ));
        assert!(matches!(
            CalendarInterval::parse("3 fortnights"),
            Err(ParseIntervalError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn interval_display_parses_back() {
        for interval in [
            CalendarInterval::Days(30),
            CalendarInterval::Weeks(1),
            CalendarInterval::Minutes(90),
        ] {
            assert_eq!(interval.to_string().parse(), Ok(interval));
        }
        assert_eq!(CalendarInterval::Days(1).to_string(), "interval 1 day");
    }

    #[test]
    fn table_properties_override_defaults() -> Result<(), ConfigError> {
        let props = BTreeMap::from([
            (CHECKPOINT_INTERVAL_KEY.to_string(), "2".to_string()),
            (LOG_RETENTION_KEY.to_string(), "interval 7 days".to_string()),
            (ENABLE_EXPIRED_LOG_CLEANUP_KEY.to_string(), "false".to_string()),
            (ISOLATION_LEVEL_KEY.to_string(), "Serializable".to_string()),
            ("owner".to_string(), "ops".to_string()),
        ]);

        let config = LogConfig::default().with_table_properties(&props)?;
        assert_eq!(config.checkpoint_interval, 2);
        assert_eq!(config.log_retention, CalendarInterval::Days(7));
        assert!(!config.expired_log_cleanup_enabled);
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        Ok(())
    }

    #[test]
    fn malformed_table_properties_are_errors() {
        let bad = |key: &str, value: &str| {
            let props = BTreeMap::from([(key.to_string(), value.to_string())]);
            LogConfig::default().with_table_properties(&props)
        };

        assert!(matches!(
            bad(CHECKPOINT_INTERVAL_KEY, "ten"),
            Err(ConfigError::InvalidInteger { .. })
        ));
        assert!(matches!(
            bad(LOG_RETENTION_KEY, "interval 1 year"),
            Err(ConfigError::InvalidInterval { .. })
        ));
        assert!(matches!(
            bad(ENABLE_EXPIRED_LOG_CLEANUP_KEY, "yes"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            bad(ISOLATION_LEVEL_KEY, "ReadCommitted"),
            Err(ConfigError::InvalidIsolationLevel { .. })
        ));
    }
}
