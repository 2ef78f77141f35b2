use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;

/// Journaling mode requested when the handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Readers proceed while a writer is active.
    #[default]
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl JournalMode {
    #[must_use]
    pub fn as_pragma(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Memory => "MEMORY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    Off,
    #[default]
    Normal,
    Full,
}

impl SynchronousMode {
    #[must_use]
    pub fn as_pragma(self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
        }
    }
}

/// How the outermost transaction takes its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeginMode {
    Deferred,
    /// Take the write lock up front so a read never has to upgrade mid-transaction.
    #[default]
    Immediate,
    Exclusive,
}

impl BeginMode {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            BeginMode::Deferred => "BEGIN DEFERRED",
            BeginMode::Immediate => "BEGIN IMMEDIATE",
            BeginMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }

    #[must_use]
    pub fn behavior(self) -> rusqlite::TransactionBehavior {
        match self {
            BeginMode::Deferred => rusqlite::TransactionBehavior::Deferred,
            BeginMode::Immediate => rusqlite::TransactionBehavior::Immediate,
            BeginMode::Exclusive => rusqlite::TransactionBehavior::Exclusive,
        }
    }
}

/// Options for the single `SQLite` handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// File path, or `:memory:`.
    pub db_path: String,
    #[serde(rename = "busy_timeout_ms", with = "duration_ms")]
    pub busy_timeout: Duration,
    pub journal_mode: JournalMode,
    pub synchronous: SynchronousMode,
    pub foreign_keys: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            busy_timeout: Duration::from_millis(5000),
            journal_mode: JournalMode::Wal,
            synchronous: SynchronousMode::Normal,
            foreign_keys: true,
        }
    }
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder(db_path: impl Into<String>) -> SqliteOptionsBuilder {
        SqliteOptionsBuilder::new(db_path)
    }

    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.db_path == ":memory:"
    }
}

/// Fluent builder for `SQLite` options.
#[derive(Debug, Clone)]
pub struct SqliteOptionsBuilder {
    opts: SqliteOptions,
    retry: RetryOptions,
    transaction: TransactionOptions,
}

impl SqliteOptionsBuilder {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            opts: SqliteOptions::new(db_path),
            retry: RetryOptions::default(),
            transaction: TransactionOptions::default(),
        }
    }

    #[must_use]
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.opts.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn journal_mode(mut self, journal_mode: JournalMode) -> Self {
        self.opts.journal_mode = journal_mode;
        self
    }

    #[must_use]
    pub fn synchronous(mut self, synchronous: SynchronousMode) -> Self {
        self.opts.synchronous = synchronous;
        self
    }

    #[must_use]
    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.opts.foreign_keys = enabled;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn begin_mode(mut self, begin_mode: BeginMode) -> Self {
        self.transaction.begin_mode = begin_mode;
        self
    }

    #[must_use]
    pub fn finish(self) -> SqliteOptions {
        self.opts
    }

    /// Build a `Coordinator` and open its handle.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError` if the options are invalid or the handle cannot be opened.
    pub async fn build(self) -> Result<Coordinator, CoordinatorError> {
        let config = CoordinatorConfig {
            sqlite: self.opts,
            retry: self.retry,
            transaction: self.transaction,
            shutdown: ShutdownPolicy::default(),
        };
        Coordinator::connect(config).await
    }
}

/// Backoff policy for transient lock errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added or removed at random.
    pub jitter: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.25,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryOptions {
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// # Errors
    ///
    /// Returns `CoordinatorError::ConfigError` describing the first invalid field.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.max_attempts == 0 {
            return Err(CoordinatorError::ConfigError(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(CoordinatorError::ConfigError(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(CoordinatorError::ConfigError(format!(
                "retry jitter must be in [0.0, 1.0), got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub begin_mode: BeginMode,
}

/// Behaviour of the signal-driven shutdown listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownPolicy {
    /// How long to wait for an in-flight lease before giving up on a clean close.
    #[serde(rename = "grace_ms", with = "duration_ms")]
    pub grace: Duration,
    /// Exit the process once shutdown finishes (or the grace period expires).
    pub exit_process: bool,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            exit_process: true,
        }
    }
}

/// Everything needed to stand up a coordinator, loadable from the host's config file.
///
/// ```rust
/// use sql_coordinator::config::CoordinatorConfig;
///
/// let cfg: CoordinatorConfig = serde_json::from_str(
///     r#"{ "sqlite": { "db_path": "app.db", "busy_timeout_ms": 2000 },
///          "retry": { "max_attempts": 3 } }"#,
/// )
/// .unwrap();
/// assert_eq!(cfg.retry.max_attempts, 3);
/// assert_eq!(cfg.sqlite.busy_timeout.as_millis(), 2000);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub sqlite: SqliteOptions,
    pub retry: RetryOptions,
    pub transaction: TransactionOptions,
    pub shutdown: ShutdownPolicy,
}

impl CoordinatorConfig {
    #[must_use]
    pub fn new(sqlite: SqliteOptions) -> Self {
        Self {
            sqlite,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns `CoordinatorError::ConfigError` if any section is invalid.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.sqlite.db_path.is_empty() {
            return Err(CoordinatorError::ConfigError("sqlite db_path is empty".into()));
        }
        self.retry.validate()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_policy() {
        let retry = RetryOptions::default();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert!(retry.validate().is_ok());

        let sqlite = SqliteOptions::default();
        assert_eq!(sqlite.journal_mode, JournalMode::Wal);
        assert!(sqlite.is_memory());
    }

    #[test]
    fn invalid_retry_options_are_rejected() {
        assert!(RetryOptions::default().max_attempts(0).validate().is_err());
        assert!(RetryOptions::default().multiplier(0.5).validate().is_err());
        assert!(RetryOptions::default().jitter(1.0).validate().is_err());
        assert!(RetryOptions::default().jitter(-0.1).validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json_with_millisecond_fields() {
        let cfg = CoordinatorConfig {
            sqlite: SqliteOptions::builder("events.db")
                .busy_timeout(Duration::from_millis(250))
                .journal_mode(JournalMode::Delete)
                .finish(),
            retry: RetryOptions::default().max_attempts(7),
            transaction: TransactionOptions {
                begin_mode: BeginMode::Deferred,
            },
            shutdown: ShutdownPolicy::default(),
        };
        let json = serde_json::to_value(&cfg).expect("serialize");
        assert_eq!(json["sqlite"]["busy_timeout_ms"], 250);
        assert_eq!(json["sqlite"]["journal_mode"], "delete");
        assert_eq!(json["transaction"]["begin_mode"], "deferred");
        let back: CoordinatorConfig = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: CoordinatorConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(cfg, CoordinatorConfig::default());
    }
}
