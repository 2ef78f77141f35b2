use std::sync::Arc;

use crate::error::CoordinatorError;
use crate::types::RowValues;

/// Decides whether a failed attempt is worth repeating.
pub type RetryClassifier = fn(&CoordinatorError) -> bool;

/// A statement plus its bound parameters, described as a value.
///
/// Retrying an `Operation` replays exactly the described effect: the SQL and
/// parameters are fixed at construction and cannot be changed afterwards.
/// Writes submitted for retry must still be idempotent or run inside a
/// transaction, since a write that landed before a busy report would
/// otherwise apply twice.
///
/// ```rust
/// use sql_coordinator::prelude::*;
///
/// let op = Operation::new(
///     "INSERT INTO pr_events (pr, action) VALUES (?1, ?2)",
///     vec![RowValues::Int(7), RowValues::Text("opened".into())],
/// );
/// assert_eq!(op.params().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Operation {
    sql: Arc<str>,
    params: Arc<[RowValues]>,
    classifier: Option<RetryClassifier>,
}

impl Operation {
    pub fn new(sql: impl Into<String>, params: Vec<RowValues>) -> Self {
        Self {
            sql: Arc::from(sql.into()),
            params: Arc::from(params),
            classifier: None,
        }
    }

    pub fn new_without_params(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    /// Replace the default transient-lock classifier for this operation only.
    #[must_use]
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn params(&self) -> &[RowValues] {
        &self.params
    }

    #[must_use]
    pub fn classifier(&self) -> RetryClassifier {
        self.classifier.unwrap_or(CoordinatorError::is_transient)
    }

    pub(crate) fn shared_sql(&self) -> Arc<str> {
        Arc::clone(&self.sql)
    }
}
