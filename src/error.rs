use rusqlite::ffi::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the coordinator.
///
/// `TransientLock` is the only kind the retry executor re-attempts by default.
/// Every other kind reaches the caller on first occurrence.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The handle could not be opened, validated, or is no longer available.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The store reported itself busy or locked.
    #[error("Transient lock error: {0}")]
    TransientLock(#[source] rusqlite::Error),

    /// Begin/commit/rollback or savepoint management failed.
    #[error("Transaction error at depth {depth}{}: {source}", savepoint_suffix(.savepoint))]
    TransactionError {
        depth: usize,
        savepoint: Option<String>,
        #[source]
        source: Box<CoordinatorError>,
    },

    /// Malformed statement, bad parameters, or a constraint the statement violated.
    #[error("Caller error: {message}")]
    CallerError {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// Any other failure reported by `SQLite`.
    #[error(transparent)]
    SqliteError(rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

fn savepoint_suffix(savepoint: &Option<String>) -> String {
    savepoint
        .as_ref()
        .map(|name| format!(" (savepoint {name})"))
        .unwrap_or_default()
}

impl CoordinatorError {
    /// Build a caller error that did not originate in `SQLite`.
    pub fn caller(message: impl Into<String>) -> Self {
        CoordinatorError::CallerError {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn transaction(depth: usize, savepoint: Option<&str>, source: Self) -> Self {
        CoordinatorError::TransactionError {
            depth,
            savepoint: savepoint.map(str::to_owned),
            source: Box::new(source),
        }
    }

    /// Default retry classifier: only busy/locked reports are worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinatorError::TransientLock(_))
    }

    /// Whether the error means the handle itself can no longer be trusted.
    #[must_use]
    pub fn requires_invalidation(&self) -> bool {
        match self {
            CoordinatorError::SqliteError(err) => poisons_handle(err),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for CoordinatorError {
    fn from(err: rusqlite::Error) -> Self {
        if is_contention(&err) {
            CoordinatorError::TransientLock(err)
        } else if is_caller_fault(&err) {
            CoordinatorError::CallerError {
                message: err.to_string(),
                source: Some(err),
            }
        } else {
            CoordinatorError::SqliteError(err)
        }
    }
}

/// `SQLITE_BUSY` shows up under file-level write contention, `SQLITE_LOCKED`
/// under shared-cache table locks. Extended codes (e.g. `BUSY_SNAPSHOT`) map
/// onto the same primary codes.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn is_caller_code(code: ErrorCode) -> bool {
    matches!(
        code,
        // SQLITE_ERROR: syntax errors, unknown tables/columns.
        ErrorCode::Unknown
            | ErrorCode::ConstraintViolation
            | ErrorCode::TypeMismatch
            | ErrorCode::TooBig
            | ErrorCode::ParameterOutOfRange
    )
}

fn is_caller_fault(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => is_caller_code(failure.code),
        // Prepare failures carry the offending token offset.
        rusqlite::Error::SqlInputError { error, .. } => is_caller_code(error.code),
        rusqlite::Error::InvalidParameterCount(..)
        | rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::InvalidColumnIndex(_)
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::ExecuteReturnedResults
        | rusqlite::Error::QueryReturnedNoRows
        | rusqlite::Error::ToSqlConversionFailure(_)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => true,
        _ => false,
    }
}

fn poisons_handle(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::CannotOpen,
                ..
            },
            _,
        )
    )
}
