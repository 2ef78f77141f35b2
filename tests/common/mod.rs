#![allow(dead_code)]

use std::time::Duration;

use sql_coordinator::prelude::*;
use tempfile::TempDir;

/// Path to a fresh database file inside `dir`.
pub fn db_path(dir: &TempDir) -> String {
    dir.path().join("coord.db").to_string_lossy().into_owned()
}

/// Short, jitter-free backoff so timing assertions stay tight.
pub fn fast_retry(max_attempts: u32) -> RetryOptions {
    RetryOptions::default()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(10))
        .jitter(0.0)
}

pub async fn count_rows(db: &Coordinator, table: &str) -> Result<i64, CoordinatorError> {
    let rs = db.query(&format!("SELECT COUNT(*) FROM {table}"), &[]).await?;
    rs.scalar()
        .and_then(RowValues::as_int)
        .copied()
        .ok_or_else(|| CoordinatorError::ExecutionError("missing count".into()))
}

pub fn busy_error() -> CoordinatorError {
    CoordinatorError::from(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".into()),
    ))
}
