use rusqlite::types::Value;
use rusqlite::{Connection, Statement};

use crate::config::BeginMode;
use crate::error::CoordinatorError;
use crate::results::{ResultSet, RunOutcome};
use crate::types::RowValues;

use super::params::Params;

/// Extract a `RowValues` from a `SQLite` row.
///
/// # Errors
/// Returns `CoordinatorError` if the column cannot be read.
pub fn sqlite_extract_value(row: &rusqlite::Row, idx: usize) -> Result<RowValues, CoordinatorError> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

/// Run a prepared statement and materialize every row.
///
/// # Errors
/// Returns `CoordinatorError` if stepping the statement or reading a column fails.
pub fn build_result_set(stmt: &mut Statement, params: &Params) -> Result<ResultSet, CoordinatorError> {
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let col_count = column_names.len();
    let mut result_set = ResultSet::with_columns(column_names, 10);

    let refs = params.as_refs();
    let mut rows_iter = stmt.query(&refs[..])?;
    while let Some(row) = rows_iter.next()? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(sqlite_extract_value(row, i)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}

/// Prepare (cached) and run a read.
///
/// # Errors
/// Returns `CoordinatorError` if preparing or executing the statement fails.
pub fn execute_select(
    conn: &Connection,
    sql: &str,
    params: &Params,
) -> Result<ResultSet, CoordinatorError> {
    let mut stmt = conn.prepare_cached(sql)?;
    build_result_set(&mut stmt, params)
}

/// Prepare (cached) and run a write, reporting affected-row metadata.
///
/// # Errors
/// Returns `CoordinatorError` if preparing or executing the statement fails.
pub fn execute_run(conn: &Connection, sql: &str, params: &Params) -> Result<RunOutcome, CoordinatorError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let refs = params.as_refs();
    let rows_affected = stmt.execute(&refs[..])?;
    Ok(RunOutcome {
        rows_affected,
        last_insert_rowid: conn.last_insert_rowid(),
    })
}

/// Execute a batch; wraps it in a transaction begun with `mode` when not
/// already inside one so a replayed batch never half-applies.
///
/// # Errors
/// Returns `CoordinatorError` if beginning the transaction or any statement
/// of the batch fails.
pub fn execute_batch_atomic(
    conn: &mut Connection,
    sql: &str,
    mode: BeginMode,
) -> Result<(), CoordinatorError> {
    if conn.is_autocommit() {
        let tx = conn.transaction_with_behavior(mode.behavior())?;
        tx.execute_batch(sql)?;
        tx.commit()?;
    } else {
        conn.execute_batch(sql)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_honours_begin_mode() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("batch.db");
        let mut conn = Connection::open(&path).expect("open");
        conn.busy_timeout(std::time::Duration::ZERO).expect("busy timeout");
        conn.execute_batch("CREATE TABLE t (id INTEGER)").expect("schema");

        let writer = Connection::open(&path).expect("open writer");
        writer.execute_batch("BEGIN IMMEDIATE").expect("take write lock");

        execute_batch_atomic(&mut conn, "SELECT 1", BeginMode::Deferred)
            .expect("deferred batch only reads");
        let err = execute_batch_atomic(&mut conn, "SELECT 1", BeginMode::Immediate)
            .expect_err("immediate batch needs the write lock");
        assert!(err.is_transient(), "got {err:?}");
        assert!(conn.is_autocommit());

        writer.execute_batch("ROLLBACK").expect("release write lock");
        execute_batch_atomic(&mut conn, "INSERT INTO t VALUES (1)", BeginMode::Immediate)
            .expect("lock released");
    }
}
