use std::thread;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::SqliteOptions;
use crate::error::{CoordinatorError, is_contention};

use super::{Counters, HandleInfo, OpenHandle, Slot};

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

fn connection_error(db_path: &str, stage: &str, err: &rusqlite::Error) -> CoordinatorError {
    CoordinatorError::ConnectionError(format!("sqlite {stage} failed for {db_path}: {err}"))
}

/// Open a handle and apply the concurrency pragmas, then validate it.
pub(super) fn open_handle(
    options: &SqliteOptions,
    generation: u64,
) -> Result<OpenHandle, CoordinatorError> {
    let path = options.db_path.as_str();
    let conn = if options.is_memory() {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    }
    .map_err(|e| connection_error(path, "open", &e))?;

    conn.busy_timeout(options.busy_timeout)
        .map_err(|e| connection_error(path, "busy_timeout", &e))?;

    // In-memory stores answer "memory" regardless of the request.
    let journal_mode: String = conn
        .query_row(
            &format!("PRAGMA journal_mode = {}", options.journal_mode.as_pragma()),
            [],
            |row| row.get(0),
        )
        .map_err(|e| connection_error(path, "journal_mode", &e))?;

    conn.execute_batch(&format!(
        "PRAGMA synchronous = {}; PRAGMA foreign_keys = {};",
        options.synchronous.as_pragma(),
        if options.foreign_keys { "ON" } else { "OFF" },
    ))
    .map_err(|e| connection_error(path, "pragma", &e))?;

    let probe: i64 = conn
        .query_row("SELECT 1", [], |row| row.get(0))
        .map_err(|e| connection_error(path, "validation", &e))?;
    if probe != 1 {
        return Err(CoordinatorError::ConnectionError(format!(
            "sqlite validation query returned {probe} for {path}"
        )));
    }

    let journal_mode = journal_mode.to_lowercase();
    info!(
        db_path = path,
        generation,
        journal_mode = journal_mode.as_str(),
        busy_timeout_ms = u64::try_from(options.busy_timeout.as_millis()).unwrap_or(u64::MAX),
        "sqlite handle opened"
    );

    Ok(OpenHandle {
        conn,
        info: HandleInfo {
            generation,
            journal_mode,
            busy_timeout: options.busy_timeout,
            opened_at: Utc::now(),
        },
    })
}

/// Close the handle currently in the slot (if any) and leave `next` behind.
/// A shut-down slot stays shut down.
pub(super) fn close_slot(slot: &mut Slot, next: Slot, counters: &Counters, reason: &'static str) {
    if matches!(slot, Slot::ShutDown) {
        return;
    }
    if let Slot::Open(handle) = std::mem::replace(slot, next) {
        close_handle(handle, counters, reason);
    }
}

pub(super) fn close_handle(handle: OpenHandle, counters: &Counters, reason: &'static str) {
    let generation = handle.info.generation;
    if let Err((_conn, err)) = handle.conn.close() {
        warn!(generation, reason, error = %err, "sqlite close reported an error; dropping handle");
    }
    counters.record_close();
    info!(generation, reason, "sqlite handle closed");
}

/// Make the slot hold a usable handle: open a vacant slot, and roll back any
/// transaction a previous holder left behind.
pub(super) fn prepare_slot(
    slot: &mut Slot,
    options: &SqliteOptions,
    counters: &Counters,
) -> Result<(), CoordinatorError> {
    match slot {
        Slot::ShutDown => Err(CoordinatorError::ConnectionError(
            "sqlite supervisor has been shut down".into(),
        )),
        Slot::Open(handle) if handle.conn.is_autocommit() => Ok(()),
        Slot::Open(handle) => {
            warn!(
                generation = handle.info.generation,
                "sqlite handle still inside a transaction; rolling back before reuse"
            );
            if let Err(err) = rollback_with_busy_retries(&handle.conn) {
                warn!(error = %err, "leftover rollback failed; replacing sqlite handle");
                counters.record_invalidation();
                close_slot(slot, Slot::Vacant, counters, "leftover transaction");
                return open_into(slot, options, counters);
            }
            Ok(())
        }
        Slot::Vacant => open_into(slot, options, counters),
    }
}

fn open_into(
    slot: &mut Slot,
    options: &SqliteOptions,
    counters: &Counters,
) -> Result<(), CoordinatorError> {
    let handle = open_handle(options, counters.next_generation())?;
    counters.record_open();
    *slot = Slot::Open(handle);
    Ok(())
}

/// `ROLLBACK` that rides out a short burst of busy reports.
pub(crate) fn rollback_with_busy_retries(conn: &Connection) -> Result<(), CoordinatorError> {
    for (idx, delay) in ROLLBACK_BUSY_RETRIES.iter().copied().enumerate() {
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => return Ok(()),
            Err(err) if is_contention(&err) && idx + 1 < ROLLBACK_BUSY_RETRIES.len() => {
                thread::sleep(delay);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(CoordinatorError::ExecutionError(
        "rollback retries exhausted".into(),
    ))
}
