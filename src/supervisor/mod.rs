//! Connection supervisor: owns the single `SQLite` handle of the process.
//!
//! The handle lives in a slot behind an async mutex. [`ConnectionSupervisor::acquire`]
//! is the only way to reach it and yields a [`ConnectionLease`] with exclusive
//! access until the lease is dropped.

mod lease;
mod lifecycle;
mod open;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::SqliteOptions;
use crate::error::CoordinatorError;

pub use lease::ConnectionLease;
pub use lifecycle::{install_panic_hook, shutdown_on, spawn_shutdown_listener};
pub(crate) use open::rollback_with_busy_retries;

/// Facts recorded when a handle was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    /// Increments every time the supervisor opens a new handle.
    pub generation: u64,
    /// Journal mode reported by `SQLite` after the pragma (lowercase).
    pub journal_mode: String,
    pub busy_timeout: Duration,
    pub opened_at: DateTime<Utc>,
}

/// Snapshot of lifecycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupervisorStats {
    pub opens: u64,
    /// Generation of the most recently opened handle; 0 before the first open.
    pub generation: u64,
    pub closes: u64,
    pub invalidations: u64,
    pub shut_down: bool,
}

pub(crate) struct OpenHandle {
    pub(crate) conn: Connection,
    pub(crate) info: HandleInfo,
}

pub(crate) enum Slot {
    Vacant,
    Open(OpenHandle),
    ShutDown,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    opens: AtomicU64,
    closes: AtomicU64,
    invalidations: AtomicU64,
    shut_down: AtomicBool,
}

impl Counters {
    fn next_generation(&self) -> u64 {
        self.opens.load(Ordering::Acquire) + 1
    }

    fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::AcqRel);
    }

    fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::AcqRel);
    }

    fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
    }

    fn snapshot(&self) -> SupervisorStats {
        let opens = self.opens.load(Ordering::Acquire);
        SupervisorStats {
            opens,
            generation: opens,
            closes: self.closes.load(Ordering::Acquire),
            invalidations: self.invalidations.load(Ordering::Acquire),
            shut_down: self.shut_down.load(Ordering::Acquire),
        }
    }
}

/// Move the slot guard onto the blocking pool, run `func`, and hand the guard back.
pub(crate) async fn on_blocking_pool<F, R>(
    mut guard: OwnedMutexGuard<Slot>,
    func: F,
) -> Result<(OwnedMutexGuard<Slot>, R), CoordinatorError>
where
    F: FnOnce(&mut Slot) -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = func(&mut guard);
        (guard, result)
    })
    .await
    .map_err(|e| CoordinatorError::ExecutionError(format!("sqlite spawn_blocking join error: {e}")))
}

/// Owner of the process-wide `SQLite` handle.
///
/// Construct one at startup and share it (usually through
/// [`Coordinator`](crate::Coordinator)); tests build a fresh one per case.
pub struct ConnectionSupervisor {
    options: SqliteOptions,
    slot: Arc<Mutex<Slot>>,
    counters: Arc<Counters>,
}

impl ConnectionSupervisor {
    /// Create a supervisor; the handle is opened lazily on first `acquire`.
    #[must_use]
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            slot: Arc::new(Mutex::new(Slot::Vacant)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a supervisor and open the handle right away.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ConnectionError` if the store cannot be opened.
    pub async fn open(options: SqliteOptions) -> Result<Self, CoordinatorError> {
        let supervisor = Self::new(options);
        drop(supervisor.acquire().await?);
        Ok(supervisor)
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    /// Exclusive access to the live handle, opening it if absent.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ConnectionError` if the handle cannot be opened
    /// or the supervisor has been shut down. Not retried here.
    pub async fn acquire(&self) -> Result<ConnectionLease, CoordinatorError> {
        let guard = Arc::clone(&self.slot).lock_owned().await;
        let options = self.options.clone();
        let counters = Arc::clone(&self.counters);
        let (guard, prepared) =
            on_blocking_pool(guard, move |slot| open::prepare_slot(slot, &options, &counters))
                .await?;
        prepared?;
        Ok(ConnectionLease::new(guard, Arc::clone(&self.counters)))
    }

    /// Drop the handle after a fatal error; the next `acquire` opens a new one.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ExecutionError` if the blocking close task fails.
    pub async fn invalidate(&self) -> Result<(), CoordinatorError> {
        let guard = Arc::clone(&self.slot).lock_owned().await;
        let counters = Arc::clone(&self.counters);
        on_blocking_pool(guard, move |slot| {
            if matches!(slot, Slot::Open(_)) {
                warn!("invalidating sqlite handle");
                counters.record_invalidation();
                open::close_slot(slot, Slot::Vacant, &counters, "invalidated");
            }
        })
        .await?;
        Ok(())
    }

    /// Close the handle but keep the supervisor usable; idempotent.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ExecutionError` if the blocking close task fails.
    pub async fn release(&self) -> Result<(), CoordinatorError> {
        let guard = Arc::clone(&self.slot).lock_owned().await;
        let counters = Arc::clone(&self.counters);
        on_blocking_pool(guard, move |slot| {
            open::close_slot(slot, Slot::Vacant, &counters, "released");
        })
        .await?;
        Ok(())
    }

    /// Close the handle for good; idempotent. Later `acquire` calls fail.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ExecutionError` if the blocking close task fails.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let guard = Arc::clone(&self.slot).lock_owned().await;
        self.shutdown_locked(guard).await
    }

    /// Like [`shutdown`](Self::shutdown), but gives up if in-flight work still holds
    /// the handle after `grace`.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ConnectionError` when the grace period expires.
    pub async fn shutdown_with_timeout(&self, grace: Duration) -> Result<(), CoordinatorError> {
        let guard = tokio::time::timeout(grace, Arc::clone(&self.slot).lock_owned())
            .await
            .map_err(|_| {
                CoordinatorError::ConnectionError(format!(
                    "sqlite handle still in use after {}ms shutdown grace period",
                    grace.as_millis()
                ))
            })?;
        self.shutdown_locked(guard).await
    }

    async fn shutdown_locked(&self, guard: OwnedMutexGuard<Slot>) -> Result<(), CoordinatorError> {
        if matches!(&*guard, Slot::ShutDown) {
            debug!("sqlite supervisor already shut down");
            return Ok(());
        }
        let counters = Arc::clone(&self.counters);
        on_blocking_pool(guard, move |slot| {
            open::close_slot(slot, Slot::ShutDown, &counters, "shutdown");
            *slot = Slot::ShutDown;
            counters.shut_down.store(true, Ordering::Release);
        })
        .await?;
        info!("sqlite supervisor shut down");
        Ok(())
    }

    /// Lifecycle counters; does not wait for the handle.
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        self.counters.snapshot()
    }

    /// Info about the currently open handle, if any.
    pub async fn handle_info(&self) -> Option<HandleInfo> {
        match &*self.slot.lock().await {
            Slot::Open(handle) => Some(handle.info.clone()),
            Slot::Vacant | Slot::ShutDown => None,
        }
    }

    pub(crate) fn shared_parts(&self) -> (Arc<Mutex<Slot>>, Arc<Counters>) {
        (Arc::clone(&self.slot), Arc::clone(&self.counters))
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("db_path", &self.options.db_path)
            .field("stats", &self.stats())
            .finish()
    }
}
