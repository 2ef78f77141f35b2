use std::fmt;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, warn};

use crate::error::CoordinatorError;

use super::open::{close_slot, rollback_with_busy_retries};
use super::{Counters, HandleInfo, Slot, on_blocking_pool};

/// Exclusive access to the supervised handle.
///
/// Every statement the coordinator issues goes through a lease. Dropping a
/// lease whose handle is still inside a transaction rolls that transaction
/// back before anyone else can acquire the handle.
pub struct ConnectionLease {
    guard: Option<OwnedMutexGuard<Slot>>,
    counters: Arc<Counters>,
}

impl ConnectionLease {
    pub(super) fn new(guard: OwnedMutexGuard<Slot>, counters: Arc<Counters>) -> Self {
        Self {
            guard: Some(guard),
            counters,
        }
    }

    /// Info about the leased handle; `None` once it has been invalidated.
    #[must_use]
    pub fn info(&self) -> Option<&HandleInfo> {
        match self.guard.as_deref() {
            Some(Slot::Open(handle)) => Some(&handle.info),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.info().is_some()
    }

    /// Whether the handle is currently inside a transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        matches!(self.guard.as_deref(), Some(Slot::Open(handle)) if !handle.conn.is_autocommit())
    }

    /// Run synchronous `rusqlite` work against the leased handle on the blocking pool.
    ///
    /// Errors that mean the handle can no longer be trusted invalidate it
    /// before they are returned.
    ///
    /// # Errors
    /// Returns whatever `func` returns, or `CoordinatorError::ConnectionError` if the
    /// handle was invalidated earlier on this lease.
    pub async fn run<F, R>(&mut self, func: F) -> Result<R, CoordinatorError>
    where
        F: FnOnce(&mut Connection) -> Result<R, CoordinatorError> + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.guard.take().ok_or_else(|| {
            CoordinatorError::ConnectionError(
                "sqlite lease lost its handle after a failed blocking task".into(),
            )
        })?;
        let (guard, result) = on_blocking_pool(guard, move |slot| match slot {
            Slot::Open(handle) => func(&mut handle.conn),
            Slot::Vacant | Slot::ShutDown => Err(CoordinatorError::ConnectionError(
                "sqlite handle was invalidated while leased".into(),
            )),
        })
        .await?;
        self.guard = Some(guard);

        if let Err(err) = &result
            && err.requires_invalidation()
        {
            error!(error = %err, "fatal sqlite error on leased handle");
            self.invalidate().await?;
        }
        result
    }

    /// Drop the leased handle; the next `acquire` opens a fresh one.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ExecutionError` if the blocking close task fails.
    pub async fn invalidate(&mut self) -> Result<(), CoordinatorError> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let counters = Arc::clone(&self.counters);
        let (guard, ()) = on_blocking_pool(guard, move |slot| {
            if matches!(slot, Slot::Open(_)) {
                warn!("invalidating leased sqlite handle");
                counters.record_invalidation();
                close_slot(slot, Slot::Vacant, &counters, "invalidated");
            }
        })
        .await?;
        self.guard = Some(guard);
        Ok(())
    }
}

fn abandon_transaction(slot: &mut Slot, counters: &Counters) {
    let Slot::Open(handle) = slot else {
        return;
    };
    warn!(
        generation = handle.info.generation,
        "lease dropped inside a transaction; rolling back"
    );
    if let Err(err) = rollback_with_busy_retries(&handle.conn) {
        error!(error = %err, "rollback of abandoned transaction failed; invalidating handle");
        counters.record_invalidation();
        close_slot(slot, Slot::Vacant, counters, "abandoned transaction");
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.in_transaction() {
            return;
        }
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        let counters = Arc::clone(&self.counters);
        let mut cleanup = move || abandon_transaction(&mut guard, &counters);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn_blocking(cleanup));
            }
            Err(_) => cleanup(),
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("info", &self.info())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}
