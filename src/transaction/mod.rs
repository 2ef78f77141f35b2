//! Transaction coordinator: atomic scopes over the leased handle.
//!
//! The outermost scope is a real transaction; every scope opened from inside
//! another one is a savepoint. Depth travels with the [`TransactionScope`]
//! value, so concurrent call stacks never share nesting state.

mod savepoint;

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error};

use crate::config::BeginMode;
use crate::error::CoordinatorError;
use crate::operation::Operation;
use crate::results::{ResultSet, RunOutcome};
use crate::retry::RetryExecutor;
use crate::sqlite::{Params, execute_run, execute_select};
use crate::supervisor::{ConnectionLease, rollback_with_busy_retries};
use crate::types::RowValues;

pub use savepoint::savepoint_name;

/// Future returned by a transaction callback.
pub type ScopeFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T, CoordinatorError>> + Send + 's>>;

/// An in-flight atomic unit, handed to transaction callbacks.
///
/// Statements issued through a scope run in the order issued, on the handle
/// the scope holds for its whole lifetime. They are not retried one by one:
/// a transient failure propagates and the outermost scope is replayed.
pub struct TransactionScope<'c> {
    lease: &'c mut ConnectionLease,
    retry: &'c RetryExecutor,
    depth: usize,
    savepoint: Option<String>,
}

impl TransactionScope<'_> {
    /// Nesting depth: 1 for the outermost transaction.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Savepoint backing this scope; `None` for the outermost transaction.
    #[must_use]
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// # Errors
    /// Returns `CoordinatorError` if the statement fails.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, CoordinatorError> {
        let sql = sql.to_owned();
        let params = Params::convert(params);
        self.lease
            .run(move |conn| execute_select(conn, &sql, &params))
            .await
    }

    /// # Errors
    /// Returns `CoordinatorError` if the statement fails.
    pub async fn run(
        &mut self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<RunOutcome, CoordinatorError> {
        let sql = sql.to_owned();
        let params = Params::convert(params);
        self.lease
            .run(move |conn| execute_run(conn, &sql, &params))
            .await
    }

    /// # Errors
    /// Returns `CoordinatorError` if the statement fails.
    pub async fn query_operation(&mut self, op: &Operation) -> Result<ResultSet, CoordinatorError> {
        let sql = op.shared_sql();
        let params = Params::convert(op.params());
        self.lease
            .run(move |conn| execute_select(conn, &sql, &params))
            .await
    }

    /// # Errors
    /// Returns `CoordinatorError` if the statement fails.
    pub async fn run_operation(&mut self, op: &Operation) -> Result<RunOutcome, CoordinatorError> {
        let sql = op.shared_sql();
        let params = Params::convert(op.params());
        self.lease
            .run(move |conn| execute_run(conn, &sql, &params))
            .await
    }

    /// # Errors
    /// Returns `CoordinatorError` if any statement of the batch fails.
    pub async fn execute_batch(&mut self, sql: &str) -> Result<(), CoordinatorError> {
        let sql = sql.to_owned();
        self.lease
            .run(move |conn| conn.execute_batch(&sql).map_err(CoordinatorError::from))
            .await
    }

    /// Run `callback` inside a savepoint nested in this scope.
    ///
    /// On error the savepoint is rolled back and the error returned; this
    /// scope's own statements stay intact and it may still commit.
    ///
    /// # Errors
    /// Returns the callback's error, or `CoordinatorError::TransactionError` if
    /// the savepoint cannot be created, released, or rolled back.
    pub async fn with_transaction<T, F>(&mut self, callback: F) -> Result<T, CoordinatorError>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<'_>) -> ScopeFuture<'s, T>,
    {
        let depth = self.depth + 1;
        let name = savepoint_name(depth);
        let create = savepoint::create_sql(&name);
        self.lease
            .run(move |conn| conn.execute_batch(&create).map_err(CoordinatorError::from))
            .await
            .map_err(|err| CoordinatorError::transaction(depth, Some(&name), err))?;
        debug!(depth, savepoint = name.as_str(), "savepoint opened");

        let mut child = TransactionScope {
            lease: &mut *self.lease,
            retry: self.retry,
            depth,
            savepoint: Some(name),
        };
        let outcome = callback(&mut child).await;
        match outcome {
            Ok(value) => {
                child.release().await?;
                Ok(value)
            }
            Err(err) => Err(child.rollback_to(err).await),
        }
    }

    async fn release(self) -> Result<(), CoordinatorError> {
        let depth = self.depth;
        let name = self.savepoint.unwrap_or_else(|| savepoint_name(depth));
        let sql = savepoint::release_sql(&name);
        match self
            .lease
            .run(move |conn| conn.execute_batch(&sql).map_err(CoordinatorError::from))
            .await
        {
            Ok(()) => {
                debug!(depth, savepoint = name.as_str(), "savepoint released");
                Ok(())
            }
            Err(err) => {
                let undo = savepoint::rollback_to_sql(&name);
                if let Err(undo_err) = self
                    .lease
                    .run(move |conn| conn.execute_batch(&undo).map_err(CoordinatorError::from))
                    .await
                {
                    error!(depth, savepoint = name.as_str(), error = %undo_err, "rollback after failed release also failed");
                }
                Err(CoordinatorError::transaction(depth, Some(&name), err))
            }
        }
    }

    async fn rollback_to(self, cause: CoordinatorError) -> CoordinatorError {
        let depth = self.depth;
        let name = self.savepoint.unwrap_or_else(|| savepoint_name(depth));
        if !self.lease.is_valid() {
            // The handle is gone and took the whole transaction with it.
            return cause;
        }
        let sql = savepoint::rollback_to_sql(&name);
        match self
            .lease
            .run(move |conn| conn.execute_batch(&sql).map_err(CoordinatorError::from))
            .await
        {
            Ok(()) => {
                debug!(depth, savepoint = name.as_str(), error = %cause, "savepoint rolled back");
                cause
            }
            Err(err) => {
                error!(
                    depth,
                    savepoint = name.as_str(),
                    original = %cause,
                    error = %err,
                    "rollback to savepoint failed"
                );
                CoordinatorError::transaction(depth, Some(&name), err)
            }
        }
    }

    async fn commit_root(self) -> Result<(), CoordinatorError> {
        let mut state = self.retry.state("commit");
        loop {
            let attempt = self
                .lease
                .run(|conn| conn.execute_batch("COMMIT").map_err(CoordinatorError::from))
                .await;
            let Err(err) = attempt else {
                debug!(attempts = state.attempt(), "transaction committed");
                return Ok(());
            };
            if let Err(err) = state
                .handle_error(err, CoordinatorError::is_transient, None)
                .await
            {
                rollback_root(self.lease, &err).await;
                return Err(CoordinatorError::transaction(1, None, err));
            }
        }
    }
}

async fn begin(lease: &mut ConnectionLease, mode: BeginMode) -> Result<(), CoordinatorError> {
    let sql = mode.as_sql();
    lease
        .run(move |conn| conn.execute_batch(sql).map_err(CoordinatorError::from))
        .await
        .map_err(|err| {
            // Busy on BEGIN is worth replaying the whole scope.
            if err.is_transient() {
                err
            } else {
                CoordinatorError::transaction(1, None, err)
            }
        })
}

/// Best-effort rollback of the outermost transaction. A failed rollback
/// invalidates the handle, which aborts the transaction on close.
async fn rollback_root(lease: &mut ConnectionLease, cause: &CoordinatorError) {
    if !lease.in_transaction() {
        return;
    }
    match lease.run(|conn| rollback_with_busy_retries(conn)).await {
        Ok(()) => debug!(error = %cause, "transaction rolled back"),
        Err(err) => {
            error!(original = %cause, error = %err, "transaction rollback failed; invalidating handle");
            if let Err(invalidate_err) = lease.invalidate().await {
                error!(error = %invalidate_err, "invalidating handle after failed rollback failed");
            }
        }
    }
}

/// Run one attempt of an outermost transaction on `lease`.
pub(crate) async fn run_root<T, F>(
    lease: &mut ConnectionLease,
    retry: &RetryExecutor,
    begin_mode: BeginMode,
    callback: &F,
) -> Result<T, CoordinatorError>
where
    F: for<'s> Fn(&'s mut TransactionScope<'_>) -> ScopeFuture<'s, T>,
{
    begin(lease, begin_mode).await?;
    debug!(mode = begin_mode.as_sql(), "transaction started");

    let mut scope = TransactionScope {
        lease,
        retry,
        depth: 1,
        savepoint: None,
    };
    let outcome = callback(&mut scope).await;
    match outcome {
        Ok(value) => {
            scope.commit_root().await?;
            Ok(value)
        }
        Err(err) => {
            rollback_root(scope.lease, &err).await;
            Err(err)
        }
    }
}
