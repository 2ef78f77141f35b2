use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{CoordinatorConfig, RetryOptions, SqliteOptionsBuilder, TransactionOptions};
use crate::error::CoordinatorError;
use crate::operation::{Operation, RetryClassifier};
use crate::results::{ResultSet, RunOutcome};
use crate::retry::RetryExecutor;
use crate::sqlite::{Params, execute_batch_atomic, execute_run, execute_select};
use crate::supervisor::{ConnectionLease, ConnectionSupervisor};
use crate::transaction::{self, ScopeFuture, TransactionScope};
use crate::types::RowValues;

/// Entry point for application code: statements and transactions against the
/// supervised handle, with transient lock errors retried.
///
/// Cloning is cheap; clones share the supervisor.
///
/// ```rust,no_run
/// use sql_coordinator::prelude::*;
///
/// # async fn demo() -> Result<(), CoordinatorError> {
/// let db = Coordinator::builder("app.db").build().await?;
/// db.execute_batch("CREATE TABLE IF NOT EXISTS labels (pr INTEGER, name TEXT)").await?;
/// db.with_transaction(|tx| {
///     Box::pin(async move {
///         tx.run("INSERT INTO labels VALUES (?1, ?2)", &[RowValues::Int(1), "bug".into()])
///             .await?;
///         Ok::<_, CoordinatorError>(())
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Coordinator {
    supervisor: Arc<ConnectionSupervisor>,
    retry: RetryExecutor,
    transaction: TransactionOptions,
    cancel: Option<CancellationToken>,
}

impl Coordinator {
    /// Wrap an existing supervisor.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ConfigError` if `retry` is invalid.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        retry: RetryOptions,
        transaction: TransactionOptions,
    ) -> Result<Self, CoordinatorError> {
        Ok(Self {
            supervisor,
            retry: RetryExecutor::new(retry)?,
            transaction,
            cancel: None,
        })
    }

    /// Build from config without touching the database; the handle opens on first use.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ConfigError` if the config is invalid.
    pub fn from_config(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let supervisor = Arc::new(ConnectionSupervisor::new(config.sqlite));
        Self::new(supervisor, config.retry, config.transaction)
    }

    /// Build from config and open the handle now.
    ///
    /// # Errors
    /// Returns `CoordinatorError::ConfigError` for invalid config or
    /// `CoordinatorError::ConnectionError` if the store cannot be opened.
    pub async fn connect(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let coordinator = Self::from_config(config)?;
        drop(coordinator.supervisor.acquire().await?);
        Ok(coordinator)
    }

    #[must_use]
    pub fn builder(db_path: impl Into<String>) -> SqliteOptionsBuilder {
        SqliteOptionsBuilder::new(db_path)
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn retry_options(&self) -> &RetryOptions {
        self.retry.options()
    }

    /// A clone whose calls stop waiting once `token` is cancelled.
    ///
    /// Cancellation is observed while waiting for the handle and between
    /// attempts. A statement already running on the blocking pool finishes;
    /// an open transaction is rolled back when its lease is dropped.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    /// Close the handle for good. See [`ConnectionSupervisor::shutdown`].
    ///
    /// # Errors
    /// Returns `CoordinatorError::ExecutionError` if the blocking close task fails.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.supervisor.shutdown().await
    }

    async fn lease(&self) -> Result<ConnectionLease, CoordinatorError> {
        match &self.cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(CoordinatorError::Cancelled),
                lease = self.supervisor.acquire() => lease,
            },
            None => self.supervisor.acquire().await,
        }
    }

    /// Run a read statement, retrying transient lock errors.
    ///
    /// # Errors
    /// Returns `CoordinatorError` on fatal failure or once retries are exhausted.
    pub async fn query(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, CoordinatorError> {
        self.select_with(Arc::from(sql), Params::convert(params), CoordinatorError::is_transient)
            .await
    }

    /// Run a write statement, retrying transient lock errors.
    ///
    /// A busy report means the statement did not apply, so replaying a single
    /// autocommit statement is safe. Multi-statement writes belong in
    /// [`with_transaction`](Self::with_transaction).
    ///
    /// # Errors
    /// Returns `CoordinatorError` on fatal failure or once retries are exhausted.
    pub async fn run(&self, sql: &str, params: &[RowValues]) -> Result<RunOutcome, CoordinatorError> {
        self.write_with(Arc::from(sql), Params::convert(params), CoordinatorError::is_transient)
            .await
    }

    /// # Errors
    /// Returns `CoordinatorError` on fatal failure or once retries are exhausted.
    pub async fn query_operation(&self, op: &Operation) -> Result<ResultSet, CoordinatorError> {
        self.select_with(op.shared_sql(), Params::convert(op.params()), op.classifier())
            .await
    }

    /// # Errors
    /// Returns `CoordinatorError` on fatal failure or once retries are exhausted.
    pub async fn run_operation(&self, op: &Operation) -> Result<RunOutcome, CoordinatorError> {
        self.write_with(op.shared_sql(), Params::convert(op.params()), op.classifier())
            .await
    }

    /// Run several `;`-separated statements as one atomic batch, begun with
    /// the configured [`BeginMode`](crate::config::BeginMode).
    ///
    /// # Errors
    /// Returns `CoordinatorError` on fatal failure or once retries are exhausted.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), CoordinatorError> {
        let sql: Arc<str> = Arc::from(sql);
        let sql = &sql;
        let mode = self.transaction.begin_mode;
        self.retry
            .run(
                "batch",
                CoordinatorError::is_transient,
                self.cancel.as_ref(),
                move |_| async move {
                    let sql = Arc::clone(sql);
                    let mut lease = self.lease().await?;
                    lease.run(move |conn| execute_batch_atomic(conn, &sql, mode)).await
                },
            )
            .await
    }

    /// Run `callback` as one atomic unit.
    ///
    /// Every statement issued through the scope commits together or not at
    /// all. Scopes opened from inside the callback become savepoints. When the
    /// transaction fails on a transient lock it is rolled back and `callback`
    /// runs again from the start, so it must be safe to replay.
    ///
    /// Do not call back into this `Coordinator` from inside `callback`; the
    /// scope already holds the handle. Use the scope's own methods.
    ///
    /// # Errors
    /// Returns the callback's error after rollback, the last transient error
    /// once retries are exhausted, or `CoordinatorError::TransactionError` when
    /// begin, commit, or a savepoint step fails. COMMIT has its own retry
    /// budget; a commit still busy after that budget is reported as a
    /// `TransactionError` (depth 1) wrapping the `TransientLock`, not as a
    /// bare `TransientLock`, and the scope is not replayed.
    pub async fn with_transaction<T, F>(&self, callback: F) -> Result<T, CoordinatorError>
    where
        F: for<'s> Fn(&'s mut TransactionScope<'_>) -> ScopeFuture<'s, T>,
    {
        let callback = &callback;
        self.retry
            .run(
                "transaction",
                CoordinatorError::is_transient,
                self.cancel.as_ref(),
                move |attempt| async move {
                    let mut lease = self.lease().await?;
                    if attempt > 1 {
                        debug!(attempt, "replaying transaction scope");
                    }
                    transaction::run_root(&mut lease, &self.retry, self.transaction.begin_mode, callback)
                        .await
                },
            )
            .await
    }

    async fn select_with(
        &self,
        sql: Arc<str>,
        params: Params,
        classifier: RetryClassifier,
    ) -> Result<ResultSet, CoordinatorError> {
        let (sql, params) = (&sql, &params);
        self.retry
            .run("query", classifier, self.cancel.as_ref(), move |_| async move {
                let (sql, params) = (Arc::clone(sql), params.clone());
                let mut lease = self.lease().await?;
                lease.run(move |conn| execute_select(conn, &sql, &params)).await
            })
            .await
    }

    async fn write_with(
        &self,
        sql: Arc<str>,
        params: Params,
        classifier: RetryClassifier,
    ) -> Result<RunOutcome, CoordinatorError> {
        let (sql, params) = (&sql, &params);
        self.retry
            .run("run", classifier, self.cancel.as_ref(), move |_| async move {
                let (sql, params) = (Arc::clone(sql), params.clone());
                let mut lease = self.lease().await?;
                lease.run(move |conn| execute_run(conn, &sql, &params)).await
            })
            .await
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("supervisor", &self.supervisor)
            .field("retry", self.retry.options())
            .field("begin_mode", &self.transaction.begin_mode)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
