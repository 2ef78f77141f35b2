//! Access coordination for a single embedded `SQLite` store.
//!
//! One supervised handle per process, transient lock errors retried with
//! jittered exponential backoff, and transaction scopes that nest as
//! savepoints. Start from [`Coordinator`]; [`prelude`] pulls in the common types.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod operation;
pub mod prelude;
pub mod results;
pub mod retry;
pub mod sqlite;
pub mod supervisor;
pub mod transaction;
pub mod types;

pub use config::{
    BeginMode, CoordinatorConfig, JournalMode, RetryOptions, ShutdownPolicy, SqliteOptions,
    SqliteOptionsBuilder, SynchronousMode, TransactionOptions,
};
pub use coordinator::Coordinator;
pub use error::CoordinatorError;
pub use operation::{Operation, RetryClassifier};
pub use results::{DbRow, ResultSet, RunOutcome};
pub use retry::{RetryExecutor, RetryState, backoff_delay};
pub use supervisor::{
    ConnectionLease, ConnectionSupervisor, HandleInfo, SupervisorStats, install_panic_hook,
    shutdown_on, spawn_shutdown_listener,
};
pub use transaction::{ScopeFuture, TransactionScope, savepoint_name};
pub use types::RowValues;
