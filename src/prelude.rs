//! Convenient imports for common functionality.
//!
//! ```rust
//! use sql_coordinator::prelude::*;
//! ```

pub use crate::config::{BeginMode, CoordinatorConfig, RetryOptions, SqliteOptions, TransactionOptions};
pub use crate::coordinator::Coordinator;
pub use crate::error::CoordinatorError;
pub use crate::operation::Operation;
pub use crate::results::{DbRow, ResultSet, RunOutcome};
pub use crate::supervisor::ConnectionSupervisor;
pub use crate::transaction::{ScopeFuture, TransactionScope};
pub use crate::types::RowValues;
