mod result_set;
mod row;

pub use result_set::{ResultSet, RunOutcome};
pub use row::DbRow;
