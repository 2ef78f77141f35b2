// SQLite plumbing shared by the supervisor, the transaction scopes and the facade:
// - params: conversion from `RowValues` into rusqlite values
// - query: statement execution and result materialization

pub mod params;
pub mod query;

pub use params::Params;
pub use query::{build_result_set, execute_batch_atomic, execute_run, execute_select};
