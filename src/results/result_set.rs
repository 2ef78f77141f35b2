use std::collections::HashMap;
use std::sync::Arc;

use super::row::DbRow;
use crate::types::RowValues;

/// Rows returned by a read.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the query
    pub results: Vec<DbRow>,
    column_names: Arc<Vec<String>>,
    column_index: Arc<HashMap<String, usize>>,
}

impl ResultSet {
    /// Create an empty result set for the given columns.
    #[must_use]
    pub fn with_columns(column_names: Vec<String>, capacity: usize) -> ResultSet {
        let column_index = column_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        ResultSet {
            results: Vec::with_capacity(capacity),
            column_names: Arc::new(column_names),
            column_index: Arc::new(column_index),
        }
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&DbRow> {
        self.results.first()
    }

    /// Value of the first column of the first row; handy for `COUNT(*)` style reads.
    #[must_use]
    pub fn scalar(&self) -> Option<&RowValues> {
        self.first().and_then(|row| row.get_by_index(0))
    }

    pub fn add_row_values(&mut self, values: Vec<RowValues>) {
        self.results.push(DbRow {
            column_names: Arc::clone(&self.column_names),
            column_index: Arc::clone(&self.column_index),
            values,
        });
    }
}

/// Metadata returned by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOutcome {
    /// Rows changed by the statement
    pub rows_affected: usize,
    /// Rowid of the most recent successful INSERT on the handle
    pub last_insert_rowid: i64,
}
