//! Backend connection seam
//!
//! The health streamer and the state monitor talk to the backing mysqld
//! only through these traits, so tests can substitute an in-memory
//! connection.

use futures::future::BoxFuture;

use crate::protocol::Row;

use super::connection::ConnectionError;

/// Result of a statement, or one batch of a streamed result set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names (empty for statements without a result set)
    pub fields: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// Index of the named column, compared case-insensitively
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.eq_ignore_ascii_case(name))
    }

    /// Value of the named column in the given row
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// Callback invoked once per streamed batch
pub type BatchCallback<'a> =
    dyn FnMut(QueryResult) -> Result<(), ConnectionError> + Send + 'a;

/// A single connection to the backing store
pub trait DbConn: Send {
    /// Execute a statement and buffer its whole result
    fn exec<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<QueryResult, ConnectionError>>;

    /// Execute a query and hand rows to `on_batch` in batches of at most
    /// `batch_size` rows. Every batch carries the column names.
    fn stream_rows<'a>(
        &'a mut self,
        sql: &'a str,
        batch_size: usize,
        on_batch: &'a mut BatchCallback<'_>,
    ) -> BoxFuture<'a, Result<(), ConnectionError>>;

    /// Whether the connection can still be used
    fn is_usable(&self) -> bool;

    /// Mark the connection broken so it is discarded instead of reused
    fn close(&mut self);
}

/// Opens new connections to the backing store
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn DbConn>, ConnectionError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_by_column_name() {
        let result = QueryResult {
            fields: vec!["Variable_name".to_string(), "Value".to_string()],
            rows: vec![vec![Some("Questions".to_string()), Some("1234".to_string())]],
            rows_affected: 0,
        };
        assert_eq!(result.value(0, "value"), Some("1234"));
        assert_eq!(result.value(0, "missing"), None);
        assert_eq!(result.value(1, "Value"), None);
    }
}
