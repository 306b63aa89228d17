//! The boundary between statement building and the database.

use crate::error::BackendError;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A decoded row: column name to value, in column order.
pub type Row = Map<String, Value>;

/// Outcome of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Rows returned or affected, as reported by the backend.
    pub row_count: u64,
}

/// Executes SQL text with positional parameters.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendError>;

    /// Release every pooled connection.
    async fn end(&self) {}
}
