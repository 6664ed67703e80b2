use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an execution backend.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The backend ran the statement and rejected it. The text is what the
    /// classifier works from.
    #[error("{0}")]
    Query(String),

    /// The backend could not be reached at all.
    #[error("Execution backend unavailable: {0}")]
    Unavailable(String),
}

impl ExecutionError {
    /// Raw provider text, without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            ExecutionError::Query(msg) | ExecutionError::Unavailable(msg) => msg,
        }
    }
}

/// Materialized result set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Runs SQL against a relational store.
///
/// Implementations must stop the statement once `timeout` elapses and must
/// never materialize more than `row_cap` rows.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        timeout: Duration,
        row_cap: usize,
    ) -> Result<QueryRows, ExecutionError>;
}
