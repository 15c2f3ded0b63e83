use async_trait::async_trait;
use thiserror::Error;

use crate::table::ResultSet;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query execution failed: {0}")]
    Execution(String),
    #[error("query result could not be decoded: {0}")]
    Decode(String),
}

/// The warehouse as seen by a conversation turn: run agent-generated SQL and
/// look up the transcript a search citation points at.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ResultSet, QueryError>;

    /// Single-row lookup keyed by document id. `Ok(None)` means no such row.
    async fn lookup_transcript(&self, doc_id: &str) -> Result<Option<String>, QueryError>;
}

/// Generated SQL is run as a single statement; statement separators are
/// removed before execution.
pub fn prepare_generated_sql(sql: &str) -> String {
    sql.replace(';', "").trim().to_string()
}
