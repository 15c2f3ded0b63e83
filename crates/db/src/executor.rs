use async_trait::async_trait;
use salesguard_core::query::{QueryError, QueryExecutor};
use salesguard_core::table::{CellValue, ResultSet};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use tracing::debug;

use crate::DbPool;

const TRANSCRIPT_LOOKUP_SQL: &str =
    "SELECT transcript_text FROM sales_conversations WHERE conversation_id = ? LIMIT 1";

/// Runs warehouse queries against the configured SQL database.
#[derive(Clone)]
pub struct SqlQueryExecutor {
    pool: DbPool,
}

impl SqlQueryExecutor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryExecutor for SqlQueryExecutor {
    async fn execute(&self, sql: &str) -> Result<ResultSet, QueryError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueryError::Execution(error.to_string()))?;

        let columns = match rows.first() {
            Some(row) => row.columns().iter().map(|column| column.name().to_string()).collect(),
            None => describe_columns(&self.pool, sql).await,
        };
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;

        debug!(
            event_name = "db.query.executed",
            row_count = rows.len(),
            column_count = columns.len(),
            "warehouse query executed"
        );
        Ok(ResultSet::new(columns, rows))
    }

    async fn lookup_transcript(&self, doc_id: &str) -> Result<Option<String>, QueryError> {
        sqlx::query_scalar::<_, String>(TRANSCRIPT_LOOKUP_SQL)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueryError::Execution(error.to_string()))
    }
}

async fn describe_columns(pool: &DbPool, sql: &str) -> Vec<String> {
    match pool.describe(sql).await {
        Ok(described) => {
            described.columns().iter().map(|column| column.name().to_string()).collect()
        }
        Err(_) => Vec::new(),
    }
}

fn decode_row(row: &SqliteRow) -> Result<Vec<CellValue>, QueryError> {
    (0..row.columns().len()).map(|index| decode_cell(row, index)).collect()
}

fn decode_cell(row: &SqliteRow, index: usize) -> Result<CellValue, QueryError> {
    let decode_error = |error: sqlx::Error| QueryError::Decode(error.to_string());

    let raw = row.try_get_raw(index).map_err(decode_error)?;
    if raw.is_null() {
        return Ok(CellValue::Null);
    }

    let type_name = raw.type_info().name().to_ascii_uppercase();
    match type_name.as_str() {
        "INTEGER" | "INT8" | "BIGINT" => row.try_get::<i64, _>(index).map(CellValue::Integer),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
            row.try_get::<f64, _>(index).map(CellValue::Real)
        }
        "BOOLEAN" => row.try_get::<bool, _>(index).map(CellValue::Bool),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| CellValue::Text(String::from_utf8_lossy(&bytes).into_owned())),
        _ => row.try_get::<String, _>(index).map(CellValue::Text),
    }
    .map_err(decode_error)
}
