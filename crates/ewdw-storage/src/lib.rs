//! Warehouse storage backends: PostgreSQL via sqlx and an in-memory twin.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use ewdw_core::{DimensionTable, ProcessRun, RunStatus, SchemaError, StreamWatermark, TableDefinition, TabularBatch, Value};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "ewdw-storage";

/// Bind parameters PostgreSQL accepts in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse unreachable while {context}: {message}")]
    Connectivity { context: String, message: String },
    #[error("query failed while {context}: {message}")]
    Query { context: String, message: String },
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaError),
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("column {table}.{column} has unsupported type {data_type}")]
    UnsupportedType {
        table: String,
        column: String,
        data_type: String,
    },
    #[error("could not decode {table}.{column}: {message}")]
    Decode {
        table: String,
        column: String,
        message: String,
    },
}

impl WarehouseError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, WarehouseError::Connectivity { .. })
    }

    pub fn from_sqlx(context: impl Into<String>, err: sqlx::Error) -> Self {
        let context = context.into();
        let message = err.to_string();
        match classify_sqlx_error(&err) {
            RetryDisposition::Retryable => WarehouseError::Connectivity { context, message },
            RetryDisposition::NonRetryable => WarehouseError::Query { context, message },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub connect_backoff: BackoffPolicy,
}

impl WarehouseConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            connect_backoff: BackoffPolicy::default(),
        }
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rejects attributes the dimension does not declare or values its columns cannot hold.
pub(crate) fn check_attributes(dimension: &DimensionTable, attributes: &[(String, Value)]) -> Result<(), WarehouseError> {
    for (name, value) in attributes {
        let column = dimension.attribute(name).ok_or_else(|| SchemaError::MissingColumn {
            table: dimension.name.clone(),
            column: name.clone(),
        })?;
        if !column.column_type.accepts(value) {
            return Err(SchemaError::IncompatibleValue {
                table: dimension.name.clone(),
                column: name.clone(),
                expected: column.column_type.sql_type(),
                value: format!("{value:?}"),
            }
            .into());
        }
    }
    Ok(())
}

/// Table-level primitives the loading components are built on. Each call
/// acquires its own connection or transaction.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Current layout of `table`, or `None` when it does not exist.
    async fn table_definition(&self, table: &str) -> Result<Option<TableDefinition>, WarehouseError>;

    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(self.table_definition(table).await?.is_some())
    }

    /// Creates the table if it is absent. Existing tables are left untouched.
    async fn create_table(&self, definition: &TableDefinition) -> Result<(), WarehouseError>;

    async fn truncate(&self, table: &str) -> Result<(), WarehouseError>;

    /// Inserts rows laid out in `definition` order as one transaction.
    async fn insert_chunk(&self, definition: &TableDefinition, rows: &[Vec<Value>]) -> Result<u64, WarehouseError>;

    /// Largest value of `column`, or `None` for an empty or missing table.
    async fn max_timestamp(&self, table: &str, column: &str) -> Result<Option<NaiveDateTime>, WarehouseError>;

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError>;

    /// Rows whose `timestamp_column` lies in `[from, to]`.
    async fn select_window(
        &self,
        table: &str,
        timestamp_column: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<TabularBatch, WarehouseError>;

    async fn ensure_dimension(&self, dimension: &DimensionTable) -> Result<(), WarehouseError>;

    /// Inserts the natural key or overwrites the supplied attributes of the
    /// existing row, returning the surrogate key. Atomic per natural key.
    async fn upsert_dimension(
        &self,
        dimension: &DimensionTable,
        natural_key: &str,
        attributes: &[(String, Value)],
    ) -> Result<i64, WarehouseError>;
}

/// Watermark ledger and process log.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn ensure_state_tables(&self) -> Result<(), WarehouseError>;

    async fn committed_watermark(&self, stream: &str) -> Result<Option<NaiveDateTime>, WarehouseError>;

    /// Moves the stream's watermark forward; never backwards. Returns the stored value.
    async fn advance_watermark(&self, stream: &str, watermark: NaiveDateTime) -> Result<NaiveDateTime, WarehouseError>;

    async fn watermarks(&self) -> Result<Vec<StreamWatermark>, WarehouseError>;

    async fn latest_run(&self, process: &str) -> Result<Option<ProcessRun>, WarehouseError>;

    /// Inserts a RUNNING row and returns its id.
    async fn insert_run(&self, process: &str, started_at: DateTime<Utc>) -> Result<i64, WarehouseError>;

    /// Moves the most recent RUNNING row of `process` to a terminal status.
    /// Returns the updated row id, or `None` when nothing was running.
    async fn finish_run(
        &self,
        process: &str,
        status: RunStatus,
        rows_processed: i64,
        error_message: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<i64>, WarehouseError>;

    /// Marks one specific RUNNING row as FAILED.
    async fn abandon_run(&self, log_id: i64, note: &str, ended_at: DateTime<Utc>) -> Result<(), WarehouseError>;

    async fn recent_runs(&self, limit: i64) -> Result<Vec<ProcessRun>, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("bidding_zone"), "\"bidding_zone\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn pool_exhaustion_counts_as_connectivity() {
        let err = WarehouseError::from_sqlx("loading chunk", sqlx::Error::PoolTimedOut);
        assert!(err.is_connectivity());
        let err = WarehouseError::from_sqlx("loading chunk", sqlx::Error::RowNotFound);
        assert!(!err.is_connectivity());
    }
}
