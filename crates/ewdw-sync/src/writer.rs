use std::sync::Arc;

use ewdw_core::{LoadMode, SchemaError, TabularBatch, Value};
use ewdw_storage::{Warehouse, WarehouseError, MAX_BIND_PARAMS};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{0} does not exist")]
    UnknownTable(String),
    #[error("schema mismatch loading {table} after {rows_committed} committed rows: {source}")]
    SchemaMismatch {
        table: String,
        rows_committed: u64,
        #[source]
        source: SchemaError,
    },
    #[error("load into {table} failed after {rows_committed} committed rows: {source}")]
    Partial {
        table: String,
        rows_committed: u64,
        #[source]
        source: WarehouseError,
    },
}

impl LoadError {
    /// Rows that stay committed despite the failure.
    pub fn rows_committed(&self) -> u64 {
        match self {
            LoadError::UnknownTable(_) => 0,
            LoadError::SchemaMismatch { rows_committed, .. } | LoadError::Partial { rows_committed, .. } => {
                *rows_committed
            }
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, LoadError::Partial { source, .. } if source.is_connectivity())
    }
}

/// Writes batches in bounded chunks, one transaction per chunk.
#[derive(Clone)]
pub struct BatchedWriter {
    warehouse: Arc<dyn Warehouse>,
    batch_size: usize,
}

impl BatchedWriter {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Rows per statement for a table of `column_count` columns.
    pub fn chunk_rows(&self, column_count: usize) -> usize {
        let cap = (MAX_BIND_PARAMS / column_count.max(1)).max(1);
        self.batch_size.max(1).min(cap)
    }

    /// Loads `batch` into `table`. On failure earlier chunks stay committed
    /// and the error reports how many rows they held.
    pub async fn load(&self, table: &str, batch: &TabularBatch, mode: LoadMode) -> Result<u64, LoadError> {
        if batch.is_empty() && mode == LoadMode::Append {
            debug!(table, "nothing to append");
            return Ok(0);
        }

        let partial = |rows_committed: u64| {
            move |source: WarehouseError| LoadError::Partial {
                table: table.to_string(),
                rows_committed,
                source,
            }
        };
        let mismatch = |rows_committed: u64| {
            move |source: SchemaError| LoadError::SchemaMismatch {
                table: table.to_string(),
                rows_committed,
                source,
            }
        };

        let definition = self
            .warehouse
            .table_definition(table)
            .await
            .map_err(partial(0))?
            .ok_or_else(|| LoadError::UnknownTable(table.to_string()))?;
        let order = if batch.is_empty() {
            Vec::new()
        } else {
            definition.align(batch.columns()).map_err(mismatch(0))?
        };

        if mode == LoadMode::ReplaceAll {
            self.warehouse.truncate(table).await.map_err(partial(0))?;
            debug!(table, "truncated before replace");
        }

        let chunk_rows = self.chunk_rows(definition.columns.len());
        let mut committed = 0u64;
        for (chunk_no, chunk) in batch.rows().chunks(chunk_rows).enumerate() {
            let rows: Vec<Vec<Value>> = chunk
                .iter()
                .map(|row| order.iter().map(|&idx| row[idx].clone()).collect())
                .collect();
            if let Err(source) = rows.iter().try_for_each(|row| definition.check_row(row)) {
                warn!(table, chunk = chunk_no, rows_committed = committed, error = %source, "chunk rejected");
                return Err(mismatch(committed)(source));
            }
            match self.warehouse.insert_chunk(&definition, &rows).await {
                Ok(inserted) => {
                    committed += inserted;
                    debug!(table, chunk = chunk_no, rows = inserted, "chunk committed");
                }
                Err(WarehouseError::SchemaMismatch(source)) => {
                    warn!(table, chunk = chunk_no, rows_committed = committed, error = %source, "chunk rejected");
                    return Err(mismatch(committed)(source));
                }
                Err(source) => {
                    warn!(table, chunk = chunk_no, rows_committed = committed, error = %source, "chunk failed");
                    return Err(partial(committed)(source));
                }
            }
        }

        info!(table, rows = committed, ?mode, "load complete");
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use ewdw_core::{ColumnDef, ColumnType, TableDefinition};
    use ewdw_storage::MemoryWarehouse;

    fn hour(h: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(0, 0, 0).unwrap() + Duration::hours(h)
    }

    fn load_batch(hours: std::ops::Range<i64>) -> TabularBatch {
        TabularBatch::from_rows(
            ["timestamp", "actual_load"],
            hours.map(|h| vec![Value::Timestamp(hour(h)), Value::Integer(100 + h)]).collect(),
        )
        .unwrap()
    }

    async fn staging() -> Arc<MemoryWarehouse> {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.create_table(&TableDefinition::new(
            "stg_load",
            vec![
                ColumnDef::new("timestamp", ColumnType::Timestamp),
                ColumnDef::new("actual_load", ColumnType::Integer),
            ],
        ))
        .await
        .unwrap();
        wh
    }

    #[test]
    fn chunks_stay_under_the_bind_parameter_limit() {
        let writer = BatchedWriter::new(Arc::new(MemoryWarehouse::new())).with_batch_size(100_000);
        assert_eq!(writer.chunk_rows(10), 6_553);
        assert_eq!(writer.chunk_rows(0), 65_535);
        let writer = writer.with_batch_size(0);
        assert_eq!(writer.chunk_rows(3), 1);
    }

    #[tokio::test]
    async fn append_grows_by_exactly_the_batch_size() {
        let wh = staging().await;
        let writer = BatchedWriter::new(wh.clone()).with_batch_size(2);
        assert_eq!(writer.load("stg_load", &load_batch(0..5), LoadMode::Append).await.unwrap(), 5);
        assert_eq!(writer.load("stg_load", &load_batch(5..8), LoadMode::Append).await.unwrap(), 3);
        assert_eq!(wh.row_count("stg_load").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn replace_all_leaves_only_the_new_batch() {
        let wh = staging().await;
        let writer = BatchedWriter::new(wh.clone());
        writer.load("stg_load", &load_batch(0..5), LoadMode::Append).await.unwrap();
        writer.load("stg_load", &load_batch(10..12), LoadMode::ReplaceAll).await.unwrap();

        let rows = wh.rows("stg_load").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Timestamp(hour(10)));
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op_even_without_a_table() {
        let wh = Arc::new(MemoryWarehouse::new());
        let writer = BatchedWriter::new(wh);
        let empty = TabularBatch::new(["timestamp"]).unwrap();
        assert_eq!(writer.load("stg_missing", &empty, LoadMode::Append).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn columns_are_bound_in_table_order() {
        let wh = staging().await;
        let writer = BatchedWriter::new(wh.clone());
        let swapped = TabularBatch::from_rows(
            ["actual_load", "timestamp"],
            vec![vec![Value::Integer(7), Value::Timestamp(hour(1))]],
        )
        .unwrap();
        writer.load("stg_load", &swapped, LoadMode::Append).await.unwrap();
        assert_eq!(wh.rows("stg_load").await[0], vec![Value::Timestamp(hour(1)), Value::Integer(7)]);
    }

    #[tokio::test]
    async fn mismatched_columns_abort_before_any_write() {
        let wh = staging().await;
        let writer = BatchedWriter::new(wh.clone());
        writer.load("stg_load", &load_batch(0..2), LoadMode::Append).await.unwrap();

        let wrong = TabularBatch::from_rows(
            ["timestamp", "forecast_load"],
            vec![vec![Value::Timestamp(hour(3)), Value::Integer(1)]],
        )
        .unwrap();
        let err = writer.load("stg_load", &wrong, LoadMode::ReplaceAll).await.unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { rows_committed: 0, .. }));
        assert_eq!(wh.row_count("stg_load").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incompatible_cells_fail_their_chunk_only() {
        let wh = staging().await;
        let writer = BatchedWriter::new(wh.clone()).with_batch_size(2);
        let mut rows: Vec<Vec<Value>> = (0..3).map(|h| vec![Value::Timestamp(hour(h)), Value::Integer(h)]).collect();
        rows.push(vec![Value::Timestamp(hour(3)), Value::from("lots")]);
        let batch = TabularBatch::from_rows(["timestamp", "actual_load"], rows);
        // Mixed kinds are rejected by the batch itself.
        assert!(batch.is_err());

        let batch = TabularBatch::from_rows(
            ["timestamp", "actual_load"],
            vec![
                vec![Value::Timestamp(hour(0)), Value::Integer(1)],
                vec![Value::Timestamp(hour(1)), Value::Integer(2)],
                vec![Value::Timestamp(hour(2)), Value::Decimal(2.5)],
            ],
        )
        .unwrap();
        let err = writer.load("stg_load", &batch, LoadMode::Append).await.unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { rows_committed: 2, .. }));
        assert_eq!(wh.row_count("stg_load").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_failing_chunk_keeps_earlier_chunks_and_reports_them() {
        let wh = staging().await;
        let writer = BatchedWriter::new(wh.clone()).with_batch_size(2);
        wh.fail_after_chunks(2).await;

        let err = writer.load("stg_load", &load_batch(0..7), LoadMode::Append).await.unwrap_err();
        assert_eq!(err.rows_committed(), 4);
        assert!(err.is_connectivity());
        assert_eq!(wh.row_count("stg_load").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn loading_into_a_missing_table_is_reported() {
        let writer = BatchedWriter::new(Arc::new(MemoryWarehouse::new()));
        let err = writer.load("stg_missing", &load_batch(0..1), LoadMode::Append).await.unwrap_err();
        assert!(matches!(err, LoadError::UnknownTable(_)));
    }
}
