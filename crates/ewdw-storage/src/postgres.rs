use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use ewdw_core::{
    ColumnDef, ColumnType, DimensionTable, ProcessRun, RunStatus, StreamWatermark, TableDefinition, TabularBatch, Value,
};
use sqlx::postgres::{PgPoolOptions, PgRow, Postgres};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, info, warn};

use crate::{
    check_attributes, classify_sqlx_error, quote_ident, RetryDisposition, StateStore, Warehouse, WarehouseConfig,
    WarehouseError,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL warehouse. Every operation borrows a pooled connection for its
/// own duration; chunk inserts run inside a transaction that rolls back on drop.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let backoff = config.connect_backoff;
        let mut attempt = 0usize;
        loop {
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .acquire_timeout(config.acquire_timeout)
                .connect(&config.database_url)
                .await;
            match result {
                Ok(pool) => return Ok(Self { pool }),
                Err(err) if classify_sqlx_error(&err) == RetryDisposition::Retryable && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "warehouse connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(WarehouseError::from_sqlx("connecting to warehouse", err)),
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), WarehouseError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| WarehouseError::Query {
                context: "running state migrations".into(),
                message: err.to_string(),
            })?;
        info!("state migrations applied");
        Ok(())
    }
}

fn bind_cell<'qb, 'args: 'qb>(
    row: &mut Separated<'qb, 'args, Postgres, &'static str>,
    column_type: &ColumnType,
    value: &Value,
) {
    match (column_type, value) {
        (ColumnType::Timestamp, Value::Timestamp(ts)) => row.push_bind(*ts),
        (ColumnType::Timestamp, _) => row.push_bind(None::<NaiveDateTime>),
        (ColumnType::Integer, Value::Integer(v)) => row.push_bind(*v),
        (ColumnType::Integer, _) => row.push_bind(None::<i64>),
        (ColumnType::Decimal, value) => row.push_bind(value.as_f64()),
        (ColumnType::Text { .. }, Value::Null) => row.push_bind(None::<String>),
        (ColumnType::Text { .. }, value) => row.push_bind(value.to_string()),
    };
}

fn select_expr(column: &ColumnDef) -> String {
    let cast = match column.column_type {
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Integer => "BIGINT",
        ColumnType::Decimal => "DOUBLE PRECISION",
        ColumnType::Text { .. } => "TEXT",
    };
    format!("{}::{cast}", quote_ident(&column.name))
}

fn decode_cell(row: &PgRow, idx: usize, table: &str, column: &ColumnDef) -> Result<Value, WarehouseError> {
    let decoded = match column.column_type {
        ColumnType::Timestamp => row.try_get::<Option<NaiveDateTime>, _>(idx).map(Value::from),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(idx).map(Value::from),
        ColumnType::Decimal => row.try_get::<Option<f64>, _>(idx).map(Value::from),
        ColumnType::Text { .. } => row.try_get::<Option<String>, _>(idx).map(Value::from),
    };
    decoded.map_err(|err| WarehouseError::Decode {
        table: table.to_string(),
        column: column.name.clone(),
        message: err.to_string(),
    })
}

fn map_run(row: &PgRow) -> Result<ProcessRun, WarehouseError> {
    let decode = |column: &str, err: sqlx::Error| WarehouseError::Decode {
        table: "etl_process_log".into(),
        column: column.into(),
        message: err.to_string(),
    };
    let raw_status: String = row.try_get("status").map_err(|e| decode("status", e))?;
    let status = RunStatus::parse(&raw_status).ok_or_else(|| WarehouseError::Decode {
        table: "etl_process_log".into(),
        column: "status".into(),
        message: format!("unknown status {raw_status}"),
    })?;
    Ok(ProcessRun {
        log_id: row.try_get("log_id").map_err(|e| decode("log_id", e))?,
        process_name: row.try_get("process_name").map_err(|e| decode("process_name", e))?,
        start_time: row.try_get("start_time").map_err(|e| decode("start_time", e))?,
        end_time: row.try_get("end_time").map_err(|e| decode("end_time", e))?,
        status,
        rows_processed: row.try_get("rows_processed").map_err(|e| decode("rows_processed", e))?,
        error_message: row.try_get("error_message").map_err(|e| decode("error_message", e))?,
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn table_definition(&self, table: &str) -> Result<Option<TableDefinition>, WarehouseError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::TEXT AS column_name,
                   data_type::TEXT AS data_type,
                   character_maximum_length::BIGINT AS max_len
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
             ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("reading layout of {table}"), e))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("column_name").map_err(|e| WarehouseError::from_sqlx("reading column name", e))?;
            let data_type: String = row.try_get("data_type").map_err(|e| WarehouseError::from_sqlx("reading column type", e))?;
            let max_len: Option<i64> = row.try_get("max_len").map_err(|e| WarehouseError::from_sqlx("reading column length", e))?;
            let column_type = ColumnType::from_catalog(&data_type, max_len).ok_or_else(|| WarehouseError::UnsupportedType {
                table: table.to_string(),
                column: name.clone(),
                data_type: data_type.clone(),
            })?;
            columns.push(ColumnDef::new(name, column_type));
        }
        Ok(Some(TableDefinition::new(table, columns)))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                 WHERE table_schema = current_schema()
                   AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("checking for table {table}"), e))
    }

    async fn create_table(&self, definition: &TableDefinition) -> Result<(), WarehouseError> {
        let columns = definition
            .columns
            .iter()
            .map(|column| {
                let mut ddl = format!("{} {}", quote_ident(&column.name), column.column_type.sql_type());
                if let Some(fk) = &column.references {
                    ddl.push_str(&format!(" REFERENCES {} ({})", quote_ident(&fk.table), quote_ident(&fk.column)));
                }
                ddl
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({columns})", quote_ident(&definition.name));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("creating table {}", definition.name), e))?;
        debug!(table = %definition.name, columns = definition.columns.len(), "table ensured");
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<(), WarehouseError> {
        let sql = format!("TRUNCATE TABLE {}", quote_ident(table));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("truncating {table}"), e))?;
        Ok(())
    }

    async fn insert_chunk(&self, definition: &TableDefinition, rows: &[Vec<Value>]) -> Result<u64, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            definition.check_row(row)?;
        }

        let column_list = definition
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({column_list}) ", quote_ident(&definition.name)));
        builder.push_values(rows, |mut row_builder, row| {
            for (column, value) in definition.columns.iter().zip(row) {
                bind_cell(&mut row_builder, &column.column_type, value);
            }
        });

        let context = format!("inserting chunk into {}", definition.name);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| WarehouseError::from_sqlx(context.clone(), e))?;
        let result = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| WarehouseError::from_sqlx(context.clone(), e))?;
        tx.commit().await.map_err(|e| WarehouseError::from_sqlx(context, e))?;
        Ok(result.rows_affected())
    }

    async fn max_timestamp(&self, table: &str, column: &str) -> Result<Option<NaiveDateTime>, WarehouseError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let sql = format!("SELECT MAX({})::TIMESTAMP FROM {}", quote_ident(column), quote_ident(table));
        sqlx::query_scalar::<_, Option<NaiveDateTime>>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("reading MAX({column}) of {table}"), e))
    }

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("counting {table}"), e))?;
        Ok(count.max(0) as u64)
    }

    async fn select_window(
        &self,
        table: &str,
        timestamp_column: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<TabularBatch, WarehouseError> {
        let definition = self
            .table_definition(table)
            .await?
            .ok_or_else(|| WarehouseError::UnknownTable(table.to_string()))?;
        let select_list = definition.columns.iter().map(select_expr).collect::<Vec<_>>().join(", ");
        let ts = quote_ident(timestamp_column);
        let sql = format!(
            "SELECT {select_list} FROM {} WHERE {ts} >= $1 AND {ts} <= $2 ORDER BY {ts}",
            quote_ident(table)
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("reading window of {table}"), e))?;

        let decode_err = |err: ewdw_core::BatchError| WarehouseError::Decode {
            table: table.to_string(),
            column: String::new(),
            message: err.to_string(),
        };
        let mut batch = TabularBatch::new(definition.column_names()).map_err(decode_err)?;
        for row in &rows {
            let values = definition
                .columns
                .iter()
                .enumerate()
                .map(|(idx, column)| decode_cell(row, idx, table, column))
                .collect::<Result<Vec<_>, _>>()?;
            batch.push_row(values).map_err(decode_err)?;
        }
        Ok(batch)
    }

    async fn ensure_dimension(&self, dimension: &DimensionTable) -> Result<(), WarehouseError> {
        let mut columns = vec![
            format!(
                "{} BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
                quote_ident(&dimension.surrogate_key())
            ),
            format!(
                "{} {} NOT NULL UNIQUE",
                quote_ident(&dimension.natural_key),
                ColumnType::text().sql_type()
            ),
        ];
        columns.extend(
            dimension
                .attributes
                .iter()
                .map(|a| format!("{} {}", quote_ident(&a.name), a.column_type.sql_type())),
        );
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&dimension.name),
            columns.join(", ")
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("creating dimension {}", dimension.name), e))?;
        Ok(())
    }

    async fn upsert_dimension(
        &self,
        dimension: &DimensionTable,
        natural_key: &str,
        attributes: &[(String, Value)],
    ) -> Result<i64, WarehouseError> {
        check_attributes(dimension, attributes)?;

        let nk = quote_ident(&dimension.natural_key);
        let mut columns = vec![nk.clone()];
        columns.extend(attributes.iter().map(|(name, _)| quote_ident(name)));

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) VALUES (",
            quote_ident(&dimension.name),
            columns.join(", ")
        ));
        {
            let mut values = builder.separated(", ");
            values.push_bind(natural_key.to_string());
            for (name, value) in attributes {
                let column_type = dimension
                    .attribute(name)
                    .map(|a| a.column_type)
                    .unwrap_or_else(ColumnType::text);
                bind_cell(&mut values, &column_type, value);
            }
        }

        let updates = if attributes.is_empty() {
            format!("{nk} = EXCLUDED.{nk}")
        } else {
            attributes
                .iter()
                .map(|(name, _)| {
                    let col = quote_ident(name);
                    format!("{col} = EXCLUDED.{col}")
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        builder.push(format!(
            ") ON CONFLICT ({nk}) DO UPDATE SET {updates} RETURNING {}",
            quote_ident(&dimension.surrogate_key())
        ));

        builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("upserting {} {natural_key}", dimension.name), e))
    }
}

#[async_trait]
impl StateStore for PgWarehouse {
    async fn ensure_state_tables(&self) -> Result<(), WarehouseError> {
        self.migrate().await
    }

    async fn committed_watermark(&self, stream: &str) -> Result<Option<NaiveDateTime>, WarehouseError> {
        sqlx::query_scalar::<_, NaiveDateTime>("SELECT watermark FROM etl_stream_watermark WHERE stream_name = $1")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx(format!("reading watermark of {stream}"), e))
    }

    async fn advance_watermark(&self, stream: &str, watermark: NaiveDateTime) -> Result<NaiveDateTime, WarehouseError> {
        sqlx::query_scalar::<_, NaiveDateTime>(
            r#"
            INSERT INTO etl_stream_watermark (stream_name, watermark, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (stream_name) DO UPDATE
               SET watermark = GREATEST(etl_stream_watermark.watermark, EXCLUDED.watermark),
                   updated_at = NOW()
            RETURNING watermark
            "#,
        )
        .bind(stream)
        .bind(watermark)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("advancing watermark of {stream}"), e))
    }

    async fn watermarks(&self) -> Result<Vec<StreamWatermark>, WarehouseError> {
        let rows = sqlx::query("SELECT stream_name, watermark, updated_at FROM etl_stream_watermark ORDER BY stream_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WarehouseError::from_sqlx("listing watermarks", e))?;
        rows.iter()
            .map(|row| {
                Ok(StreamWatermark {
                    stream_name: row.try_get("stream_name").map_err(|e| WarehouseError::from_sqlx("decoding watermark", e))?,
                    watermark: row.try_get("watermark").map_err(|e| WarehouseError::from_sqlx("decoding watermark", e))?,
                    updated_at: row.try_get("updated_at").map_err(|e| WarehouseError::from_sqlx("decoding watermark", e))?,
                })
            })
            .collect()
    }

    async fn latest_run(&self, process: &str) -> Result<Option<ProcessRun>, WarehouseError> {
        let row = sqlx::query(
            r#"
            SELECT log_id, process_name, start_time, end_time, status, rows_processed, error_message
              FROM etl_process_log
             WHERE process_name = $1
             ORDER BY log_id DESC
             LIMIT 1
            "#,
        )
        .bind(process)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("reading latest run of {process}"), e))?;
        row.as_ref().map(map_run).transpose()
    }

    async fn insert_run(&self, process: &str, started_at: DateTime<Utc>) -> Result<i64, WarehouseError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO etl_process_log (process_name, start_time, status, rows_processed)
            VALUES ($1, $2, 'RUNNING', 0)
            RETURNING log_id
            "#,
        )
        .bind(process)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("logging start of {process}"), e))
    }

    async fn finish_run(
        &self,
        process: &str,
        status: RunStatus,
        rows_processed: i64,
        error_message: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<i64>, WarehouseError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE etl_process_log
               SET end_time = $2,
                   status = $3,
                   rows_processed = $4,
                   error_message = $5
             WHERE log_id = (
                   SELECT MAX(log_id) FROM etl_process_log
                    WHERE process_name = $1 AND status = 'RUNNING'
             )
            RETURNING log_id
            "#,
        )
        .bind(process)
        .bind(ended_at)
        .bind(status.as_str())
        .bind(rows_processed)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("logging end of {process}"), e))
    }

    async fn abandon_run(&self, log_id: i64, note: &str, ended_at: DateTime<Utc>) -> Result<(), WarehouseError> {
        sqlx::query(
            r#"
            UPDATE etl_process_log
               SET status = 'FAILED', end_time = $2, error_message = $3
             WHERE log_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(log_id)
        .bind(ended_at)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx(format!("abandoning run {log_id}"), e))?;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<ProcessRun>, WarehouseError> {
        let rows = sqlx::query(
            r#"
            SELECT log_id, process_name, start_time, end_time, status, rows_processed, error_message
              FROM etl_process_log
             ORDER BY log_id DESC
             LIMIT $1
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WarehouseError::from_sqlx("listing runs", e))?;
        rows.iter().map(map_run).collect()
    }
}
