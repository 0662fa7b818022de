use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use ewdw_core::{
    ColumnDef, ColumnType, DimensionTable, ProcessRun, RunStatus, StreamWatermark, TableDefinition, TabularBatch, Value,
};
use tokio::sync::Mutex;

use crate::{check_attributes, StateStore, Warehouse, WarehouseError};

#[derive(Debug, Clone)]
struct MemTable {
    definition: TableDefinition,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRow {
    pub surrogate_key: i64,
    pub natural_key: String,
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
struct MemDimension {
    spec: DimensionTable,
    next_id: i64,
    rows: Vec<DimensionRow>,
}

impl MemDimension {
    fn definition(&self) -> TableDefinition {
        let mut columns = vec![
            ColumnDef::new(self.spec.surrogate_key(), ColumnType::Integer),
            ColumnDef::new(self.spec.natural_key.clone(), ColumnType::text()),
        ];
        columns.extend(self.spec.attributes.iter().cloned());
        TableDefinition::new(self.spec.name.clone(), columns)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemTable>,
    dimensions: BTreeMap<String, MemDimension>,
    watermarks: BTreeMap<String, (NaiveDateTime, DateTime<Utc>)>,
    runs: Vec<ProcessRun>,
    next_log_id: i64,
    offline: bool,
    chunks_before_failure: Option<usize>,
}

impl MemoryState {
    /// Foreign-key check: every non-null referencing cell must name an existing row.
    fn check_references(&self, definition: &TableDefinition, rows: &[Vec<Value>]) -> Result<(), WarehouseError> {
        for (idx, column) in definition.columns.iter().enumerate() {
            let Some(fk) = &column.references else { continue };
            for value in rows.iter().filter_map(|row| row.get(idx)).filter(|v| !v.is_null()) {
                if !self.references_exist(&fk.table, &fk.column, value) {
                    return Err(WarehouseError::Query {
                        context: format!("inserting chunk into {}", definition.name),
                        message: format!(
                            "{}.{} = {value} is not present in {}.{}",
                            definition.name, column.name, fk.table, fk.column
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn references_exist(&self, table: &str, column: &str, value: &Value) -> bool {
        if let Some(dimension) = self.dimensions.get(table) {
            if column == dimension.spec.surrogate_key() {
                return matches!(value, Value::Integer(key) if dimension.rows.iter().any(|r| r.surrogate_key == *key));
            }
            if column == dimension.spec.natural_key {
                return value
                    .as_key()
                    .is_some_and(|key| dimension.rows.iter().any(|r| r.natural_key == key));
            }
            return false;
        }
        self.tables.get(table).is_some_and(|t| {
            t.definition
                .columns
                .iter()
                .position(|c| c.name == column)
                .is_some_and(|idx| t.rows.iter().any(|row| row.get(idx) == Some(value)))
        })
    }

    fn check_online(&self, context: &str) -> Result<(), WarehouseError> {
        if self.offline {
            return Err(WarehouseError::Connectivity {
                context: context.to_string(),
                message: "in-memory warehouse is offline".into(),
            });
        }
        Ok(())
    }
}

/// Warehouse held in process memory. Used for dry runs and tests; enforces the
/// same column, uniqueness and chunk-atomicity rules as PostgreSQL.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later operation fail with a connectivity error.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Lets `chunks` more inserts succeed, then fails the next one.
    pub async fn fail_after_chunks(&self, chunks: usize) {
        self.state.lock().await.chunks_before_failure = Some(chunks);
    }

    pub async fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn dimension_rows(&self, table: &str) -> Vec<DimensionRow> {
        self.state
            .lock()
            .await
            .dimensions
            .get(table)
            .map(|d| d.rows.clone())
            .unwrap_or_default()
    }

    pub async fn runs(&self) -> Vec<ProcessRun> {
        self.state.lock().await.runs.clone()
    }

    /// Inserts a process-log row directly, bypassing the RUNNING protocol.
    pub async fn seed_run(&self, process: &str, status: RunStatus, started_at: DateTime<Utc>) -> i64 {
        let mut state = self.state.lock().await;
        state.next_log_id += 1;
        let log_id = state.next_log_id;
        state.runs.push(ProcessRun {
            log_id,
            process_name: process.to_string(),
            start_time: started_at,
            end_time: None,
            status,
            rows_processed: 0,
            error_message: None,
        });
        log_id
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_definition(&self, table: &str) -> Result<Option<TableDefinition>, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("reading table layout")?;
        if let Some(t) = state.tables.get(table) {
            return Ok(Some(t.definition.clone()));
        }
        Ok(state.dimensions.get(table).map(MemDimension::definition))
    }

    async fn create_table(&self, definition: &TableDefinition) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("creating table")?;
        if let Some(fk) = definition.columns.iter().filter_map(|c| c.references.as_ref()).find(|fk| {
            !state.dimensions.contains_key(&fk.table) && !state.tables.contains_key(&fk.table)
        }) {
            return Err(WarehouseError::UnknownTable(fk.table.clone()));
        }
        if state.tables.contains_key(&definition.name) || state.dimensions.contains_key(&definition.name) {
            return Ok(());
        }
        state.tables.insert(
            definition.name.clone(),
            MemTable {
                definition: definition.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("truncating table")?;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::UnknownTable(table.to_string()))?;
        t.rows.clear();
        Ok(())
    }

    async fn insert_chunk(&self, definition: &TableDefinition, rows: &[Vec<Value>]) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("inserting chunk")?;
        if let Some(remaining) = state.chunks_before_failure {
            if remaining == 0 {
                state.chunks_before_failure = None;
                return Err(WarehouseError::Connectivity {
                    context: format!("inserting chunk into {}", definition.name),
                    message: "connection reset".into(),
                });
            }
            state.chunks_before_failure = Some(remaining - 1);
        }
        {
            let table = state
                .tables
                .get(&definition.name)
                .ok_or_else(|| WarehouseError::UnknownTable(definition.name.clone()))?;
            for row in rows {
                table.definition.check_row(row)?;
            }
            state.check_references(&table.definition, rows)?;
        }
        let table = state
            .tables
            .get_mut(&definition.name)
            .ok_or_else(|| WarehouseError::UnknownTable(definition.name.clone()))?;
        table.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn max_timestamp(&self, table: &str, column: &str) -> Result<Option<NaiveDateTime>, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("reading max timestamp")?;
        let Some(t) = state.tables.get(table) else {
            return Ok(None);
        };
        let idx = t
            .definition
            .columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| WarehouseError::Query {
                context: format!("reading MAX({column}) of {table}"),
                message: format!("column {column} does not exist"),
            })?;
        Ok(t.rows.iter().filter_map(|r| r[idx].as_timestamp()).max())
    }

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("counting rows")?;
        if let Some(t) = state.tables.get(table) {
            return Ok(t.rows.len() as u64);
        }
        state
            .dimensions
            .get(table)
            .map(|d| d.rows.len() as u64)
            .ok_or_else(|| WarehouseError::UnknownTable(table.to_string()))
    }

    async fn select_window(
        &self,
        table: &str,
        timestamp_column: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<TabularBatch, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("reading window")?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| WarehouseError::UnknownTable(table.to_string()))?;
        let idx = t
            .definition
            .column_names()
            .iter()
            .position(|c| *c == timestamp_column)
            .ok_or_else(|| WarehouseError::Query {
                context: format!("reading window of {table}"),
                message: format!("column {timestamp_column} does not exist"),
            })?;
        let decode_err = |err: ewdw_core::BatchError| WarehouseError::Decode {
            table: table.to_string(),
            column: String::new(),
            message: err.to_string(),
        };
        let mut batch = TabularBatch::new(t.definition.column_names()).map_err(decode_err)?;
        let mut selected: Vec<&Vec<Value>> = t
            .rows
            .iter()
            .filter(|r| matches!(r[idx].as_timestamp(), Some(ts) if ts >= from && ts <= to))
            .collect();
        selected.sort_by_key(|r| r[idx].as_timestamp());
        for row in selected {
            batch.push_row(row.clone()).map_err(decode_err)?;
        }
        Ok(batch)
    }

    async fn ensure_dimension(&self, dimension: &DimensionTable) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("creating dimension")?;
        state
            .dimensions
            .entry(dimension.name.clone())
            .or_insert_with(|| MemDimension {
                spec: dimension.clone(),
                next_id: 1,
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn upsert_dimension(
        &self,
        dimension: &DimensionTable,
        natural_key: &str,
        attributes: &[(String, Value)],
    ) -> Result<i64, WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("upserting dimension row")?;
        let dim = state
            .dimensions
            .get_mut(&dimension.name)
            .ok_or_else(|| WarehouseError::UnknownTable(dimension.name.clone()))?;
        check_attributes(&dim.spec, attributes)?;

        if let Some(row) = dim.rows.iter_mut().find(|r| r.natural_key == natural_key) {
            for (name, value) in attributes {
                row.attributes.insert(name.clone(), value.clone());
            }
            return Ok(row.surrogate_key);
        }

        let surrogate_key = dim.next_id;
        dim.next_id += 1;
        dim.rows.push(DimensionRow {
            surrogate_key,
            natural_key: natural_key.to_string(),
            attributes: attributes.iter().cloned().collect(),
        });
        Ok(surrogate_key)
    }
}

#[async_trait]
impl StateStore for MemoryWarehouse {
    async fn ensure_state_tables(&self) -> Result<(), WarehouseError> {
        self.state.lock().await.check_online("ensuring state tables")
    }

    async fn committed_watermark(&self, stream: &str) -> Result<Option<NaiveDateTime>, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("reading watermark")?;
        Ok(state.watermarks.get(stream).map(|(wm, _)| *wm))
    }

    async fn advance_watermark(&self, stream: &str, watermark: NaiveDateTime) -> Result<NaiveDateTime, WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("advancing watermark")?;
        let now = Utc::now();
        let entry = state
            .watermarks
            .entry(stream.to_string())
            .or_insert((watermark, now));
        entry.0 = entry.0.max(watermark);
        entry.1 = now;
        Ok(entry.0)
    }

    async fn watermarks(&self) -> Result<Vec<StreamWatermark>, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("listing watermarks")?;
        Ok(state
            .watermarks
            .iter()
            .map(|(name, (watermark, updated_at))| StreamWatermark {
                stream_name: name.clone(),
                watermark: *watermark,
                updated_at: *updated_at,
            })
            .collect())
    }

    async fn latest_run(&self, process: &str) -> Result<Option<ProcessRun>, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("reading latest run")?;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.process_name == process)
            .max_by_key(|r| r.log_id)
            .cloned())
    }

    async fn insert_run(&self, process: &str, started_at: DateTime<Utc>) -> Result<i64, WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("logging run start")?;
        state.next_log_id += 1;
        let log_id = state.next_log_id;
        state.runs.push(ProcessRun {
            log_id,
            process_name: process.to_string(),
            start_time: started_at,
            end_time: None,
            status: RunStatus::Running,
            rows_processed: 0,
            error_message: None,
        });
        Ok(log_id)
    }

    async fn finish_run(
        &self,
        process: &str,
        status: RunStatus,
        rows_processed: i64,
        error_message: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<i64>, WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("logging run end")?;
        let Some(run) = state
            .runs
            .iter_mut()
            .filter(|r| r.process_name == process && r.status == RunStatus::Running)
            .max_by_key(|r| r.log_id)
        else {
            return Ok(None);
        };
        run.status = status;
        run.end_time = Some(ended_at);
        run.rows_processed = rows_processed;
        run.error_message = error_message.map(str::to_string);
        Ok(Some(run.log_id))
    }

    async fn abandon_run(&self, log_id: i64, note: &str, ended_at: DateTime<Utc>) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.check_online("abandoning run")?;
        if let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.log_id == log_id && r.status == RunStatus::Running)
        {
            run.status = RunStatus::Failed;
            run.end_time = Some(ended_at);
            run.error_message = Some(note.to_string());
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<ProcessRun>, WarehouseError> {
        let state = self.state.lock().await;
        state.check_online("listing runs")?;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.log_id.cmp(&a.log_id));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }
}
