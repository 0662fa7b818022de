use std::sync::Arc;

use ewdw_core::{TableDefinition, TabularBatch};
use ewdw_storage::{Warehouse, WarehouseError};
use tracing::{debug, info};

/// Creates staging and fact tables on first sight. Existing tables are never
/// altered; type drift surfaces later as a schema mismatch in the writer.
#[derive(Clone)]
pub struct SchemaSynthesizer {
    warehouse: Arc<dyn Warehouse>,
}

impl SchemaSynthesizer {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Returns the live definition of `table`, creating it from the batch's
    /// column kinds when it does not exist yet.
    pub async fn ensure_table(&self, table: &str, batch: &TabularBatch) -> Result<TableDefinition, WarehouseError> {
        if let Some(existing) = self.warehouse.table_definition(table).await? {
            debug!(table, columns = existing.columns.len(), "table already exists");
            return Ok(existing);
        }
        if batch.columns().is_empty() {
            return Err(WarehouseError::Query {
                context: format!("creating {table}"),
                message: "batch has no columns".into(),
            });
        }
        self.create(TableDefinition::infer(table, batch)).await
    }

    /// Same as [`ensure_table`](Self::ensure_table) for a declared layout.
    pub async fn ensure_definition(&self, definition: &TableDefinition) -> Result<TableDefinition, WarehouseError> {
        if let Some(existing) = self.warehouse.table_definition(&definition.name).await? {
            return Ok(existing);
        }
        self.create(definition.clone()).await
    }

    async fn create(&self, definition: TableDefinition) -> Result<TableDefinition, WarehouseError> {
        self.warehouse.create_table(&definition).await?;
        info!(
            table = %definition.name,
            columns = ?definition.column_names(),
            "created table"
        );
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ewdw_core::{ColumnType, Value};
    use ewdw_storage::MemoryWarehouse;

    fn batch(columns: &[&str], row: Vec<Value>) -> TabularBatch {
        TabularBatch::from_rows(columns.iter().copied(), vec![row]).unwrap()
    }

    #[tokio::test]
    async fn creates_missing_tables_with_inferred_types() {
        let wh = Arc::new(MemoryWarehouse::new());
        let synth = SchemaSynthesizer::new(wh.clone());
        let ts = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let input = batch(
            &["timestamp", "zone_code", "actual_load", "price", "flag", "unknown"],
            vec![
                Value::Timestamp(ts),
                Value::from("PL"),
                Value::Integer(15800),
                Value::Decimal(92.5),
                Value::Boolean(true),
                Value::Null,
            ],
        );

        let def = synth.ensure_table("stg_mixed", &input).await.unwrap();
        let types: Vec<ColumnType> = def.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Timestamp,
                ColumnType::text(),
                ColumnType::Integer,
                ColumnType::Decimal,
                ColumnType::text(),
                ColumnType::text(),
            ]
        );
        assert_eq!(wh.table_definition("stg_mixed").await.unwrap(), Some(def));
    }

    #[tokio::test]
    async fn existing_tables_are_left_alone() {
        let wh = Arc::new(MemoryWarehouse::new());
        let synth = SchemaSynthesizer::new(wh.clone());
        synth
            .ensure_table("stg_weather", &batch(&["temperature"], vec![Value::Decimal(1.0)]))
            .await
            .unwrap();

        let later = batch(&["temperature", "humidity"], vec![Value::from("warm"), Value::Integer(80)]);
        let def = synth.ensure_table("stg_weather", &later).await.unwrap();
        assert_eq!(def.column_names(), vec!["temperature"]);
        assert_eq!(def.columns[0].column_type, ColumnType::Decimal);
    }

    #[tokio::test]
    async fn a_batch_without_columns_cannot_create_a_table() {
        let wh = Arc::new(MemoryWarehouse::new());
        let synth = SchemaSynthesizer::new(wh.clone());
        let empty = TabularBatch::new(Vec::<String>::new()).unwrap();
        assert!(synth.ensure_table("stg_empty", &empty).await.is_err());
        assert!(!wh.table_exists("stg_empty").await.unwrap());
    }
}
