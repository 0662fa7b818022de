use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ColumnKind, TabularBatch, Value};

/// Width of text columns created from batches.
pub const DEFAULT_TEXT_LENGTH: usize = 255;

/// Closed set of warehouse column types. Decided once per column at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    Timestamp,
    Integer,
    Decimal,
    Text { max_len: usize },
}

impl ColumnType {
    pub fn text() -> Self {
        ColumnType::Text {
            max_len: DEFAULT_TEXT_LENGTH,
        }
    }

    /// Timestamp, then decimal, then integer; everything else is bounded text.
    pub fn infer(kind: Option<ColumnKind>) -> Self {
        match kind {
            Some(ColumnKind::Timestamp) => ColumnType::Timestamp,
            Some(ColumnKind::Decimal) => ColumnType::Decimal,
            Some(ColumnKind::Integer) => ColumnType::Integer,
            Some(ColumnKind::Text) | Some(ColumnKind::Boolean) | None => ColumnType::text(),
        }
    }

    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Integer => "BIGINT".to_string(),
            ColumnType::Decimal => "DOUBLE PRECISION".to_string(),
            ColumnType::Text { max_len } => format!("VARCHAR({max_len})"),
        }
    }

    /// Maps an `information_schema.columns.data_type` entry back to a column type.
    pub fn from_catalog(data_type: &str, character_maximum_length: Option<i64>) -> Option<Self> {
        let max_len = character_maximum_length
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(usize::MAX);
        match data_type.trim().to_ascii_lowercase().as_str() {
            "timestamp without time zone" | "timestamp" => Some(ColumnType::Timestamp),
            "bigint" | "integer" | "smallint" => Some(ColumnType::Integer),
            "double precision" | "real" | "numeric" => Some(ColumnType::Decimal),
            "character varying" | "character" | "text" => Some(ColumnType::Text { max_len }),
            _ => None,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Timestamp, Value::Timestamp(_)) => true,
            (ColumnType::Integer, Value::Integer(_)) => true,
            (ColumnType::Decimal, Value::Integer(_) | Value::Decimal(_)) => true,
            (ColumnType::Text { max_len }, Value::Text(s)) => s.chars().count() <= *max_len,
            (ColumnType::Text { .. }, Value::Boolean(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            references: None,
        }
    }

    pub fn referencing(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("{table} has {expected} columns, batch has {found}")]
    ColumnCount {
        table: String,
        expected: usize,
        found: usize,
    },
    #[error("{table}.{column} is missing from the batch")]
    MissingColumn { table: String, column: String },
    #[error("{table}.{column} is {expected} and cannot hold {value}")]
    IncompatibleValue {
        table: String,
        column: String,
        expected: String,
        value: String,
    },
}

/// Ordered table layout; the column order is the insert order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn infer(name: impl Into<String>, batch: &TabularBatch) -> Self {
        let columns = batch
            .columns()
            .iter()
            .zip(batch.kinds())
            .map(|(column, kind)| ColumnDef::new(column.clone(), ColumnType::infer(*kind)))
            .collect();
        Self::new(name, columns)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of each table column inside `batch_columns`, in table order.
    pub fn align(&self, batch_columns: &[String]) -> Result<Vec<usize>, SchemaError> {
        if batch_columns.len() != self.columns.len() {
            return Err(SchemaError::ColumnCount {
                table: self.name.clone(),
                expected: self.columns.len(),
                found: batch_columns.len(),
            });
        }
        self.columns
            .iter()
            .map(|column| {
                batch_columns
                    .iter()
                    .position(|name| name == &column.name)
                    .ok_or_else(|| SchemaError::MissingColumn {
                        table: self.name.clone(),
                        column: column.name.clone(),
                    })
            })
            .collect()
    }

    /// Checks one row already laid out in table order.
    pub fn check_row(&self, row: &[Value]) -> Result<(), SchemaError> {
        if row.len() != self.columns.len() {
            return Err(SchemaError::ColumnCount {
                table: self.name.clone(),
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        for (column, value) in self.columns.iter().zip(row) {
            if !column.column_type.accepts(value) {
                return Err(SchemaError::IncompatibleValue {
                    table: self.name.clone(),
                    column: column.name.clone(),
                    expected: column.column_type.sql_type(),
                    value: format!("{value:?}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn weather_batch() -> TabularBatch {
        let date = NaiveDate::from_ymd_opt(2020, 1, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        TabularBatch::from_rows(
            ["date", "temperature", "readings", "station", "is_estimate", "note"],
            vec![vec![
                Value::Timestamp(date),
                Value::Decimal(-1.5),
                Value::Integer(24),
                Value::from("PL-01"),
                Value::Boolean(false),
                Value::Null,
            ]],
        )
        .unwrap()
    }

    #[test]
    fn inference_follows_the_fixed_precedence() {
        let def = TableDefinition::infer("weather", &weather_batch());
        let types: Vec<_> = def.columns.iter().map(|c| c.column_type.sql_type()).collect();
        assert_eq!(
            types,
            vec![
                "TIMESTAMP",
                "DOUBLE PRECISION",
                "BIGINT",
                "VARCHAR(255)",
                "VARCHAR(255)",
                "VARCHAR(255)"
            ]
        );
    }

    #[test]
    fn alignment_maps_batch_order_onto_table_order() {
        let def = TableDefinition::new(
            "prices",
            vec![
                ColumnDef::new("ts", ColumnType::Timestamp),
                ColumnDef::new("price", ColumnType::Decimal),
            ],
        );
        let order = def.align(&["price".to_string(), "ts".to_string()]).unwrap();
        assert_eq!(order, vec![1, 0]);

        assert!(matches!(
            def.align(&["ts".to_string()]),
            Err(SchemaError::ColumnCount { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            def.align(&["ts".to_string(), "cost".to_string()]),
            Err(SchemaError::MissingColumn { .. })
        ));
    }

    #[test]
    fn cell_compatibility_is_strict_except_for_widening() {
        assert!(ColumnType::Decimal.accepts(&Value::Integer(3)));
        assert!(!ColumnType::Integer.accepts(&Value::Decimal(3.5)));
        assert!(ColumnType::Timestamp.accepts(&Value::Null));
        assert!(ColumnType::text().accepts(&Value::Boolean(true)));
        assert!(!ColumnType::Text { max_len: 2 }.accepts(&Value::from("PLN")));
    }

    #[test]
    fn catalog_types_map_back_to_the_closed_set() {
        assert_eq!(
            ColumnType::from_catalog("timestamp without time zone", None),
            Some(ColumnType::Timestamp)
        );
        assert_eq!(
            ColumnType::from_catalog("character varying", Some(255)),
            Some(ColumnType::text())
        );
        assert_eq!(ColumnType::from_catalog("jsonb", None), None);
    }
}
