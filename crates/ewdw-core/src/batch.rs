use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Value;

/// In-memory type of a batch column, fixed by its first non-null value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Decimal,
    Text,
    Timestamp,
    Boolean,
}

#[derive(Debug, Error, PartialEq)]
pub enum BatchError {
    #[error("column name must not be empty")]
    EmptyColumnName,
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("row has {found} values but the batch has {expected} columns")]
    RowWidth { expected: usize, found: usize },
    #[error("column {column} holds {expected:?} values, got {found:?}")]
    MixedTypes {
        column: String,
        expected: ColumnKind,
        found: ColumnKind,
    },
}

/// Ordered rows of typed values under a fixed column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TabularBatch {
    columns: Vec<String>,
    kinds: Vec<Option<ColumnKind>>,
    rows: Vec<Vec<Value>>,
}

impl TabularBatch {
    pub fn new<I, S>(columns: I) -> Result<Self, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for name in &columns {
            if name.trim().is_empty() {
                return Err(BatchError::EmptyColumnName);
            }
            if !seen.insert(name.as_str()) {
                return Err(BatchError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            kinds: vec![None; columns.len()],
            columns,
            rows: Vec::new(),
        })
    }

    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Result<Self, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut batch = Self::new(columns)?;
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Appends a row, enforcing one kind per column. Integers widen into
    /// decimal columns and a decimal widens an integer column.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), BatchError> {
        if row.len() != self.columns.len() {
            return Err(BatchError::RowWidth {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        let mut next_kinds = self.kinds.clone();
        for (idx, value) in row.iter().enumerate() {
            let Some(found) = value.kind() else { continue };
            next_kinds[idx] = match next_kinds[idx] {
                None => Some(found),
                Some(expected) if expected == found => Some(expected),
                Some(ColumnKind::Integer) if found == ColumnKind::Decimal => Some(ColumnKind::Decimal),
                Some(ColumnKind::Decimal) if found == ColumnKind::Integer => Some(ColumnKind::Decimal),
                Some(expected) => {
                    return Err(BatchError::MixedTypes {
                        column: self.columns[idx].clone(),
                        expected,
                        found,
                    })
                }
            };
        }
        self.kinds = next_kinds;
        self.rows.push(row);
        Ok(())
    }

    /// Appends a row given as a column map; absent columns become nulls and
    /// keys outside the column list are ignored.
    pub fn push_record(&mut self, record: &BTreeMap<String, Value>) -> Result<(), BatchError> {
        let row = self
            .columns
            .iter()
            .map(|name| record.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        self.push_row(row)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_kind(&self, name: &str) -> Option<ColumnKind> {
        self.column_index(name).and_then(|idx| self.kinds[idx])
    }

    pub fn kinds(&self) -> &[Option<ColumnKind>] {
        &self.kinds
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn record(&self, row: usize) -> Option<BTreeMap<String, Value>> {
        let values = self.rows.get(row)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect(),
        )
    }

    pub fn records(&self) -> impl Iterator<Item = BTreeMap<String, Value>> + '_ {
        (0..self.rows.len()).filter_map(|idx| self.record(idx))
    }

    /// Newest timestamp in `column`, ignoring nulls and non-timestamp cells.
    pub fn max_timestamp(&self, column: &str) -> Option<NaiveDateTime> {
        let idx = self.column_index(column)?;
        self.rows.iter().filter_map(|r| r[idx].as_timestamp()).max()
    }

    pub fn min_timestamp(&self, column: &str) -> Option<NaiveDateTime> {
        let idx = self.column_index(column)?;
        self.rows.iter().filter_map(|r| r[idx].as_timestamp()).min()
    }
}
