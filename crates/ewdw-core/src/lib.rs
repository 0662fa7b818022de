//! Core domain model for the energy/weather warehouse: typed batches, table
//! definitions, the star schema and process-log records.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub mod batch;
pub mod calendar;
pub mod schema;
pub mod star;

pub use batch::{BatchError, ColumnKind, TabularBatch};
pub use schema::{ColumnDef, ColumnType, ForeignKey, SchemaError, TableDefinition, DEFAULT_TEXT_LENGTH};
pub use star::{DimensionRef, DimensionTable, FactSpec, KeySource, MeasureSpec};

pub const CRATE_NAME: &str = "ewdw-core";

/// Earliest point the warehouse is willing to backfill from.
pub fn default_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

/// One typed cell of a [`TabularBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Boolean(bool),
    Null,
}

impl Value {
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            Value::Integer(_) => Some(ColumnKind::Integer),
            Value::Decimal(_) => Some(ColumnKind::Decimal),
            Value::Text(_) => Some(ColumnKind::Text),
            Value::Timestamp(_) => Some(ColumnKind::Timestamp),
            Value::Boolean(_) => Some(ColumnKind::Boolean),
            Value::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Text rendering used for natural keys and text columns. `None` for nulls.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Null => f.write_str("NULL"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// How a load treats rows already present in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    ReplaceAll,
    #[default]
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One row of the process log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRun {
    pub log_id: i64,
    pub process_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub rows_processed: i64,
    pub error_message: Option<String>,
}

/// Committed watermark for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamWatermark {
    pub stream_name: String,
    pub watermark: NaiveDateTime,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_epoch_is_start_of_2020() {
        assert_eq!(default_epoch().to_string(), "2020-01-01 00:00:00");
    }

    #[test]
    fn run_status_round_trips_through_log_text() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("running"), None);
    }

    #[test]
    fn natural_key_rendering_skips_nulls() {
        assert_eq!(Value::from("PL").as_key().as_deref(), Some("PL"));
        assert_eq!(Value::Integer(7).as_key().as_deref(), Some("7"));
        assert_eq!(Value::Null.as_key(), None);
        assert_eq!(Value::from(None::<f64>), Value::Null);
    }
}
