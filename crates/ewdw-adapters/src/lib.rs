//! Source extractor contracts + fixture-first extractor implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use ewdw_core::{BatchError, TabularBatch, Value};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ewdw-adapters";

/// External system a source is pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    Entsoe,
    OpenMeteo,
    Eurostat,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("{source_id}: row {row} has an invalid {column} value {raw}")]
    InvalidTimestamp {
        source_id: String,
        row: usize,
        column: String,
        raw: String,
    },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Pulls rows newer than a watermark from one external source.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn source_id(&self) -> &str;
    fn provider(&self) -> Provider;

    /// Rows whose timestamp lies in `(since, until]`.
    async fn fetch(&self, since: NaiveDateTime, until: NaiveDateTime) -> Result<TabularBatch, AdapterError>;
}

/// Captured API response, stored as JSON records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub provider: Provider,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<serde_json::Map<String, JsonValue>>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DDTHH:MM[:SS]` and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc).naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

pub fn json_to_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Decimal).unwrap_or(Value::Null),
        },
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

/// Converts JSON records into a batch, turning the timestamp column into
/// timestamps and keeping rows in `(since, until]`.
pub fn records_to_batch(
    source_id: &str,
    records: &[serde_json::Map<String, JsonValue>],
    timestamp_column: &str,
    since: NaiveDateTime,
    until: NaiveDateTime,
) -> Result<TabularBatch, AdapterError> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    if !records.is_empty() && !columns.iter().any(|c| c == timestamp_column) {
        return Err(AdapterError::Message(format!(
            "{source_id}: records carry no {timestamp_column} column"
        )));
    }

    let mut batch = TabularBatch::new(columns)?;
    for (idx, record) in records.iter().enumerate() {
        let raw_ts = record.get(timestamp_column).and_then(JsonValue::as_str).unwrap_or_default();
        let ts = parse_timestamp(raw_ts).ok_or_else(|| AdapterError::InvalidTimestamp {
            source_id: source_id.to_string(),
            row: idx,
            column: timestamp_column.to_string(),
            raw: raw_ts.to_string(),
        })?;
        if ts <= since || ts > until {
            continue;
        }
        let mut row: BTreeMap<String, Value> = record
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect();
        row.insert(timestamp_column.to_string(), Value::Timestamp(ts));
        batch.push_record(&row)?;
    }
    Ok(batch)
}

/// Extractor that replays a captured [`FixtureBundle`].
#[derive(Debug, Clone)]
pub struct FixtureExtractor {
    source_id: String,
    provider: Provider,
    path: PathBuf,
    timestamp_column: String,
}

impl FixtureExtractor {
    pub fn new(
        source_id: impl Into<String>,
        provider: Provider,
        path: impl Into<PathBuf>,
        timestamp_column: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            provider,
            path: path.into(),
            timestamp_column: timestamp_column.into(),
        }
    }
}

#[async_trait]
impl SourceExtractor for FixtureExtractor {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch(&self, since: NaiveDateTime, until: NaiveDateTime) -> Result<TabularBatch, AdapterError> {
        let bundle = load_fixture_bundle(&self.path)?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "{} holds records for {}, expected {}",
                self.path.display(),
                bundle.source_id,
                self.source_id
            )));
        }
        let batch = records_to_batch(&self.source_id, &bundle.records, &self.timestamp_column, since, until)?;
        debug!(source_id = %self.source_id, rows = batch.len(), %since, %until, "fixture extracted");
        Ok(batch)
    }
}

/// Provider behind a known source id.
pub fn provider_for_source(source_id: &str) -> Option<Provider> {
    match source_id {
        "entsoe-load" | "entsoe-price" | "entsoe-generation" => Some(Provider::Entsoe),
        "open-meteo-weather" => Some(Provider::OpenMeteo),
        "eurostat-socioeconomic" => Some(Provider::Eurostat),
        _ => None,
    }
}

pub fn extractor_for_source(
    source_id: &str,
    fixture_path: impl Into<PathBuf>,
    timestamp_column: &str,
) -> Option<Box<dyn SourceExtractor>> {
    let provider = provider_for_source(source_id)?;
    Some(Box::new(FixtureExtractor::new(
        source_id,
        provider,
        fixture_path,
        timestamp_column,
    )))
}

/// Static members of one dimension, keyed by natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMember {
    pub natural_key: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, JsonValue>,
}

impl CatalogMember {
    pub fn attribute_values(&self) -> Vec<(String, Value)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionCatalog {
    pub dimensions: BTreeMap<String, Vec<CatalogMember>>,
}

impl DimensionCatalog {
    pub fn members(&self, dimension: &str) -> &[CatalogMember] {
        self.dimensions.get(dimension).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn load_dimension_catalog(path: impl AsRef<Path>) -> Result<DimensionCatalog> {
    read_json_file(path)
}
