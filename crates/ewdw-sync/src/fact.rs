use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveTime, Timelike};
use ewdw_core::calendar::{date_attributes, date_key, time_attributes, time_key};
use ewdw_core::star::classify_weather_condition;
use ewdw_core::{BatchError, DimensionRef, FactSpec, KeySource, TabularBatch, Value};
use tracing::{debug, info};

use crate::dimension::{DimensionKeyResolver, ResolveError};

const BASE_TEMPERATURE_HEATING: f64 = 18.0;
const BASE_TEMPERATURE_COOLING: f64 = 22.0;
const HOURS_PER_DAY: f64 = 24.0;

/// ENTSO-E production types counted as renewable.
pub const RENEWABLE_PRODUCTION_TYPES: [&str; 9] = ["B01", "B09", "B11", "B12", "B13", "B15", "B16", "B18", "B19"];

/// A staging batch joined onto the driver rows by key columns.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    pub batch: &'a TabularBatch,
    pub on: &'a [String],
}

fn join_key(record: &BTreeMap<String, Value>, on: &[String]) -> Option<Vec<String>> {
    on.iter()
        .map(|column| record.get(column).and_then(Value::as_key))
        .collect()
}

/// Left-joins every lookup onto the driver. Driver values win on name
/// clashes, the last lookup row wins on duplicate keys, and rows with a null
/// key component never match.
pub fn join_sources(driver: &TabularBatch, lookups: &[Lookup<'_>]) -> Result<TabularBatch, BatchError> {
    let mut columns: Vec<String> = driver.columns().to_vec();
    let mut indexed: Vec<(&[String], HashMap<Vec<String>, BTreeMap<String, Value>>)> = Vec::new();
    for lookup in lookups {
        for column in lookup.batch.columns() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        let mut index = HashMap::new();
        for record in lookup.batch.records() {
            if let Some(key) = join_key(&record, lookup.on) {
                index.insert(key, record);
            }
        }
        indexed.push((lookup.on, index));
    }

    let mut joined = TabularBatch::new(columns)?;
    for mut record in driver.records() {
        for (on, index) in &indexed {
            let Some(matched) = join_key(&record, on).and_then(|key| index.get(&key)) else {
                continue;
            };
            for (column, value) in matched {
                record.entry(column.clone()).or_insert_with(|| value.clone());
            }
        }
        joined.push_record(&record)?;
    }
    Ok(joined)
}

/// Fills measures computed from other columns when the source does not carry them.
pub fn derive_measures(record: &mut BTreeMap<String, Value>) {
    let number = |record: &BTreeMap<String, Value>, column: &str| record.get(column).and_then(Value::as_f64);

    if !has_value(record, "consumption_deviation") {
        if let (Some(actual), Some(forecast)) = (number(record, "actual_load"), number(record, "forecast_load")) {
            if actual > 0.0 {
                record.insert(
                    "consumption_deviation".into(),
                    Value::Decimal((forecast - actual) / actual * 100.0),
                );
            }
        }
    }

    if let Some(temperature) = number(record, "temperature") {
        if !has_value(record, "heating_degree_days") {
            let hdd = (BASE_TEMPERATURE_HEATING - temperature).max(0.0) / HOURS_PER_DAY;
            record.insert("heating_degree_days".into(), Value::Decimal(hdd));
        }
        if !has_value(record, "cooling_degree_days") {
            let cdd = (temperature - BASE_TEMPERATURE_COOLING).max(0.0) / HOURS_PER_DAY;
            record.insert("cooling_degree_days".into(), Value::Decimal(cdd));
        }
    }

    if !has_value(record, "weather_condition") {
        if let (Some(precipitation), Some(cloud_cover), Some(wind_speed), Some(temperature)) = (
            number(record, "precipitation"),
            number(record, "cloud_cover"),
            number(record, "wind_speed"),
            number(record, "temperature"),
        ) {
            let condition = classify_weather_condition(precipitation, cloud_cover, wind_speed, temperature);
            record.insert("weather_condition".into(), Value::from(condition));
        }
    }
}

/// Sets `renewable_percentage` on generation rows: the row's share of all
/// generation at the same timestamp and zone when its production type is
/// renewable, zero otherwise. Rows without a timestamp or zone are left alone.
pub fn derive_renewable_share(records: &mut [BTreeMap<String, Value>]) {
    let group = |record: &BTreeMap<String, Value>| -> Option<(String, String)> {
        let timestamp = record.get("timestamp").and_then(Value::as_key)?;
        let zone = record.get("zone_code").and_then(Value::as_key)?;
        Some((timestamp, zone))
    };
    let amount = |record: &BTreeMap<String, Value>| {
        record
            .get("generation_mw")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
    };

    let mut totals: HashMap<(String, String), f64> = HashMap::new();
    for record in records.iter() {
        if let (Some(key), Some(mw)) = (group(record), amount(record)) {
            *totals.entry(key).or_default() += mw;
        }
    }

    for record in records.iter_mut() {
        if has_value(record, "renewable_percentage") {
            continue;
        }
        let (Some(key), Some(mw)) = (group(record), amount(record)) else {
            continue;
        };
        let renewable = record
            .get("production_type")
            .and_then(Value::as_key)
            .is_some_and(|code| RENEWABLE_PRODUCTION_TYPES.contains(&code.as_str()));
        let total = totals.get(&key).copied().unwrap_or_default();
        let share = if renewable && total > 0.0 { mw * 100.0 / total } else { 0.0 };
        record.insert("renewable_percentage".into(), Value::Decimal(share));
    }
}

fn has_value(record: &BTreeMap<String, Value>, column: &str) -> bool {
    record.get(column).is_some_and(|v| !v.is_null())
}

#[derive(Debug, Clone)]
pub struct AssembledFacts {
    pub batch: TabularBatch,
    pub source_rows: usize,
    pub dropped_rows: usize,
}

/// Turns joined source rows into fact rows of surrogate keys and measures.
pub struct FactAssembler<'a> {
    resolver: &'a DimensionKeyResolver,
    spec: FactSpec,
    resolved: HashMap<(String, String), i64>,
}

impl<'a> FactAssembler<'a> {
    pub fn new(resolver: &'a DimensionKeyResolver, spec: FactSpec) -> Self {
        Self {
            resolver,
            spec,
            resolved: HashMap::new(),
        }
    }

    pub fn spec(&self) -> &FactSpec {
        &self.spec
    }

    /// Rows with an unresolvable dimension key are dropped and counted.
    /// Connectivity failures abort the whole assembly.
    pub async fn assemble(&mut self, source: &TabularBatch) -> Result<AssembledFacts, ResolveError> {
        for dim_ref in &self.spec.dimensions {
            if self.resolver.dimension(&dim_ref.dimension).is_none() {
                return Err(ResolveError::UnknownDimension(dim_ref.dimension.clone()));
            }
        }

        let mut batch = TabularBatch::new(self.spec.column_names())?;
        let mut dropped_rows = 0usize;
        let mut records: Vec<BTreeMap<String, Value>> = source.records().collect();
        derive_renewable_share(&mut records);
        for (row, mut record) in records.into_iter().enumerate() {
            derive_measures(&mut record);
            let keys = match self.resolve_row(&record).await {
                Ok(keys) => keys,
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    dropped_rows += 1;
                    debug!(row, error = %err, "fact row dropped");
                    continue;
                }
            };
            let measures = self.spec.measures.iter().map(|measure| {
                let value = record
                    .get(&measure.source_column)
                    .and_then(Value::as_f64)
                    .filter(|v| v.is_finite())
                    .unwrap_or(measure.sentinel);
                Value::Decimal(value)
            });
            let fact_row: Vec<Value> = keys.into_iter().map(Value::Integer).chain(measures).collect();
            batch.push_row(fact_row)?;
        }

        info!(
            table = %self.spec.table,
            source_rows = source.len(),
            fact_rows = batch.len(),
            dropped_rows,
            "facts assembled"
        );
        Ok(AssembledFacts {
            batch,
            source_rows: source.len(),
            dropped_rows,
        })
    }

    async fn resolve_row(&mut self, record: &BTreeMap<String, Value>) -> Result<Vec<i64>, ResolveError> {
        let mut keys = Vec::with_capacity(self.spec.dimensions.len());
        for dim_ref in &self.spec.dimensions {
            let (natural_key, attributes) = natural_key_for(dim_ref, record)?;
            let cache_key = (dim_ref.dimension.clone(), natural_key);
            if let Some(key) = self.resolved.get(&cache_key) {
                keys.push(*key);
                continue;
            }
            let natural_key_column = self
                .resolver
                .dimension(&dim_ref.dimension)
                .map(|d| d.natural_key.clone())
                .ok_or_else(|| ResolveError::UnknownDimension(dim_ref.dimension.clone()))?;
            let key = self
                .resolver
                .resolve_key(&dim_ref.dimension, &natural_key_column, &cache_key.1, &attributes)
                .await?;
            self.resolved.insert(cache_key, key);
            keys.push(key);
        }
        Ok(keys)
    }
}

fn natural_key_for(
    dim_ref: &DimensionRef,
    record: &BTreeMap<String, Value>,
) -> Result<(String, Vec<(String, Value)>), ResolveError> {
    let missing = || ResolveError::EmptyNaturalKey(dim_ref.dimension.clone());
    match &dim_ref.source {
        KeySource::Column { column } => {
            let key = record
                .get(column)
                .and_then(Value::as_key)
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(missing)?;
            Ok((key, Vec::new()))
        }
        KeySource::CalendarDate { timestamp_column } => {
            let ts = record
                .get(timestamp_column)
                .and_then(Value::as_timestamp)
                .ok_or_else(missing)?;
            Ok((date_key(ts), date_attributes(ts.date())))
        }
        KeySource::TimeOfDay { timestamp_column } => {
            let ts = record
                .get(timestamp_column)
                .and_then(Value::as_timestamp)
                .ok_or_else(missing)?;
            let hour = NaiveTime::from_hms_opt(ts.hour(), 0, 0).ok_or_else(missing)?;
            Ok((time_key(ts), time_attributes(hour)))
        }
    }
}
