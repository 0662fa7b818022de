use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveTime};
use ewdw_adapters::DimensionCatalog;
use ewdw_core::calendar::time_attributes;
use ewdw_core::star::classify_socioeconomic_profile;
use ewdw_core::{BatchError, DimensionTable, TabularBatch, Value};
use ewdw_storage::{Warehouse, WarehouseError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SOCIOECONOMIC_PROFILE: &str = "socioeconomic_profile";
pub const TIME_OF_DAY: &str = "time_of_day";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown dimension table {0}")]
    UnknownDimension(String),
    #[error("{table} is keyed by {expected}, not {found}")]
    NaturalKeyColumn {
        table: String,
        expected: String,
        found: String,
    },
    #[error("empty natural key for {0}")]
    EmptyNaturalKey(String),
    #[error("{table} has no attribute {attribute}")]
    UnknownAttribute { table: String, attribute: String },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

impl ResolveError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ResolveError::Warehouse(err) if err.is_connectivity())
    }
}

/// Maps natural keys to surrogate keys, creating or refreshing dimension rows.
#[derive(Clone)]
pub struct DimensionKeyResolver {
    warehouse: Arc<dyn Warehouse>,
    dimensions: BTreeMap<String, DimensionTable>,
}

impl DimensionKeyResolver {
    pub fn new(warehouse: Arc<dyn Warehouse>, dimensions: Vec<DimensionTable>) -> Self {
        Self {
            warehouse,
            dimensions: dimensions.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionTable> {
        self.dimensions.get(name)
    }

    pub fn dimensions(&self) -> Vec<DimensionTable> {
        self.dimensions.values().cloned().collect()
    }

    pub async fn ensure_tables(&self) -> Result<(), WarehouseError> {
        for dimension in self.dimensions.values() {
            self.warehouse.ensure_dimension(dimension).await?;
        }
        Ok(())
    }

    /// Surrogate key for `natural_key`, inserting the row when it is new and
    /// overwriting the supplied attributes when it exists.
    pub async fn resolve_key(
        &self,
        table: &str,
        natural_key_column: &str,
        natural_key: &str,
        attributes: &[(String, Value)],
    ) -> Result<i64, ResolveError> {
        let dimension = self
            .dimensions
            .get(table)
            .ok_or_else(|| ResolveError::UnknownDimension(table.to_string()))?;
        if dimension.natural_key != natural_key_column {
            return Err(ResolveError::NaturalKeyColumn {
                table: table.to_string(),
                expected: dimension.natural_key.clone(),
                found: natural_key_column.to_string(),
            });
        }
        if natural_key.trim().is_empty() {
            return Err(ResolveError::EmptyNaturalKey(table.to_string()));
        }
        if let Some((attribute, _)) = attributes.iter().find(|(name, _)| dimension.attribute(name).is_none()) {
            return Err(ResolveError::UnknownAttribute {
                table: table.to_string(),
                attribute: attribute.clone(),
            });
        }
        Ok(self
            .warehouse
            .upsert_dimension(dimension, natural_key, attributes)
            .await?)
    }

    /// Upserts every catalog member. Catalog sections without a matching
    /// dimension are skipped.
    pub async fn load_catalog(&self, catalog: &DimensionCatalog) -> Result<u64, ResolveError> {
        let mut rows = 0u64;
        for (name, members) in &catalog.dimensions {
            let Some(dimension) = self.dimensions.get(name) else {
                warn!(dimension = %name, "catalog section has no dimension table");
                continue;
            };
            for member in members {
                self.resolve_key(name, &dimension.natural_key, &member.natural_key, &member.attribute_values())
                    .await?;
                rows += 1;
            }
            debug!(dimension = %name, members = members.len(), "catalog loaded");
        }
        Ok(rows)
    }

    /// One row per hour of the day.
    pub async fn seed_time_of_day(&self) -> Result<u64, ResolveError> {
        let Some(dimension) = self.dimensions.get(TIME_OF_DAY) else {
            return Ok(0);
        };
        let mut rows = 0u64;
        for hour in 0..24 {
            let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
                continue;
            };
            let key = time.format("%H:%M").to_string();
            self.resolve_key(TIME_OF_DAY, &dimension.natural_key, &key, &time_attributes(time))
                .await?;
            rows += 1;
        }
        Ok(rows)
    }

    /// Refines socio-economic profiles from indicator rows carrying
    /// `zone_code`, `gdp_per_capita` and `unemployment_rate`.
    pub async fn profiles_from_indicators(&self, batch: &TabularBatch) -> Result<u64, ResolveError> {
        let Some(dimension) = self.dimensions.get(SOCIOECONOMIC_PROFILE) else {
            return Ok(0);
        };
        let mut rows = 0u64;
        for record in batch.records() {
            let Some(zone) = record.get("zone_code").and_then(Value::as_key) else {
                debug!("indicator row without zone_code skipped");
                continue;
            };
            let gdp = record.get("gdp_per_capita").and_then(Value::as_f64);
            let unemployment = record.get("unemployment_rate").and_then(Value::as_f64);
            let mut attributes = Vec::new();
            if let (Some(gdp), Some(unemployment)) = (gdp, unemployment) {
                attributes.push((
                    "profile_name".to_string(),
                    Value::from(classify_socioeconomic_profile(gdp, unemployment)),
                ));
            }
            if let Some(gdp) = gdp {
                attributes.push(("avg_income_level".to_string(), Value::Decimal(gdp)));
            }
            if let Some(unemployment) = unemployment {
                attributes.push(("unemployment_rate".to_string(), Value::Decimal(unemployment)));
            }
            if let Some(year) = record
                .get("period")
                .and_then(Value::as_timestamp)
                .map(|ts| i64::from(ts.year()))
            {
                attributes.push(("reference_year".to_string(), Value::Integer(year)));
            }
            match self
                .resolve_key(SOCIOECONOMIC_PROFILE, &dimension.natural_key, &zone, &attributes)
                .await
            {
                Ok(_) => rows += 1,
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => warn!(zone = %zone, error = %err, "indicator row skipped"),
            }
        }
        info!(rows, "socio-economic profiles refreshed");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ewdw_adapters::CatalogMember;
    use ewdw_core::star::warehouse_dimensions;
    use ewdw_core::ColumnType;
    use ewdw_storage::MemoryWarehouse;
    use serde_json::json;

    fn zones() -> DimensionTable {
        DimensionTable::new("bidding_zone", "code")
            .with_attribute("name", ColumnType::text())
            .with_attribute("country_code", ColumnType::text())
    }

    async fn resolver(dimensions: Vec<DimensionTable>) -> (Arc<MemoryWarehouse>, DimensionKeyResolver) {
        let wh = Arc::new(MemoryWarehouse::new());
        let resolver = DimensionKeyResolver::new(wh.clone(), dimensions);
        resolver.ensure_tables().await.unwrap();
        (wh, resolver)
    }

    #[tokio::test]
    async fn first_resolution_inserts_and_later_ones_reuse_the_key() {
        let (wh, resolver) = resolver(vec![zones()]).await;
        let first = resolver
            .resolve_key("bidding_zone", "code", "PL", &[("name".into(), Value::from("Poland"))])
            .await
            .unwrap();
        let second = resolver
            .resolve_key("bidding_zone", "code", "PL", &[("name".into(), Value::from("Poland"))])
            .await
            .unwrap();

        assert_eq!(first, second);
        let rows = wh.dimension_rows("bidding_zone").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].natural_key, "PL");
        assert_eq!(rows[0].attributes["name"], Value::from("Poland"));
    }

    #[tokio::test]
    async fn attributes_are_last_writer_wins() {
        let (wh, resolver) = resolver(vec![zones()]).await;
        resolver
            .resolve_key("bidding_zone", "code", "DE", &[("name".into(), Value::from("Germany"))])
            .await
            .unwrap();
        resolver
            .resolve_key("bidding_zone", "code", "DE", &[("name".into(), Value::from("Deutschland"))])
            .await
            .unwrap();
        assert_eq!(wh.dimension_rows("bidding_zone").await[0].attributes["name"], Value::from("Deutschland"));
    }

    #[tokio::test]
    async fn natural_keys_are_case_sensitive() {
        let (_, resolver) = resolver(vec![zones()]).await;
        let upper = resolver.resolve_key("bidding_zone", "code", "PL", &[]).await.unwrap();
        let lower = resolver.resolve_key("bidding_zone", "code", "pl", &[]).await.unwrap();
        assert_ne!(upper, lower);
    }

    #[tokio::test]
    async fn invalid_requests_are_resolver_errors() {
        let (_, resolver) = resolver(vec![zones()]).await;
        assert!(matches!(
            resolver.resolve_key("bidding_zone", "code", "  ", &[]).await,
            Err(ResolveError::EmptyNaturalKey(_))
        ));
        assert!(matches!(
            resolver.resolve_key("planet", "code", "PL", &[]).await,
            Err(ResolveError::UnknownDimension(_))
        ));
        assert!(matches!(
            resolver.resolve_key("bidding_zone", "zone", "PL", &[]).await,
            Err(ResolveError::NaturalKeyColumn { .. })
        ));
        assert!(matches!(
            resolver
                .resolve_key("bidding_zone", "code", "PL", &[("colour".into(), Value::from("red"))])
                .await,
            Err(ResolveError::UnknownAttribute { .. })
        ));
    }

    #[tokio::test]
    async fn connectivity_failures_are_flagged() {
        let (wh, resolver) = resolver(vec![zones()]).await;
        wh.set_offline(true).await;
        let err = resolver.resolve_key("bidding_zone", "code", "PL", &[]).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn catalog_and_time_of_day_are_loaded_once() {
        let (wh, resolver) = resolver(warehouse_dimensions()).await;
        let mut catalog = DimensionCatalog::default();
        catalog.dimensions.insert(
            "bidding_zone".into(),
            vec![CatalogMember {
                natural_key: "PL".into(),
                attributes: serde_json::from_value(json!({"name": "Poland", "country_code": "PL"})).unwrap(),
            }],
        );
        catalog.dimensions.insert("moon_phase".into(), Vec::new());

        assert_eq!(resolver.load_catalog(&catalog).await.unwrap(), 1);
        assert_eq!(resolver.load_catalog(&catalog).await.unwrap(), 1);
        assert_eq!(resolver.seed_time_of_day().await.unwrap(), 24);
        assert_eq!(resolver.seed_time_of_day().await.unwrap(), 24);

        assert_eq!(wh.dimension_rows("bidding_zone").await.len(), 1);
        let hours = wh.dimension_rows("time_of_day").await;
        assert_eq!(hours.len(), 24);
        assert_eq!(hours[8].natural_key, "08:00");
        assert_eq!(hours[8].attributes["is_peak_hour"], Value::Boolean(true));
    }

    #[tokio::test]
    async fn indicators_refine_profiles() {
        let (wh, resolver) = resolver(warehouse_dimensions()).await;
        let period = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let batch = TabularBatch::from_rows(
            ["period", "zone_code", "gdp_per_capita", "unemployment_rate"],
            vec![
                vec![Value::Timestamp(period), Value::from("PL"), Value::Decimal(18_000.0), Value::Decimal(2.9)],
                vec![Value::Timestamp(period), Value::Null, Value::Decimal(1.0), Value::Decimal(1.0)],
            ],
        )
        .unwrap();

        assert_eq!(resolver.profiles_from_indicators(&batch).await.unwrap(), 1);
        let rows = wh.dimension_rows(SOCIOECONOMIC_PROFILE).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributes["reference_year"], Value::Integer(2023));
        assert_eq!(rows[0].attributes["avg_income_level"], Value::Decimal(18_000.0));
    }
}
