//! Star schema: dimension tables, the conformed fact table and the sentinel
//! values used for measures a source row does not carry.

use serde::{Deserialize, Serialize};

use crate::{ColumnDef, ColumnType, TableDefinition};

/// Additive measures (consumption, generation, price, degree days).
pub const ADDITIVE_SENTINEL: f64 = 0.0;
/// Measures whose physical range excludes it (temperature, humidity, precipitation,
/// wind speed, cloud cover, radiation, shares).
pub const OUT_OF_RANGE_SENTINEL: f64 = -99.99;
/// Wind direction lives in 0..=360.
pub const WIND_DIRECTION_SENTINEL: f64 = -999.0;

pub const FACT_TABLE: &str = "fact_energy_weather";

/// A dimension table keyed by a unique text natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionTable {
    pub name: String,
    pub natural_key: String,
    pub attributes: Vec<ColumnDef>,
}

impl DimensionTable {
    pub fn new(name: impl Into<String>, natural_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            natural_key: natural_key.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.attributes.push(ColumnDef::new(name, column_type));
        self
    }

    pub fn surrogate_key(&self) -> String {
        format!("{}_id", self.name)
    }

    pub fn attribute(&self, name: &str) -> Option<&ColumnDef> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Where a fact row's natural key for one dimension comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeySource {
    Column { column: String },
    CalendarDate { timestamp_column: String },
    TimeOfDay { timestamp_column: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRef {
    pub fact_column: String,
    pub dimension: String,
    pub source: KeySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    pub source_column: String,
    pub sentinel: f64,
}

impl MeasureSpec {
    pub fn new(name: &str, source_column: &str, sentinel: f64) -> Self {
        Self {
            name: name.to_string(),
            source_column: source_column.to_string(),
            sentinel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSpec {
    pub table: String,
    pub dimensions: Vec<DimensionRef>,
    pub measures: Vec<MeasureSpec>,
}

impl FactSpec {
    /// Surrogate-key columns (with foreign keys) followed by decimal measures.
    pub fn table_definition(&self, dimensions: &[DimensionTable]) -> TableDefinition {
        let mut columns: Vec<ColumnDef> = self
            .dimensions
            .iter()
            .map(|dim_ref| {
                let column = ColumnDef::new(dim_ref.fact_column.clone(), ColumnType::Integer);
                match dimensions.iter().find(|d| d.name == dim_ref.dimension) {
                    Some(dim) => column.referencing(dim.name.clone(), dim.surrogate_key()),
                    None => column,
                }
            })
            .collect();
        columns.extend(
            self.measures
                .iter()
                .map(|m| ColumnDef::new(m.name.clone(), ColumnType::Decimal)),
        );
        TableDefinition::new(self.table.clone(), columns)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|d| d.fact_column.clone())
            .chain(self.measures.iter().map(|m| m.name.clone()))
            .collect()
    }
}

/// Dimension tables of the energy/weather star schema.
pub fn warehouse_dimensions() -> Vec<DimensionTable> {
    let text = ColumnType::text();
    vec![
        DimensionTable::new("calendar_date", "date_key")
            .with_attribute("full_date", ColumnType::Timestamp)
            .with_attribute("day_of_week", text)
            .with_attribute("day_of_month", ColumnType::Integer)
            .with_attribute("month", ColumnType::Integer)
            .with_attribute("month_name", text)
            .with_attribute("quarter", ColumnType::Integer)
            .with_attribute("year", ColumnType::Integer)
            .with_attribute("season", text)
            .with_attribute("is_weekend", text)
            .with_attribute("is_holiday", text)
            .with_attribute("holiday_name", text),
        DimensionTable::new("time_of_day", "time_key")
            .with_attribute("hour", ColumnType::Integer)
            .with_attribute("minute", ColumnType::Integer)
            .with_attribute("day_period", text)
            .with_attribute("is_peak_hour", text),
        DimensionTable::new("bidding_zone", "code")
            .with_attribute("name", text)
            .with_attribute("eic_code", text)
            .with_attribute("country_code", text)
            .with_attribute("timezone", text)
            .with_attribute("control_area", text),
        DimensionTable::new("weather_zone", "zone_code")
            .with_attribute("zone_name", text)
            .with_attribute("climate_zone", text)
            .with_attribute("elevation_avg", ColumnType::Decimal)
            .with_attribute("coastal_proximity", text)
            .with_attribute("urbanization_level", text),
        DimensionTable::new("generation_type", "entsoe_code")
            .with_attribute("generation_type", text)
            .with_attribute("generation_category", text)
            .with_attribute("is_renewable", text)
            .with_attribute("is_intermittent", text)
            .with_attribute("fuel_source", text),
        DimensionTable::new("weather_condition", "condition_type")
            .with_attribute("severity", text)
            .with_attribute("is_extreme", text)
            .with_attribute("extreme_type", text),
        DimensionTable::new("socioeconomic_profile", "zone_code")
            .with_attribute("profile_name", text)
            .with_attribute("reference_year", ColumnType::Integer)
            .with_attribute("avg_income_level", ColumnType::Decimal)
            .with_attribute("unemployment_rate", ColumnType::Decimal)
            .with_attribute("urbanization_rate", ColumnType::Decimal)
            .with_attribute("energy_poverty_rate", ColumnType::Decimal),
    ]
}

/// The conformed energy/weather fact table.
pub fn energy_weather_fact() -> FactSpec {
    let column = |fact_column: &str, dimension: &str, source: &str| DimensionRef {
        fact_column: fact_column.to_string(),
        dimension: dimension.to_string(),
        source: KeySource::Column {
            column: source.to_string(),
        },
    };
    FactSpec {
        table: FACT_TABLE.to_string(),
        dimensions: vec![
            DimensionRef {
                fact_column: "date_id".into(),
                dimension: "calendar_date".into(),
                source: KeySource::CalendarDate {
                    timestamp_column: "timestamp".into(),
                },
            },
            DimensionRef {
                fact_column: "time_id".into(),
                dimension: "time_of_day".into(),
                source: KeySource::TimeOfDay {
                    timestamp_column: "timestamp".into(),
                },
            },
            column("bidding_zone_id", "bidding_zone", "zone_code"),
            column("weather_zone_id", "weather_zone", "zone_code"),
            column("generation_type_id", "generation_type", "production_type"),
            column("socioeconomic_profile_id", "socioeconomic_profile", "zone_code"),
            column("weather_condition_id", "weather_condition", "weather_condition"),
        ],
        measures: vec![
            MeasureSpec::new("actual_consumption", "actual_load", ADDITIVE_SENTINEL),
            MeasureSpec::new("forecasted_consumption", "forecast_load", ADDITIVE_SENTINEL),
            MeasureSpec::new("consumption_deviation", "consumption_deviation", ADDITIVE_SENTINEL),
            MeasureSpec::new("generation_amount", "generation_mw", ADDITIVE_SENTINEL),
            MeasureSpec::new("day_ahead_price", "price", ADDITIVE_SENTINEL),
            MeasureSpec::new("heating_degree_days", "heating_degree_days", ADDITIVE_SENTINEL),
            MeasureSpec::new("cooling_degree_days", "cooling_degree_days", ADDITIVE_SENTINEL),
            MeasureSpec::new("temperature_avg", "temperature", OUT_OF_RANGE_SENTINEL),
            MeasureSpec::new("humidity", "humidity", OUT_OF_RANGE_SENTINEL),
            MeasureSpec::new("precipitation", "precipitation", OUT_OF_RANGE_SENTINEL),
            MeasureSpec::new("wind_speed", "wind_speed", OUT_OF_RANGE_SENTINEL),
            MeasureSpec::new("wind_direction", "wind_direction", WIND_DIRECTION_SENTINEL),
            MeasureSpec::new("cloud_cover", "cloud_cover", OUT_OF_RANGE_SENTINEL),
            MeasureSpec::new("solar_radiation", "radiation", OUT_OF_RANGE_SENTINEL),
            MeasureSpec::new("renewable_percentage", "renewable_percentage", OUT_OF_RANGE_SENTINEL),
        ],
    }
}

/// Weather condition for an hourly observation (precipitation in mm, cloud cover
/// in %, wind speed in km/h, temperature in °C).
pub fn classify_weather_condition(
    precipitation: f64,
    cloud_cover: f64,
    wind_speed: f64,
    temperature: f64,
) -> &'static str {
    if precipitation > 5.0 {
        return if temperature < 0.0 { "Snow" } else { "Rain" };
    }
    if wind_speed > 50.0 {
        return "Windy";
    }
    if cloud_cover < 20.0 {
        "Clear"
    } else if cloud_cover < 50.0 {
        "Partly Cloudy"
    } else if cloud_cover < 80.0 {
        "Cloudy"
    } else {
        "Overcast"
    }
}

pub fn classify_socioeconomic_profile(gdp_per_capita: f64, unemployment_rate: f64) -> &'static str {
    if gdp_per_capita > 40_000.0 {
        if unemployment_rate < 5.0 {
            "High Income - Low Unemployment"
        } else {
            "High Income - Moderate Unemployment"
        }
    } else if gdp_per_capita > 25_000.0 {
        if unemployment_rate < 8.0 {
            "Middle Income - Low Unemployment"
        } else {
            "Middle Income - High Unemployment"
        }
    } else {
        "Lower Middle Income"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_table_references_every_dimension() {
        let dims = warehouse_dimensions();
        let spec = energy_weather_fact();
        let def = spec.table_definition(&dims);

        let fks: Vec<_> = def
            .columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|fk| (c.name.as_str(), fk.column.as_str())))
            .collect();
        assert_eq!(fks.len(), 7);
        assert!(fks.contains(&("bidding_zone_id", "bidding_zone_id")));
        assert!(fks.contains(&("date_id", "calendar_date_id")));
        assert_eq!(def.columns.len(), 7 + spec.measures.len());
    }

    #[test]
    fn sentinels_are_documented_per_measure() {
        let spec = energy_weather_fact();
        let sentinel = |name: &str| spec.measures.iter().find(|m| m.name == name).unwrap().sentinel;
        assert_eq!(sentinel("actual_consumption"), 0.0);
        assert_eq!(sentinel("temperature_avg"), -99.99);
        assert_eq!(sentinel("wind_direction"), -999.0);
    }

    #[test]
    fn weather_condition_rules() {
        assert_eq!(classify_weather_condition(6.0, 90.0, 10.0, -2.0), "Snow");
        assert_eq!(classify_weather_condition(6.0, 90.0, 10.0, 4.0), "Rain");
        assert_eq!(classify_weather_condition(0.0, 10.0, 60.0, 4.0), "Windy");
        assert_eq!(classify_weather_condition(0.0, 10.0, 5.0, 4.0), "Clear");
        assert_eq!(classify_weather_condition(0.0, 65.0, 5.0, 4.0), "Cloudy");
        assert_eq!(classify_weather_condition(0.0, 95.0, 5.0, 4.0), "Overcast");
    }

    #[test]
    fn socioeconomic_profile_bands() {
        assert_eq!(classify_socioeconomic_profile(45_000.0, 3.0), "High Income - Low Unemployment");
        assert_eq!(classify_socioeconomic_profile(30_000.0, 9.0), "Middle Income - High Unemployment");
        assert_eq!(classify_socioeconomic_profile(18_000.0, 4.0), "Lower Middle Income");
    }
}
