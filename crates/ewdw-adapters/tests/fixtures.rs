use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use ewdw_adapters::{extractor_for_source, load_dimension_catalog, load_fixture_bundle, provider_for_source};
use ewdw_core::ColumnKind;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

const BUNDLES: [(&str, &str, usize); 5] = [
    ("entsoe-load", "timestamp", 6),
    ("entsoe-price", "timestamp", 6),
    ("entsoe-generation", "timestamp", 13),
    ("open-meteo-weather", "timestamp", 6),
    ("eurostat-socioeconomic", "period", 2),
];

#[test]
fn every_fixture_bundle_matches_its_source() {
    for (source_id, _, rows) in BUNDLES {
        let path = workspace_root().join("fixtures").join(format!("{source_id}.json"));
        let bundle = load_fixture_bundle(&path).unwrap();
        assert_eq!(bundle.source_id, source_id);
        assert_eq!(Some(bundle.provider), provider_for_source(source_id));
        assert_eq!(bundle.records.len(), rows, "{source_id}");
    }
}

#[tokio::test]
async fn every_fixture_extracts_from_the_epoch() {
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let now = Utc::now().naive_utc();
    for (source_id, column, rows) in BUNDLES {
        let path = workspace_root().join("fixtures").join(format!("{source_id}.json"));
        let extractor = extractor_for_source(source_id, path, column).unwrap();
        let batch = extractor.fetch(epoch, now).await.unwrap();
        assert_eq!(batch.len(), rows, "{source_id}");
        let idx = batch.columns().iter().position(|c| c == column).unwrap();
        assert_eq!(batch.kinds()[idx], Some(ColumnKind::Timestamp), "{source_id}");
    }
}

#[tokio::test]
async fn fetch_window_is_open_at_since() {
    let path = workspace_root().join("fixtures/entsoe-load.json");
    let extractor = extractor_for_source("entsoe-load", path, "timestamp").unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let batch = extractor
        .fetch(day.and_hms_opt(1, 0, 0).unwrap(), day.and_hms_opt(2, 0, 0).unwrap())
        .await
        .unwrap();
    // PL and DE at 02:00 only.
    assert_eq!(batch.len(), 2);
}

#[test]
fn catalog_covers_the_static_dimensions() {
    let catalog = load_dimension_catalog(workspace_root().join("catalog/dimensions.json")).unwrap();
    for dimension in ["bidding_zone", "generation_type", "weather_condition", "weather_zone", "socioeconomic_profile"] {
        assert!(!catalog.members(dimension).is_empty(), "{dimension}");
    }
    assert!(catalog.members("bidding_zone").iter().any(|m| m.natural_key == "PL"));
    assert!(catalog.members("weather_condition").iter().any(|m| m.natural_key == "Snow"));
}
