use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use ewdw_core::{ColumnKind, TabularBatch, Value};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Parquet copies of the batches one run loaded, under `<work_dir>/runs/<run_id>`.
#[derive(Debug)]
pub struct RunSnapshot {
    run_id: Uuid,
    dir: PathBuf,
    files: Vec<ParquetManifestFile>,
}

impl RunSnapshot {
    pub fn new(work_dir: &Path, run_id: Uuid) -> Self {
        Self {
            run_id,
            dir: work_dir.join("runs").join(run_id.to_string()),
            files: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn add(&mut self, table: &str, batch: &TabularBatch) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(format!("{table}.parquet"));
        write_parquet(&path, batch_to_record_batch(batch)?)?;
        let mut entry = manifest_entry(table, &self.dir, &path)?;
        entry.rows = batch.len();
        self.files.retain(|f| f.name != table);
        self.files.push(entry);
        Ok(path)
    }

    /// Writes `manifest.json` and returns its path.
    pub fn finish(self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;
        let manifest = ParquetManifest {
            schema_version: 1,
            run_id: self.run_id,
            files: self.files,
        };
        let manifest_path = self.dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

fn arrow_type(kind: Option<ColumnKind>) -> DataType {
    match kind {
        Some(ColumnKind::Integer) => DataType::Int64,
        Some(ColumnKind::Decimal) => DataType::Float64,
        Some(ColumnKind::Timestamp) => DataType::Timestamp(TimeUnit::Microsecond, None),
        Some(ColumnKind::Boolean) => DataType::Boolean,
        Some(ColumnKind::Text) | None => DataType::Utf8,
    }
}

pub fn batch_to_record_batch(batch: &TabularBatch) -> Result<RecordBatch> {
    let fields: Vec<ArrowField> = batch
        .columns()
        .iter()
        .zip(batch.kinds())
        .map(|(name, kind)| ArrowField::new(name.as_str(), arrow_type(*kind), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays: Vec<ArrayRef> = batch
        .kinds()
        .iter()
        .enumerate()
        .map(|(idx, kind)| {
            let cells = batch.rows().iter().map(move |row| &row[idx]);
            let array: ArrayRef = match kind {
                Some(ColumnKind::Integer) => Arc::new(Int64Array::from(
                    cells
                        .map(|v| match v {
                            Value::Integer(i) => Some(*i),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                Some(ColumnKind::Decimal) => Arc::new(Float64Array::from(cells.map(Value::as_f64).collect::<Vec<_>>())),
                Some(ColumnKind::Timestamp) => Arc::new(TimestampMicrosecondArray::from(
                    cells
                        .map(|v| v.as_timestamp().map(|ts| ts.and_utc().timestamp_micros()))
                        .collect::<Vec<_>>(),
                )),
                Some(ColumnKind::Boolean) => Arc::new(BooleanArray::from(
                    cells
                        .map(|v| match v {
                            Value::Boolean(b) => Some(*b),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                Some(ColumnKind::Text) | None => Arc::new(StringArray::from(
                    cells
                        .map(|v| if v.is_null() { None } else { Some(v.to_string()) })
                        .collect::<Vec<_>>(),
                )),
            };
            array
        })
        .collect();

    RecordBatch::try_new(schema, arrays).context("building snapshot record batch")
}

pub fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows: 0,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> TabularBatch {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(1, 0, 0).unwrap();
        TabularBatch::from_rows(
            ["timestamp", "zone_code", "actual_load", "price", "renewable", "note"],
            vec![
                vec![
                    Value::Timestamp(ts),
                    Value::from("PL"),
                    Value::Integer(15_650),
                    Value::Decimal(92.5),
                    Value::Boolean(true),
                    Value::Null,
                ],
                vec![Value::Null, Value::from("DE"), Value::Null, Value::Integer(80), Value::Null, Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn record_batches_keep_column_kinds() {
        let batch = batch_to_record_batch(&sample()).unwrap();
        let schema = batch.schema();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(schema.field(0).data_type(), &DataType::Timestamp(TimeUnit::Microsecond, None));
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).data_type(), &DataType::Float64);
        assert_eq!(schema.field(4).data_type(), &DataType::Boolean);
        assert_eq!(schema.field(5).data_type(), &DataType::Utf8);
        assert_eq!(batch.column(0).null_count(), 1);
    }

    #[test]
    fn snapshot_writes_parquet_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let mut snapshot = RunSnapshot::new(dir.path(), run_id);
        let parquet_path = snapshot.add("stg_entsoe_load", &sample()).unwrap();
        assert!(parquet_path.exists());

        let manifest_path = snapshot.finish().unwrap();
        assert_eq!(
            manifest_path,
            dir.path().join("runs").join(run_id.to_string()).join("manifest.json")
        );
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.run_id, run_id);
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "stg_entsoe_load.parquet");
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[0].sha256.len(), 64);
        assert!(manifest.files[0].bytes > 0);
    }
}
