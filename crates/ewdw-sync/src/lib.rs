//! Incremental sync: watermarks, schema synthesis, batched loading, dimension
//! resolution and fact assembly, driven by the stream registry.

use anyhow::Result;

pub mod config;
pub mod dimension;
pub mod fact;
pub mod orchestrator;
pub mod process_log;
pub mod schema;
pub mod snapshot;
pub mod watermark;
pub mod writer;

pub use config::{FactStageConfig, JoinConfig, StreamConfig, StreamRegistry, SyncConfig};
pub use dimension::{DimensionKeyResolver, ResolveError};
pub use fact::{join_sources, AssembledFacts, FactAssembler, Lookup};
pub use orchestrator::{OutcomeStatus, StageOutcome, StreamOutcome, SyncPipeline, SyncRunSummary};
pub use process_log::{BeginOutcome, ProcessLog, RunHandle};
pub use schema::SchemaSynthesizer;
pub use snapshot::{ParquetManifest, ParquetManifestFile, RunSnapshot};
pub use watermark::WatermarkResolver;
pub use writer::{BatchedWriter, LoadError, DEFAULT_BATCH_SIZE};

pub const CRATE_NAME: &str = "ewdw-sync";

/// Runs every stream once against the configured warehouse, or against an
/// in-memory one for a dry run.
pub async fn run_sync_once_from_env(dry_run: bool, only: &[String]) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = if dry_run {
        SyncPipeline::in_memory(config)?
    } else {
        SyncPipeline::connect(config).await?
    };
    pipeline.run_once(only).await
}
