use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use ewdw_adapters::{extractor_for_source, load_dimension_catalog, DimensionCatalog, SourceExtractor};
use ewdw_core::star::{energy_weather_fact, warehouse_dimensions};
use ewdw_core::{DimensionTable, FactSpec, LoadMode, TabularBatch};
use ewdw_storage::{MemoryWarehouse, PgWarehouse, StateStore, Warehouse, WarehouseError};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{FactStageConfig, StreamConfig, StreamRegistry, SyncConfig};
use crate::dimension::{DimensionKeyResolver, ResolveError};
use crate::fact::{join_sources, AssembledFacts, FactAssembler, Lookup};
use crate::process_log::{stream_process_name, BeginOutcome, ProcessLog, RunHandle, DIMENSION_PROCESS, FACT_PROCESS};
use crate::schema::SchemaSynthesizer;
use crate::snapshot::RunSnapshot;
use crate::watermark::WatermarkResolver;
use crate::writer::{BatchedWriter, LoadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Loaded,
    /// Not attempted because a dependency failed.
    Skipped,
    /// Another run of the same process is still in flight.
    InFlight,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOutcome {
    pub stream: String,
    pub status: OutcomeStatus,
    pub rows: u64,
    pub since: Option<NaiveDateTime>,
    pub watermark: Option<NaiveDateTime>,
    pub detail: Option<String>,
}

impl StreamOutcome {
    fn new(stream: &StreamConfig, status: OutcomeStatus) -> Self {
        Self {
            stream: stream.name.clone(),
            status,
            rows: 0,
            since: None,
            watermark: None,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub process: String,
    pub status: OutcomeStatus,
    pub rows: u64,
    pub dropped_rows: u64,
    pub detail: Option<String>,
}

impl StageOutcome {
    fn new(process: &str, status: OutcomeStatus) -> Self {
        Self {
            process: process.to_string(),
            status,
            rows: 0,
            dropped_rows: 0,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub streams: Vec<StreamOutcome>,
    pub dimensions: Option<StageOutcome>,
    pub facts: Option<StageOutcome>,
    pub snapshot_manifest: Option<String>,
}

impl SyncRunSummary {
    pub fn failed(&self) -> bool {
        self.streams.iter().any(|s| s.status == OutcomeStatus::Failed)
            || [&self.dimensions, &self.facts]
                .into_iter()
                .flatten()
                .any(|s| s.status == OutcomeStatus::Failed)
    }

    pub fn stream(&self, name: &str) -> Option<&StreamOutcome> {
        self.streams.iter().find(|s| s.stream == name)
    }
}

struct LoadedStream {
    batch: TabularBatch,
    rows: u64,
}

fn rows_committed(err: &anyhow::Error) -> u64 {
    err.downcast_ref::<LoadError>().map(LoadError::rows_committed).unwrap_or(0)
}

/// Runs every stream in dependency order, then the dimension and fact stages.
pub struct SyncPipeline {
    config: SyncConfig,
    registry: StreamRegistry,
    warehouse: Arc<dyn Warehouse>,
    extractors: BTreeMap<String, Box<dyn SourceExtractor>>,
    catalog: DimensionCatalog,
    dimensions: Vec<DimensionTable>,
    fact_spec: FactSpec,
    state: Arc<dyn StateStore>,
    watermarks: WatermarkResolver,
    schema: SchemaSynthesizer,
    writer: BatchedWriter,
    resolver: DimensionKeyResolver,
    process_log: ProcessLog,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: StreamRegistry,
        warehouse: Arc<dyn Warehouse>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        let mut extractors = BTreeMap::new();
        for stream in &registry.streams {
            let Some(fixture) = &stream.fixture else { continue };
            let path = config.workspace_root.join(fixture);
            match extractor_for_source(&stream.source_id, path, &stream.watermark_column) {
                Some(extractor) => {
                    extractors.insert(stream.name.clone(), extractor);
                }
                None => warn!(stream = %stream.name, source_id = %stream.source_id, "no extractor for source"),
            }
        }

        let dimensions = warehouse_dimensions();
        Self {
            watermarks: WatermarkResolver::new(warehouse.clone(), state.clone()),
            schema: SchemaSynthesizer::new(warehouse.clone()),
            writer: BatchedWriter::new(warehouse.clone()).with_batch_size(config.batch_size),
            resolver: DimensionKeyResolver::new(warehouse.clone(), dimensions.clone()),
            process_log: ProcessLog::new(state.clone(), config.run_staleness),
            config,
            registry,
            warehouse,
            extractors,
            catalog: DimensionCatalog::default(),
            dimensions,
            fact_spec: energy_weather_fact(),
            state,
        }
    }

    /// PostgreSQL-backed pipeline built from the workspace files.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let registry = StreamRegistry::load(config.streams_path())?;
        let catalog = load_catalog_or_default(&config);
        let warehouse = Arc::new(
            PgWarehouse::connect(&config.warehouse_config())
                .await
                .context("connecting to warehouse")?,
        );
        Ok(Self::new(config, registry, warehouse.clone(), warehouse).with_catalog(catalog))
    }

    /// Pipeline over a fresh in-memory warehouse; nothing is persisted.
    pub fn in_memory(config: SyncConfig) -> Result<Self> {
        let registry = StreamRegistry::load(config.streams_path())?;
        let catalog = load_catalog_or_default(&config);
        let warehouse = Arc::new(MemoryWarehouse::new());
        Ok(Self::new(config, registry, warehouse.clone(), warehouse).with_catalog(catalog))
    }

    pub fn with_catalog(mut self, catalog: DimensionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_extractor(mut self, stream: impl Into<String>, extractor: Box<dyn SourceExtractor>) -> Self {
        self.extractors.insert(stream.into(), extractor);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn state(&self) -> Arc<dyn StateStore> {
        self.state.clone()
    }

    /// One pass over the selected streams (all when `only` is empty).
    pub async fn run_once(&self, only: &[String]) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let until = started_at.naive_utc();
        for name in only {
            if self.registry.stream(name).is_none() {
                bail!("unknown stream {name}");
            }
        }
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .with_context(|| format!("creating {}", self.config.work_dir.display()))?;
        self.state
            .ensure_state_tables()
            .await
            .context("preparing state tables")?;

        let mut streams = Vec::new();
        let mut loaded: BTreeMap<String, TabularBatch> = BTreeMap::new();
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        for stream in self.registry.execution_order()? {
            if !only.is_empty() && !only.contains(&stream.name) {
                continue;
            }
            if let Some(dep) = stream.depends_on.iter().find(|d| blocked.contains(*d)) {
                warn!(stream = %stream.name, dependency = %dep, "skipping stream after dependency failure");
                blocked.insert(stream.name.clone());
                streams.push(
                    StreamOutcome::new(stream, OutcomeStatus::Skipped).with_detail(format!("dependency {dep} failed")),
                );
                continue;
            }

            let (outcome, batch) = self
                .run_stream(stream, until)
                .instrument(info_span!("stream_run", stream = %stream.name))
                .await;
            if outcome.status == OutcomeStatus::Failed {
                blocked.insert(stream.name.clone());
            }
            if let Some(batch) = batch {
                loaded.insert(stream.name.clone(), batch);
            }
            streams.push(outcome);
        }

        let profile_batch = self
            .registry
            .dimensions
            .profile_stream
            .as_ref()
            .and_then(|name| loaded.get(name));
        let dimensions = self
            .run_dimension_stage(profile_batch)
            .instrument(info_span!("dimension_stage"))
            .await;

        let mut fact_batch = None;
        let facts = match &self.registry.fact {
            Some(fact) => {
                let outcome = self
                    .run_fact_stage(fact, &loaded)
                    .instrument(info_span!("fact_stage", driver = %fact.driver))
                    .await;
                outcome.map(|(outcome, batch)| {
                    fact_batch = batch;
                    outcome
                })
            }
            None => None,
        };

        let snapshot_manifest = self.write_snapshot(run_id, &loaded, fact_batch.as_ref());
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            streams,
            dimensions: Some(dimensions),
            facts,
            snapshot_manifest,
        };
        info!(run_id = %summary.run_id, failed = summary.failed(), "sync run finished");
        Ok(summary)
    }

    async fn run_stream(&self, stream: &StreamConfig, until: NaiveDateTime) -> (StreamOutcome, Option<TabularBatch>) {
        let handle = match self.process_log.begin(&stream_process_name(&stream.name)).await {
            Ok(BeginOutcome::Started(handle)) => handle,
            Ok(BeginOutcome::InFlight(run)) => {
                let outcome = StreamOutcome::new(stream, OutcomeStatus::InFlight)
                    .with_detail(format!("run {} started at {}", run.log_id, run.start_time));
                return (outcome, None);
            }
            Err(err) => {
                error!(error = %err, "could not start run");
                return (
                    StreamOutcome::new(stream, OutcomeStatus::Failed).with_detail(err.to_string()),
                    None,
                );
            }
        };

        let since = match stream.mode {
            // A replace-all batch must carry the source's complete state.
            LoadMode::ReplaceAll => self.watermarks.default_epoch(),
            LoadMode::Append => self.watermarks.last_processed(stream).await,
        };
        let loaded = match self.load_stream(stream, since, until).await {
            Ok(loaded) => loaded,
            Err(err) => {
                let rows = rows_committed(&err);
                let message = format!("{err:#}");
                error!(rows_committed = rows, error = %message, "stream load failed");
                if rows > 0 {
                    // Pin the ledger so committed chunks cannot move the column maximum past unloaded rows.
                    if let Err(err) = self.watermarks.advance(stream, since).await {
                        warn!(error = %err, "could not pin watermark after partial load");
                    }
                }
                self.finish_failed(handle, rows, &message).await;
                let mut outcome = StreamOutcome::new(stream, OutcomeStatus::Failed).with_detail(message);
                outcome.rows = rows;
                outcome.since = Some(since);
                return (outcome, None);
            }
        };

        let mut watermark = None;
        if let Some(batch_max) = loaded.batch.max_timestamp(&stream.watermark_column) {
            match self.watermarks.advance(stream, batch_max).await {
                Ok(stored) => watermark = Some(stored),
                Err(err) => {
                    let message = format!("advancing watermark: {err}");
                    error!(error = %message, "stream load failed");
                    self.finish_failed(handle, loaded.rows, &message).await;
                    let mut outcome = StreamOutcome::new(stream, OutcomeStatus::Failed).with_detail(message);
                    outcome.rows = loaded.rows;
                    outcome.since = Some(since);
                    return (outcome, None);
                }
            }
        }
        if let Err(err) = self.process_log.succeed(handle, loaded.rows).await {
            warn!(error = %err, "could not record run success");
        }

        let mut outcome = StreamOutcome::new(stream, OutcomeStatus::Loaded);
        outcome.rows = loaded.rows;
        outcome.since = Some(since);
        outcome.watermark = watermark;
        (outcome, Some(loaded.batch))
    }

    async fn load_stream(&self, stream: &StreamConfig, since: NaiveDateTime, until: NaiveDateTime) -> Result<LoadedStream> {
        let extractor = self
            .extractors
            .get(&stream.name)
            .with_context(|| format!("no extractor registered for stream {}", stream.name))?;
        let batch = extractor
            .fetch(since, until)
            .await
            .with_context(|| format!("extracting {} since {since}", extractor.source_id()))?;
        info!(rows = batch.len(), %since, %until, "extracted");
        if batch.is_empty() {
            // An empty fetch never truncates a replace-all table.
            return Ok(LoadedStream { batch, rows: 0 });
        }

        self.schema
            .ensure_table(&stream.target_table, &batch)
            .await
            .with_context(|| format!("preparing {}", stream.target_table))?;
        let rows = self
            .writer
            .load(&stream.target_table, &batch, stream.mode)
            .await
            .with_context(|| format!("loading {}", stream.target_table))?;
        Ok(LoadedStream { batch, rows })
    }

    async fn finish_failed(&self, handle: RunHandle, rows: u64, message: &str) {
        if let Err(err) = self.process_log.fail(handle, rows, message).await {
            error!(error = %err, "could not record run failure");
        }
    }

    async fn run_dimension_stage(&self, profiles: Option<&TabularBatch>) -> StageOutcome {
        let handle = match self.process_log.begin(DIMENSION_PROCESS).await {
            Ok(BeginOutcome::Started(handle)) => handle,
            Ok(BeginOutcome::InFlight(_)) => return StageOutcome::new(DIMENSION_PROCESS, OutcomeStatus::InFlight),
            Err(err) => {
                let mut outcome = StageOutcome::new(DIMENSION_PROCESS, OutcomeStatus::Failed);
                outcome.detail = Some(err.to_string());
                return outcome;
            }
        };

        match self.refresh_dimensions(profiles).await {
            Ok(rows) => {
                if let Err(err) = self.process_log.succeed(handle, rows).await {
                    warn!(error = %err, "could not record run success");
                }
                let mut outcome = StageOutcome::new(DIMENSION_PROCESS, OutcomeStatus::Loaded);
                outcome.rows = rows;
                outcome
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "dimension processing failed");
                self.finish_failed(handle, 0, &message).await;
                let mut outcome = StageOutcome::new(DIMENSION_PROCESS, OutcomeStatus::Failed);
                outcome.detail = Some(message);
                outcome
            }
        }
    }

    async fn refresh_dimensions(&self, profiles: Option<&TabularBatch>) -> Result<u64, ResolveError> {
        self.resolver.ensure_tables().await?;
        let mut rows = self.resolver.load_catalog(&self.catalog).await?;
        rows += self.resolver.seed_time_of_day().await?;
        if let Some(batch) = profiles {
            rows += self.resolver.profiles_from_indicators(batch).await?;
        }
        info!(rows, "dimensions refreshed");
        Ok(rows)
    }

    async fn run_fact_stage(
        &self,
        fact: &FactStageConfig,
        loaded: &BTreeMap<String, TabularBatch>,
    ) -> Option<(StageOutcome, Option<TabularBatch>)> {
        let Some(driver) = loaded.get(&fact.driver).filter(|b| !b.is_empty()) else {
            info!("no new driver rows; fact stage skipped");
            return None;
        };

        let handle = match self.process_log.begin(FACT_PROCESS).await {
            Ok(BeginOutcome::Started(handle)) => handle,
            Ok(BeginOutcome::InFlight(_)) => return Some((StageOutcome::new(FACT_PROCESS, OutcomeStatus::InFlight), None)),
            Err(err) => {
                let mut outcome = StageOutcome::new(FACT_PROCESS, OutcomeStatus::Failed);
                outcome.detail = Some(err.to_string());
                return Some((outcome, None));
            }
        };

        match self.build_facts(fact, driver).await {
            Ok((facts, rows)) => {
                if let Err(err) = self.process_log.succeed(handle, rows).await {
                    warn!(error = %err, "could not record run success");
                }
                let mut outcome = StageOutcome::new(FACT_PROCESS, OutcomeStatus::Loaded);
                outcome.rows = rows;
                outcome.dropped_rows = facts.dropped_rows as u64;
                Some((outcome, Some(facts.batch)))
            }
            Err(err) => {
                let rows = rows_committed(&err);
                let message = format!("{err:#}");
                error!(rows_committed = rows, error = %message, "fact processing failed");
                self.finish_failed(handle, rows, &message).await;
                let mut outcome = StageOutcome::new(FACT_PROCESS, OutcomeStatus::Failed);
                outcome.rows = rows;
                outcome.detail = Some(message);
                Some((outcome, None))
            }
        }
    }

    async fn build_facts(&self, fact: &FactStageConfig, driver: &TabularBatch) -> Result<(AssembledFacts, u64)> {
        let driver_stream = self
            .registry
            .stream(&fact.driver)
            .with_context(|| format!("unknown driver stream {}", fact.driver))?;
        let (Some(from), Some(to)) = (
            driver.min_timestamp(&driver_stream.watermark_column),
            driver.max_timestamp(&driver_stream.watermark_column),
        ) else {
            bail!("driver rows carry no {} values", driver_stream.watermark_column);
        };

        let mut lookup_batches = Vec::with_capacity(fact.joins.len());
        for join in &fact.joins {
            let stream = self
                .registry
                .stream(&join.stream)
                .with_context(|| format!("unknown join stream {}", join.stream))?;
            let batch = match self
                .warehouse
                .select_window(&stream.target_table, &stream.watermark_column, from, to)
                .await
            {
                Ok(batch) => batch,
                Err(WarehouseError::UnknownTable(table)) => {
                    warn!(%table, "join source has no staging table yet");
                    TabularBatch::default()
                }
                Err(err) => return Err(err).with_context(|| format!("reading {} for the fact join", stream.target_table)),
            };
            lookup_batches.push((batch, join.on.as_slice()));
        }
        let lookups: Vec<Lookup<'_>> = lookup_batches
            .iter()
            .map(|(batch, on)| Lookup { batch, on: *on })
            .collect();
        let joined = join_sources(driver, &lookups).context("joining fact sources")?;

        self.resolver
            .ensure_tables()
            .await
            .context("preparing dimension tables")?;
        let definition = self.fact_spec.table_definition(&self.dimensions);
        self.schema
            .ensure_definition(&definition)
            .await
            .with_context(|| format!("preparing {}", definition.name))?;

        let mut assembler = FactAssembler::new(&self.resolver, self.fact_spec.clone());
        let facts = assembler.assemble(&joined).await.context("assembling facts")?;
        let rows = self
            .writer
            .load(&self.fact_spec.table, &facts.batch, fact.mode)
            .await
            .with_context(|| format!("loading {}", self.fact_spec.table))?;
        Ok((facts, rows))
    }

    fn write_snapshot(
        &self,
        run_id: Uuid,
        loaded: &BTreeMap<String, TabularBatch>,
        facts: Option<&TabularBatch>,
    ) -> Option<String> {
        let mut snapshot = RunSnapshot::new(&self.config.work_dir, run_id);
        let tables = self
            .registry
            .streams
            .iter()
            .filter_map(|s| loaded.get(&s.name).map(|batch| (s.target_table.as_str(), batch)))
            .chain(facts.map(|batch| (self.fact_spec.table.as_str(), batch)))
            .filter(|(_, batch)| !batch.is_empty());
        for (table, batch) in tables {
            if let Err(err) = snapshot.add(table, batch) {
                warn!(table, error = %format!("{err:#}"), "snapshot export failed");
            }
        }
        if snapshot.is_empty() {
            return None;
        }
        match snapshot.finish() {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "snapshot manifest failed");
                None
            }
        }
    }

    /// Cron job that runs [`run_once`](Self::run_once) over every stream.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&[]).await {
                    Ok(summary) => info!(run_id = %summary.run_id, failed = summary.failed(), "scheduled sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn load_catalog_or_default(config: &SyncConfig) -> DimensionCatalog {
    let path = config.catalog_path();
    match load_dimension_catalog(&path) {
        Ok(catalog) => catalog,
        Err(err) => {
            warn!(path = %path.display(), error = %format!("{err:#}"), "dimension catalog unavailable");
            DimensionCatalog::default()
        }
    }
}
