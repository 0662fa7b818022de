use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ewdw_core::ProcessRun;
use ewdw_storage::{PgWarehouse, StateStore};
use ewdw_sync::{OutcomeStatus, StreamRegistry, SyncConfig, SyncPipeline, SyncRunSummary, WatermarkResolver};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ewdw-cli")]
#[command(about = "Energy and weather warehouse loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stream (or the named ones) once, then dimensions and facts.
    Sync {
        /// Load into an in-memory warehouse instead of PostgreSQL.
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "stream", value_name = "NAME")]
        streams: Vec<String>,
    },
    /// Create the state tables.
    Migrate,
    /// Show the committed and resolved watermark of a stream.
    Watermark { stream: String },
    /// List recent process-log rows.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Run syncs on the SYNC_CRON schedule until interrupted.
    Schedule,
    /// Serve the JSON status API.
    Serve {
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        streams: Vec::new(),
    });

    match command {
        Commands::Sync { dry_run, streams } => {
            let summary = ewdw_sync::run_sync_once_from_env(dry_run, &streams).await?;
            print_summary(&summary);
            if summary.failed() {
                bail!("sync run {} finished with failed streams", summary.run_id);
            }
        }
        Commands::Migrate => {
            let warehouse = PgWarehouse::connect(&SyncConfig::from_env().warehouse_config())
                .await
                .context("connecting to warehouse")?;
            warehouse.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Watermark { stream } => {
            let config = SyncConfig::from_env();
            let registry = StreamRegistry::load(config.streams_path())?;
            let Some(stream_config) = registry.stream(&stream) else {
                bail!("unknown stream {stream}");
            };
            let warehouse = Arc::new(connect(&config).await?);
            let committed = warehouse.committed_watermark(&stream).await?;
            let resolver = WatermarkResolver::new(warehouse.clone(), warehouse);
            let resolved = resolver.last_processed(stream_config).await;
            match committed {
                Some(ts) => println!("{stream}: committed={ts} resolved={resolved}"),
                None => println!("{stream}: committed=none resolved={resolved}"),
            }
        }
        Commands::Runs { limit } => {
            let warehouse = connect(&SyncConfig::from_env()).await?;
            for run in warehouse.recent_runs(limit).await? {
                print_run(&run);
            }
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve { addr } => {
            ewdw_web::serve_from_env(addr).await?;
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgWarehouse> {
    let warehouse = PgWarehouse::connect(&config.warehouse_config())
        .await
        .context("connecting to warehouse")?;
    warehouse.ensure_state_tables().await?;
    Ok(warehouse)
}

fn print_summary(summary: &SyncRunSummary) {
    println!("sync run {} ({} -> {})", summary.run_id, summary.started_at, summary.finished_at);
    for stream in &summary.streams {
        let watermark = stream
            .watermark
            .map(|ts| ts.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<16} {:<9} rows={:<6} watermark={}{}",
            stream.stream,
            status_label(stream.status),
            stream.rows,
            watermark,
            stream.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
        );
    }
    for stage in summary.dimensions.iter().chain(summary.facts.iter()) {
        println!(
            "  {:<16} {:<9} rows={:<6} dropped={}",
            stage.process,
            status_label(stage.status),
            stage.rows,
            stage.dropped_rows
        );
    }
    if let Some(manifest) = &summary.snapshot_manifest {
        println!("  snapshot {manifest}");
    }
}

fn status_label(status: OutcomeStatus) -> &'static str {
    match status {
        OutcomeStatus::Loaded => "loaded",
        OutcomeStatus::Skipped => "skipped",
        OutcomeStatus::InFlight => "in-flight",
        OutcomeStatus::Failed => "failed",
    }
}

fn print_run(run: &ProcessRun) {
    let ended = run.end_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
    println!(
        "{:>6} {:<24} {:<8} rows={:<6} started={} ended={} {}",
        run.log_id,
        run.process_name,
        run.status.as_str(),
        run.rows_processed,
        run.start_time,
        ended,
        run.error_message.as_deref().unwrap_or_default()
    );
}
