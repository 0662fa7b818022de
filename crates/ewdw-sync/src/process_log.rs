use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ewdw_core::{ProcessRun, RunStatus};
use ewdw_storage::{StateStore, WarehouseError};
use tracing::{info, warn};

pub const DIMENSION_PROCESS: &str = "DIMENSION_PROCESSING";
pub const FACT_PROCESS: &str = "FACT_PROCESSING";

pub fn stream_process_name(stream: &str) -> String {
    format!("STREAM_{}", stream.to_ascii_uppercase())
}

/// A RUNNING process-log row owned by the current run. Consumed by exactly
/// one terminal update.
#[derive(Debug)]
#[must_use = "a started run must be finished with succeed or fail"]
pub struct RunHandle {
    process: String,
    log_id: i64,
    started_at: DateTime<Utc>,
}

impl RunHandle {
    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn log_id(&self) -> i64 {
        self.log_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[derive(Debug)]
pub enum BeginOutcome {
    Started(RunHandle),
    /// Another run of the process is younger than the staleness threshold.
    InFlight(ProcessRun),
}

#[derive(Clone)]
pub struct ProcessLog {
    state: Arc<dyn StateStore>,
    staleness: Duration,
}

impl ProcessLog {
    pub fn new(state: Arc<dyn StateStore>, staleness: Duration) -> Self {
        Self { state, staleness }
    }

    pub async fn begin(&self, process: &str) -> Result<BeginOutcome, WarehouseError> {
        self.begin_at(process, Utc::now()).await
    }

    pub async fn begin_at(&self, process: &str, now: DateTime<Utc>) -> Result<BeginOutcome, WarehouseError> {
        if let Some(latest) = self.state.latest_run(process).await? {
            if latest.status == RunStatus::Running {
                let age = (now - latest.start_time).to_std().unwrap_or_default();
                if age < self.staleness {
                    info!(process, log_id = latest.log_id, started = %latest.start_time, "run already in flight");
                    return Ok(BeginOutcome::InFlight(latest));
                }
                warn!(process, log_id = latest.log_id, started = %latest.start_time, "abandoning stale run");
                let note = format!("abandoned: still RUNNING after {}s", age.as_secs());
                self.state.abandon_run(latest.log_id, &note, now).await?;
            }
        }

        let log_id = self.state.insert_run(process, now).await?;
        info!(process, log_id, "run started");
        Ok(BeginOutcome::Started(RunHandle {
            process: process.to_string(),
            log_id,
            started_at: now,
        }))
    }

    pub async fn succeed(&self, handle: RunHandle, rows_processed: u64) -> Result<(), WarehouseError> {
        self.finish(handle, RunStatus::Success, rows_processed, None).await
    }

    pub async fn fail(&self, handle: RunHandle, rows_processed: u64, error: &str) -> Result<(), WarehouseError> {
        self.finish(handle, RunStatus::Failed, rows_processed, Some(error)).await
    }

    async fn finish(
        &self,
        handle: RunHandle,
        status: RunStatus,
        rows_processed: u64,
        error: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let rows = i64::try_from(rows_processed).unwrap_or(i64::MAX);
        let updated = self
            .state
            .finish_run(&handle.process, status, rows, error, Utc::now())
            .await?;
        match updated {
            Some(log_id) if log_id != handle.log_id => {
                warn!(process = %handle.process, expected = handle.log_id, updated = log_id, "finished a newer run row");
            }
            Some(_) => info!(process = %handle.process, log_id = handle.log_id, status = status.as_str(), rows, "run finished"),
            None => warn!(process = %handle.process, log_id = handle.log_id, "no RUNNING row left to finish"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ewdw_storage::MemoryWarehouse;

    fn log(wh: &Arc<MemoryWarehouse>) -> ProcessLog {
        ProcessLog::new(wh.clone(), Duration::from_secs(7200))
    }

    #[tokio::test]
    async fn a_run_ends_in_exactly_one_terminal_row() {
        let wh = Arc::new(MemoryWarehouse::new());
        let log = log(&wh);
        let BeginOutcome::Started(handle) = log.begin(FACT_PROCESS).await.unwrap() else {
            panic!("expected a fresh run");
        };
        log.succeed(handle, 42).await.unwrap();

        let runs = wh.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].rows_processed, 42);
        assert!(runs[0].end_time.is_some());
    }

    #[tokio::test]
    async fn failures_keep_the_error_text() {
        let wh = Arc::new(MemoryWarehouse::new());
        let log = log(&wh);
        let BeginOutcome::Started(handle) = log.begin("STREAM_WEATHER").await.unwrap() else {
            panic!("expected a fresh run");
        };
        log.fail(handle, 4, "connection reset").await.unwrap();

        let run = &wh.runs().await[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.rows_processed, 4);
        assert_eq!(run.error_message.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn a_young_running_row_is_in_flight() {
        let wh = Arc::new(MemoryWarehouse::new());
        let now = Utc::now();
        wh.seed_run(FACT_PROCESS, RunStatus::Running, now - chrono::Duration::minutes(10))
            .await;

        let outcome = log(&wh).begin_at(FACT_PROCESS, now).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::InFlight(_)));
        assert_eq!(wh.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn a_stale_running_row_is_abandoned() {
        let wh = Arc::new(MemoryWarehouse::new());
        let now = Utc::now();
        let stale = wh
            .seed_run(FACT_PROCESS, RunStatus::Running, now - chrono::Duration::hours(3))
            .await;

        let outcome = log(&wh).begin_at(FACT_PROCESS, now).await.unwrap();
        let BeginOutcome::Started(handle) = outcome else {
            panic!("stale run should not block");
        };
        assert_ne!(handle.log_id(), stale);

        let runs = wh.runs().await;
        let abandoned = runs.iter().find(|r| r.log_id == stale).unwrap();
        assert_eq!(abandoned.status, RunStatus::Failed);
        assert!(abandoned.error_message.as_deref().unwrap().starts_with("abandoned"));
        log(&wh).succeed(handle, 0).await.unwrap();
    }

    #[tokio::test]
    async fn finished_runs_do_not_block() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.seed_run(DIMENSION_PROCESS, RunStatus::Success, Utc::now()).await;
        let outcome = log(&wh).begin(DIMENSION_PROCESS).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::Started(_)));
    }

    #[test]
    fn stream_processes_are_named_after_the_stream() {
        assert_eq!(stream_process_name("weather"), "STREAM_WEATHER");
    }
}
