use std::sync::Arc;

use chrono::NaiveDateTime;
use ewdw_core::default_epoch;
use ewdw_storage::{StateStore, Warehouse, WarehouseError};
use tracing::{debug, warn};

use crate::config::StreamConfig;

/// Decides where each stream's next extraction starts.
#[derive(Clone)]
pub struct WatermarkResolver {
    warehouse: Arc<dyn Warehouse>,
    state: Arc<dyn StateStore>,
    default_epoch: NaiveDateTime,
}

impl WatermarkResolver {
    pub fn new(warehouse: Arc<dyn Warehouse>, state: Arc<dyn StateStore>) -> Self {
        Self {
            warehouse,
            state,
            default_epoch: default_epoch(),
        }
    }

    pub fn with_default_epoch(mut self, epoch: NaiveDateTime) -> Self {
        self.default_epoch = epoch;
        self
    }

    pub fn default_epoch(&self) -> NaiveDateTime {
        self.default_epoch
    }

    /// Never fails: lookup errors are logged and the default epoch returned.
    pub async fn last_processed(&self, stream: &StreamConfig) -> NaiveDateTime {
        match self.lookup(stream).await {
            Ok(watermark) => {
                debug!(stream = %stream.name, %watermark, "resolved watermark");
                watermark
            }
            Err(err) => {
                warn!(
                    stream = %stream.name,
                    table = %stream.target_table,
                    error = %err,
                    "watermark lookup failed; starting from default epoch"
                );
                self.default_epoch
            }
        }
    }

    async fn lookup(&self, stream: &StreamConfig) -> Result<NaiveDateTime, WarehouseError> {
        let Some(column_max) = self
            .warehouse
            .max_timestamp(&stream.target_table, &stream.watermark_column)
            .await?
        else {
            return Ok(self.default_epoch);
        };
        // Chunks of a failed append stay committed, so the ledger wins over the column.
        let committed = self.state.committed_watermark(&stream.name).await?;
        Ok(committed.unwrap_or(column_max))
    }

    /// Records a fully loaded batch. The stored value never decreases.
    pub async fn advance(&self, stream: &StreamConfig, batch_max: NaiveDateTime) -> Result<NaiveDateTime, WarehouseError> {
        let stored = self.state.advance_watermark(&stream.name, batch_max).await?;
        debug!(stream = %stream.name, watermark = %stored, "watermark committed");
        Ok(stored)
    }
}
