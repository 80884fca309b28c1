//! Round history: append-only log, token budget and compressor.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::record::RoundRecord;

pub mod budget;
pub mod compressor;
pub mod log;

pub use budget::{BudgetDecision, HistoryBudget, TokenEstimator, WordCountEstimator};
pub use compressor::{CompressionResult, CompressionTrigger, HistoryCompressor};
pub use log::{CompressedRound, HistoryEntry, HistoryLog};

/// History log shared between unit tasks: single writer, concurrent readers.
#[derive(Clone)]
pub struct SharedHistory {
    log: Arc<RwLock<HistoryLog>>,
    compressor: Arc<HistoryCompressor>,
}

impl SharedHistory {
    pub fn new(compressor: HistoryCompressor) -> Self {
        Self {
            log: Arc::new(RwLock::new(HistoryLog::new())),
            compressor: Arc::new(compressor),
        }
    }

    /// Append a record, then run compression for its unit and the budget.
    pub async fn record(&self, record: RoundRecord) -> Vec<CompressionResult> {
        let unit_id = record.unit_id.clone();
        let mut log = self.log.write().await;
        log.append(record);
        self.compressor.after_append(&mut log, &unit_id)
    }

    pub async fn snapshot(&self) -> HistoryLog {
        self.log.read().await.clone()
    }

    pub async fn count_for_unit(&self, unit_id: &str) -> usize {
        self.log.read().await.count_for_unit(unit_id)
    }
}
