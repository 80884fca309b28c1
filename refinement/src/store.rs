//! Content store seam: where the source document comes from and where the
//! finalized document, history and reports go.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::history::HistoryLog;
use crate::orchestrator::{FinalDocument, RunReport};

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn read_source(&self) -> Result<String>;

    async fn write_document(&self, document: &FinalDocument) -> Result<()>;

    async fn write_history(&self, history: &HistoryLog) -> Result<()>;

    async fn write_reports(&self, report: &RunReport) -> Result<()>;
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    source: String,
    document: Mutex<Option<FinalDocument>>,
    history: Mutex<Option<HistoryLog>>,
    report: Mutex<Option<RunReport>>,
}

impl MemoryStore {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn document(&self) -> Option<FinalDocument> {
        self.document.lock().ok().and_then(|d| d.clone())
    }

    pub fn history(&self) -> Option<HistoryLog> {
        self.history.lock().ok().and_then(|h| h.clone())
    }

    pub fn report(&self) -> Option<RunReport> {
        self.report.lock().ok().and_then(|r| r.clone())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("memory store lock poisoned")
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn read_source(&self) -> Result<String> {
        Ok(self.source.clone())
    }

    async fn write_document(&self, document: &FinalDocument) -> Result<()> {
        *self.document.lock().map_err(poisoned)? = Some(document.clone());
        Ok(())
    }

    async fn write_history(&self, history: &HistoryLog) -> Result<()> {
        *self.history.lock().map_err(poisoned)? = Some(history.clone());
        Ok(())
    }

    async fn write_reports(&self, report: &RunReport) -> Result<()> {
        *self.report.lock().map_err(poisoned)? = Some(report.clone());
        Ok(())
    }
}
