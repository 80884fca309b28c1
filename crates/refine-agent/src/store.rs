//! Filesystem content store.
//!
//! ```text
//! <output_dir>/
//!   refined.md     assembled document (only when the gate passed)
//!   history.json   full round history
//!   history.md     the same history, grouped by unit
//!   report.json    run report, risk reports, unresolved references
//!   risk.md        one summary line per unit
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use refinement::history::HistoryLog;
use refinement::orchestrator::{FinalDocument, RunReport};
use refinement::store::ContentStore;
use serde::Serialize;
use tracing::info;

pub const DOCUMENT_FILE: &str = "refined.md";
pub const HISTORY_FILE: &str = "history.json";
pub const HISTORY_MARKDOWN_FILE: &str = "history.md";
pub const REPORT_FILE: &str = "report.json";
pub const RISK_FILE: &str = "risk.md";

pub struct FsContentStore {
    source: PathBuf,
    output_dir: PathBuf,
}

impl FsContentStore {
    pub fn new(source: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn write(&self, name: &str, contents: String) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;
        let path = self.output_dir.join(name);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn write_json<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(value).with_context(|| format!("Failed to serialize {}", name))?;
        self.write(name, json).await
    }
}

fn risk_summary(report: &RunReport) -> String {
    let mut out = format!("# Risk summary\n\n{}\n\n", report.summary_line());
    for risk in &report.risk_reports {
        out.push_str(&format!("- {}\n", risk.summary_line()));
        for item in &risk.items {
            out.push_str(&format!("  - {}\n", item.describe()));
        }
    }
    out
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn read_source(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.source)
            .await
            .with_context(|| format!("Failed to read {}", self.source.display()))
    }

    async fn write_document(&self, document: &FinalDocument) -> Result<()> {
        let path = self.write(DOCUMENT_FILE, document.text.clone()).await?;
        info!(path = %path.display(), "Wrote refined document");
        Ok(())
    }

    async fn write_history(&self, history: &HistoryLog) -> Result<()> {
        self.write_json(HISTORY_FILE, history).await?;
        self.write(HISTORY_MARKDOWN_FILE, history.render()).await?;
        Ok(())
    }

    async fn write_reports(&self, report: &RunReport) -> Result<()> {
        self.write_json(REPORT_FILE, report).await?;
        self.write(RISK_FILE, risk_summary(report)).await?;
        Ok(())
    }
}
