//! Append-only history of round outcomes.

use serde::{Deserialize, Serialize};

use crate::record::{RoundRecord, Verdict};
use crate::stage::StageKind;
use crate::unit::UnitId;

/// One-line stand-in for a non-critical round record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedRound {
    pub unit_id: UnitId,
    pub stage: StageKind,
    pub round_index: u32,
    pub verdict: Verdict,
    pub p0_count: usize,
    pub p1_count: usize,
    pub p2_count: usize,
    pub key_fix: String,
}

impl CompressedRound {
    pub fn from_record(record: &RoundRecord) -> Self {
        Self {
            unit_id: record.unit_id.clone(),
            stage: record.stage,
            round_index: record.round_index,
            verdict: record.verdict,
            p0_count: record.p0_count,
            p1_count: record.p1_count,
            p2_count: record.p2_count,
            key_fix: record
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| record.key_fix.clone()),
        }
    }

    pub fn line(&self) -> String {
        format!(
            "r{} {} {} p0/p1/p2={}/{}/{} | {}",
            self.round_index,
            self.stage,
            self.verdict,
            self.p0_count,
            self.p1_count,
            self.p2_count,
            self.key_fix
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    Round(RoundRecord),
    Compressed(CompressedRound),
}

impl HistoryEntry {
    pub fn unit_id(&self) -> &str {
        match self {
            Self::Round(r) => &r.unit_id,
            Self::Compressed(c) => &c.unit_id,
        }
    }

    pub fn round_index(&self) -> u32 {
        match self {
            Self::Round(r) => r.round_index,
            Self::Compressed(c) => c.round_index,
        }
    }

    /// Critical-stage records are never compressed.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Round(r) if r.critical)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// Text form used for budget estimation and the written history.
    pub fn render(&self) -> String {
        match self {
            Self::Round(r) => {
                let mut text = r.summary_line();
                for issue in &r.issues {
                    text.push_str(&format!("\n  - {}", issue));
                }
                text
            }
            Self::Compressed(c) => c.line(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: RoundRecord) {
        self.entries.push(HistoryEntry::Round(record));
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [HistoryEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_unit<'a>(&'a self, unit_id: &'a str) -> impl Iterator<Item = &'a HistoryEntry> + 'a {
        self.entries.iter().filter(move |e| e.unit_id() == unit_id)
    }

    pub fn count_for_unit(&self, unit_id: &str) -> usize {
        self.for_unit(unit_id).count()
    }

    /// Unit ids in order of first appearance.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = Vec::new();
        for entry in &self.entries {
            if !ids.iter().any(|id| id == entry.unit_id()) {
                ids.push(entry.unit_id().to_string());
            }
        }
        ids
    }

    /// Markdown rendering grouped by unit.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for id in self.unit_ids() {
            out.push_str(&format!("## {}\n\n", id));
            for entry in self.for_unit(&id) {
                out.push_str(&format!("- {}\n", entry.render()));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RoundFailure;

    fn record(unit: &str, round: u32, critical: bool) -> RoundRecord {
        let mut r = RoundRecord::failed(unit, StageKind::Draft, critical, round, RoundFailure::GenerationFailure);
        r.failure = None;
        r.verdict = Verdict::Approve;
        r.key_fix = format!("fix {}", round);
        r
    }

    #[test]
    fn test_append_and_query() {
        let mut log = HistoryLog::new();
        log.append(record("u-01", 1, false));
        log.append(record("u-02", 1, true));
        log.append(record("u-01", 2, false));
        assert_eq!(log.len(), 3);
        assert_eq!(log.count_for_unit("u-01"), 2);
        assert_eq!(log.unit_ids(), vec!["u-01", "u-02"]);
        assert!(log.entries()[1].is_critical());
        let rendered = log.render();
        assert!(rendered.starts_with("## u-01"));
        assert!(rendered.contains("fix: fix 2"));
    }

    #[test]
    fn test_compressed_line_uses_failure() {
        let r = RoundRecord::failed("u-01", StageKind::Adversarial, false, 4, RoundFailure::GenerationTimeout);
        let c = CompressedRound::from_record(&r);
        assert_eq!(c.line(), "r4 adversarial REJECT p0/p1/p2=0/0/0 | generation_timeout");
    }

    #[test]
    fn test_entry_serde_tag() {
        let entry = HistoryEntry::Compressed(CompressedRound::from_record(&record("u-01", 1, false)));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "compressed");
        assert_eq!(json["round_index"], 1);
    }
}
