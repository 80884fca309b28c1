//! Units of work: the independently reviewable partitions of a document.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::partition::{complexity, facts};

/// Stable identifier of a unit within one document run.
pub type UnitId = String;

/// Complexity band a unit falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityBand {
    Low,
    Medium,
    High,
}

impl ComplexityBand {
    /// Minimum number of rounds a unit in this band must run.
    pub fn min_rounds(self) -> u32 {
        match self {
            Self::Low => 3,
            Self::Medium => 5,
            Self::High => 6,
        }
    }
}

impl std::fmt::Display for ComplexityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Round budget for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundBand {
    pub min_rounds: u32,
    pub max_rounds: u32,
}

/// Weighted complexity of a unit's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    /// Weighted sum of the factors below.
    pub value: f64,
    pub words: usize,
    /// Headings, list items, table rows, figure and equation markers.
    pub structural_elements: usize,
    /// Fraction of sentences that carry a number or a fact marker (0.0-1.0).
    pub claim_density: f64,
    pub band: ComplexityBand,
}

impl ComplexityScore {
    /// Map the score onto a round budget. The minimum never exceeds `max_rounds`.
    pub fn round_band(&self, max_rounds: u32) -> RoundBand {
        RoundBand {
            min_rounds: self.band.min_rounds().min(max_rounds),
            max_rounds,
        }
    }
}

/// An ordered, named partition of the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    /// Position in document order (0-indexed).
    pub order: usize,
    /// Heading line emitted on assembly; `None` for a preamble or a
    /// continuation part of a split section.
    pub heading: Option<String>,
    pub title: String,
    pub content: String,
    /// Context header built from the latest summaries of finalized dependencies.
    pub dependency_summary: String,
    pub complexity: ComplexityScore,
    /// Fact keys this unit declares (`[[key: value]]`).
    pub defines: BTreeSet<String>,
    /// Fact keys this unit cites (`[[key]]`).
    pub references: BTreeSet<String>,
    /// Set when the partitioner could not isolate this unit cleanly.
    pub degraded: bool,
}

impl Unit {
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    /// One-paragraph digest used as context by dependent units.
    pub fn digest(&self, max_words: usize) -> String {
        let words: Vec<&str> = self.content.split_whitespace().take(max_words).collect();
        let mut digest = format!("{}: {}", self.title, words.join(" "));
        if self.word_count() > max_words {
            digest.push_str(" ...");
        }
        digest
    }

    /// Replace the content and re-read its fact markers.
    pub fn commit(&mut self, content: String) {
        self.content = content;
        self.defines = facts::defined_keys(&self.content);
        self.references = facts::extract_references(&self.content);
    }

    /// Recompute the complexity score from the current content.
    pub fn rescore(&mut self) {
        self.complexity = complexity::score(&self.content);
    }

    /// Markdown for final assembly.
    pub fn render(&self) -> String {
        match &self.heading {
            Some(heading) if self.content.is_empty() => heading.clone(),
            Some(heading) => format!("{}\n\n{}", heading, self.content),
            None => self.content.clone(),
        }
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] #{} '{}' | {} words | complexity {:.1} ({})",
            self.id,
            self.order,
            self.title,
            self.word_count(),
            self.complexity.value,
            self.complexity.band
        )
    }
}
