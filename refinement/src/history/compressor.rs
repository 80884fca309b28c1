//! History compression.
//!
//! Two triggers share one collapse step:
//!
//! - **Unit length**: a unit with more than `trigger` entries has every entry
//!   older than its `keep_recent` most recent ones collapsed.
//! - **Budget**: when the whole log's estimated tokens exceed the budget, the
//!   same collapse runs for every unit with more than `keep_recent` entries.
//!
//! Collapsing is one-to-one (a record becomes one [`CompressedRound`]), skips
//! critical-stage records, and is idempotent.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::budget::{BudgetDecision, HistoryBudget, TokenEstimator, WordCountEstimator};
use super::log::{CompressedRound, HistoryEntry, HistoryLog};

/// What caused a compression pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTrigger {
    UnitLength,
    Budget,
}

impl std::fmt::Display for CompressionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnitLength => write!(f, "unit_length"),
            Self::Budget => write!(f, "budget"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionResult {
    pub trigger: CompressionTrigger,
    pub entries_compressed: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

pub struct HistoryCompressor {
    trigger: usize,
    keep_recent: usize,
    budget: HistoryBudget,
    estimator: Box<dyn TokenEstimator>,
}

impl HistoryCompressor {
    pub fn new(trigger: usize, keep_recent: usize, budget: HistoryBudget) -> Self {
        Self {
            trigger,
            keep_recent,
            budget,
            estimator: Box::new(WordCountEstimator::default()),
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Estimated tokens of the whole log.
    pub fn estimate(&self, log: &HistoryLog) -> u64 {
        log.entries()
            .iter()
            .map(|e| self.estimator.estimate(&e.render()))
            .sum()
    }

    pub fn check_budget(&self, log: &HistoryLog) -> BudgetDecision {
        self.budget.evaluate(self.estimate(log))
    }

    /// Collapse one unit's old entries. Returns the number collapsed.
    fn collapse_unit(&self, log: &mut HistoryLog, unit_id: &str) -> usize {
        let positions: Vec<usize> = log
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.unit_id() == unit_id)
            .map(|(i, _)| i)
            .collect();
        if positions.len() <= self.keep_recent {
            return 0;
        }
        let old = &positions[..positions.len() - self.keep_recent];

        let entries = log.entries_mut();
        let mut collapsed = 0;
        for &i in old {
            let summary = match &entries[i] {
                HistoryEntry::Round(r) if !r.critical => CompressedRound::from_record(r),
                _ => continue,
            };
            entries[i] = HistoryEntry::Compressed(summary);
            collapsed += 1;
        }
        collapsed
    }

    /// Apply the unit-length trigger to one unit.
    pub fn compress_unit(&self, log: &mut HistoryLog, unit_id: &str) -> Option<CompressionResult> {
        if log.count_for_unit(unit_id) <= self.trigger {
            return None;
        }
        let tokens_before = self.estimate(log);
        let entries_compressed = self.collapse_unit(log, unit_id);
        if entries_compressed == 0 {
            return None;
        }
        let tokens_after = self.estimate(log);
        debug!(unit_id, entries_compressed, tokens_before, tokens_after, "Compressed unit history");
        Some(CompressionResult {
            trigger: CompressionTrigger::UnitLength,
            entries_compressed,
            tokens_before,
            tokens_after,
        })
    }

    /// Apply the budget trigger to the whole log.
    pub fn enforce_budget(&self, log: &mut HistoryLog) -> Option<CompressionResult> {
        let tokens_before = match self.check_budget(log) {
            BudgetDecision::WithinBudget => return None,
            BudgetDecision::OverBudget { current_tokens, .. } => current_tokens,
        };

        let mut entries_compressed = 0;
        for unit_id in log.unit_ids() {
            entries_compressed += self.collapse_unit(log, &unit_id);
        }
        let tokens_after = self.estimate(log);
        if tokens_after > self.budget.max_tokens {
            warn!(
                tokens_after,
                budget = self.budget.max_tokens,
                "History still over budget after compression"
            );
        }
        if entries_compressed == 0 {
            return None;
        }
        Some(CompressionResult {
            trigger: CompressionTrigger::Budget,
            entries_compressed,
            tokens_before,
            tokens_after,
        })
    }

    /// Run both triggers after a record for `unit_id` was appended.
    pub fn after_append(&self, log: &mut HistoryLog, unit_id: &str) -> Vec<CompressionResult> {
        let mut results = Vec::new();
        results.extend(self.compress_unit(log, unit_id));
        results.extend(self.enforce_budget(log));
        results
    }
}
