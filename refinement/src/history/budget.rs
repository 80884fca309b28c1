//! Token budgeting for the history log.

use serde::{Deserialize, Serialize};

/// Estimates the token cost of a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    /// Estimator name for logging.
    fn name(&self) -> &str;
}

/// Word count times a tokens-per-word factor (about 1.3 for English).
#[derive(Debug, Clone)]
pub struct WordCountEstimator {
    pub factor: f64,
}

impl Default for WordCountEstimator {
    fn default() -> Self {
        Self { factor: 1.3 }
    }
}

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let words = text.split_whitespace().count();
        (words as f64 * self.factor).ceil() as u64
    }

    fn name(&self) -> &str {
        "word_count"
    }
}

/// Outcome of checking the log against its budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDecision {
    WithinBudget,
    OverBudget { current_tokens: u64, overage: u64 },
}

impl BudgetDecision {
    pub fn should_compress(&self) -> bool {
        matches!(self, Self::OverBudget { .. })
    }
}

impl std::fmt::Display for BudgetDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WithinBudget => write!(f, "within_budget"),
            Self::OverBudget {
                current_tokens,
                overage,
            } => write!(f, "over_budget ({} tokens, {} over)", current_tokens, overage),
        }
    }
}

/// Token ceiling for the whole history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBudget {
    pub max_tokens: u64,
}

impl HistoryBudget {
    pub fn new(max_tokens: u64) -> Self {
        Self { max_tokens }
    }

    pub fn evaluate(&self, current_tokens: u64) -> BudgetDecision {
        if current_tokens > self.max_tokens {
            BudgetDecision::OverBudget {
                current_tokens,
                overage: current_tokens - self.max_tokens,
            }
        } else {
            BudgetDecision::WithinBudget
        }
    }
}
