//! Round records: the immutable outcome of one round for one unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::{Severity, StageKind};
use crate::unit::UnitId;

/// Round verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No P0 or P1 predicate left unmet.
    Approve,
    /// At least one blocking predicate unmet, or no usable candidate.
    Reject,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "APPROVE"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Why a round committed no winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundFailure {
    GenerationTimeout,
    GenerationFailure,
    /// The winner failed more blocking predicates than the current content.
    CandidateRegression,
}

impl std::fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GenerationTimeout => write!(f, "generation_timeout"),
            Self::GenerationFailure => write!(f, "generation_failure"),
            Self::CandidateRegression => write!(f, "candidate_regression"),
        }
    }
}

/// An unmet predicate carried by a winning candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub predicate_id: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Issue {
    pub fn new(predicate_id: &str, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            predicate_id: predicate_id.to_string(),
            severity,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "[{}] {}", self.severity, self.predicate_id)
        } else {
            write!(f, "[{}] {}: {}", self.severity, self.predicate_id, self.detail)
        }
    }
}

/// Finalized outcome of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub unit_id: UnitId,
    pub stage: StageKind,
    pub critical: bool,
    /// 1-indexed round number within the unit.
    pub round_index: u32,
    pub verdict: Verdict,
    pub p0_count: usize,
    pub p1_count: usize,
    pub p2_count: usize,
    pub winner_candidate_id: Option<String>,
    /// One-line summary of the most important change the winner made.
    #[serde(default)]
    pub key_fix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RoundFailure>,
    /// Inner sub-rounds consolidated into this record (adversarial stage only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_rounds: Option<u32>,
    /// Unmet predicates of the winner.
    #[serde(default)]
    pub issues: Vec<Issue>,
    pub recorded_at: DateTime<Utc>,
}

impl RoundRecord {
    /// A record for a round in which no candidate survived generation.
    pub fn failed(
        unit_id: &str,
        stage: StageKind,
        critical: bool,
        round_index: u32,
        failure: RoundFailure,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            stage,
            critical,
            round_index,
            verdict: Verdict::Reject,
            p0_count: 0,
            p1_count: 0,
            p2_count: 0,
            winner_candidate_id: None,
            key_fix: String::new(),
            failure: Some(failure),
            sub_rounds: None,
            issues: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Verdict derived from issue counts: APPROVE iff no P0 and no P1.
    pub fn verdict_for(p0_count: usize, p1_count: usize) -> Verdict {
        if p0_count == 0 && p1_count == 0 {
            Verdict::Approve
        } else {
            Verdict::Reject
        }
    }

    pub fn is_approve(&self) -> bool {
        self.verdict == Verdict::Approve
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity.is_blocking())
    }

    /// Compact one-line summary for logging and compressed history.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "r{} {}{} {} p0={} p1={} p2={}",
            self.round_index,
            self.stage,
            if self.critical { "*" } else { "" },
            self.verdict,
            self.p0_count,
            self.p1_count,
            self.p2_count
        );
        if let Some(n) = self.sub_rounds {
            line.push_str(&format!(" sub={}", n));
        }
        if let Some(failure) = self.failure {
            line.push_str(&format!(" failure={}", failure));
        } else if !self.key_fix.is_empty() {
            line.push_str(&format!(" fix: {}", self.key_fix));
        }
        line
    }
}
