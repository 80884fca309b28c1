//! Acceptance state machine, one per unit.
//!
//! ```text
//! IN_PROGRESS ──(streak + critical + min rounds)────────► ACCEPTED
//!      │      ──(same, one round early, nothing blocking)► ACCEPTED (early)
//!      └─────(max rounds reached)───────────────────────► ACCEPTED_WITH_CAVEATS
//! ACCEPTED ──(post-acceptance review rejects)───────────► ACCEPTED_WITH_CAVEATS
//! ```
//!
//! Transitions are pure: [`transition`] takes a state and a record and
//! returns the next state, so the rules are testable without any text
//! generation.

use serde::{Deserialize, Serialize};

use crate::record::{Issue, RoundRecord, Verdict};
use crate::unit::{RoundBand, UnitId};

/// Per-unit acceptance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    InProgress,
    Accepted,
    AcceptedWithCaveats,
}

impl AcceptanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [AcceptanceStatus] {
        match self {
            Self::InProgress => &[Self::Accepted, Self::AcceptedWithCaveats],
            Self::Accepted => &[Self::AcceptedWithCaveats],
            Self::AcceptedWithCaveats => &[],
        }
    }
}

impl std::fmt::Display for AcceptanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::AcceptedWithCaveats => write!(f, "ACCEPTED_WITH_CAVEATS"),
        }
    }
}

/// Error for records applied against the wrong status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub unit_id: UnitId,
    pub from: AcceptanceStatus,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition for {} from {}: {}",
            self.unit_id, self.from, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

/// A question left open when a unit is accepted with caveats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenQuery {
    pub question: String,
    /// The unmet predicate behind the query, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<Issue>,
}

impl OpenQuery {
    fn from_issue(issue: &Issue) -> Self {
        Self {
            question: format!("unresolved {}", issue),
            issue: Some(issue.clone()),
        }
    }
}

/// Approval state of one unit across rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceState {
    pub unit_id: UnitId,
    /// Consecutive APPROVE rounds; reset by any REJECT.
    pub approval_counter: u32,
    pub rounds_completed: u32,
    /// Sticky once the critical stage has approved.
    pub critical_stage_approved: bool,
    pub status: AcceptanceStatus,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub approval_threshold: u32,
    /// Unmet predicates of the latest committed winner.
    pub outstanding: Vec<Issue>,
    /// Blocking issues of the most recent REJECT round.
    pub last_rejection: Vec<Issue>,
    pub open_queries: Vec<OpenQuery>,
    pub accepted_early: bool,
    /// Unresolved cross-references currently targeting this unit.
    pub unresolved_references: usize,
    /// Post-acceptance review rounds (propagation). Never counted as rounds.
    pub review_rounds: u32,
}

impl AcceptanceState {
    pub fn new(unit_id: &str, band: RoundBand, approval_threshold: u32) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            approval_counter: 0,
            rounds_completed: 0,
            critical_stage_approved: false,
            status: AcceptanceStatus::InProgress,
            min_rounds: band.min_rounds,
            max_rounds: band.max_rounds,
            approval_threshold,
            outstanding: Vec::new(),
            last_rejection: Vec::new(),
            open_queries: Vec::new(),
            accepted_early: false,
            unresolved_references: 0,
            review_rounds: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether anything still blocks early acceptance.
    pub fn has_blocking_items(&self) -> bool {
        self.unresolved_references > 0 || self.outstanding.iter().any(|i| i.severity.is_blocking())
    }

    /// Apply a round record in place.
    pub fn apply(&mut self, record: &RoundRecord) -> Result<AcceptanceStatus, TransitionError> {
        *self = transition(self, record)?;
        Ok(self.status)
    }

    /// Absorb a post-acceptance review (propagation mini-round).
    ///
    /// Counters are left alone. A review that leaves blocking issues
    /// downgrades `ACCEPTED` to `ACCEPTED_WITH_CAVEATS`.
    pub fn apply_review(&mut self, record: &RoundRecord) -> Result<AcceptanceStatus, TransitionError> {
        if !self.is_terminal() {
            return Err(TransitionError {
                unit_id: self.unit_id.clone(),
                from: self.status,
                reason: "review rounds only apply to terminal units".to_string(),
            });
        }
        self.review_rounds += 1;
        if record.failure.is_none() {
            self.outstanding = record.issues.clone();
        }
        let blocking: Vec<OpenQuery> = record.blocking_issues().map(OpenQuery::from_issue).collect();
        if blocking.is_empty() {
            return Ok(self.status);
        }
        if self.status.valid_transitions().contains(&AcceptanceStatus::AcceptedWithCaveats) {
            self.status = AcceptanceStatus::AcceptedWithCaveats;
        }
        for query in blocking {
            if !self.open_queries.contains(&query) {
                self.open_queries.push(query);
            }
        }
        Ok(self.status)
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} | rounds {}/{} (min {}) | streak {}/{} | critical {}{}",
            self.unit_id,
            self.status,
            self.rounds_completed,
            self.max_rounds,
            self.min_rounds,
            self.approval_counter,
            self.approval_threshold,
            if self.critical_stage_approved { "yes" } else { "no" },
            if self.accepted_early { " | early" } else { "" }
        )
    }
}

/// Pure transition: the state after applying `record`.
pub fn transition(
    state: &AcceptanceState,
    record: &RoundRecord,
) -> Result<AcceptanceState, TransitionError> {
    if state.is_terminal() {
        return Err(TransitionError {
            unit_id: state.unit_id.clone(),
            from: state.status,
            reason: format!("round {} applied to a terminal unit", record.round_index),
        });
    }

    let mut next = state.clone();
    next.rounds_completed += 1;

    // A failed round commits nothing; the previous outstanding set still holds.
    if record.failure.is_none() {
        next.outstanding = record.issues.clone();
    }

    match record.verdict {
        Verdict::Reject => {
            next.approval_counter = 0;
            next.last_rejection = record.blocking_issues().cloned().collect();
        }
        Verdict::Approve => {
            next.approval_counter += 1;
            if record.critical {
                next.critical_stage_approved = true;
            }
        }
    }

    let streak_met =
        next.approval_counter >= next.approval_threshold && next.critical_stage_approved;

    if streak_met && next.rounds_completed >= next.min_rounds {
        next.status = AcceptanceStatus::Accepted;
    } else if streak_met
        && next.rounds_completed + 1 >= next.min_rounds
        && !next.has_blocking_items()
    {
        next.status = AcceptanceStatus::Accepted;
        next.accepted_early = true;
    } else if next.rounds_completed >= next.max_rounds {
        next.status = AcceptanceStatus::AcceptedWithCaveats;
        next.open_queries = fallback_queries(&next);
    }

    Ok(next)
}

fn fallback_queries(state: &AcceptanceState) -> Vec<OpenQuery> {
    let mut queries: Vec<OpenQuery> = state
        .outstanding
        .iter()
        .filter(|i| i.severity.is_blocking())
        .map(OpenQuery::from_issue)
        .collect();
    for issue in &state.last_rejection {
        let query = OpenQuery::from_issue(issue);
        if !queries.contains(&query) {
            queries.push(query);
        }
    }
    queries.push(OpenQuery {
        question: format!(
            "acceptance not reached in {} rounds (streak {}/{}, critical stage {})",
            state.max_rounds,
            state.approval_counter,
            state.approval_threshold,
            if state.critical_stage_approved {
                "approved"
            } else {
                "never approved"
            }
        ),
        issue: None,
    });
    queries
}
