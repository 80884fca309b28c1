//! Round scheduler: drives one unit through the stage rotation.
//!
//! Per-unit phases:
//!
//! ```text
//! PENDING ──start──► RUNNING ──terminal status──► DONE
//!                       ▲                          │
//!                       └────── reopen (review) ───┘
//! ```
//!
//! The adversarial stage nests a bounded FSM: up to `adversarial_sub_rounds`
//! sub-rounds, stopping at the first APPROVE. Each sub-round's winner seeds
//! the next, and the outer loop sees one consolidated record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::acceptance::{AcceptanceState, AcceptanceStatus, TransitionError};
use crate::candidate::{CandidateLoop, RoundContext, RoundOutcome};
use crate::history::SharedHistory;
use crate::record::RoundRecord;
use crate::stage::{ReferenceFacts, Stage, StageRotation};
use crate::unit::{Unit, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Pending,
    Running,
    Done,
}

impl UnitPhase {
    pub fn valid_transitions(self) -> &'static [UnitPhase] {
        match self {
            Self::Pending => &[Self::Running],
            Self::Running => &[Self::Done],
            Self::Done => &[Self::Running],
        }
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("unit {unit_id}: invalid phase change {from} -> {to}")]
    Phase {
        unit_id: UnitId,
        from: UnitPhase,
        to: UnitPhase,
    },

    #[error("{0}")]
    Acceptance(#[from] TransitionError),

    #[error("rotation has no critical stage")]
    NoCriticalStage,
}

/// A unit together with its scheduling and acceptance state.
#[derive(Debug, Clone)]
pub struct UnitRun {
    pub unit: Unit,
    pub phase: UnitPhase,
    pub acceptance: AcceptanceState,
    /// Carry-over token produced by the latest winner.
    pub carry_over: String,
    /// Context handed to the capability, fixed when the unit starts.
    pub context_header: String,
    pub reference_facts: ReferenceFacts,
}

impl UnitRun {
    pub fn new(unit: Unit, acceptance: AcceptanceState) -> Self {
        Self {
            unit,
            phase: UnitPhase::Pending,
            acceptance,
            carry_over: String::new(),
            context_header: String::new(),
            reference_facts: ReferenceFacts::new(),
        }
    }

    pub fn transition(&mut self, to: UnitPhase) -> Result<(), SchedulerError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(SchedulerError::Phase {
                unit_id: self.unit.id.clone(),
                from: self.phase,
                to,
            });
        }
        debug!(unit_id = %self.unit.id, from = %self.phase, to = %to, "Unit phase change");
        self.phase = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.acceptance.is_terminal()
    }

    fn round_context(&self, round_index: u32, sub_round: Option<u32>) -> RoundContext {
        RoundContext {
            round_index,
            sub_round,
            carry_over: self.carry_over.clone(),
            context_header: self.context_header.clone(),
            reference_facts: self.reference_facts.clone(),
        }
    }

    /// Commit a round's winner, if any.
    fn absorb(&mut self, outcome: &RoundOutcome) {
        if let Some(text) = &outcome.winner_text {
            self.unit.commit(text.clone());
            if !outcome.carry_over.is_empty() {
                self.carry_over = outcome.carry_over.clone();
            }
        }
    }
}

/// Drives units through rounds.
#[derive(Clone)]
pub struct RoundScheduler {
    candidate_loop: CandidateLoop,
    rotation: Arc<StageRotation>,
    adversarial_sub_rounds: u32,
}

impl RoundScheduler {
    pub fn new(candidate_loop: CandidateLoop, rotation: Arc<StageRotation>, adversarial_sub_rounds: u32) -> Self {
        Self {
            candidate_loop,
            rotation,
            adversarial_sub_rounds,
        }
    }

    /// Run one outer round on `stage`. Adversarial stages consolidate their
    /// sub-rounds into the returned record.
    pub async fn run_stage(&self, run: &mut UnitRun, stage: &Stage, round_index: u32) -> RoundRecord {
        if !stage.kind.is_adversarial() {
            let outcome = self
                .candidate_loop
                .run(&run.unit, stage, &run.round_context(round_index, None))
                .await;
            run.absorb(&outcome);
            return outcome.record;
        }

        let limit = self.adversarial_sub_rounds.max(1);
        let mut sub = 1;
        loop {
            let outcome = self
                .candidate_loop
                .run(&run.unit, stage, &run.round_context(round_index, Some(sub)))
                .await;
            run.absorb(&outcome);
            debug!(unit_id = %run.unit.id, round = round_index, sub_round = sub, verdict = %outcome.record.verdict, "Adversarial sub-round");
            if outcome.record.is_approve() || sub >= limit {
                let mut record = outcome.record;
                record.sub_rounds = Some(sub);
                return record;
            }
            sub += 1;
        }
    }

    /// Run rounds until the unit reaches a terminal status.
    pub async fn run_unit(&self, run: &mut UnitRun, history: &SharedHistory) -> Result<AcceptanceStatus, SchedulerError> {
        run.transition(UnitPhase::Running)?;
        info!(unit_id = %run.unit.id, min = run.acceptance.min_rounds, max = run.acceptance.max_rounds, "Unit started");

        while !run.is_terminal() && run.acceptance.rounds_completed < run.acceptance.max_rounds {
            let round_index = run.acceptance.rounds_completed + 1;
            let stage = self.rotation.stage_for_round(round_index).clone();
            let record = self.run_stage(run, &stage, round_index).await;
            history.record(record.clone()).await;
            let status = run.acceptance.apply(&record)?;
            debug!(unit_id = %run.unit.id, round = round_index, stage = %stage.kind, verdict = %record.verdict, status = %status, "Round applied");
        }

        run.transition(UnitPhase::Done)?;
        info!(unit_id = %run.unit.id, "{}", run.acceptance.status_line());
        Ok(run.acceptance.status)
    }

    /// Re-open a terminal unit for one critical-stage mini-round.
    pub async fn run_review(&self, run: &mut UnitRun, history: &SharedHistory) -> Result<RoundRecord, SchedulerError> {
        let stage = self
            .rotation
            .critical_stage()
            .cloned()
            .ok_or(SchedulerError::NoCriticalStage)?;
        run.transition(UnitPhase::Running)?;

        let round_index = run.acceptance.rounds_completed + run.acceptance.review_rounds + 1;
        let record = self.run_stage(run, &stage, round_index).await;
        run.unit.rescore();
        history.record(record.clone()).await;
        run.acceptance.apply_review(&record)?;

        run.transition(UnitPhase::Done)?;
        info!(unit_id = %run.unit.id, verdict = %record.verdict, status = %run.acceptance.status, "Review round complete");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::capability::ScriptedCapability;
    use crate::history::{HistoryBudget, HistoryCompressor};
    use crate::partition::UnitPartitioner;
    use crate::record::{RoundFailure, Verdict};
    use crate::stage::{PredicateRegistry, StageKind};
    use crate::unit::RoundBand;

    fn scheduler(cap: ScriptedCapability) -> RoundScheduler {
        let lp = CandidateLoop::new(
            Arc::new(cap),
            Arc::new(PredicateRegistry::builtin()),
            2,
            Duration::from_secs(5),
            60,
        );
        RoundScheduler::new(lp, Arc::new(StageRotation::default()), 3)
    }

    fn history() -> SharedHistory {
        SharedHistory::new(HistoryCompressor::new(6, 3, HistoryBudget::new(100_000)))
    }

    fn run(content: &str, min: u32, max: u32) -> UnitRun {
        let unit = UnitPartitioner::default()
            .partition(&format!("# U\n\n{}\n", content))
            .units
            .remove(0);
        let acceptance = AcceptanceState::new(&unit.id, RoundBand { min_rounds: min, max_rounds: max }, 3);
        UnitRun::new(unit, acceptance)
    }

    #[test]
    fn test_phase_transitions() {
        let mut r = run("x", 3, 10);
        assert!(r.transition(UnitPhase::Done).is_err());
        r.transition(UnitPhase::Running).unwrap();
        r.transition(UnitPhase::Done).unwrap();
        r.transition(UnitPhase::Running).unwrap();
    }

    #[tokio::test]
    async fn test_clean_unit_accepted_at_min_rounds() {
        let sched = scheduler(ScriptedCapability::echo());
        let h = history();
        let mut r = run("Gain is 3 dB.", 3, 10);
        let status = sched.run_unit(&mut r, &h).await.unwrap();
        // Echo passes every predicate; critical stage (round 2) approves.
        assert_eq!(status, AcceptanceStatus::Accepted);
        assert_eq!(r.acceptance.rounds_completed, 3);
        assert_eq!(r.phase, UnitPhase::Done);
        assert_eq!(h.count_for_unit("u-01").await, 3);
    }

    #[tokio::test]
    async fn test_always_failing_falls_back_at_max() {
        let sched = scheduler(ScriptedCapability::failing());
        let h = history();
        let mut r = run("text", 3, 5);
        let status = sched.run_unit(&mut r, &h).await.unwrap();
        assert_eq!(status, AcceptanceStatus::AcceptedWithCaveats);
        assert_eq!(r.acceptance.rounds_completed, 5);
        assert_eq!(r.unit.content, "text");
    }

    #[tokio::test]
    async fn test_adversarial_stops_at_first_approve() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        // First sub-round keeps a forbidden superlative, later ones drop it.
        let cap = ScriptedCapability::from_fn(move |req| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Ok(format!("{} An unprecedented result.", req.content))
            } else {
                Ok("A measured result of 3 dB.".to_string())
            }
        });
        let sched = scheduler(cap);
        let mut r = run("Start.", 3, 10);
        let stage = StageRotation::default().stage_for_round(3).clone();
        assert_eq!(stage.kind, StageKind::Adversarial);
        let record = sched.run_stage(&mut r, &stage, 3).await;
        assert_eq!(record.verdict, Verdict::Approve);
        assert_eq!(record.sub_rounds, Some(2));
        assert_eq!(r.unit.content, "A measured result of 3 dB.");
        // K = 2 candidates per sub-round.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_adversarial_bounded_by_sub_round_limit() {
        let cap = ScriptedCapability::from_fn(|_| Ok("Revolutionary claims only.".to_string()));
        let sched = scheduler(cap);
        let mut r = run("Start.", 3, 10);
        let stage = StageRotation::default().stage_for_round(3).clone();
        let record = sched.run_stage(&mut r, &stage, 3).await;
        assert_eq!(record.verdict, Verdict::Reject);
        assert_eq!(record.sub_rounds, Some(3));
        // Sub-rounds are not rounds.
        assert_eq!(r.acceptance.rounds_completed, 0);
    }

    #[tokio::test]
    async fn test_regressing_winner_leaves_content_untouched() {
        let cap = ScriptedCapability::from_fn(|_| Ok("Revolutionary claims only.".to_string()));
        let sched = scheduler(cap);
        let mut r = run("Start.", 3, 10);
        let stage = StageRotation::default().stage_for_round(3).clone();
        let record = sched.run_stage(&mut r, &stage, 3).await;
        assert_eq!(record.failure, Some(RoundFailure::CandidateRegression));
        assert_eq!(r.unit.content, "Start.");
        assert!(r.carry_over.is_empty());
    }

    #[tokio::test]
    async fn test_review_runs_critical_stage_only() {
        let sched = scheduler(ScriptedCapability::echo());
        let h = history();
        let mut r = run("Gain is 3 dB.", 3, 10);
        sched.run_unit(&mut r, &h).await.unwrap();
        let record = sched.run_review(&mut r, &h).await.unwrap();
        assert_eq!(record.stage, StageKind::DiffVerify);
        assert!(record.critical);
        assert_eq!(record.round_index, 4);
        assert_eq!(r.acceptance.rounds_completed, 3);
        assert_eq!(r.acceptance.review_rounds, 1);
        assert_eq!(r.phase, UnitPhase::Done);
    }
}
