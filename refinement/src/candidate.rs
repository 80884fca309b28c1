//! Candidate loop: generate K candidates, verify, select one winner.
//!
//! Selection is deterministic: most predicates passed, then fewest words,
//! then earliest candidate index. The loop never mutates the unit; the
//! caller commits `winner_text` when one is returned.
//!
//! A rejected winner is checked against the unit's current content. When
//! it fails every blocking predicate the current content fails plus at
//! least one more, the round is recorded as a regression and no text is
//! returned.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityError, GenerationRequest, RefinementCapability};
use crate::partition::complexity::sentences;
use crate::record::{Issue, RoundFailure, RoundRecord, Verdict};
use crate::stage::{PredicateRegistry, PredicateResult, ReferenceFacts, Severity, Stage};
use crate::unit::Unit;

const KEY_FIX_MAX_CHARS: usize = 80;

/// Per-round inputs that are not part of the unit itself.
#[derive(Debug, Clone, Default)]
pub struct RoundContext {
    pub round_index: u32,
    /// Set for adversarial sub-rounds (1-indexed).
    pub sub_round: Option<u32>,
    /// Carry-over token from the previous stage's winner.
    pub carry_over: String,
    pub context_header: String,
    pub reference_facts: ReferenceFacts,
}

/// One artifact produced for unit + stage + round.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub index: usize,
    pub text: String,
    pub checklist_results: Vec<PredicateResult>,
    pub carry_over_token: String,
}

impl Candidate {
    pub fn passes(&self) -> usize {
        self.checklist_results.iter().filter(|r| r.passed).count()
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Result of one round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub record: RoundRecord,
    /// `None` when every candidate was dropped.
    pub winner_text: Option<String>,
    pub carry_over: String,
}

/// Pick the winner: most passes, fewest words, earliest index.
pub fn select_winner(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .min_by_key(|c| (Reverse(c.passes()), c.word_count(), c.index))
}

/// Sentences of `winner` absent from `input`, capped at `max_words`.
pub fn extract_carry_over(input: &str, winner: &str, max_words: usize) -> String {
    let known: BTreeSet<&str> = sentences(input).into_iter().collect();
    let fresh: Vec<&str> = sentences(winner)
        .into_iter()
        .filter(|s| !known.contains(s))
        .collect();
    let joined = fresh.join(" ");
    let words: Vec<&str> = joined.split_whitespace().take(max_words).collect();
    words.join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

fn key_fix(input: &str, winner: &str, carry_over: &str) -> String {
    if !carry_over.is_empty() {
        truncate_chars(carry_over, KEY_FIX_MAX_CHARS)
    } else if input.trim() == winner.trim() {
        "unchanged".to_string()
    } else {
        "condensed".to_string()
    }
}

/// Fill in a failing result for every checklist entry the verifier skipped.
fn normalize_results(stage: &Stage, results: Vec<PredicateResult>) -> Vec<PredicateResult> {
    stage
        .checklist
        .iter()
        .map(|id| {
            results
                .iter()
                .find(|r| r.predicate_id == *id)
                .cloned()
                .unwrap_or_else(|| PredicateResult::fail(id, "no result from verifier"))
        })
        .collect()
}

/// Runs one generate/verify/select round.
#[derive(Clone)]
pub struct CandidateLoop {
    capability: Arc<dyn RefinementCapability>,
    registry: Arc<PredicateRegistry>,
    candidates_per_round: usize,
    generation_timeout: Duration,
    carry_over_max_words: usize,
}

impl CandidateLoop {
    pub fn new(
        capability: Arc<dyn RefinementCapability>,
        registry: Arc<PredicateRegistry>,
        candidates_per_round: usize,
        generation_timeout: Duration,
        carry_over_max_words: usize,
    ) -> Self {
        Self {
            capability,
            registry,
            candidates_per_round,
            generation_timeout,
            carry_over_max_words,
        }
    }

    fn candidate_id(unit: &Unit, ctx: &RoundContext, index: usize) -> String {
        match ctx.sub_round {
            Some(sub) => format!("{}-r{}.{}-c{}", unit.id, ctx.round_index, sub, index),
            None => format!("{}-r{}-c{}", unit.id, ctx.round_index, index),
        }
    }

    fn severity_of(&self, predicate_id: &str) -> Severity {
        self.registry
            .get(predicate_id)
            .map(|p| p.severity)
            .unwrap_or(Severity::P1)
    }

    fn blocking_failures(&self, results: &[PredicateResult]) -> BTreeSet<String> {
        results
            .iter()
            .filter(|r| !r.passed && self.severity_of(&r.predicate_id).is_blocking())
            .map(|r| r.predicate_id.clone())
            .collect()
    }

    /// Whether `winner` is strictly worse than the unit's current content.
    /// An unverifiable baseline never counts as a regression.
    async fn regresses(&self, unit: &Unit, stage: &Stage, ctx: &RoundContext, winner: &Candidate) -> bool {
        let baseline = match self
            .capability
            .verify(&unit.content, stage, &self.registry, &ctx.reference_facts)
            .await
        {
            Ok(results) => normalize_results(stage, results),
            Err(e) => {
                debug!(unit_id = %unit.id, error = %e, "Baseline verification failed");
                return false;
            }
        };
        let before = self.blocking_failures(&baseline);
        let after = self.blocking_failures(&winner.checklist_results);
        after.len() > before.len() && after.is_superset(&before)
    }

    pub async fn run(&self, unit: &Unit, stage: &Stage, ctx: &RoundContext) -> RoundOutcome {
        let requests: Vec<GenerationRequest> = (0..self.candidates_per_round)
            .map(|index| GenerationRequest {
                unit_id: unit.id.clone(),
                unit_title: unit.title.clone(),
                content: unit.content.clone(),
                stage: stage.kind,
                instruction: stage.kind.instruction().to_string(),
                carry_over: ctx.carry_over.clone(),
                candidate_index: index,
                round_index: ctx.round_index,
                context_header: ctx.context_header.clone(),
                reference_facts: ctx.reference_facts.clone(),
            })
            .collect();

        let timeout = self.generation_timeout;
        let generated = join_all(requests.iter().map(|request| async move {
            match tokio::time::timeout(timeout, self.capability.generate(request)).await {
                Ok(result) => result,
                Err(_) => Err(CapabilityError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                }),
            }
        }))
        .await;

        let mut texts = Vec::new();
        let mut timeouts = 0usize;
        let mut failures = 0usize;
        for (index, result) in generated.into_iter().enumerate() {
            match result {
                Ok(text) => texts.push((index, text)),
                Err(e) => {
                    warn!(unit_id = %unit.id, stage = %stage.kind, round = ctx.round_index, candidate = index, error = %e, "Dropping candidate");
                    match e {
                        CapabilityError::Timeout { .. } => timeouts += 1,
                        CapabilityError::Failure(_) => failures += 1,
                    }
                }
            }
        }

        if texts.is_empty() {
            let failure = if failures == 0 && timeouts > 0 {
                RoundFailure::GenerationTimeout
            } else {
                RoundFailure::GenerationFailure
            };
            warn!(unit_id = %unit.id, stage = %stage.kind, round = ctx.round_index, failure = %failure, "No usable candidates");
            return RoundOutcome {
                record: RoundRecord::failed(&unit.id, stage.kind, stage.critical, ctx.round_index, failure),
                winner_text: None,
                carry_over: String::new(),
            };
        }

        let verified = join_all(texts.iter().map(|(_, text)| async move {
            self.capability
                .verify(text, stage, &self.registry, &ctx.reference_facts)
                .await
        }))
        .await;

        let candidates: Vec<Candidate> = texts
            .into_iter()
            .zip(verified)
            .map(|((index, text), results)| {
                let checklist_results = match results {
                    Ok(results) => normalize_results(stage, results),
                    Err(e) => {
                        warn!(unit_id = %unit.id, candidate = index, error = %e, "Verification failed, counting all predicates as failed");
                        stage
                            .checklist
                            .iter()
                            .map(|id| PredicateResult::fail(id, format!("verification error: {}", e)))
                            .collect()
                    }
                };
                let carry_over_token =
                    extract_carry_over(&unit.content, &text, self.carry_over_max_words);
                Candidate {
                    id: Self::candidate_id(unit, ctx, index),
                    index,
                    text,
                    checklist_results,
                    carry_over_token,
                }
            })
            .collect();

        for c in &candidates {
            debug!(candidate = %c.id, passes = c.passes(), words = c.word_count(), "Scored candidate");
        }

        // Non-empty by construction.
        let Some(winner) = select_winner(&candidates) else {
            return RoundOutcome {
                record: RoundRecord::failed(
                    &unit.id,
                    stage.kind,
                    stage.critical,
                    ctx.round_index,
                    RoundFailure::GenerationFailure,
                ),
                winner_text: None,
                carry_over: String::new(),
            };
        };

        let issues: Vec<Issue> = winner
            .checklist_results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| Issue::new(&r.predicate_id, self.severity_of(&r.predicate_id), r.detail.clone()))
            .collect();
        let count = |s: Severity| issues.iter().filter(|i| i.severity == s).count();
        let (p0_count, p1_count, p2_count) = (count(Severity::P0), count(Severity::P1), count(Severity::P2));
        let verdict = RoundRecord::verdict_for(p0_count, p1_count);
        let regressed = verdict == Verdict::Reject && self.regresses(unit, stage, ctx, winner).await;

        let record = RoundRecord {
            unit_id: unit.id.clone(),
            stage: stage.kind,
            critical: stage.critical,
            round_index: ctx.round_index,
            verdict,
            p0_count,
            p1_count,
            p2_count,
            winner_candidate_id: Some(winner.id.clone()),
            key_fix: if regressed {
                "kept previous content".to_string()
            } else {
                key_fix(&unit.content, &winner.text, &winner.carry_over_token)
            },
            failure: regressed.then_some(RoundFailure::CandidateRegression),
            sub_rounds: None,
            issues,
            recorded_at: Utc::now(),
        };

        info!(
            unit_id = %unit.id,
            stage = %stage.kind,
            round = ctx.round_index,
            verdict = %record.verdict,
            winner = %winner.id,
            "Round complete"
        );

        if regressed {
            warn!(unit_id = %unit.id, stage = %stage.kind, round = ctx.round_index, winner = %winner.id, "Winner regresses current content, keeping it");
            return RoundOutcome {
                record,
                winner_text: None,
                carry_over: String::new(),
            };
        }

        RoundOutcome {
            record,
            winner_text: Some(winner.text.clone()),
            carry_over: winner.carry_over_token.clone(),
        }
    }
}
