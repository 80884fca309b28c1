//! Refinement orchestrator: owns one document run end to end.
//!
//! ```text
//! partition ─► schedule units (dependency order, worker pool)
//!                 │  per unit: rounds until terminal
//!                 └► on finalize: update fact index, propagate (depth <= 1)
//!           ─► quality gate ─► assemble
//! ```
//!
//! Shared state: the history log and the propagation engine (which owns the
//! fact index and each unit's progress) sit behind `RwLock`s; each unit sits
//! behind its own `Mutex`, which propagation re-acquires before re-opening a
//! unit. The engine lock is never held while waiting on a unit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acceptance::{AcceptanceState, AcceptanceStatus};
use crate::candidate::CandidateLoop;
use crate::capability::RefinementCapability;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::gate::{GateError, GateFailure, GateInput, QualityGate, RiskLevel, RiskReport};
use crate::history::{HistoryBudget, HistoryCompressor, HistoryLog, SharedHistory, WordCountEstimator};
use crate::partition::{PartitionError, UnitPartitioner};
use crate::propagation::{FactIndex, PropagationDecision, PropagationEngine, PropagationEvent, UnresolvedCrossReference};
use crate::scheduler::{RoundScheduler, UnitRun};
use crate::store::ContentStore;
use crate::unit::{ComplexityBand, Unit, UnitId};

/// Per-unit line of the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit_id: UnitId,
    pub title: String,
    pub status: AcceptanceStatus,
    pub rounds_completed: u32,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub accepted_early: bool,
    pub review_rounds: u32,
    pub complexity: f64,
    pub band: ComplexityBand,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
}

/// Everything a run reports, whether or not assembly went through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitSummary>,
    pub risk_reports: Vec<RiskReport>,
    pub unresolved: Vec<UnresolvedCrossReference>,
    pub propagation_events: Vec<PropagationEvent>,
    pub diagnostics: Vec<PartitionError>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_failure: Option<GateFailure>,
}

impl RunReport {
    pub fn highest_risk(&self) -> Option<RiskLevel> {
        self.risk_reports.iter().map(|r| r.risk).max()
    }

    pub fn summary_line(&self) -> String {
        let count = |s: AcceptanceStatus| self.units.iter().filter(|u| u.status == s).count();
        format!(
            "run {} | {} units | accepted {} | caveats {} | unresolved {} | gate {}",
            self.run_id,
            self.units.len(),
            count(AcceptanceStatus::Accepted),
            count(AcceptanceStatus::AcceptedWithCaveats),
            self.unresolved.len(),
            if self.gate_failure.is_some() { "blocked" } else { "passed" }
        )
    }
}

/// Assembled output of a run that passed the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalDocument {
    pub run_id: String,
    /// Unit texts in document order.
    pub text: String,
    pub statuses: BTreeMap<UnitId, AcceptanceStatus>,
    pub reports: Vec<RiskReport>,
    pub unresolved: Vec<UnresolvedCrossReference>,
}

/// Result of [`RefinementOrchestrator::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    /// `None` when the quality gate blocked assembly.
    pub document: Option<FinalDocument>,
    pub history: HistoryLog,
    /// Final units in document order.
    pub units: Vec<Unit>,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.report.gate_failure.is_none()
    }
}

/// Shared per-run state handed to every unit task.
struct RunContext {
    scheduler: RoundScheduler,
    history: SharedHistory,
    engine: RwLock<PropagationEngine>,
    runs: HashMap<UnitId, Arc<Mutex<UnitRun>>>,
    depends_on: BTreeMap<UnitId, BTreeSet<UnitId>>,
    digest_words: usize,
}

impl RunContext {
    fn run_of(&self, id: &str) -> OrchestratorResult<Arc<Mutex<UnitRun>>> {
        self.runs
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Join(format!("unknown unit {}", id)))
    }

    async fn dependency_header(&self, id: &str) -> String {
        let mut lines = Vec::new();
        if let Some(deps) = self.depends_on.get(id) {
            for dep in deps {
                if let Some(run) = self.runs.get(dep) {
                    lines.push(run.lock().await.unit.digest(self.digest_words));
                }
            }
        }
        lines.join("\n")
    }

    /// Drive one unit to a terminal status, then propagate its fact changes.
    ///
    /// A unit that finished against facts another unit changed while it was
    /// running gets one review round before anything propagates from it.
    async fn refine_unit(self: Arc<Self>, id: UnitId) -> OrchestratorResult<UnitId> {
        let handle = self.run_of(&id)?;
        let header = self.dependency_header(&id).await;

        let changed = {
            let mut run = handle.lock().await;
            {
                let mut engine = self.engine.write().await;
                run.reference_facts = engine.start_unit(&id);
                run.acceptance.unresolved_references = engine.unresolved_for(&id).len();
            }
            run.context_header = header.clone();
            run.unit.dependency_summary = header;
            self.scheduler.run_unit(&mut run, &self.history).await?;

            let (changed, stale) = {
                let mut engine = self.engine.write().await;
                let changed = engine.index_mut().update_unit(&run.unit);
                let stale = engine.mark_terminal(&id, &run.reference_facts);
                (changed, stale)
            };
            if !stale.is_empty() {
                let facts: Vec<&str> = stale.iter().map(|c| c.fact.as_str()).collect();
                info!(unit_id = %id, facts = ?facts, "Reviewing unit against facts changed while it ran");
                let follow_up = self.review(&id, &mut run).await?;
                self.record_follow_up(&id, follow_up).await;
            }
            changed
        };

        for fact in changed {
            self.propagate_from(&id, &fact).await?;
        }
        Ok(id)
    }

    /// One critical-stage review against the current index. Returns the
    /// facts the review changed.
    async fn review(&self, id: &str, run: &mut UnitRun) -> OrchestratorResult<Vec<String>> {
        run.reference_facts = self.engine.read().await.index().reference_facts_for(id);
        self.scheduler.run_review(run, &self.history).await?;
        Ok(self.engine.write().await.index_mut().update_unit(&run.unit))
    }

    /// Changes made by a review go out at depth 1: recorded, never re-opened.
    async fn record_follow_up(&self, source: &str, facts: Vec<String>) {
        let mut engine = self.engine.write().await;
        for fact in facts {
            engine.propagate(source, &fact, 1);
        }
    }

    /// Depth-0 propagation: re-open terminal referencers for one review
    /// round each. Running referencers are settled by the engine when they
    /// turn terminal.
    async fn propagate_from(&self, source: &str, fact: &str) -> OrchestratorResult<()> {
        let decision = self.engine.write().await.propagate(source, fact, 0);
        let PropagationDecision::Reopen { targets } = decision else {
            return Ok(());
        };

        for target in targets {
            let handle = self.run_of(&target)?;
            let follow_up = {
                let mut run = handle.lock().await;
                self.review(&target, &mut run).await?
            };
            self.record_follow_up(&target, follow_up).await;
        }
        Ok(())
    }
}

/// Top-level driver for one document run.
pub struct RefinementOrchestrator {
    config: OrchestratorConfig,
    capability: Arc<dyn RefinementCapability>,
}

impl RefinementOrchestrator {
    /// Build an orchestrator. Fails on an invalid configuration.
    pub fn new(config: OrchestratorConfig, capability: Arc<dyn RefinementCapability>) -> OrchestratorResult<Self> {
        config.validate()?;
        Ok(Self { config, capability })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn scheduler(&self) -> RoundScheduler {
        let candidate_loop = CandidateLoop::new(
            Arc::clone(&self.capability),
            Arc::new(self.config.predicates.clone()),
            self.config.candidates_per_round,
            self.config.generation_timeout(),
            self.config.carry_over_max_words,
        );
        RoundScheduler::new(
            candidate_loop,
            Arc::new(self.config.rotation.clone()),
            self.config.adversarial_sub_rounds,
        )
    }

    /// Refine a document. Gate failures are reported in the outcome, not
    /// returned as errors.
    pub async fn run(&self, document: &str) -> OrchestratorResult<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let partition = UnitPartitioner::new(self.config.partition.clone()).partition(document);
        info!(
            run_id = %run_id,
            units = partition.units.len(),
            degraded = partition.degraded,
            "Starting refinement run"
        );
        for diagnostic in &partition.diagnostics {
            warn!(run_id = %run_id, diagnostic = %diagnostic, "Partition diagnostic");
        }

        let runs: HashMap<UnitId, Arc<Mutex<UnitRun>>> = partition
            .units
            .iter()
            .map(|unit| {
                let band = unit.complexity.round_band(self.config.max_rounds);
                let acceptance = AcceptanceState::new(&unit.id, band, self.config.approval_threshold);
                (unit.id.clone(), Arc::new(Mutex::new(UnitRun::new(unit.clone(), acceptance))))
            })
            .collect();

        let compressor = HistoryCompressor::new(
            self.config.compression_trigger,
            self.config.compression_keep_recent,
            HistoryBudget::new(self.config.history_token_budget as u64),
        )
        .with_estimator(Box::new(WordCountEstimator {
            factor: self.config.history_tokens_per_word,
        }));
        let ctx = Arc::new(RunContext {
            scheduler: self.scheduler(),
            history: SharedHistory::new(compressor),
            engine: RwLock::new(PropagationEngine::new(FactIndex::from_units(&partition.units))),
            runs,
            depends_on: partition.depends_on.clone(),
            digest_words: self.config.dependency_digest_words,
        });

        self.drive(&ctx, &partition.iteration_order).await?;

        // Gate over every unit in document order.
        let mut finals: Vec<UnitRun> = Vec::with_capacity(partition.units.len());
        for unit in &partition.units {
            finals.push(ctx.run_of(&unit.id)?.lock().await.clone());
        }
        let (unresolved, events) = {
            let engine = ctx.engine.read().await;
            (engine.unresolved().to_vec(), engine.events().to_vec())
        };
        let inputs: Vec<GateInput<'_>> = finals
            .iter()
            .map(|run| GateInput {
                unit: &run.unit,
                state: &run.acceptance,
                unresolved: &unresolved,
            })
            .collect();

        let (reports, gate_failure) = match QualityGate::new().evaluate(&inputs) {
            Ok(reports) => (reports, None),
            Err(GateError::Failure(failure)) => (failure.reports.clone(), Some(failure)),
            Err(GateError::NotTerminal { units }) => return Err(OrchestratorError::NotTerminal(units)),
        };

        let risk_of: HashMap<&str, RiskLevel> =
            reports.iter().map(|r| (r.unit_id.as_str(), r.risk)).collect();
        let units: Vec<UnitSummary> = finals
            .iter()
            .map(|run| UnitSummary {
                unit_id: run.unit.id.clone(),
                title: run.unit.title.clone(),
                status: run.acceptance.status,
                rounds_completed: run.acceptance.rounds_completed,
                min_rounds: run.acceptance.min_rounds,
                max_rounds: run.acceptance.max_rounds,
                accepted_early: run.acceptance.accepted_early,
                review_rounds: run.acceptance.review_rounds,
                complexity: run.unit.complexity.value,
                band: run.unit.complexity.band,
                degraded: run.unit.degraded,
                risk: risk_of.get(run.unit.id.as_str()).copied(),
            })
            .collect();

        let document = gate_failure.is_none().then(|| FinalDocument {
            run_id: run_id.clone(),
            text: assemble(finals.iter().map(|r| &r.unit)),
            statuses: finals
                .iter()
                .map(|r| (r.unit.id.clone(), r.acceptance.status))
                .collect(),
            reports: reports.clone(),
            unresolved: unresolved.clone(),
        });

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            units,
            risk_reports: reports,
            unresolved,
            propagation_events: events,
            diagnostics: partition.diagnostics.clone(),
            degraded: partition.degraded,
            gate_failure,
        };
        info!("{}", report.summary_line());

        Ok(RunOutcome {
            report,
            document,
            history: ctx.history.snapshot().await,
            units: finals.into_iter().map(|r| r.unit).collect(),
        })
    }

    /// Start units as their dependencies finish, bounded by the worker pool.
    async fn drive(&self, ctx: &Arc<RunContext>, order: &[UnitId]) -> OrchestratorResult<()> {
        let pool = Arc::new(Semaphore::new(self.config.worker_pool_size));
        let mut join_set: JoinSet<OrchestratorResult<UnitId>> = JoinSet::new();
        let mut started: HashSet<UnitId> = HashSet::new();
        let mut done: HashSet<UnitId> = HashSet::new();

        loop {
            let mut ready: Vec<&UnitId> = order
                .iter()
                .filter(|id| !started.contains(*id))
                .filter(|id| {
                    ctx.depends_on
                        .get(*id)
                        .map_or(true, |deps| deps.iter().all(|d| done.contains(d)))
                })
                .collect();

            if ready.is_empty() && join_set.is_empty() {
                // Dependencies always point backwards in `order`, so this
                // only triggers once every unit has started.
                match order.iter().find(|id| !started.contains(*id)) {
                    Some(stuck) => {
                        warn!(unit_id = %stuck, "No runnable unit, starting next in order");
                        ready.push(stuck);
                    }
                    None => break,
                }
            }

            for id in ready {
                started.insert(id.clone());
                let ctx = Arc::clone(ctx);
                let pool = Arc::clone(&pool);
                let id = id.clone();
                debug!(unit_id = %id, "Queueing unit");
                join_set.spawn(async move {
                    let _permit = pool.acquire_owned().await.map_err(|_| OrchestratorError::PoolClosed)?;
                    ctx.refine_unit(id).await
                });
            }

            match join_set.join_next().await {
                Some(joined) => {
                    let id = joined.map_err(|e| OrchestratorError::Join(e.to_string()))??;
                    done.insert(id);
                }
                None => {
                    if started.len() == order.len() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Read from a store, run, and write every output. A blocked gate still
    /// writes the history and reports, then returns the failure.
    pub async fn run_with_store(&self, store: &dyn ContentStore) -> OrchestratorResult<RunOutcome> {
        let source = store.read_source().await.map_err(OrchestratorError::Store)?;
        let outcome = self.run(&source).await?;

        store
            .write_history(&outcome.history)
            .await
            .map_err(OrchestratorError::Store)?;
        store
            .write_reports(&outcome.report)
            .await
            .map_err(OrchestratorError::Store)?;

        match &outcome.document {
            Some(document) => {
                store.write_document(document).await.map_err(OrchestratorError::Store)?;
                Ok(outcome)
            }
            None => match outcome.report.gate_failure.clone() {
                Some(failure) => Err(OrchestratorError::Gate(failure)),
                None => Ok(outcome),
            },
        }
    }
}

/// Join unit texts in document order.
pub fn assemble<'a>(units: impl Iterator<Item = &'a Unit>) -> String {
    let parts: Vec<String> = units.map(Unit::render).filter(|s| !s.is_empty()).collect();
    let mut text = parts.join("\n\n");
    text.push('\n');
    text
}
