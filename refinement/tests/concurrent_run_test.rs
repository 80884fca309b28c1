//! Multi-threaded runs: units in flight together, and fact changes that
//! land while a citing unit is still refining.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use refinement::capability::{CapabilityError, GenerationRequest, RefinementCapability};
use refinement::config::OrchestratorConfig;
use refinement::orchestrator::RefinementOrchestrator;
use refinement::{AcceptanceStatus, RiskLevel};
use tokio::sync::watch;

/// Tracks how many distinct units are generating at the same time.
#[derive(Default)]
struct Activity {
    active: Mutex<BTreeMap<String, usize>>,
    peak_units: AtomicUsize,
}

impl Activity {
    fn enter(&self, unit_id: &str) {
        let mut active = self.active.lock().unwrap();
        *active.entry(unit_id.to_string()).or_default() += 1;
        let units = active.values().filter(|n| **n > 0).count();
        self.peak_units.fetch_max(units, Ordering::SeqCst);
    }

    fn leave(&self, unit_id: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(n) = active.get_mut(unit_id) {
            *n -= 1;
        }
    }

    fn peak(&self) -> usize {
        self.peak_units.load(Ordering::SeqCst)
    }
}

/// Echoes every unit after a fixed delay.
struct SlowEcho {
    delay: Duration,
    activity: Activity,
}

#[async_trait]
impl RefinementCapability for SlowEcho {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        self.activity.enter(&request.unit_id);
        tokio::time::sleep(self.delay).await;
        self.activity.leave(&request.unit_id);
        Ok(request.content.clone())
    }
}

/// "Source" declares `[[a: 42]]` once "Reader" has started; "Reader" cites
/// `a` and is slow, so it is still refining when the fact appears.
struct InterleavedCapability {
    reader_started: watch::Sender<bool>,
    reader_delay: Duration,
    reader_saw_fact: AtomicBool,
    activity: Activity,
}

impl InterleavedCapability {
    fn new(reader_delay: Duration) -> Self {
        let (reader_started, _) = watch::channel(false);
        Self {
            reader_started,
            reader_delay,
            reader_saw_fact: AtomicBool::new(false),
            activity: Activity::default(),
        }
    }

    async fn respond(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        match request.unit_title.as_str() {
            "Source" => {
                let mut started = self.reader_started.subscribe();
                started
                    .wait_for(|s| *s)
                    .await
                    .map_err(|e| CapabilityError::Failure(e.to_string()))?;
                if request.content.contains("[[a:") {
                    Ok(request.content.clone())
                } else {
                    Ok(format!("{} Gain is [[a: 42]].", request.content))
                }
            }
            "Reader" => {
                self.reader_started.send_replace(true);
                if request.reference_facts.get("a").map(String::as_str) == Some("42") {
                    self.reader_saw_fact.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(self.reader_delay).await;
                Ok(request.content.clone())
            }
            _ => Ok(request.content.clone()),
        }
    }
}

#[async_trait]
impl RefinementCapability for InterleavedCapability {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        self.activity.enter(&request.unit_id);
        let result = self.respond(request).await;
        self.activity.leave(&request.unit_id);
        result
    }
}

fn config(worker_pool_size: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        candidates_per_round: 2,
        worker_pool_size,
        ..Default::default()
    }
}

const INDEPENDENT_DOC: &str = "# A\n\nFirst section with 1 figure.\n\n\
# B\n\nSecond section with 2 figures.\n\n\
# C\n\nThird section with 3 figures.\n";

// ── Worker pool ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_units_refine_concurrently() {
    let cap = Arc::new(SlowEcho {
        delay: Duration::from_millis(20),
        activity: Activity::default(),
    });
    let orchestrator = RefinementOrchestrator::new(config(3), cap.clone()).unwrap();
    let outcome = orchestrator.run(INDEPENDENT_DOC).await.unwrap();

    assert_eq!(outcome.report.units.len(), 3);
    assert!(outcome.report.units.iter().all(|u| u.status == AcceptanceStatus::Accepted));
    assert!(cap.activity.peak() >= 2, "peak units in flight: {}", cap.activity.peak());
    assert!(outcome.passed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_of_one_runs_units_one_at_a_time() {
    let cap = Arc::new(SlowEcho {
        delay: Duration::from_millis(5),
        activity: Activity::default(),
    });
    let orchestrator = RefinementOrchestrator::new(config(1), cap.clone()).unwrap();
    let outcome = orchestrator.run(INDEPENDENT_DOC).await.unwrap();

    assert_eq!(outcome.report.units.len(), 3);
    assert_eq!(cap.activity.peak(), 1);
}

// ── Fact changes while a citing unit runs ───────────────────────────

const INTERLEAVED_DOC: &str = "# Source\n\nPlain prose here.\n\n# Reader\n\nThe receiver uses [[a]].\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_referencer_is_reviewed_after_fact_appears() {
    let cap = Arc::new(InterleavedCapability::new(Duration::from_millis(40)));
    let orchestrator = RefinementOrchestrator::new(config(4), cap.clone()).unwrap();
    let outcome = orchestrator.run(INTERLEAVED_DOC).await.unwrap();

    let by_title = |title: &str| {
        outcome
            .report
            .units
            .iter()
            .find(|u| u.title == title)
            .cloned()
            .unwrap()
    };
    let (source, reader) = (by_title("Source"), by_title("Reader"));

    assert!(cap.activity.peak() >= 2, "both units must be in flight together");
    assert!(outcome
        .report
        .propagation_events
        .iter()
        .any(|e| e.source_unit == source.unit_id && e.affected_fact == "a" && e.depth == 0));

    assert_eq!(reader.review_rounds, 1, "Reader finished against a stale index");
    assert!(cap.reader_saw_fact.load(Ordering::SeqCst));
    assert!(outcome.report.unresolved.is_empty());
    assert_eq!(reader.risk, Some(RiskLevel::Low));

    assert!(outcome
        .history
        .for_unit(&reader.unit_id)
        .any(|e| e.is_critical() && e.round_index() == reader.rounds_completed + 1));
    assert!(outcome.passed());
}
