//! Orchestrator end-to-end tests with the scripted capability and the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use refinement::capability::{CapabilityError, GenerationRequest, ScriptedCapability};
use refinement::config::{ConfigError, OrchestratorConfig};
use refinement::error::OrchestratorError;
use refinement::orchestrator::RefinementOrchestrator;
use refinement::partition::{PartitionError, PartitionRules};
use refinement::record::RoundFailure;
use refinement::stage::{Stage, StageKind, StageRotation};
use refinement::store::MemoryStore;
use refinement::{AcceptanceStatus, HistoryEntry, RiskLevel};

const DOC: &str = "# Introduction\n\nThe amplifier reaches [[gain: 3 dB]] at 10 GHz.\n\n\
# Design\n\nThe stage count follows from a target of 12 dB.\n\n\
# Results\n\nMeasured [[gain]] matches the model within 0.2 dB.\n";

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        candidates_per_round: 2,
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

fn orchestrator(cap: ScriptedCapability) -> RefinementOrchestrator {
    RefinementOrchestrator::new(config(), Arc::new(cap)).unwrap()
}

/// Results section keeps redeclaring the gain with a conflicting value.
fn conflicting_capability() -> ScriptedCapability {
    ScriptedCapability::from_fn(|req: &GenerationRequest| {
        if req.unit_title == "Results" && !req.content.contains("[[gain: 9 dB]]") {
            Ok(format!("{} Gain is [[gain: 9 dB]].", req.content))
        } else {
            Ok(req.content.clone())
        }
    })
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_with_store_writes_every_output() {
    init_tracing();
    let store = MemoryStore::new(DOC);
    let outcome = orchestrator(ScriptedCapability::echo())
        .run_with_store(&store)
        .await
        .unwrap();

    assert!(outcome.passed());
    let document = store.document().unwrap();
    assert_eq!(document.statuses.len(), 3);
    assert!(document.statuses.values().all(|s| *s == AcceptanceStatus::Accepted));
    let intro = document.text.find("# Introduction").unwrap();
    let design = document.text.find("# Design").unwrap();
    let results = document.text.find("# Results").unwrap();
    assert!(intro < design && design < results);

    let report = store.report().unwrap();
    assert_eq!(report.run_id, document.run_id);
    assert!(report.gate_failure.is_none());
    assert!(report.propagation_events.is_empty());
    assert!(report.finished_at >= report.started_at);
    assert!(report.summary_line().contains("gate passed"));

    let history = store.history().unwrap();
    for unit in &report.units {
        assert_eq!(history.count_for_unit(&unit.unit_id) as u32, unit.rounds_completed);
        assert!(unit.rounds_completed >= unit.min_rounds.saturating_sub(1));
        assert!(unit.rounds_completed <= unit.max_rounds);
    }
}

#[tokio::test]
async fn test_dependency_digest_reaches_referencing_unit() {
    let cap = ScriptedCapability::from_fn(|req: &GenerationRequest| {
        if req.unit_title == "Results" {
            assert!(req.context_header.contains("Introduction: The amplifier"), "{}", req.context_header);
            assert_eq!(req.reference_facts.get("gain").map(String::as_str), Some("3 dB"));
        }
        Ok(req.content.clone())
    });
    let outcome = orchestrator(cap).run(DOC).await.unwrap();
    assert!(outcome.passed());
}

#[tokio::test]
async fn test_empty_document_is_degraded_but_completes() {
    let outcome = orchestrator(ScriptedCapability::echo()).run("   \n").await.unwrap();
    assert!(outcome.report.degraded);
    assert_eq!(outcome.report.diagnostics, vec![PartitionError::EmptyDocument]);
    assert_eq!(outcome.report.units.len(), 1);
}

#[tokio::test]
async fn test_missing_grouping_flags_degraded() {
    let mut cfg = config();
    cfg.partition = PartitionRules {
        required_groupings: vec!["Methods".to_string()],
        ..Default::default()
    };
    let doc = "# Overview\n\nOur methods are described inline here.\n";
    let outcome = RefinementOrchestrator::new(cfg, Arc::new(ScriptedCapability::echo()))
        .unwrap()
        .run(doc)
        .await
        .unwrap();
    assert!(outcome.report.degraded);
    assert!(outcome.report.units[0].degraded);
    assert!(matches!(
        outcome.report.diagnostics[0],
        PartitionError::MissingGrouping { .. }
    ));
}

// ── Quality gate ────────────────────────────────────────────────────

#[tokio::test]
async fn test_gate_blocks_on_p0_and_names_unit_and_predicate() {
    init_tracing();
    let outcome = orchestrator(conflicting_capability()).run(DOC).await.unwrap();
    assert!(!outcome.passed());
    assert!(outcome.document.is_none());

    let failure = outcome.report.gate_failure.as_ref().unwrap();
    let results = outcome
        .report
        .units
        .iter()
        .find(|u| u.title == "Results")
        .unwrap();
    assert_eq!(results.status, AcceptanceStatus::AcceptedWithCaveats);
    assert_eq!(results.risk, Some(RiskLevel::High));
    assert!(failure
        .defects
        .iter()
        .any(|d| d.unit_id == results.unit_id && d.predicate_id == "fact-consistency"));

    let message = failure.to_string();
    assert!(message.contains(&results.unit_id));
    assert!(message.contains("fact-consistency"));
}

#[tokio::test]
async fn test_gate_failure_still_writes_reports() {
    let store = MemoryStore::new(DOC);
    let err = orchestrator(conflicting_capability())
        .run_with_store(&store)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Gate(_)));
    assert!(store.document().is_none());
    assert!(store.report().unwrap().gate_failure.is_some());
    assert!(store.history().is_some());
}

// ── Failures and timeouts ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_generation_timeouts_are_recorded_and_unit_falls_back() {
    let mut cfg = config();
    cfg.generation_timeout_ms = 50;
    cfg.max_rounds = 4;
    cfg.approval_threshold = 3;
    let cap = ScriptedCapability::echo().with_delay(Duration::from_secs(10));
    let outcome = RefinementOrchestrator::new(cfg, Arc::new(cap))
        .unwrap()
        .run("# Only\n\nA single unit of plain prose.\n")
        .await
        .unwrap();

    let unit = &outcome.report.units[0];
    assert_eq!(unit.status, AcceptanceStatus::AcceptedWithCaveats);
    assert_eq!(unit.rounds_completed, 4);
    let failures: Vec<RoundFailure> = outcome
        .history
        .entries()
        .iter()
        .filter_map(|e| match e {
            HistoryEntry::Round(r) => r.failure,
            HistoryEntry::Compressed(_) => None,
        })
        .collect();
    assert_eq!(failures.len(), 4);
    assert!(failures.iter().all(|f| *f == RoundFailure::GenerationTimeout));
}

#[tokio::test]
async fn test_capability_failures_never_abort_the_run() {
    let cap = ScriptedCapability::from_fn(|req: &GenerationRequest| {
        if req.candidate_index == 0 {
            Err(CapabilityError::Failure("backend unavailable".to_string()))
        } else {
            Ok(req.content.clone())
        }
    });
    let outcome = orchestrator(cap).run(DOC).await.unwrap();
    assert!(outcome.passed());
    assert!(outcome
        .report
        .units
        .iter()
        .all(|u| u.status == AcceptanceStatus::Accepted));
}

// ── Configuration ───────────────────────────────────────────────────

#[test]
fn test_two_critical_stages_is_a_config_error() {
    let mut cfg = config();
    cfg.rotation = StageRotation::new(vec![
        Stage::new(1, StageKind::Draft, &["word-bounds"], true),
        Stage::new(2, StageKind::DiffVerify, &["fact-consistency"], true),
    ]);
    let err = RefinementOrchestrator::new(cfg, Arc::new(ScriptedCapability::echo()))
        .err()
        .unwrap();
    match err {
        OrchestratorError::Config(ConfigError::ChecklistMisconfiguration { reason, .. }) => {
            assert!(reason.contains("critical"), "{}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("refine.toml");
    std::fs::write(
        &path,
        "candidates_per_round = 3\nmax_rounds = 8\n\n[partition]\nmax_unit_words = 250\n",
    )
    .unwrap();

    let cfg = OrchestratorConfig::from_file(&path).unwrap();
    assert_eq!(cfg.candidates_per_round, 3);
    assert_eq!(cfg.max_rounds, 8);
    assert_eq!(cfg.partition.max_unit_words, 250);
    assert_eq!(cfg.approval_threshold, 3);
    assert!(RefinementOrchestrator::new(cfg, Arc::new(ScriptedCapability::echo())).is_ok());
}
