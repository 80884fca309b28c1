//! Quality gate: per-unit risk audit over finalized units.
//!
//! Risk rules:
//!
//! | condition                                         | risk |
//! |---------------------------------------------------|------|
//! | >= 2 blocking items, or accepted with caveats     | HIGH |
//! | at least one unresolved item                      | MED  |
//! | nothing unresolved                                | LOW  |
//!
//! Assembly is blocked only by a hard-blocking (P0) item.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::acceptance::{AcceptanceState, AcceptanceStatus, OpenQuery};
use crate::propagation::UnresolvedCrossReference;
use crate::record::Issue;
use crate::stage::{count_placeholders, Severity};
use crate::unit::{Unit, UnitId};

const PLACEHOLDER_PREDICATE: &str = "no-placeholders";
const CROSS_REFERENCE_PREDICATE: &str = "cross-reference";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Med,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Med => write!(f, "MED"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Something left open on a finalized unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnresolvedItem {
    Issue(Issue),
    OpenQuery(OpenQuery),
    Placeholder { count: usize },
    CrossReference(UnresolvedCrossReference),
}

impl UnresolvedItem {
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Self::Issue(issue) => Some(issue.severity),
            Self::OpenQuery(query) => query.issue.as_ref().map(|i| i.severity),
            Self::Placeholder { .. } | Self::CrossReference(_) => Some(Severity::P1),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity().is_some_and(Severity::is_blocking)
    }

    pub fn is_hard_blocking(&self) -> bool {
        self.severity().is_some_and(Severity::is_hard_blocking)
    }

    pub fn predicate_id(&self) -> Option<&str> {
        match self {
            Self::Issue(issue) => Some(&issue.predicate_id),
            Self::OpenQuery(query) => query.issue.as_ref().map(|i| i.predicate_id.as_str()),
            Self::Placeholder { .. } => Some(PLACEHOLDER_PREDICATE),
            Self::CrossReference(_) => Some(CROSS_REFERENCE_PREDICATE),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Issue(issue) => issue.to_string(),
            Self::OpenQuery(query) => format!("open query: {}", query.question),
            Self::Placeholder { count } => format!("{} placeholder(s) left in content", count),
            Self::CrossReference(x) => format!(
                "fact '{}' from {} may be stale ({})",
                x.fact, x.source_unit, x.reason
            ),
        }
    }
}

/// Risk classification of one finalized unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskReport {
    pub unit_id: UnitId,
    pub status: AcceptanceStatus,
    pub risk: RiskLevel,
    pub blocking_count: usize,
    pub items: Vec<UnresolvedItem>,
}

impl RiskReport {
    pub fn hard_blocking(&self) -> impl Iterator<Item = &UnresolvedItem> {
        self.items.iter().filter(|i| i.is_hard_blocking())
    }

    pub fn summary_line(&self) -> String {
        format!(
            "[{}] {} risk={} blocking={} items={}",
            self.unit_id,
            self.status,
            self.risk,
            self.blocking_count,
            self.items.len()
        )
    }
}

/// One P0 item that blocks assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingDefect {
    pub unit_id: UnitId,
    pub predicate_id: String,
    pub detail: String,
}

/// Assembly blocked. Carries every report so callers can still write them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    pub defects: Vec<BlockingDefect>,
    pub reports: Vec<RiskReport>,
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "quality gate failed:")?;
        for (i, d) in self.defects.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{}{} [{}] {}", sep, d.unit_id, d.predicate_id, d.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for GateFailure {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("quality gate run before all units were terminal: {}", .units.join(", "))]
    NotTerminal { units: Vec<UnitId> },

    #[error(transparent)]
    Failure(#[from] GateFailure),
}

/// Everything the gate needs about one unit.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub unit: &'a Unit,
    pub state: &'a AcceptanceState,
    pub unresolved: &'a [UnresolvedCrossReference],
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate;

impl QualityGate {
    pub fn new() -> Self {
        Self
    }

    /// Collect the unresolved items of one unit, without double counting a
    /// predicate that appears both as an outstanding issue and an open query.
    pub fn unresolved_items(&self, input: &GateInput<'_>) -> Vec<UnresolvedItem> {
        let mut items = Vec::new();
        let mut seen: HashSet<&Issue> = HashSet::new();

        for issue in &input.state.outstanding {
            if seen.insert(issue) {
                items.push(UnresolvedItem::Issue(issue.clone()));
            }
        }
        for query in &input.state.open_queries {
            match &query.issue {
                Some(issue) if !seen.insert(issue) => {}
                _ => items.push(UnresolvedItem::OpenQuery(query.clone())),
            }
        }

        let placeholders = count_placeholders(&input.unit.content);
        let already_flagged = items
            .iter()
            .any(|i| i.predicate_id() == Some(PLACEHOLDER_PREDICATE));
        if placeholders > 0 && !already_flagged {
            items.push(UnresolvedItem::Placeholder {
                count: placeholders,
            });
        }

        for reference in input.unresolved.iter().filter(|u| u.target_unit == input.unit.id) {
            items.push(UnresolvedItem::CrossReference(reference.clone()));
        }
        items
    }

    pub fn classify(&self, input: &GateInput<'_>) -> RiskReport {
        let items = self.unresolved_items(input);
        let blocking_count = items.iter().filter(|i| i.is_blocking()).count();
        let risk = if blocking_count >= 2 || input.state.status == AcceptanceStatus::AcceptedWithCaveats {
            RiskLevel::High
        } else if !items.is_empty() {
            RiskLevel::Med
        } else {
            RiskLevel::Low
        };
        RiskReport {
            unit_id: input.unit.id.clone(),
            status: input.state.status,
            risk,
            blocking_count,
            items,
        }
    }

    /// Classify every unit. Fails if any unit is not terminal, or if any unit
    /// carries a P0 item.
    pub fn evaluate(&self, inputs: &[GateInput<'_>]) -> Result<Vec<RiskReport>, GateError> {
        let pending: Vec<UnitId> = inputs
            .iter()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.unit.id.clone())
            .collect();
        if !pending.is_empty() {
            return Err(GateError::NotTerminal { units: pending });
        }

        let reports: Vec<RiskReport> = inputs.iter().map(|i| self.classify(i)).collect();
        for report in &reports {
            info!(unit_id = %report.unit_id, risk = %report.risk, blocking = report.blocking_count, "Risk classified");
        }

        let defects: Vec<BlockingDefect> = reports
            .iter()
            .flat_map(|r| {
                r.hard_blocking().map(move |item| BlockingDefect {
                    unit_id: r.unit_id.clone(),
                    predicate_id: item.predicate_id().unwrap_or("unknown").to_string(),
                    detail: item.describe(),
                })
            })
            .collect();

        if defects.is_empty() {
            Ok(reports)
        } else {
            warn!(defects = defects.len(), "Quality gate blocked assembly");
            Err(GateError::Failure(GateFailure { defects, reports }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::UnitPartitioner;
    use crate::unit::RoundBand;

    fn unit(content: &str) -> Unit {
        UnitPartitioner::default()
            .partition(&format!("# U\n\n{}\n", content))
            .units
            .remove(0)
    }

    fn state(status: AcceptanceStatus) -> AcceptanceState {
        let mut s = AcceptanceState::new(
            "u-01",
            RoundBand {
                min_rounds: 3,
                max_rounds: 10,
            },
            3,
        );
        s.status = status;
        s
    }

    #[test]
    fn test_low_risk() {
        let u = unit("Clean text.");
        let s = state(AcceptanceStatus::Accepted);
        let report = QualityGate::new().classify(&GateInput { unit: &u, state: &s, unresolved: &[] });
        assert_eq!(report.risk, RiskLevel::Low);
        assert!(report.items.is_empty());
    }

    #[test]
    fn test_single_item_is_med() {
        let u = unit("Text with TBD.");
        let s = state(AcceptanceStatus::Accepted);
        let report = QualityGate::new().classify(&GateInput { unit: &u, state: &s, unresolved: &[] });
        assert_eq!(report.risk, RiskLevel::Med);
        assert_eq!(report.items, vec![UnresolvedItem::Placeholder { count: 1 }]);

        let mut s = state(AcceptanceStatus::Accepted);
        s.outstanding = vec![Issue::new("no-hedging", Severity::P2, "")];
        let u = unit("Clean.");
        let report = QualityGate::new().classify(&GateInput { unit: &u, state: &s, unresolved: &[] });
        assert_eq!(report.risk, RiskLevel::Med);
        assert_eq!(report.blocking_count, 0);
    }

    #[test]
    fn test_two_blocking_is_high() {
        let u = unit("Text with TODO.");
        let xref = UnresolvedCrossReference {
            source_unit: "u-02".to_string(),
            target_unit: "u-01".to_string(),
            fact: "b".to_string(),
            depth: 1,
            reason: "depth limit reached".to_string(),
        };
        let s = state(AcceptanceStatus::Accepted);
        let unresolved = [xref];
        let report = QualityGate::new().classify(&GateInput { unit: &u, state: &s, unresolved: &unresolved });
        assert_eq!(report.blocking_count, 2);
        assert_eq!(report.risk, RiskLevel::High);
    }

    #[test]
    fn test_caveats_is_high() {
        let u = unit("Clean.");
        let s = state(AcceptanceStatus::AcceptedWithCaveats);
        let report = QualityGate::new().classify(&GateInput { unit: &u, state: &s, unresolved: &[] });
        assert_eq!(report.risk, RiskLevel::High);
    }

    #[test]
    fn test_open_query_not_double_counted() {
        let issue = Issue::new("no-unsupported-superlatives", Severity::P1, "forbidden marker 'unprecedented'");
        let mut s = state(AcceptanceStatus::AcceptedWithCaveats);
        s.outstanding = vec![issue.clone()];
        s.open_queries = vec![OpenQuery {
            question: "unresolved".to_string(),
            issue: Some(issue),
        }];
        let u = unit("Clean.");
        let report = QualityGate::new().classify(&GateInput { unit: &u, state: &s, unresolved: &[] });
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.blocking_count, 1);
    }

    #[test]
    fn test_not_terminal() {
        let u = unit("Clean.");
        let s = state(AcceptanceStatus::InProgress);
        let err = QualityGate::new()
            .evaluate(&[GateInput { unit: &u, state: &s, unresolved: &[] }])
            .unwrap_err();
        assert_eq!(err, GateError::NotTerminal { units: vec!["u-01".to_string()] });
    }

    #[test]
    fn test_p0_blocks_and_names_unit_and_predicate() {
        let u = unit("Clean.");
        let mut s = state(AcceptanceStatus::AcceptedWithCaveats);
        s.outstanding = vec![Issue::new("fact-consistency", Severity::P0, "gain=4 dB (expected 3 dB)")];
        let err = QualityGate::new()
            .evaluate(&[GateInput { unit: &u, state: &s, unresolved: &[] }])
            .unwrap_err();
        let GateError::Failure(failure) = &err else {
            panic!("expected gate failure");
        };
        assert_eq!(failure.defects.len(), 1);
        assert_eq!(failure.reports.len(), 1);
        let message = err.to_string();
        assert!(message.contains("u-01"));
        assert!(message.contains("fact-consistency"));
    }
}
