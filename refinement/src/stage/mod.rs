//! Stage rotation: the fixed cycle of review phases every unit runs through.
//!
//! ```text
//! draft → diff_verify* → adversarial → quantitative_audit → final_polish → draft → ...
//!                                 │
//!                                 └─ inner loop, up to 3 sub-rounds, one outer round
//! ```
//!
//! `*` marks the critical stage: never compressed, required for acceptance,
//! and the only stage run by propagation mini-rounds. A rotation must mark
//! exactly one stage critical.

pub mod checklist;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigResult};

pub use checklist::{
    count_placeholders, ChecklistVerifier, Predicate, PredicateKind, PredicateRegistry,
    PredicateResult, ReferenceFacts, Severity,
};

/// Kind of review phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Draft,
    DiffVerify,
    Adversarial,
    QuantitativeAudit,
    FinalPolish,
}

impl StageKind {
    /// Whether the stage runs the bounded inner sub-round loop.
    pub fn is_adversarial(self) -> bool {
        matches!(self, Self::Adversarial)
    }

    /// Instruction handed to the generation capability.
    pub fn instruction(self) -> &'static str {
        match self {
            Self::Draft => "Produce a complete draft of this unit.",
            Self::DiffVerify => {
                "Revise the unit, then check every changed statement against the reference facts."
            }
            Self::Adversarial => {
                "Argue against the unit as a skeptical reviewer and rewrite it to survive the critique."
            }
            Self::QuantitativeAudit => {
                "Audit every number, unit and comparison in the unit and correct inconsistencies."
            }
            Self::FinalPolish => "Polish wording and flow without changing any claim.",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::DiffVerify => write!(f, "diff_verify"),
            Self::Adversarial => write!(f, "adversarial"),
            Self::QuantitativeAudit => write!(f, "quantitative_audit"),
            Self::FinalPolish => write!(f, "final_polish"),
        }
    }
}

/// One phase in the rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the rotation (1-indexed).
    pub ordinal: u32,
    pub kind: StageKind,
    /// Predicate ids, resolved through the [`PredicateRegistry`].
    pub checklist: Vec<String>,
    pub critical: bool,
}

impl Stage {
    pub fn new(ordinal: u32, kind: StageKind, checklist: &[&str], critical: bool) -> Self {
        Self {
            ordinal,
            kind,
            checklist: checklist.iter().map(|s| s.to_string()).collect(),
            critical,
        }
    }
}

/// The fixed, cycling stage table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRotation {
    stages: Vec<Stage>,
}

impl StageRotation {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage for a 1-indexed round number.
    ///
    /// Callers must have validated the rotation (non-empty).
    pub fn stage_for_round(&self, round_index: u32) -> &Stage {
        let slot = (round_index.max(1) - 1) as usize % self.stages.len();
        &self.stages[slot]
    }

    /// The single critical stage. `None` only on an unvalidated rotation.
    pub fn critical_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.critical)
    }

    /// Validate the rotation against a registry.
    ///
    /// Any ambiguity about which stage is authoritative for acceptance is a
    /// configuration error, as is a checklist entry with no predicate behind it.
    pub fn validate(&self, registry: &PredicateRegistry) -> ConfigResult<()> {
        if self.stages.is_empty() {
            return Err(ConfigError::ChecklistMisconfiguration {
                stage: "<rotation>".to_string(),
                reason: "rotation has no stages".to_string(),
            });
        }

        let critical = self.stages.iter().filter(|s| s.critical).count();
        if critical != 1 {
            return Err(ConfigError::ChecklistMisconfiguration {
                stage: "<rotation>".to_string(),
                reason: format!("exactly one critical stage required, found {}", critical),
            });
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.kind) {
                return Err(ConfigError::ChecklistMisconfiguration {
                    stage: stage.kind.to_string(),
                    reason: "stage kind appears twice in the rotation".to_string(),
                });
            }
            if stage.checklist.is_empty() {
                return Err(ConfigError::ChecklistMisconfiguration {
                    stage: stage.kind.to_string(),
                    reason: "empty checklist".to_string(),
                });
            }
            for id in &stage.checklist {
                let predicate = registry.get(id).ok_or_else(|| {
                    ConfigError::ChecklistMisconfiguration {
                        stage: stage.kind.to_string(),
                        reason: format!("undefined predicate '{}'", id),
                    }
                })?;
                predicate
                    .check_pattern()
                    .map_err(|reason| ConfigError::ChecklistMisconfiguration {
                        stage: stage.kind.to_string(),
                        reason: format!("predicate '{}': {}", id, reason),
                    })?;
            }
        }

        Ok(())
    }
}

impl Default for StageRotation {
    fn default() -> Self {
        Self::new(vec![
            Stage::new(1, StageKind::Draft, &["word-bounds", "no-placeholders"], false),
            Stage::new(
                2,
                StageKind::DiffVerify,
                &["fact-consistency", "no-placeholders", "word-bounds"],
                true,
            ),
            Stage::new(
                3,
                StageKind::Adversarial,
                &["no-unsupported-superlatives", "no-hedging", "hedge-density"],
                false,
            ),
            Stage::new(
                4,
                StageKind::QuantitativeAudit,
                &["fact-consistency", "quantities-stated"],
                false,
            ),
            Stage::new(
                5,
                StageKind::FinalPolish,
                &["word-bounds", "no-hedging", "no-placeholders", "sentence-length"],
                false,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rotation_is_valid() {
        let rotation = StageRotation::default();
        rotation.validate(&PredicateRegistry::builtin()).unwrap();
        assert_eq!(rotation.len(), 5);
        assert_eq!(
            rotation.critical_stage().unwrap().kind,
            StageKind::DiffVerify
        );
    }

    #[test]
    fn test_stage_for_round_cycles() {
        let rotation = StageRotation::default();
        assert_eq!(rotation.stage_for_round(1).kind, StageKind::Draft);
        assert_eq!(rotation.stage_for_round(3).kind, StageKind::Adversarial);
        assert_eq!(rotation.stage_for_round(5).kind, StageKind::FinalPolish);
        assert_eq!(rotation.stage_for_round(6).kind, StageKind::Draft);
        assert_eq!(rotation.stage_for_round(7).kind, StageKind::DiffVerify);
        // Round 0 is treated as the first round.
        assert_eq!(rotation.stage_for_round(0).kind, StageKind::Draft);
    }

    #[test]
    fn test_undefined_predicate_rejected() {
        let rotation = StageRotation::new(vec![Stage::new(
            1,
            StageKind::DiffVerify,
            &["ghost"],
            true,
        )]);
        let err = rotation.validate(&PredicateRegistry::builtin()).unwrap_err();
        assert!(err.to_string().contains("undefined predicate 'ghost'"));
    }

    #[test]
    fn test_critical_count_enforced() {
        let none = StageRotation::new(vec![Stage::new(1, StageKind::Draft, &["word-bounds"], false)]);
        assert!(none.validate(&PredicateRegistry::builtin()).is_err());

        let two = StageRotation::new(vec![
            Stage::new(1, StageKind::Draft, &["word-bounds"], true),
            Stage::new(2, StageKind::DiffVerify, &["word-bounds"], true),
        ]);
        let err = two.validate(&PredicateRegistry::builtin()).unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn test_empty_rotation_rejected() {
        let rotation = StageRotation::new(vec![]);
        assert!(rotation.validate(&PredicateRegistry::builtin()).is_err());
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let rotation = StageRotation::new(vec![
            Stage::new(1, StageKind::Draft, &["word-bounds"], true),
            Stage::new(2, StageKind::Draft, &["word-bounds"], false),
        ]);
        assert!(rotation.validate(&PredicateRegistry::builtin()).is_err());
    }

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::DiffVerify.to_string(), "diff_verify");
        assert_eq!(StageKind::QuantitativeAudit.to_string(), "quantitative_audit");
        assert!(StageKind::Adversarial.is_adversarial());
        assert!(!StageKind::FinalPolish.is_adversarial());
    }
}
