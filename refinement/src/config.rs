//! Orchestrator configuration.
//!
//! Resolution order: defaults, then an optional TOML file, then `REFINE_*`
//! environment overrides, then [`OrchestratorConfig::validate`]. A config that
//! fails validation is fatal at startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::partition::PartitionRules;
use crate::stage::{PredicateRegistry, StageRotation};

/// Propagation never re-opens more than one hop past the source.
pub const PROPAGATION_DEPTH_LIMIT: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("checklist misconfiguration in stage {stage}: {reason}")]
    ChecklistMisconfiguration { stage: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables for one document run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Candidates generated per round (K).
    pub candidates_per_round: usize,
    /// Hard ceiling on rounds per unit, for every complexity band.
    pub max_rounds: u32,
    /// Consecutive approvals required for acceptance.
    pub approval_threshold: u32,
    /// Per-unit history length that triggers compression.
    pub compression_trigger: usize,
    /// Most recent entries per unit kept verbatim by compression.
    pub compression_keep_recent: usize,
    /// Must equal [`PROPAGATION_DEPTH_LIMIT`].
    pub propagation_depth_limit: u32,
    /// Inner sub-round cap for the adversarial stage.
    pub adversarial_sub_rounds: u32,
    /// Units refined concurrently.
    pub worker_pool_size: usize,
    pub generation_timeout_ms: u64,
    /// Estimated token budget for the whole history log.
    pub history_token_budget: usize,
    /// Tokens per word used to estimate the history log's size.
    pub history_tokens_per_word: f64,
    /// Longest carry-over token handed to the next stage, in words.
    pub carry_over_max_words: usize,
    /// Length of a finalized unit's digest used as dependency context.
    pub dependency_digest_words: usize,
    pub partition: PartitionRules,
    pub rotation: StageRotation,
    pub predicates: PredicateRegistry,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            candidates_per_round: 4,
            max_rounds: 10,
            approval_threshold: 3,
            compression_trigger: 6,
            compression_keep_recent: 3,
            propagation_depth_limit: PROPAGATION_DEPTH_LIMIT,
            adversarial_sub_rounds: 3,
            worker_pool_size: 4,
            generation_timeout_ms: 120_000,
            history_token_budget: 32_000,
            history_tokens_per_word: 1.3,
            carry_over_max_words: 60,
            dependency_digest_words: 40,
            partition: PartitionRules::default(),
            rotation: StageRotation::default(),
            predicates: PredicateRegistry::builtin(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_from(|key| std::env::var(key).ok());
        config
    }

    /// Full resolution: file (if any), environment, validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `REFINE_*` overrides from an arbitrary lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => warn!(key, value = %raw, "Ignoring unparseable config override"),
                }
            }
        }

        parse(
            "REFINE_CANDIDATES_PER_ROUND",
            lookup("REFINE_CANDIDATES_PER_ROUND"),
            &mut self.candidates_per_round,
        );
        parse("REFINE_MAX_ROUNDS", lookup("REFINE_MAX_ROUNDS"), &mut self.max_rounds);
        parse(
            "REFINE_APPROVAL_THRESHOLD",
            lookup("REFINE_APPROVAL_THRESHOLD"),
            &mut self.approval_threshold,
        );
        parse(
            "REFINE_COMPRESSION_TRIGGER",
            lookup("REFINE_COMPRESSION_TRIGGER"),
            &mut self.compression_trigger,
        );
        parse(
            "REFINE_COMPRESSION_KEEP_RECENT",
            lookup("REFINE_COMPRESSION_KEEP_RECENT"),
            &mut self.compression_keep_recent,
        );
        parse(
            "REFINE_PROPAGATION_DEPTH_LIMIT",
            lookup("REFINE_PROPAGATION_DEPTH_LIMIT"),
            &mut self.propagation_depth_limit,
        );
        parse(
            "REFINE_ADVERSARIAL_SUB_ROUNDS",
            lookup("REFINE_ADVERSARIAL_SUB_ROUNDS"),
            &mut self.adversarial_sub_rounds,
        );
        parse(
            "REFINE_WORKER_POOL_SIZE",
            lookup("REFINE_WORKER_POOL_SIZE"),
            &mut self.worker_pool_size,
        );
        parse(
            "REFINE_GENERATION_TIMEOUT_MS",
            lookup("REFINE_GENERATION_TIMEOUT_MS"),
            &mut self.generation_timeout_ms,
        );
        parse(
            "REFINE_HISTORY_TOKEN_BUDGET",
            lookup("REFINE_HISTORY_TOKEN_BUDGET"),
            &mut self.history_token_budget,
        );
        parse(
            "REFINE_HISTORY_TOKENS_PER_WORD",
            lookup("REFINE_HISTORY_TOKENS_PER_WORD"),
            &mut self.history_tokens_per_word,
        );
        parse(
            "REFINE_MAX_UNIT_WORDS",
            lookup("REFINE_MAX_UNIT_WORDS"),
            &mut self.partition.max_unit_words,
        );
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        fn positive(field: &str, value: u64) -> ConfigResult<()> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("candidates_per_round", self.candidates_per_round as u64)?;
        positive("max_rounds", self.max_rounds as u64)?;
        positive("approval_threshold", self.approval_threshold as u64)?;
        positive("adversarial_sub_rounds", self.adversarial_sub_rounds as u64)?;
        positive("worker_pool_size", self.worker_pool_size as u64)?;
        positive("generation_timeout_ms", self.generation_timeout_ms)?;
        positive("history_token_budget", self.history_token_budget as u64)?;
        positive("partition.max_unit_words", self.partition.max_unit_words as u64)?;

        if !self.history_tokens_per_word.is_finite() || self.history_tokens_per_word <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "history_tokens_per_word".to_string(),
                reason: format!("must be a positive number, got {}", self.history_tokens_per_word),
            });
        }
        if self.propagation_depth_limit != PROPAGATION_DEPTH_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "propagation_depth_limit".to_string(),
                reason: format!(
                    "fixed at {}, got {}",
                    PROPAGATION_DEPTH_LIMIT, self.propagation_depth_limit
                ),
            });
        }
        if self.compression_keep_recent >= self.compression_trigger {
            return Err(ConfigError::InvalidValue {
                field: "compression_keep_recent".to_string(),
                reason: format!(
                    "must be below compression_trigger ({} >= {})",
                    self.compression_keep_recent, self.compression_trigger
                ),
            });
        }
        if self.approval_threshold > self.max_rounds {
            return Err(ConfigError::InvalidValue {
                field: "approval_threshold".to_string(),
                reason: format!(
                    "can never be reached within max_rounds ({} > {})",
                    self.approval_threshold, self.max_rounds
                ),
            });
        }

        self.rotation.validate(&self.predicates)
    }
}
