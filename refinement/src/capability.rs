//! Generation/verification capability seam.
//!
//! The orchestrator never writes or judges text itself. It hands a
//! [`GenerationRequest`] to an injected [`RefinementCapability`] and scores
//! the returned candidates through the same capability's `verify`. The
//! default `verify` runs the rule-based [`ChecklistVerifier`].
//!
//! [`ScriptedCapability`] is a deterministic implementation driven by
//! closures, used by the test suite and by dry runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::{ChecklistVerifier, PredicateRegistry, PredicateResult, ReferenceFacts, Stage, StageKind};
use crate::unit::UnitId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("generation timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("capability failure: {0}")]
    Failure(String),
}

/// Everything a capability sees when asked for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub unit_id: UnitId,
    pub unit_title: String,
    /// Current unit content (read-only for the capability).
    pub content: String,
    pub stage: StageKind,
    pub instruction: String,
    /// New material the previous stage's winner introduced.
    pub carry_over: String,
    /// 0-based candidate slot within the round.
    pub candidate_index: usize,
    pub round_index: u32,
    /// Digests of finalized dependencies.
    pub context_header: String,
    pub reference_facts: ReferenceFacts,
}

impl GenerationRequest {
    /// Prompt text for completion-style backends.
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!(
            "Stage: {} (round {})\n{}\n\n",
            self.stage, self.round_index, self.instruction
        );
        if !self.context_header.is_empty() {
            prompt.push_str(&format!("Context from finished sections:\n{}\n\n", self.context_header));
        }
        if !self.reference_facts.is_empty() {
            prompt.push_str("Reference facts (keep these values):\n");
            for (key, value) in &self.reference_facts {
                prompt.push_str(&format!("- [[{}: {}]]\n", key, value));
            }
            prompt.push('\n');
        }
        if !self.carry_over.is_empty() {
            prompt.push_str(&format!("Carried over from the previous stage:\n{}\n\n", self.carry_over));
        }
        prompt.push_str(&format!(
            "Section '{}':\n{}\n\nReturn only the revised section text.",
            self.unit_title, self.content
        ));
        prompt
    }
}

#[async_trait]
pub trait RefinementCapability: Send + Sync {
    /// Produce one candidate text.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError>;

    /// Evaluate a candidate against the stage checklist.
    async fn verify(
        &self,
        text: &str,
        stage: &Stage,
        registry: &PredicateRegistry,
        facts: &ReferenceFacts,
    ) -> Result<Vec<PredicateResult>, CapabilityError> {
        Ok(ChecklistVerifier::new().verify(text, &stage.checklist, registry, facts))
    }
}

type GenerateFn = dyn Fn(&GenerationRequest) -> Result<String, CapabilityError> + Send + Sync;
type VerifyFn = dyn Fn(&str, &Stage, &PredicateRegistry, &ReferenceFacts) -> Result<Vec<PredicateResult>, CapabilityError>
    + Send
    + Sync;

/// Deterministic capability driven by closures.
pub struct ScriptedCapability {
    generate_fn: Arc<GenerateFn>,
    verify_fn: Option<Arc<VerifyFn>>,
    delay: Option<Duration>,
    generate_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl ScriptedCapability {
    /// Generate with an arbitrary closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<String, CapabilityError> + Send + Sync + 'static,
    {
        Self {
            generate_fn: Arc::new(f),
            verify_fn: None,
            delay: None,
            generate_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }

    /// Return the unit content unchanged.
    pub fn echo() -> Self {
        Self::from_fn(|req| Ok(req.content.clone()))
    }

    /// Always fail generation.
    pub fn failing() -> Self {
        Self::from_fn(|_| Err(CapabilityError::Failure("simulated failure".to_string())))
    }

    /// Replace the rule-based verification with a closure.
    pub fn with_verify_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Stage, &PredicateRegistry, &ReferenceFacts) -> Result<Vec<PredicateResult>, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        self.verify_fn = Some(Arc::new(f));
        self
    }

    /// Sleep before every generation (exercises timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedCapability {
    fn default() -> Self {
        Self::echo()
    }
}

#[async_trait]
impl RefinementCapability for ScriptedCapability {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.generate_fn)(request)
    }

    async fn verify(
        &self,
        text: &str,
        stage: &Stage,
        registry: &PredicateRegistry,
        facts: &ReferenceFacts,
    ) -> Result<Vec<PredicateResult>, CapabilityError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        match &self.verify_fn {
            Some(f) => f(text, stage, registry, facts),
            None => Ok(ChecklistVerifier::new().verify(text, &stage.checklist, registry, facts)),
        }
    }
}
