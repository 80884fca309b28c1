//! Iterative refinement orchestrator.
//!
//! Improves a long structured document by splitting it into units and
//! refining each one through bounded rounds of candidate generation and
//! checklist verification until it reaches an explicit acceptance status.
//!
//! # Components
//!
//! - [`partition`]: splits a document into units, scores complexity and
//!   orders units so fact definers run before their referencers.
//! - [`candidate`]: one round on one unit: K candidates, verification,
//!   winner selection and carry-over.
//! - [`scheduler`]: rotates review stages per round and drives a unit to a
//!   terminal status.
//! - [`acceptance`]: per-unit acceptance state machine.
//! - [`history`]: append-only round log with compression and a token budget.
//! - [`propagation`]: fact index and depth-limited cross-unit propagation.
//! - [`gate`]: risk classification and the final assembly gate.
//! - [`orchestrator`]: the run driver tying everything together.
//!
//! Generation and verification sit behind [`capability::RefinementCapability`];
//! document I/O sits behind [`store::ContentStore`].

pub mod acceptance;
pub mod candidate;
pub mod capability;
pub mod config;
pub mod error;
pub mod gate;
pub mod history;
pub mod orchestrator;
pub mod partition;
pub mod propagation;
pub mod record;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod unit;

pub use acceptance::{AcceptanceState, AcceptanceStatus, OpenQuery, TransitionError};
pub use capability::{CapabilityError, GenerationRequest, RefinementCapability, ScriptedCapability};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult};
pub use gate::{GateFailure, QualityGate, RiskLevel, RiskReport};
pub use history::{HistoryEntry, HistoryLog};
pub use orchestrator::{FinalDocument, RefinementOrchestrator, RunOutcome, RunReport, UnitSummary};
pub use partition::{Partition, PartitionError, PartitionRules, UnitPartitioner};
pub use propagation::{PropagationEngine, PropagationEvent, UnresolvedCrossReference};
pub use record::{Issue, RoundRecord, Verdict};
pub use stage::{Severity, Stage, StageKind, StageRotation};
pub use store::{ContentStore, MemoryStore};
pub use unit::{Unit, UnitId};
