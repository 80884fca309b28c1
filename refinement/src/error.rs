//! Top-level orchestrator errors.
//!
//! Only configuration errors and gate failures end a run early in normal
//! operation; the remaining variants guard programming errors and I/O.

use thiserror::Error;

use crate::config::ConfigError;
use crate::gate::GateFailure;
use crate::scheduler::SchedulerError;
use crate::unit::UnitId;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Gate(#[from] GateFailure),

    #[error("units not terminal at gate time: {}", .0.join(", "))]
    NotTerminal(Vec<UnitId>),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("unit task failed: {0}")]
    Join(String),

    #[error("worker pool closed")]
    PoolClosed,

    #[error("content store error: {0:#}")]
    Store(anyhow::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
