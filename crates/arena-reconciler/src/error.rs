//! Reconciler error types.

use arena_allocator::AllocatorError;
use arena_core::ConfigError;
use arena_orchestrator::OrchestratorError;
use arena_state::StateError;
use thiserror::Error;

/// Errors that can occur while reconciling one workload.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ReconcileError {
    /// Whether retrying on a later pass cannot help.
    ///
    /// Config and capacity errors are terminal; orchestrator and store
    /// errors are retried.
    pub fn is_terminal(&self) -> bool {
        match self {
            ReconcileError::Config(_) => true,
            ReconcileError::Allocator(AllocatorError::State(_)) => false,
            ReconcileError::Allocator(_) => true,
            ReconcileError::Orchestrator(_) | ReconcileError::State(_) => false,
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
