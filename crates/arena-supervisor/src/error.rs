//! Supervisor error types.

use arena_core::ConfigError;
use thiserror::Error;

use crate::process::ProcessState;

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ProcessState,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("process exited during startup: {0}")]
    StartupExit(String),

    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("report rejected with HTTP {0}")]
    ReportStatus(http::StatusCode),

    #[error("report failed: {0}")]
    Report(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
