//! arena-supervisor: per-workload process supervisor.
//!
//! Runs inside the game server's container and owns exactly one OS
//! process: starts it, health-checks it, stops it with signal escalation
//! and reports status and heartbeats to the control plane's internal API.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   ├── ManagedProcess (process group, stdout/stderr → tracing)
//!   ├── startup health check (none | port | log-pattern)
//!   ├── health monitor loop (HealthTracker, unhealthy callback)
//!   ├── heartbeat loop (/proc VmRSS + CPU)
//!   └── Reporter (HTTP, retried status reports)
//! ```
//!
//! Reports are informational: the control plane records them but does not
//! drive workload status from them.

pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod process;
pub mod reporter;
pub mod server;
pub mod supervisor;

pub use config::{HealthSettings, SupervisorConfig};
pub use error::{SupervisorError, SupervisorResult};
pub use health::{HealthTracker, ProbeResult};
pub use process::{ExitInfo, ManagedProcess, ProcessState};
pub use reporter::{HttpReporter, MemoryReporter, Reporter, RetryPolicy};
pub use supervisor::{
    REPORT_DEADLINE, StartOutcome, StatusSnapshot, Supervisor, UnhealthyCallback,
};
