//! arena-orchestrator: the client seam between Arena and the container
//! orchestrator.
//!
//! This crate provides:
//!
//! - [`Orchestrator`]: the operations the control plane issues against the
//!   orchestrator (workload objects, volume claims, pod status, change feed)
//! - [`types`]: the object model and the `server-<id>` naming convention
//! - [`MemoryOrchestrator`]: an in-process backend for tests and local runs
//!
//! All mutating operations are idempotent from the caller's point of view:
//! creating an object that exists yields [`OrchestratorError::AlreadyExists`]
//! and deleting one that is gone yields [`OrchestratorError::NotFound`], both
//! of which callers treat as success.

pub mod error;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::{OrchestratorError, OrchestratorResult};
pub use memory::MemoryOrchestrator;
pub use types::*;

/// Operations against the orchestrator's API.
///
/// Implementations must be `Send + Sync`; the reconciler, watcher and
/// failure detector share one instance.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fetch a workload object by name.
    async fn get_workload(&self, name: &str) -> OrchestratorResult<Option<WorkloadObject>>;

    /// Create a workload object.
    async fn create_workload(&self, object: WorkloadObject) -> OrchestratorResult<()>;

    /// Request deletion of a workload object.
    async fn delete_workload(&self, name: &str, options: DeleteOptions) -> OrchestratorResult<()>;

    /// Create a persistent volume claim.
    async fn create_volume_claim(&self, claim: VolumeClaim) -> OrchestratorResult<()>;

    /// List pods whose labels match `selector`.
    async fn list_pods(&self, selector: &Labels) -> OrchestratorResult<Vec<Pod>>;

    /// Subscribe to the workload-object change feed.
    ///
    /// The stream opens with one `Added` per existing object followed by
    /// [`WatchEvent::Synced`], then carries live changes.
    async fn watch(&self) -> OrchestratorResult<mpsc::UnboundedReceiver<WatchEvent>>;
}
