//! arena-reconciler: the polling half of the Arena control plane.
//!
//! On a fixed interval the [`Reconciler`] converges workloads in
//! `pending`, `starting` and `stopping` toward their next state:
//!
//! ```text
//! Reconciler pass
//!   ├── stopping → confirm deletion (stopped) or re-issue / escalate delete
//!   ├── starting → fail on startup timeout, promote to running when ready
//!   ├── pending  → catalog lookup, allocate, volume claims, workload object
//!   └── sweep    → release capacity held by terminal workloads
//! ```
//!
//! It races with the watcher and the failure detector on the same
//! transitions; every status change is a compare-and-swap in the store, so
//! whichever writer comes second observes a no-op.

pub mod catalog;
pub mod error;
pub mod object;
pub mod reconciler;

pub use catalog::{CatalogSource, FileCatalog, StaticCatalog};
pub use error::{ReconcileError, ReconcileResult};
pub use object::{SupervisorEnv, volume_claims, workload_object};
pub use reconciler::{PassReport, Reconciler, ReconcilerConfig, SIDECAR_OVERHEAD};
