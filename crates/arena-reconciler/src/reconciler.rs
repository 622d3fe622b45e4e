//! The reconcile loop.
//!
//! Every pass walks the three transitional sets in order (stopping,
//! starting, pending) and then sweeps capacity still held by terminal
//! workloads. A pass keeps no memory of earlier passes: everything it needs
//! is in the store, the allocator and the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use arena_allocator::{Allocator, AllocatorError, PortRequest};
use arena_core::{Catalog, ResourceRequirement};
use arena_orchestrator::{DeleteOptions, Orchestrator, Phase, object_name};
use arena_state::{StateStore, StatusEvent, StatusHub, Workload, WorkloadStatus, epoch_secs};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogSource;
use crate::error::{ReconcileError, ReconcileResult};
use crate::object::{SupervisorEnv, volume_claims, workload_object};

/// CPU and memory reserved for the supervisor sidecar of every workload.
pub const SIDECAR_OVERHEAD: ResourceRequirement = ResourceRequirement {
    cpu_millis: 100,
    memory_bytes: 128 * 1024 * 1024,
};

/// Tunables for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// A workload still `starting` after this long is failed.
    pub startup_timeout: Duration,
    /// A workload `stopping` longer than this is force-deleted.
    pub stop_escalation_after: Duration,
    pub sidecar_overhead: ResourceRequirement,
    pub supervisor: SupervisorEnv,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(300),
            stop_escalation_after: Duration::from_secs(300),
            sidecar_overhead: SIDECAR_OVERHEAD,
            supervisor: SupervisorEnv::default(),
        }
    }
}

/// Counts for one pass.
///
/// `succeeded` counts workloads whose step completed (including waiting on
/// the orchestrator), `failed` counts workloads that errored or were marked
/// failed, and `skipped` counts workloads abandoned because another writer
/// changed their status first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Workloads whose lingering capacity was released by the sweep.
    pub reclaimed: usize,
}

impl PassReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Failed,
    Skipped,
}

/// Drives workloads in `pending`, `starting` and `stopping` forward.
pub struct Reconciler {
    store: StateStore,
    allocator: Allocator,
    orchestrator: Arc<dyn Orchestrator>,
    catalog: Arc<dyn CatalogSource>,
    hub: Option<StatusHub>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        allocator: Allocator,
        orchestrator: Arc<dyn Orchestrator>,
        catalog: Arc<dyn CatalogSource>,
    ) -> Self {
        Self {
            store,
            allocator,
            orchestrator,
            catalog,
            hub: None,
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish committed transitions to `hub`.
    pub fn with_hub(mut self, hub: StatusHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Run one full pass.
    ///
    /// Only a failure to list workloads aborts the pass; per-workload errors
    /// are counted in the report.
    pub async fn reconcile_once(&self) -> ReconcileResult<PassReport> {
        let mut report = PassReport::default();

        for workload in self.store.list_workloads_by_status(&[WorkloadStatus::Stopping])? {
            let outcome = self.reconcile_stopping(&workload).await;
            self.stamp_reconciled(&workload.id);
            report.record(outcome);
        }

        for workload in self.store.list_workloads_by_status(&[WorkloadStatus::Starting])? {
            let outcome = self.reconcile_starting(&workload).await;
            self.stamp_reconciled(&workload.id);
            report.record(outcome);
        }

        let pending = self.store.list_workloads_by_status(&[WorkloadStatus::Pending])?;
        if !pending.is_empty() {
            match self.catalog.load() {
                Ok(catalog) => {
                    for workload in &pending {
                        let outcome = self.reconcile_pending(workload, &catalog).await;
                        self.stamp_reconciled(&workload.id);
                        report.record(outcome);
                    }
                }
                Err(e) => {
                    // An unreadable catalog says nothing about any one workload.
                    error!(error = %e, pending = pending.len(), "failed to load catalog, pending set skipped");
                    report.skipped += pending.len();
                }
            }
        }

        report.reclaimed = self.reclaim()?;

        if report.total() > 0 || report.reclaimed > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                reclaimed = report.reclaimed,
                "reconcile pass complete"
            );
        }
        Ok(report)
    }

    /// Run the reconcile loop until `shutdown` changes.
    ///
    /// A pass in flight when shutdown arrives is allowed to finish.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "reconcile pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    // ── Stopping ───────────────────────────────────────────────────

    async fn reconcile_stopping(&self, workload: &Workload) -> Outcome {
        let name = object_name(&workload.id);
        let object = match self.orchestrator.get_workload(&name).await {
            Ok(object) => object,
            Err(e) => {
                warn!(workload_id = %workload.id, error = %e, "failed to query stopping workload");
                return Outcome::Failed;
            }
        };

        match object {
            None => self.commit(
                workload,
                WorkloadStatus::Stopping,
                WorkloadStatus::Stopped,
                Some("deletion confirmed"),
            ),
            Some(object) if object.status.deleting => {
                debug!(workload_id = %workload.id, "deletion in progress");
                Outcome::Done
            }
            Some(_) => {
                let lingering = workload.secs_in_status(epoch_secs());
                let options = if lingering > self.config.stop_escalation_after.as_secs() {
                    DeleteOptions::force()
                } else {
                    DeleteOptions::graceful()
                };
                match self.orchestrator.delete_workload(&name, options).await {
                    Ok(()) => {
                        if options.force {
                            warn!(workload_id = %workload.id, lingering_secs = lingering, "stop escalated to force delete");
                        } else {
                            debug!(workload_id = %workload.id, "delete re-issued");
                        }
                        Outcome::Done
                    }
                    Err(e) if e.is_not_found() => Outcome::Done,
                    Err(e) => {
                        warn!(workload_id = %workload.id, error = %e, "failed to delete workload object");
                        Outcome::Failed
                    }
                }
            }
        }
    }

    // ── Starting ───────────────────────────────────────────────────

    async fn reconcile_starting(&self, workload: &Workload) -> Outcome {
        let elapsed = workload.secs_in_status(epoch_secs());
        if elapsed > self.config.startup_timeout.as_secs() {
            let message = format!("startup timed out after {elapsed}s");
            return match self.commit(workload, WorkloadStatus::Starting, WorkloadStatus::Failed, Some(&message)) {
                Outcome::Done => Outcome::Failed,
                other => other,
            };
        }

        let object = match self.orchestrator.get_workload(&object_name(&workload.id)).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                debug!(workload_id = %workload.id, "workload object not found yet");
                return Outcome::Done;
            }
            Err(e) => {
                warn!(workload_id = %workload.id, error = %e, "failed to query starting workload");
                return Outcome::Failed;
            }
        };
        if object.status.phase != Phase::Ready {
            debug!(workload_id = %workload.id, phase = %object.status.phase, "workload not ready yet");
            return Outcome::Done;
        }

        let node_ip = match self.allocator.server_ports(&workload.id) {
            Ok(allocations) => allocations.first().map(|a| a.node_ip.clone()),
            Err(e) => {
                warn!(workload_id = %workload.id, error = %e, "failed to read allocations for node ip");
                None
            }
        };
        let pod_ip = object.status.address.clone();

        match self.store.transition_with(
            &workload.id,
            WorkloadStatus::Starting,
            WorkloadStatus::Running,
            None,
            |w| {
                if node_ip.is_some() {
                    w.node_ip = node_ip;
                }
                if pod_ip.is_some() {
                    w.pod_ip = pod_ip;
                }
            },
        ) {
            Ok(Some(committed)) => {
                info!(workload_id = %workload.id, from = %WorkloadStatus::Starting, to = %WorkloadStatus::Running, "transition committed");
                self.publish(&committed);
                Outcome::Done
            }
            Ok(None) => Outcome::Skipped,
            Err(e) => {
                error!(workload_id = %workload.id, error = %e, "transition failed");
                Outcome::Failed
            }
        }
    }

    // ── Pending ────────────────────────────────────────────────────

    async fn reconcile_pending(&self, workload: &Workload, catalog: &Catalog) -> Outcome {
        match self.materialize(workload, catalog).await {
            Ok(()) => self.commit(workload, WorkloadStatus::Pending, WorkloadStatus::Starting, None),
            Err(e) if e.is_terminal() => {
                warn!(workload_id = %workload.id, error = %e, "workload cannot be scheduled");
                let message = e.to_string();
                match self.commit(workload, WorkloadStatus::Pending, WorkloadStatus::Failed, Some(&message)) {
                    Outcome::Done => Outcome::Failed,
                    other => other,
                }
            }
            Err(e) => {
                warn!(workload_id = %workload.id, error = %e, "transient error, will retry next pass");
                Outcome::Failed
            }
        }
    }

    /// Allocate capacity and create the orchestrator resources for a
    /// pending workload. Safe to repeat.
    async fn materialize(&self, workload: &Workload, catalog: &Catalog) -> ReconcileResult<()> {
        let (game, plan) = catalog.lookup(&workload.game, &workload.plan)?;
        let resources = plan.requirement()?;

        let mut allocations = self.allocator.server_ports(&workload.id)?;
        let mut node = self.allocator.assigned_node(&workload.id)?;
        if node.is_none() {
            let requests: Vec<PortRequest> = game.ports.iter().map(PortRequest::from).collect();
            allocations = self.allocator.allocate_ports(
                &workload.id,
                &requests,
                resources.with_overhead(self.config.sidecar_overhead),
            )?;
            node = self.allocator.assigned_node(&workload.id)?;
        }
        let Some(node) = node else {
            return Err(AllocatorError::NoCapacity {
                workload_id: workload.id.clone(),
                reason: "reservation vanished after allocation".to_string(),
            }
            .into());
        };

        for claim in volume_claims(workload, game, plan) {
            match self.orchestrator.create_volume_claim(claim).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let object = workload_object(
            workload,
            game,
            resources,
            &node,
            &allocations,
            &self.config.supervisor,
        )?;
        match self.orchestrator.create_workload(object).await {
            Ok(()) => {
                info!(workload_id = %workload.id, %node, "workload object created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(workload_id = %workload.id, "workload object already exists");
                Ok(())
            }
            Err(e) => Err(ReconcileError::from(e)),
        }
    }

    // ── Reclaim ────────────────────────────────────────────────────

    /// Release capacity still held by terminal or vanished workloads.
    fn reclaim(&self) -> ReconcileResult<usize> {
        let mut holders: Vec<String> = self
            .store
            .list_reservations()?
            .into_iter()
            .map(|r| r.workload_id)
            .chain(self.store.list_allocations()?.into_iter().map(|a| a.workload_id))
            .collect();
        holders.sort();
        holders.dedup();

        let mut reclaimed = 0;
        for id in holders {
            let lingering = match self.store.get_workload(&id)? {
                Some(workload) => workload.status.is_terminal(),
                None => true,
            };
            if lingering {
                self.allocator.release(&id).map_err(ReconcileError::from)?;
                info!(workload_id = %id, "reclaimed capacity from terminal workload");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn commit(
        &self,
        workload: &Workload,
        from: WorkloadStatus,
        to: WorkloadStatus,
        message: Option<&str>,
    ) -> Outcome {
        match self.store.transition_with(&workload.id, from, to, message, |_| {}) {
            Ok(Some(committed)) => {
                info!(workload_id = %workload.id, %from, %to, "transition committed");
                self.publish(&committed);
                Outcome::Done
            }
            Ok(None) => {
                debug!(workload_id = %workload.id, %from, %to, "status changed concurrently, abandoned");
                Outcome::Skipped
            }
            Err(e) => {
                error!(workload_id = %workload.id, %from, %to, error = %e, "transition failed");
                Outcome::Failed
            }
        }
    }

    /// Record that this pass looked at the workload. Does not move
    /// `updated_at`, so startup and stop timers keep running.
    fn stamp_reconciled(&self, id: &str) {
        if let Err(e) = self.store.touch_reconciled(id, epoch_secs()) {
            error!(workload_id = %id, error = %e, "failed to stamp last_reconciled");
        }
    }

    fn publish(&self, workload: &Workload) {
        if let Some(hub) = &self.hub {
            hub.publish(
                &workload.user_id,
                StatusEvent {
                    server_id: workload.id.clone(),
                    status: workload.status,
                    message: workload.status_message.clone(),
                    timestamp: workload.updated_at,
                },
            );
        }
    }
}
