//! In-memory orchestrator backend.
//!
//! [`MemoryOrchestrator`] keeps workload objects, volume claims and pods in
//! process memory and broadcasts changes to every open watch stream.
//!
//! Two modes:
//!
//! - **manual** ([`MemoryOrchestrator::new`]): objects stay where they are
//!   until the caller drives them with [`set_phase`](MemoryOrchestrator::set_phase),
//!   [`finish_deletion`](MemoryOrchestrator::finish_deletion) and friends.
//!   Used by tests to stage exact orchestrator behavior.
//! - **auto** ([`MemoryOrchestrator::auto`]): created objects walk straight to
//!   `Ready` with a synthetic address and a running pod, and deletions
//!   complete at once. Used by the daemon's local mode.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::*;
use crate::Orchestrator;

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, WorkloadObject>,
    claims: BTreeMap<String, VolumeClaim>,
    pods: BTreeMap<String, Pod>,
    watchers: Vec<mpsc::UnboundedSender<WatchEvent>>,
    deletes: Vec<(String, DeleteOptions)>,
    create_calls: usize,
    unavailable: bool,
    next_address: u32,
}

impl MemoryState {
    fn emit(&mut self, event: WatchEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn check_available(&self) -> OrchestratorResult<()> {
        if self.unavailable {
            Err(OrchestratorError::Unavailable(
                "memory orchestrator marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn update_object(&mut self, name: &str, f: impl FnOnce(&mut WorkloadObject)) -> bool {
        let Some(object) = self.objects.get_mut(name) else {
            return false;
        };
        let old = object.clone();
        f(object);
        let new = object.clone();
        self.emit(WatchEvent::Modified { old, new });
        true
    }

    fn remove_object(&mut self, name: &str) -> bool {
        let Some(object) = self.objects.remove(name) else {
            return false;
        };
        self.pods.remove(name);
        self.emit(WatchEvent::Deleted(object));
        true
    }

    fn allocate_address(&mut self) -> String {
        self.next_address += 1;
        let n = self.next_address;
        format!("10.88.{}.{}", (n >> 8) & 0xff, n & 0xff)
    }
}

#[derive(Debug, Default)]
pub struct MemoryOrchestrator {
    state: Mutex<MemoryState>,
    auto_progress: bool,
}

impl MemoryOrchestrator {
    /// A backend that only changes when driven by the caller.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that brings created objects to `Ready` on its own.
    pub fn auto() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            auto_progress: true,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Controls ───────────────────────────────────────────────────

    /// Report a new phase (and optionally an address) for an object.
    pub fn set_phase(&self, name: &str, phase: Phase, address: Option<&str>) -> bool {
        self.state().update_object(name, |object| {
            object.status.phase = phase;
            if let Some(address) = address {
                object.status.address = Some(address.to_string());
            }
        })
    }

    /// Complete a pending deletion.
    pub fn finish_deletion(&self, name: &str) -> bool {
        self.state().remove_object(name)
    }

    /// Push a raw event to every watcher.
    pub fn emit(&self, event: WatchEvent) {
        self.state().emit(event);
    }

    /// Insert or replace a pod.
    pub fn set_pod(&self, pod: Pod) {
        self.state().pods.insert(pod.name.clone(), pod);
    }

    pub fn remove_pod(&self, name: &str) -> bool {
        self.state().pods.remove(name).is_some()
    }

    /// Make every API call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn object(&self, name: &str) -> Option<WorkloadObject> {
        self.state().objects.get(name).cloned()
    }

    pub fn objects(&self) -> Vec<WorkloadObject> {
        self.state().objects.values().cloned().collect()
    }

    pub fn claims(&self) -> Vec<VolumeClaim> {
        self.state().claims.values().cloned().collect()
    }

    /// Every delete request received, in order.
    pub fn delete_requests(&self) -> Vec<(String, DeleteOptions)> {
        self.state().deletes.clone()
    }

    /// Number of create calls received, including ones that found the object.
    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn get_workload(&self, name: &str) -> OrchestratorResult<Option<WorkloadObject>> {
        let state = self.state();
        state.check_available()?;
        Ok(state.objects.get(name).cloned())
    }

    async fn create_workload(&self, mut object: WorkloadObject) -> OrchestratorResult<()> {
        let mut state = self.state();
        state.check_available()?;
        state.create_calls += 1;
        if state.objects.contains_key(&object.name) {
            return Err(OrchestratorError::AlreadyExists(object.name));
        }

        object.status = WorkloadObjectStatus::default();
        let name = object.name.clone();
        state.objects.insert(name.clone(), object.clone());
        state.emit(WatchEvent::Added(object.clone()));
        debug!(object = %name, node = %object.spec.node_name, "workload object created");

        if self.auto_progress {
            let address = state.allocate_address();
            state.update_object(&name, |o| o.status.phase = Phase::Scheduled);
            state.update_object(&name, |o| {
                o.status.phase = Phase::Ready;
                o.status.address = Some(address.clone());
            });
            state.pods.insert(
                name.clone(),
                Pod {
                    name: name.clone(),
                    labels: object.labels.clone(),
                    phase: PodPhase::Running,
                    pod_ip: Some(address),
                    containers: vec![ContainerStatus {
                        name: SUPERVISOR_CONTAINER.to_string(),
                        ..ContainerStatus::default()
                    }],
                    init_containers: Vec::new(),
                },
            );
        }
        Ok(())
    }

    async fn delete_workload(&self, name: &str, options: DeleteOptions) -> OrchestratorResult<()> {
        let mut state = self.state();
        state.check_available()?;
        state.deletes.push((name.to_string(), options));
        if !state.objects.contains_key(name) {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }

        if options.force || self.auto_progress {
            state.remove_object(name);
            debug!(object = %name, force = options.force, "workload object deleted");
        } else {
            let already = state
                .objects
                .get(name)
                .is_some_and(|o| o.status.deleting);
            if !already {
                state.update_object(name, |o| o.status.deleting = true);
            }
            debug!(object = %name, "workload object deletion requested");
        }
        Ok(())
    }

    async fn create_volume_claim(&self, claim: VolumeClaim) -> OrchestratorResult<()> {
        let mut state = self.state();
        state.check_available()?;
        if state.claims.contains_key(&claim.name) {
            return Err(OrchestratorError::AlreadyExists(claim.name));
        }
        trace!(claim = %claim.name, "volume claim created");
        state.claims.insert(claim.name.clone(), claim);
        Ok(())
    }

    async fn list_pods(&self, selector: &Labels) -> OrchestratorResult<Vec<Pod>> {
        let state = self.state();
        state.check_available()?;
        Ok(state
            .pods
            .values()
            .filter(|pod| selector_matches(selector, &pod.labels))
            .cloned()
            .collect())
    }

    async fn watch(&self) -> OrchestratorResult<mpsc::UnboundedReceiver<WatchEvent>> {
        let mut state = self.state();
        state.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        for object in state.objects.values() {
            // The receiver is still in hand; this cannot fail.
            let _ = tx.send(WatchEvent::Added(object.clone()));
        }
        let _ = tx.send(WatchEvent::Synced);
        state.watchers.push(tx);
        Ok(rx)
    }
}
