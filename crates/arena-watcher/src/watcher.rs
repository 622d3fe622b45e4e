//! Change-feed consumer.

use std::sync::Arc;
use std::time::Duration;

use arena_orchestrator::{Orchestrator, Phase, WatchEvent, WorkloadObject, parse_object_name};
use arena_state::{StateStore, StatusEvent, StatusHub, Workload, WorkloadStatus};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const RESUBSCRIBE_INITIAL: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// What handling one notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The notification carried nothing to act on.
    Ignored,
    /// A transition applied but another writer had already moved the workload.
    NoOp,
    Transitioned {
        from: WorkloadStatus,
        to: WorkloadStatus,
    },
}

/// Mirrors orchestrator-reported phases into the store.
pub struct Watcher {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    hub: Option<StatusHub>,
}

impl Watcher {
    pub fn new(store: StateStore, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            hub: None,
        }
    }

    /// Publish committed transitions to `hub`.
    pub fn with_hub(mut self, hub: StatusHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Consume the change feed until `shutdown` changes.
    ///
    /// If the feed ends or cannot be opened the watcher re-subscribes with a
    /// capped exponential backoff; the fresh listing replays current state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("watcher started");
        let mut backoff = RESUBSCRIBE_INITIAL;

        loop {
            match self.orchestrator.watch().await {
                Ok(rx) => {
                    backoff = RESUBSCRIBE_INITIAL;
                    if self.consume(rx, &mut shutdown).await {
                        break;
                    }
                    warn!("change feed closed, re-subscribing");
                }
                Err(e) => {
                    warn!(error = %e, retry_in_secs = backoff.as_secs(), "failed to open change feed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
        }
        info!("watcher shutting down");
    }

    /// Drain one subscription. Returns true if shutdown was requested.
    async fn consume(
        &self,
        mut rx: mpsc::UnboundedReceiver<WatchEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut synced = false;
        let mut backlog: Vec<WatchEvent> = Vec::new();

        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = shutdown.changed() => return true,
            };
            let Some(event) = event else {
                return false;
            };

            if synced {
                self.handle_event(&event);
            } else if event == WatchEvent::Synced {
                synced = true;
                debug!(backlog = backlog.len(), "change feed synced");
                for event in backlog.drain(..) {
                    self.handle_event(&event);
                }
            } else {
                backlog.push(event);
            }
        }
    }

    /// Apply one notification.
    pub fn handle_event(&self, event: &WatchEvent) -> EventOutcome {
        match event {
            WatchEvent::Added(object) => self.apply_phase(object),
            WatchEvent::Modified { old, new } => {
                if old.status.phase == new.status.phase {
                    return EventOutcome::Ignored;
                }
                self.apply_phase(new)
            }
            WatchEvent::Deleted(object) => self.apply_delete(&object.name),
            WatchEvent::DeletedFinalStateUnknown { name, .. } => self.apply_delete(name),
            WatchEvent::Synced => EventOutcome::Ignored,
        }
    }

    fn apply_phase(&self, object: &WorkloadObject) -> EventOutcome {
        let Some(workload) = self.lookup(&object.name) else {
            return EventOutcome::Ignored;
        };

        match &object.status.phase {
            Phase::Creating | Phase::Starting | Phase::Scheduled | Phase::RequestReady => {
                self.commit(&workload, WorkloadStatus::Pending, WorkloadStatus::Starting, |_| {})
            }
            Phase::Ready => {
                let pod_ip = object.status.address.clone();
                let node_ip = match self.store.allocations_for(&workload.id) {
                    Ok(allocations) => allocations.first().map(|a| a.node_ip.clone()),
                    Err(e) => {
                        warn!(workload_id = %workload.id, error = %e, "failed to read allocations for node ip");
                        None
                    }
                };
                self.commit(&workload, WorkloadStatus::Starting, WorkloadStatus::Running, |w| {
                    if pod_ip.is_some() {
                        w.pod_ip = pod_ip;
                    }
                    if node_ip.is_some() {
                        w.node_ip = node_ip;
                    }
                })
            }
            Phase::Shutdown => {
                self.commit(&workload, WorkloadStatus::Running, WorkloadStatus::Stopping, |_| {})
            }
            other => {
                debug!(workload_id = %workload.id, phase = %other, "phase not mapped");
                EventOutcome::Ignored
            }
        }
    }

    fn apply_delete(&self, name: &str) -> EventOutcome {
        let Some(workload) = self.lookup(name) else {
            return EventOutcome::Ignored;
        };
        if workload.status != WorkloadStatus::Stopping {
            // Deletions Arena did not start are left for operators.
            warn!(workload_id = %workload.id, status = %workload.status, "object deleted outside a stop");
        }
        self.commit(&workload, WorkloadStatus::Stopping, WorkloadStatus::Stopped, |_| {})
    }

    fn lookup(&self, name: &str) -> Option<Workload> {
        let Some(id) = parse_object_name(name) else {
            debug!(object = %name, "not an arena object");
            return None;
        };
        match self.store.get_workload(id) {
            Ok(Some(workload)) => Some(workload),
            Ok(None) => {
                debug!(workload_id = %id, "no workload for object");
                None
            }
            Err(e) => {
                error!(workload_id = %id, error = %e, "failed to load workload");
                None
            }
        }
    }

    fn commit<F>(
        &self,
        workload: &Workload,
        from: WorkloadStatus,
        to: WorkloadStatus,
        mutate: F,
    ) -> EventOutcome
    where
        F: FnOnce(&mut Workload),
    {
        match self.store.transition_with(&workload.id, from, to, None, mutate) {
            Ok(Some(committed)) => {
                info!(workload_id = %workload.id, %from, %to, "transition committed");
                if let Some(hub) = &self.hub {
                    hub.publish(
                        &committed.user_id,
                        StatusEvent {
                            server_id: committed.id.clone(),
                            status: committed.status,
                            message: committed.status_message.clone(),
                            timestamp: committed.updated_at,
                        },
                    );
                }
                EventOutcome::Transitioned { from, to }
            }
            Ok(None) => {
                debug!(workload_id = %workload.id, %from, %to, "transition not applicable");
                EventOutcome::NoOp
            }
            Err(e) => {
                error!(workload_id = %workload.id, %from, %to, error = %e, "transition failed");
                EventOutcome::NoOp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::ResourceRequirement;
    use arena_orchestrator::{
        DeleteOptions, HealthCheckSpec, MemoryOrchestrator, WorkloadObjectStatus, WorkloadSpec,
        object_name, workload_selector,
    };
    use std::collections::BTreeMap;

    fn object(id: &str, phase: Phase, address: Option<&str>) -> WorkloadObject {
        WorkloadObject {
            name: object_name(id),
            labels: workload_selector(id),
            spec: WorkloadSpec {
                node_name: "node-1".to_string(),
                image: "img".to_string(),
                ports: Vec::new(),
                volumes: Vec::new(),
                env: BTreeMap::new(),
                resources: ResourceRequirement::default(),
                health: HealthCheckSpec {
                    path: "/readyz".to_string(),
                    port: 9090,
                    initial_delay_secs: 0,
                    period_secs: 10,
                },
            },
            status: WorkloadObjectStatus {
                phase,
                address: address.map(str::to_string),
                deleting: false,
            },
        }
    }

    fn setup(id: &str, status: WorkloadStatus) -> (StateStore, Arc<MemoryOrchestrator>, Watcher) {
        let store = StateStore::open_in_memory().unwrap();
        let mut w = Workload::new(id, "user-1", "minecraft", "small", 1000);
        w.status = status;
        store.insert_workload(&w).unwrap();
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let watcher = Watcher::new(store.clone(), orchestrator.clone());
        (store, orchestrator, watcher)
    }

    fn status(store: &StateStore, id: &str) -> WorkloadStatus {
        store.get_workload(id).unwrap().unwrap().status
    }

    #[test]
    fn ready_promotes_starting_and_records_address() {
        let (store, _, watcher) = setup("w1", WorkloadStatus::Starting);
        let event = WatchEvent::Modified {
            old: object("w1", Phase::Scheduled, None),
            new: object("w1", Phase::Ready, Some("10.0.0.5")),
        };

        let outcome = watcher.handle_event(&event);

        assert_eq!(
            outcome,
            EventOutcome::Transitioned {
                from: WorkloadStatus::Starting,
                to: WorkloadStatus::Running
            }
        );
        let w = store.get_workload("w1").unwrap().unwrap();
        assert_eq!(w.pod_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn early_phases_move_pending_to_starting() {
        for phase in [Phase::Creating, Phase::Starting, Phase::Scheduled, Phase::RequestReady] {
            let (store, _, watcher) = setup("w1", WorkloadStatus::Pending);
            watcher.handle_event(&WatchEvent::Added(object("w1", phase, None)));
            assert_eq!(status(&store, "w1"), WorkloadStatus::Starting);
        }
    }

    #[test]
    fn shutdown_moves_running_to_stopping() {
        let (store, _, watcher) = setup("w1", WorkloadStatus::Running);
        watcher.handle_event(&WatchEvent::Modified {
            old: object("w1", Phase::Ready, None),
            new: object("w1", Phase::Shutdown, None),
        });
        assert_eq!(status(&store, "w1"), WorkloadStatus::Stopping);
    }

    #[test]
    fn unchanged_phase_is_skipped() {
        let (store, _, watcher) = setup("w1", WorkloadStatus::Starting);
        let outcome = watcher.handle_event(&WatchEvent::Modified {
            old: object("w1", Phase::Ready, None),
            new: object("w1", Phase::Ready, Some("10.0.0.5")),
        });
        assert_eq!(outcome, EventOutcome::Ignored);
        assert_eq!(status(&store, "w1"), WorkloadStatus::Starting);
    }

    #[test]
    fn foreign_and_unknown_objects_are_ignored() {
        let (_, _, watcher) = setup("w1", WorkloadStatus::Starting);
        let mut foreign = object("w1", Phase::Ready, None);
        foreign.name = "proxy-abc".to_string();

        assert_eq!(watcher.handle_event(&WatchEvent::Added(foreign)), EventOutcome::Ignored);
        assert_eq!(
            watcher.handle_event(&WatchEvent::Added(object("ghost", Phase::Ready, None))),
            EventOutcome::Ignored
        );
        assert_eq!(
            watcher.handle_event(&WatchEvent::Added(object("w1", Phase::Other("Allocated".into()), None))),
            EventOutcome::Ignored
        );
    }

    #[test]
    fn stale_phase_is_a_noop() {
        let (store, _, watcher) = setup("w1", WorkloadStatus::Running);
        let outcome = watcher.handle_event(&WatchEvent::Added(object("w1", Phase::Scheduled, None)));
        assert_eq!(outcome, EventOutcome::NoOp);
        assert_eq!(status(&store, "w1"), WorkloadStatus::Running);
    }

    #[test]
    fn delete_and_tombstone_confirm_stop() {
        let (store, _, watcher) = setup("w1", WorkloadStatus::Stopping);
        watcher.handle_event(&WatchEvent::DeletedFinalStateUnknown {
            name: object_name("w1"),
            last_known: None,
        });
        let w = store.get_workload("w1").unwrap().unwrap();
        assert_eq!(w.status, WorkloadStatus::Stopped);
        assert!(w.stopped_at.is_some());
    }

    #[test]
    fn unsolicited_delete_is_not_reconciled() {
        let (store, _, watcher) = setup("w1", WorkloadStatus::Running);
        let outcome = watcher.handle_event(&WatchEvent::Deleted(object("w1", Phase::Ready, None)));
        assert_eq!(outcome, EventOutcome::NoOp);
        assert_eq!(status(&store, "w1"), WorkloadStatus::Running);
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let (_, _, watcher) = setup("w1", WorkloadStatus::Starting);
        let hub = StatusHub::default();
        let mut rx = hub.subscribe("user-1");
        let watcher = watcher.with_hub(hub);

        watcher.handle_event(&WatchEvent::Added(object("w1", Phase::Ready, Some("10.0.0.5"))));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, WorkloadStatus::Running);
    }

    #[tokio::test]
    async fn run_replays_listing_then_follows_live_events() {
        let (store, orchestrator, watcher) = setup("w1", WorkloadStatus::Starting);
        orchestrator
            .create_workload(object("w1", Phase::Creating, None))
            .await
            .unwrap();
        orchestrator.set_phase("server-w1", Phase::Ready, Some("10.0.0.5"));

        let (tx, rx) = watch::channel(false);
        let watcher = Arc::new(watcher);
        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.run(rx).await }
        });

        wait_for(&store, "w1", WorkloadStatus::Running).await;

        orchestrator.set_phase("server-w1", Phase::Shutdown, None);
        wait_for(&store, "w1", WorkloadStatus::Stopping).await;

        orchestrator
            .delete_workload("server-w1", DeleteOptions::force())
            .await
            .unwrap();
        wait_for(&store, "w1", WorkloadStatus::Stopped).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_for(store: &StateStore, id: &str, want: WorkloadStatus) {
        for _ in 0..200 {
            if status(store, id) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workload {id} never reached {want}");
    }
}
