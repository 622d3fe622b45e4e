//! Failure detector: polls container status for signals the phase hides.

use std::sync::Arc;
use std::time::Duration;

use arena_orchestrator::{
    ContainerStatus, Orchestrator, Pod, PodPhase, SUPERVISOR_CONTAINER, workload_selector,
};
use arena_state::{StateResult, StateStore, StatusEvent, StatusHub, Workload, WorkloadStatus, epoch_secs};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CRASH_LOOP_THRESHOLD: u32 = 5;

const OOM_REASON: &str = "OOMKilled";

/// Wait reasons that mean the container will not come up on its own.
const BAD_WAIT_REASONS: &[&str] = &["CrashLoopBackOff", "ImagePullBackOff", "ErrImagePull"];

/// Wait reasons checked on init containers.
const IMAGE_PULL_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull"];

/// Counts for one detection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub inspected: usize,
    /// Workloads this pass moved to `failed`.
    pub failed: usize,
    /// Workloads whose pod could not be found or listed.
    pub skipped: usize,
}

pub struct Detector {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    hub: Option<StatusHub>,
    crash_loop_threshold: u32,
}

impl Detector {
    pub fn new(store: StateStore, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            hub: None,
            crash_loop_threshold: DEFAULT_CRASH_LOOP_THRESHOLD,
        }
    }

    /// Restart count at which a workload counts as crash-looping.
    pub fn with_crash_loop_threshold(mut self, threshold: u32) -> Self {
        self.crash_loop_threshold = threshold.max(1);
        self
    }

    pub fn with_hub(mut self, hub: StatusHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Inspect every `running` and `starting` workload once.
    pub async fn detect_once(&self) -> StateResult<DetectionReport> {
        let workloads = self
            .store
            .list_workloads_by_status(&[WorkloadStatus::Running, WorkloadStatus::Starting])?;
        let mut report = DetectionReport::default();

        for workload in &workloads {
            report.inspected += 1;
            let pods = match self.orchestrator.list_pods(&workload_selector(&workload.id)).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(workload_id = %workload.id, error = %e, "failed to list pods");
                    report.skipped += 1;
                    continue;
                }
            };
            let Some(pod) = pods.first() else {
                debug!(workload_id = %workload.id, "no pod found, skipping");
                report.skipped += 1;
                continue;
            };
            if self.inspect(workload, pod) {
                report.failed += 1;
            }
        }

        if report.failed > 0 {
            info!(
                inspected = report.inspected,
                failed = report.failed,
                skipped = report.skipped,
                "failure detection pass complete"
            );
        }
        Ok(report)
    }

    /// Run the detector loop until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "failure detector started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.detect_once().await {
                        error!(error = %e, "failure detection pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("failure detector shutting down");
                    break;
                }
            }
        }
    }

    /// Apply the detection rules to one pod. Returns true once a rule fails
    /// the workload; later rules are not evaluated.
    fn inspect(&self, workload: &Workload, pod: &Pod) -> bool {
        let supervisor = pod.containers.iter().find(|c| c.name == SUPERVISOR_CONTAINER);

        if let Some(container) = supervisor
            && (self.check_crash_loop(workload, container)
                || self.check_oom(workload, container)
                || self.check_waiting(workload, container, BAD_WAIT_REASONS))
        {
            return true;
        }

        for init in &pod.init_containers {
            if self.check_waiting(workload, init, IMAGE_PULL_REASONS) {
                return true;
            }
        }

        if pod.phase == PodPhase::Failed {
            let message = "pod failed";
            return self.fail(workload, WorkloadStatus::Running, message)
                || self.fail(workload, WorkloadStatus::Starting, message);
        }
        false
    }

    fn check_crash_loop(&self, workload: &Workload, container: &ContainerStatus) -> bool {
        if container.restart_count > workload.restart_count {
            let now = epoch_secs();
            let restarts = container.restart_count;
            if let Err(e) = self.store.update_workload(&workload.id, |w| {
                w.restart_count = restarts;
                w.last_restart_at = Some(now);
            }) {
                error!(workload_id = %workload.id, error = %e, "failed to record restart count");
            }
        }
        if container.restart_count < self.crash_loop_threshold {
            return false;
        }
        let message = format!("crash loop: restarted {} times", container.restart_count);
        self.fail(workload, WorkloadStatus::Running, &message)
    }

    fn check_oom(&self, workload: &Workload, container: &ContainerStatus) -> bool {
        if container.last_termination_reason.as_deref() != Some(OOM_REASON) {
            return false;
        }
        let now = epoch_secs();
        if let Err(e) = self
            .store
            .update_workload(&workload.id, |w| w.last_oom_at = Some(now))
        {
            error!(workload_id = %workload.id, error = %e, "failed to record oom");
        }
        self.fail(workload, WorkloadStatus::Running, "out of memory: container was OOM killed")
    }

    fn check_waiting(&self, workload: &Workload, container: &ContainerStatus, reasons: &[&str]) -> bool {
        let Some(reason) = container.waiting_reason.as_deref() else {
            return false;
        };
        if !reasons.contains(&reason) {
            return false;
        }
        let message = match container.waiting_message.as_deref() {
            Some(detail) if !detail.is_empty() => format!("{reason}: {detail}"),
            _ => reason.to_string(),
        };
        self.fail(workload, WorkloadStatus::Starting, &message)
    }

    fn fail(&self, workload: &Workload, from: WorkloadStatus, message: &str) -> bool {
        match self
            .store
            .transition_with(&workload.id, from, WorkloadStatus::Failed, Some(message), |_| {})
        {
            Ok(Some(committed)) => {
                warn!(workload_id = %workload.id, %from, reason = message, "workload failed");
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
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(workload_id = %workload.id, error = %e, "transition failed");
                false
            }
        }
    }
}
