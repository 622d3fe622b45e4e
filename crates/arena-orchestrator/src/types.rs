//! Objects exchanged with the orchestrator.

use std::collections::BTreeMap;

use arena_core::{Protocol, ResourceRequirement};
use serde::{Deserialize, Serialize};

/// Prefix of every workload object name managed by Arena.
pub const OBJECT_NAME_PREFIX: &str = "server-";

/// Label carrying the workload id on objects and pods.
pub const LABEL_SERVER_ID: &str = "arena.io/server-id";

/// Label carrying the catalog game type.
pub const LABEL_GAME: &str = "arena.io/game";

/// Name of the supervisor container inside a workload pod.
pub const SUPERVISOR_CONTAINER: &str = "supervisor";

pub type Labels = BTreeMap<String, String>;

/// Deterministic orchestrator object name for a workload.
pub fn object_name(workload_id: &str) -> String {
    format!("{OBJECT_NAME_PREFIX}{workload_id}")
}

/// Extract the workload id from an object name.
///
/// Returns `None` for names outside the naming convention, which belong to
/// other systems sharing the namespace.
pub fn parse_object_name(name: &str) -> Option<&str> {
    name.strip_prefix(OBJECT_NAME_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Name of the volume claim backing one declared volume of a workload.
pub fn claim_name(workload_id: &str, volume: &str) -> String {
    format!("{OBJECT_NAME_PREFIX}{workload_id}-{volume}")
}

/// Label selector matching the pods of one workload.
pub fn workload_selector(workload_id: &str) -> Labels {
    Labels::from([(LABEL_SERVER_ID.to_string(), workload_id.to_string())])
}

/// Whether `labels` carries every pair in `selector`.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
}

// ── Workload objects ──────────────────────────────────────────────

/// Lifecycle phase the orchestrator reports for a workload object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    Creating,
    Starting,
    Scheduled,
    RequestReady,
    Ready,
    Shutdown,
    Unhealthy,
    Error,
    Other(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Creating => "Creating",
            Phase::Starting => "Starting",
            Phase::Scheduled => "Scheduled",
            Phase::RequestReady => "RequestReady",
            Phase::Ready => "Ready",
            Phase::Shutdown => "Shutdown",
            Phase::Unhealthy => "Unhealthy",
            Phase::Error => "Error",
            Phase::Other(other) => other,
        }
    }
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Creating" => Phase::Creating,
            "Starting" => Phase::Starting,
            "Scheduled" => Phase::Scheduled,
            "RequestReady" => Phase::RequestReady,
            "Ready" => Phase::Ready,
            "Shutdown" => Phase::Shutdown,
            "Unhealthy" => Phase::Unhealthy,
            "Error" => Phase::Error,
            _ => Phase::Other(s),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.as_str().to_string()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statically bound host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPortBinding {
    pub name: String,
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub claim_name: String,
}

/// Health check the orchestrator runs against the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub path: String,
    pub port: u16,
    pub initial_delay_secs: u64,
    pub period_secs: u64,
}

/// Desired state of a workload object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Node the object is pinned to.
    pub node_name: String,
    pub image: String,
    pub ports: Vec<HostPortBinding>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    /// Resource limits for the game container.
    pub resources: ResourceRequirement,
    pub health: HealthCheckSpec,
}

/// Observed state of a workload object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadObjectStatus {
    pub phase: Phase,
    /// Reachable address, set once the object is ready.
    pub address: Option<String>,
    /// Deletion has been requested but has not completed.
    pub deleting: bool,
}

impl Default for WorkloadObjectStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Creating,
            address: None,
            deleting: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadObject {
    pub name: String,
    pub labels: Labels,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadObjectStatus,
}

impl WorkloadObject {
    /// Workload id encoded in the object name, if it follows the convention.
    pub fn workload_id(&self) -> Option<&str> {
        parse_object_name(&self.name)
    }
}

/// Persistent storage requested for one workload volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaim {
    pub name: String,
    pub labels: Labels,
    pub storage: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Skip the graceful termination period.
    pub force: bool,
}

impl DeleteOptions {
    pub fn graceful() -> Self {
        Self { force: false }
    }

    pub fn force() -> Self {
        Self { force: true }
    }
}

// ── Pods ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Container-level signals the phase does not surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    pub restart_count: u32,
    /// Reason the container is currently waiting, e.g. `CrashLoopBackOff`.
    pub waiting_reason: Option<String>,
    pub waiting_message: Option<String>,
    /// Reason the previous run terminated, e.g. `OOMKilled`.
    pub last_termination_reason: Option<String>,
    pub last_termination_exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub name: String,
    pub labels: Labels,
    pub phase: PodPhase,
    pub pod_ip: Option<String>,
    pub containers: Vec<ContainerStatus>,
    pub init_containers: Vec<ContainerStatus>,
}

// ── Change feed ───────────────────────────────────────────────────

/// Notification from the orchestrator's change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(WorkloadObject),
    Modified {
        old: WorkloadObject,
        new: WorkloadObject,
    },
    Deleted(WorkloadObject),
    /// A delete observed only through a relist; the final state was missed.
    DeletedFinalStateUnknown {
        name: String,
        last_known: Option<WorkloadObject>,
    },
    /// The initial listing has been delivered; live events follow.
    Synced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_round_trip() {
        let name = object_name("abc123");
        assert_eq!(name, "server-abc123");
        assert_eq!(parse_object_name(&name), Some("abc123"));
    }

    #[test]
    fn foreign_names_are_rejected() {
        assert_eq!(parse_object_name("proxy-7f9c"), None);
        assert_eq!(parse_object_name("server-"), None);
        assert_eq!(parse_object_name("gameserver-1"), None);
    }

    #[test]
    fn unknown_phase_is_preserved() {
        let phase = Phase::from("Allocated".to_string());
        assert_eq!(phase, Phase::Other("Allocated".to_string()));
        assert_eq!(phase.to_string(), "Allocated");
        assert_eq!(Phase::from("Ready".to_string()), Phase::Ready);
    }

    #[test]
    fn selector_requires_every_pair() {
        let mut labels = workload_selector("w1");
        labels.insert(LABEL_GAME.to_string(), "minecraft".to_string());

        assert!(selector_matches(&workload_selector("w1"), &labels));
        assert!(!selector_matches(&workload_selector("w2"), &labels));
        assert!(selector_matches(&Labels::new(), &labels));
    }
}
