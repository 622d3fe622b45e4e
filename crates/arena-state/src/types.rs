//! Domain types for the Arena state store.
//!
//! All types are serializable to/from JSON for storage in redb tables.
//! Timestamps are Unix epoch seconds.

use serde::{Deserialize, Serialize};

use arena_core::{Protocol, ResourceRequirement};

/// Opaque unique identifier for a workload.
pub type WorkloadId = String;

/// Name of a node in the capacity ledger.
pub type NodeName = String;

// ── Workload ──────────────────────────────────────────────────────

/// Lifecycle status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Expired,
    Failed,
    Deleting,
    Deleted,
}

impl WorkloadStatus {
    pub const ALL: [WorkloadStatus; 9] = [
        WorkloadStatus::Pending,
        WorkloadStatus::Starting,
        WorkloadStatus::Running,
        WorkloadStatus::Stopping,
        WorkloadStatus::Stopped,
        WorkloadStatus::Expired,
        WorkloadStatus::Failed,
        WorkloadStatus::Deleting,
        WorkloadStatus::Deleted,
    ];

    /// States whose allocations are returned to the ledger.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadStatus::Stopped | WorkloadStatus::Failed | WorkloadStatus::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Pending => "pending",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Expired => "expired",
            WorkloadStatus::Failed => "failed",
            WorkloadStatus::Deleting => "deleting",
            WorkloadStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkloadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown workload status: {s}"))
    }
}

/// A managed game-server instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    pub id: WorkloadId,
    /// Owning user; keys the status broadcast hub.
    pub user_id: String,
    /// Catalog game type.
    pub game: String,
    /// Catalog resource plan name.
    pub plan: String,
    pub status: WorkloadStatus,
    pub status_message: Option<String>,
    pub node_ip: Option<String>,
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    pub last_restart_at: Option<u64>,
    pub last_oom_at: Option<u64>,
    pub last_reconciled: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    pub stopped_at: Option<u64>,
    pub expired_at: Option<u64>,
    pub delete_after: Option<u64>,
    /// Latest process report from the workload's supervisor.
    #[serde(default)]
    pub process: ProcessReport,
}

impl Workload {
    /// A freshly created workload in `pending`.
    pub fn new(id: &str, user_id: &str, game: &str, plan: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            game: game.to_string(),
            plan: plan.to_string(),
            status: WorkloadStatus::Pending,
            status_message: None,
            node_ip: None,
            pod_ip: None,
            restart_count: 0,
            last_restart_at: None,
            last_oom_at: None,
            last_reconciled: None,
            created_at: now,
            updated_at: now,
            stopped_at: None,
            expired_at: None,
            delete_after: None,
            process: ProcessReport::default(),
        }
    }

    /// Seconds since the last status change.
    pub fn secs_in_status(&self, now: u64) -> u64 {
        now.saturating_sub(self.updated_at)
    }
}

/// Informational process state reported by the supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessReport {
    pub status: Option<String>,
    pub message: Option<String>,
    pub pid: Option<u32>,
    pub memory_mb: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub reported_at: Option<u64>,
    pub last_heartbeat_at: Option<u64>,
}

// ── Capacity ──────────────────────────────────────────────────────

/// One reserved host port for a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub workload_id: WorkloadId,
    /// Logical port name from the catalog ("game", "query", "rcon").
    pub port_name: String,
    pub node_name: NodeName,
    pub node_ip: String,
    /// Host-side port reserved on `node_name`.
    pub port: u16,
    pub protocol: Protocol,
    pub allocated_at: u64,
}

impl Allocation {
    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.workload_id, self.port_name)
    }
}

/// CPU/memory held on a node by one workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub workload_id: WorkloadId,
    pub node_name: NodeName,
    pub resources: ResourceRequirement,
}

/// Declared capacity of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeCapacity {
    pub name: NodeName,
    pub ip: String,
    pub capacity: ResourceRequirement,
    /// Inclusive host port range.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl NodeCapacity {
    pub fn port_count(&self) -> usize {
        if self.port_range_end < self.port_range_start {
            0
        } else {
            usize::from(self.port_range_end - self.port_range_start) + 1
        }
    }

    pub fn contains_port(&self, port: u16) -> bool {
        (self.port_range_start..=self.port_range_end).contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = WorkloadStatus::ALL
            .into_iter()
            .filter(WorkloadStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![
                WorkloadStatus::Stopped,
                WorkloadStatus::Failed,
                WorkloadStatus::Deleted
            ]
        );
    }

    #[test]
    fn status_string_round_trip() {
        for status in WorkloadStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkloadStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<WorkloadStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&WorkloadStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
    }

    #[test]
    fn new_workload_is_pending() {
        let w = Workload::new("w1", "u1", "minecraft", "small", 1000);
        assert_eq!(w.status, WorkloadStatus::Pending);
        assert_eq!(w.secs_in_status(1300), 300);
    }

    #[test]
    fn node_port_range() {
        let node = NodeCapacity {
            name: "n1".to_string(),
            ip: "10.0.0.1".to_string(),
            capacity: ResourceRequirement::new(1000, 1024),
            port_range_start: 7000,
            port_range_end: 7009,
        };
        assert_eq!(node.port_count(), 10);
        assert!(node.contains_port(7009));
        assert!(!node.contains_port(7010));
    }
}
