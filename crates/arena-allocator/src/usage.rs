//! Per-node view of the capacity ledger.

use std::collections::{BTreeSet, HashMap};

use arena_core::ResourceRequirement;
use arena_state::{Allocation, NodeCapacity, Reservation};
use serde::Serialize;

/// Declared capacity of a node together with what is currently reserved on it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeUsage {
    pub name: String,
    pub ip: String,
    pub capacity: ResourceRequirement,
    pub reserved: ResourceRequirement,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Host ports in the range held by live allocations.
    pub used_ports: BTreeSet<u16>,
    /// Number of workloads holding a reservation on this node.
    pub workloads: usize,
}

impl NodeUsage {
    pub fn new(node: &NodeCapacity) -> Self {
        Self {
            name: node.name.clone(),
            ip: node.ip.clone(),
            capacity: node.capacity,
            reserved: ResourceRequirement::default(),
            port_range_start: node.port_range_start,
            port_range_end: node.port_range_end,
            used_ports: BTreeSet::new(),
            workloads: 0,
        }
    }

    pub fn free(&self) -> ResourceRequirement {
        ResourceRequirement::new(
            self.capacity.cpu_millis.saturating_sub(self.reserved.cpu_millis),
            self.capacity
                .memory_bytes
                .saturating_sub(self.reserved.memory_bytes),
        )
    }

    /// Free ports in ascending order.
    pub fn free_ports(&self) -> impl Iterator<Item = u16> + '_ {
        let range = if self.port_range_start == 0 || self.port_range_end < self.port_range_start {
            1..=0
        } else {
            self.port_range_start..=self.port_range_end
        };
        range.filter(|port| !self.used_ports.contains(port))
    }

    pub fn free_port_count(&self) -> usize {
        self.free_ports().count()
    }

    /// Memory utilization in `0.0..=1.0`; half-full when capacity is unknown.
    pub fn memory_utilization(&self) -> f64 {
        if self.capacity.memory_bytes > 0 {
            (self.reserved.memory_bytes as f64 / self.capacity.memory_bytes as f64).min(1.0)
        } else {
            0.5
        }
    }
}

/// Fold allocations and reservations onto the declared nodes.
///
/// Records that reference a node missing from the ledger are ignored; the
/// result is sorted by node name.
pub fn ledger_usage(
    nodes: &[NodeCapacity],
    allocations: &[Allocation],
    reservations: &[Reservation],
) -> Vec<NodeUsage> {
    let mut by_name: HashMap<&str, NodeUsage> = nodes
        .iter()
        .map(|n| (n.name.as_str(), NodeUsage::new(n)))
        .collect();

    for allocation in allocations {
        if let Some(usage) = by_name.get_mut(allocation.node_name.as_str()) {
            usage.used_ports.insert(allocation.port);
        }
    }
    for reservation in reservations {
        if let Some(usage) = by_name.get_mut(reservation.node_name.as_str()) {
            usage.reserved = usage.reserved.with_overhead(reservation.resources);
            usage.workloads += 1;
        }
    }

    let mut usage: Vec<NodeUsage> = by_name.into_values().collect();
    usage.sort_by(|a, b| a.name.cmp(&b.name));
    usage
}
