//! Allocate, look up and release per-workload capacity bundles.

use std::collections::HashSet;

use arena_core::{PortSpec, Protocol, ResourceRequirement};
use arena_state::{Allocation, NodeCapacity, Reservation, StateStore, epoch_secs};
use tracing::{debug, info, warn};

use crate::error::{AllocatorError, AllocatorResult};
use crate::scorer::{ScoringWeights, rank_nodes};
use crate::usage::{NodeUsage, ledger_usage};

/// One named host port a workload needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub name: String,
    pub protocol: Protocol,
}

impl PortRequest {
    pub fn new(name: &str, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            protocol,
        }
    }
}

impl From<&PortSpec> for PortRequest {
    fn from(spec: &PortSpec) -> Self {
        Self::new(&spec.name, spec.protocol)
    }
}

/// Capacity allocator over the state store's ledger tables.
#[derive(Clone)]
pub struct Allocator {
    store: StateStore,
    weights: ScoringWeights,
}

impl Allocator {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            weights: ScoringWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Register the declared nodes in the ledger.
    ///
    /// Nodes no longer declared are removed unless a workload still holds a
    /// reservation on them.
    pub fn sync_nodes(&self, nodes: &[NodeCapacity]) -> AllocatorResult<()> {
        let declared: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let held: HashSet<String> = self
            .store
            .list_reservations()?
            .into_iter()
            .map(|r| r.node_name)
            .collect();

        for node in nodes {
            self.store.put_node(node)?;
        }
        for existing in self.store.list_nodes()? {
            if declared.contains(existing.name.as_str()) {
                continue;
            }
            if held.contains(&existing.name) {
                warn!(node = %existing.name, "undeclared node still holds reservations, keeping");
            } else {
                self.store.delete_node(&existing.name)?;
                info!(node = %existing.name, "node removed from ledger");
            }
        }
        Ok(())
    }

    /// Reserve a node, one host port per request and `resources` for a workload.
    ///
    /// All-or-nothing: either every port is reserved on a single node together
    /// with the resources, or nothing is written. A workload that already holds
    /// a reservation gets its existing allocations back.
    pub fn allocate_ports(
        &self,
        workload_id: &str,
        ports: &[PortRequest],
        resources: ResourceRequirement,
    ) -> AllocatorResult<Vec<Allocation>> {
        if workload_id.is_empty() {
            return Err(AllocatorError::InvalidRequest("empty workload id".to_string()));
        }
        let mut names = HashSet::new();
        for port in ports {
            if !names.insert(port.name.as_str()) {
                return Err(AllocatorError::InvalidRequest(format!(
                    "duplicate port name {:?}",
                    port.name
                )));
            }
        }

        self.store.ledger_txn(|ledger| {
            let reservations = ledger.reservations()?;
            if reservations.iter().any(|r| r.workload_id == workload_id) {
                debug!(workload_id, "workload already holds capacity");
                return Ok(ledger.allocations_for(workload_id)?);
            }

            let nodes = ledger.nodes()?;
            let usage = ledger_usage(&nodes, &ledger.allocations()?, &reservations);
            let ranked = rank_nodes(&usage, &resources, ports.len(), &self.weights);

            let Some(best) = ranked.first() else {
                let reason = if nodes.is_empty() {
                    "no nodes registered".to_string()
                } else {
                    format!(
                        "no node has {}m CPU, {} bytes memory and {} free ports",
                        resources.cpu_millis,
                        resources.memory_bytes,
                        ports.len()
                    )
                };
                return Err(AllocatorError::NoCapacity {
                    workload_id: workload_id.to_string(),
                    reason,
                });
            };

            let Some(node) = usage.iter().find(|u| u.name == best.node_name) else {
                return Err(AllocatorError::InvalidRequest(format!(
                    "ranked node {} missing from ledger",
                    best.node_name
                )));
            };

            let now = epoch_secs();
            let allocations: Vec<Allocation> = ports
                .iter()
                .zip(node.free_ports())
                .map(|(request, port)| Allocation {
                    workload_id: workload_id.to_string(),
                    port_name: request.name.clone(),
                    node_name: node.name.clone(),
                    node_ip: node.ip.clone(),
                    port,
                    protocol: request.protocol,
                    allocated_at: now,
                })
                .collect();

            for allocation in &allocations {
                ledger.insert_allocation(allocation)?;
            }
            ledger.insert_reservation(&Reservation {
                workload_id: workload_id.to_string(),
                node_name: node.name.clone(),
                resources,
            })?;

            info!(
                workload_id,
                node = %node.name,
                score = best.score,
                ports = ?allocations.iter().map(|a| a.port).collect::<Vec<_>>(),
                "capacity allocated"
            );
            Ok(allocations)
        })
    }

    /// Current allocation set of a workload; empty if it holds none.
    pub fn server_ports(&self, workload_id: &str) -> AllocatorResult<Vec<Allocation>> {
        Ok(self.store.allocations_for(workload_id)?)
    }

    /// Node a workload's capacity is reserved on, if it holds any.
    pub fn assigned_node(&self, workload_id: &str) -> AllocatorResult<Option<String>> {
        Ok(self
            .store
            .reservation_for(workload_id)?
            .map(|r| r.node_name))
    }

    /// Return a workload's ports and resources to the ledger.
    pub fn release(&self, workload_id: &str) -> AllocatorResult<usize> {
        let released = self
            .store
            .ledger_txn(|ledger| ledger.release(workload_id))?;
        if released > 0 {
            info!(workload_id, released, "capacity released");
        }
        Ok(released)
    }

    /// Per-node view of capacity and what is reserved against it.
    pub fn node_usage(&self) -> AllocatorResult<Vec<NodeUsage>> {
        Ok(ledger_usage(
            &self.store.list_nodes()?,
            &self.store.list_allocations()?,
            &self.store.list_reservations()?,
        ))
    }
}
