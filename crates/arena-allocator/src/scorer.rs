//! Node scoring for placement decisions.
//!
//! Evaluates candidate nodes using a weighted combination of:
//! - **Bin-packing** (best-fit): prefer nodes that will be most full after placement
//! - **Balance**: penalize nodes far above the fleet's average utilization
//! - **Feasibility**: reject nodes without the resources or enough free ports

use arena_core::ResourceRequirement;

use crate::usage::NodeUsage;

/// Scored placement result for a single node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_name: String,
    /// Total composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    /// Bin-packing score: how full the node will be (higher = more packed).
    pub bin_packing: f64,
    /// Balance score: closeness to the fleet's average utilization.
    pub balance: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub bin_packing: f64,
    pub balance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            bin_packing: 0.7,
            balance: 0.3,
        }
    }
}

/// Score a single node for one workload needing `req` and `port_count` ports.
///
/// Returns `None` if the node cannot host the workload.
pub fn score_node(
    node: &NodeUsage,
    req: &ResourceRequirement,
    port_count: usize,
    weights: &ScoringWeights,
    fleet_avg_utilization: f64,
) -> Option<NodeScore> {
    if !req.fits_within(&node.free()) {
        return None;
    }
    if node.free_port_count() < port_count {
        return None;
    }

    // Bin-packing: projected fullness across both dimensions.
    let projected = |reserved: u64, need: u64, capacity: u64| {
        if capacity > 0 {
            ((reserved + need) as f64 / capacity as f64).min(1.0)
        } else {
            0.5
        }
    };
    let cpu = projected(node.reserved.cpu_millis, req.cpu_millis, node.capacity.cpu_millis);
    let memory = projected(
        node.reserved.memory_bytes,
        req.memory_bytes,
        node.capacity.memory_bytes,
    );
    let bin_packing = (cpu + memory) / 2.0 * 100.0;

    let balance =
        (1.0 - (node.memory_utilization() - fleet_avg_utilization).abs()).max(0.0) * 100.0;

    let score = weights.bin_packing * bin_packing + weights.balance * balance;

    Some(NodeScore {
        node_name: node.name.clone(),
        score,
        breakdown: ScoreBreakdown {
            bin_packing,
            balance,
        },
    })
}

/// Score all nodes and return the feasible ones, best first.
///
/// Ties are broken by node name so the choice is deterministic.
pub fn rank_nodes(
    nodes: &[NodeUsage],
    req: &ResourceRequirement,
    port_count: usize,
    weights: &ScoringWeights,
) -> Vec<NodeScore> {
    let fleet_avg = if nodes.is_empty() {
        0.5
    } else {
        nodes.iter().map(NodeUsage::memory_utilization).sum::<f64>() / nodes.len() as f64
    };

    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .filter_map(|n| score_node(n, req, port_count, weights, fleet_avg))
        .collect();

    // Sort descending by score.
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_name.cmp(&b.node_name))
    });
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_state::NodeCapacity;

    fn make_node(name: &str, cap_mem: u64, used_mem: u64, cap_cpu: u64, used_cpu: u64) -> NodeUsage {
        let mut usage = NodeUsage::new(&NodeCapacity {
            name: name.to_string(),
            ip: "10.0.0.1".to_string(),
            capacity: ResourceRequirement::new(cap_cpu, cap_mem),
            port_range_start: 7000,
            port_range_end: 7009,
        });
        usage.reserved = ResourceRequirement::new(used_cpu, used_mem);
        usage
    }

    fn packing_only() -> ScoringWeights {
        ScoringWeights {
            bin_packing: 1.0,
            balance: 0.0,
        }
    }

    #[test]
    fn rejects_insufficient_memory() {
        let node = make_node("n1", 1024, 1000, 1000, 0);
        let req = ResourceRequirement::new(100, 128); // Needs 128 but only 24 free.

        assert!(score_node(&node, &req, 1, &ScoringWeights::default(), 0.5).is_none());
    }

    #[test]
    fn rejects_insufficient_cpu() {
        let node = make_node("n1", 1024, 0, 1000, 950);
        let req = ResourceRequirement::new(100, 128);

        assert!(score_node(&node, &req, 1, &ScoringWeights::default(), 0.5).is_none());
    }

    #[test]
    fn rejects_when_ports_run_out() {
        let mut node = make_node("n1", 1024, 0, 1000, 0);
        node.used_ports.extend(7000..=7008); // one port left
        let req = ResourceRequirement::new(100, 128);

        assert!(score_node(&node, &req, 2, &ScoringWeights::default(), 0.5).is_none());
        assert!(score_node(&node, &req, 1, &ScoringWeights::default(), 0.5).is_some());
    }

    #[test]
    fn bin_packing_prefers_fuller_node() {
        let nearly_full = make_node("n1", 1024, 800, 1000, 0);
        let mostly_empty = make_node("n2", 1024, 100, 1000, 0);
        let req = ResourceRequirement::new(10, 128);

        let s1 = score_node(&nearly_full, &req, 1, &packing_only(), 0.5).unwrap();
        let s2 = score_node(&mostly_empty, &req, 1, &packing_only(), 0.5).unwrap();

        assert!(
            s1.score > s2.score,
            "nearly full ({}) should score higher than mostly empty ({}) for bin-packing",
            s1.score,
            s2.score
        );
    }

    #[test]
    fn rank_nodes_returns_sorted() {
        let nodes = vec![
            make_node("n1", 1024, 100, 1000, 0), // Less full.
            make_node("n2", 1024, 800, 1000, 0), // More full, scores higher for bin-packing.
            make_node("n3", 1024, 500, 1000, 0), // Middle.
        ];
        let req = ResourceRequirement::new(10, 128);

        let ranked = rank_nodes(&nodes, &req, 1, &packing_only());

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].node_name, "n2");
        assert!(ranked[0].score >= ranked[1].score);
        assert!(ranked[1].score >= ranked[2].score);
    }

    #[test]
    fn ties_break_by_name() {
        let nodes = vec![
            make_node("b", 1024, 0, 1000, 0),
            make_node("a", 1024, 0, 1000, 0),
        ];
        let req = ResourceRequirement::new(10, 128);

        let ranked = rank_nodes(&nodes, &req, 1, &ScoringWeights::default());
        assert_eq!(ranked[0].node_name, "a");
    }
}
