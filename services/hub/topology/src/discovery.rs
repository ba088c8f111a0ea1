//! Neighbor cost smoothing for discovery sweeps.
//!
//! A sweep reads a node's neighbor table several times. Each round moves the
//! running estimate halfway toward the new measurement; a neighbor missing
//! from a round gets 10% worse. When the sweep ends, links that got too weak
//! are dropped from the graph and the rest take the final estimate.

use crate::graph::{format_node_id, DiscoveryFlags, MeshEdge, MeshGraph, NodeId};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// RSSI readings above this are treated as this
pub const RSSI_CEILING: i16 = 45;
/// Lowest cost a link can get
pub const MIN_COST: f64 = 0.05;
/// Links with either cost above this are dropped
pub const MAX_COST: f64 = 1.0;
/// Penalty factor for a neighbor missing from a round
pub const MISSED_PENALTY: f64 = 1.1;

/// Map a discovery RSSI reading to a link cost
pub fn rssi_to_cost(rssi: i16) -> f64 {
    let mut rssi = i32::from(rssi.min(RSSI_CEILING));
    if rssi <= -1 {
        rssi = -rssi * 2;
    }
    let cost = 1.0 - f64::from(rssi) / f64::from(RSSI_CEILING);
    cost.max(MIN_COST)
}

type Costs = (f64, f64);

#[derive(Debug, Clone, Default)]
struct Estimate {
    last: Option<Costs>,
    current: Option<Costs>,
    next: Option<Costs>,
    in_graph: bool,
    seen: bool,
}

/// What a finished sweep did to the graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Links written back with their new costs
    pub updated: Vec<NodeId>,
    /// Links removed for exceeding [`MAX_COST`]
    pub dropped: Vec<NodeId>,
}

/// Running cost estimates for the neighbors of one node
#[derive(Debug, Clone)]
pub struct NeighborTable {
    node: NodeId,
    entries: BTreeMap<NodeId, Estimate>,
}

impl NeighborTable {
    /// Seed the table with the node's current links
    pub fn from_graph(graph: &MeshGraph, node: NodeId) -> Self {
        let entries = graph
            .neighbors(node)
            .filter_map(|neighbor| {
                let edge = graph.edge(node, neighbor)?;
                let estimate = Estimate {
                    next: Some((edge.cost_remote, edge.cost_local)),
                    in_graph: true,
                    ..Default::default()
                };
                Some((neighbor, estimate))
            })
            .collect();
        Self { node, entries }
    }

    /// Node whose neighbors are measured
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Start a measurement round
    pub fn begin_round(&mut self) {
        for estimate in self.entries.values_mut() {
            estimate.last = estimate.next.take();
            estimate.current = None;
        }
    }

    /// Record one neighbor table row
    pub fn record(&mut self, neighbor: NodeId, rssi_remote: i16, rssi_local: i16) {
        let estimate = self.entries.entry(neighbor).or_default();
        let current = (rssi_to_cost(rssi_remote), rssi_to_cost(rssi_local));
        estimate.current = Some(current);
        estimate.seen = true;
        estimate.next = Some(match estimate.last {
            Some(last) => ((last.0 + current.0) / 2.0, (last.1 + current.1) / 2.0),
            None => current,
        });
    }

    /// Close a round, penalizing neighbors it did not report
    pub fn end_round(&mut self) {
        for (neighbor, estimate) in self.entries.iter_mut() {
            if estimate.current.is_none() {
                estimate.next = estimate
                    .last
                    .map(|last| (last.0 * MISSED_PENALTY, last.1 * MISSED_PENALTY));
                debug!("Neighbor {} missed this round", format_node_id(*neighbor));
            }
        }
    }

    /// Current estimate for a neighbor
    pub fn estimate(&self, neighbor: NodeId) -> Option<(f64, f64)> {
        self.entries.get(&neighbor).and_then(|e| e.next)
    }

    /// Write the estimates back to the graph
    pub fn apply(self, graph: &mut MeshGraph) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let node = self.node;
        graph.add_node(node, "").discovery |= DiscoveryFlags::DISCOVERED;

        for (neighbor, estimate) in self.entries {
            let Some((remote, local)) = estimate.next else {
                continue;
            };
            if estimate.seen {
                graph.add_node(neighbor, "").discovery |= DiscoveryFlags::SEEN;
            }
            if remote > MAX_COST || local > MAX_COST {
                if estimate.in_graph || graph.edge(node, neighbor).is_some() {
                    graph.remove_edge(node, neighbor);
                }
                outcome.dropped.push(neighbor);
                continue;
            }
            if !graph.contains(neighbor) {
                graph.add_node(neighbor, "");
            }
            if graph.add_edge(node, neighbor, MeshEdge::new(remote, local)).is_ok() {
                outcome.updated.push(neighbor);
            }
        }

        info!(
            "Discovery of {}: {} links updated, {} dropped",
            format_node_id(node),
            outcome.updated.len(),
            outcome.dropped.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rssi_to_cost() {
        assert!(close(rssi_to_cost(45), MIN_COST));
        assert!(close(rssi_to_cost(90), MIN_COST));
        assert!(close(rssi_to_cost(0), 1.0));
        assert!(close(rssi_to_cost(9), 0.8));
        assert!(close(rssi_to_cost(-9), 0.6));
        assert!(close(rssi_to_cost(-40), MIN_COST));
    }

    #[test]
    fn test_rounds_smooth_toward_measurement() {
        let mut graph = MeshGraph::new();
        graph.add_node(1, "");
        graph.set_local_node(1);

        let mut table = NeighborTable::from_graph(&graph, 1);
        table.begin_round();
        table.record(2, 9, 9);
        table.end_round();
        assert!(close(table.estimate(2).unwrap().0, 0.8));

        table.begin_round();
        table.record(2, 27, 27);
        table.end_round();
        assert!(close(table.estimate(2).unwrap().0, (0.8 + 0.4) / 2.0));

        table.begin_round();
        table.end_round();
        assert!(close(table.estimate(2).unwrap().1, 0.6 * MISSED_PENALTY));

        let outcome = table.apply(&mut graph);
        assert_eq!(outcome.updated, vec![2]);
        assert!(graph.node(2).unwrap().discovery.contains(DiscoveryFlags::SEEN));
        assert!(graph.node(1).unwrap().discovery.contains(DiscoveryFlags::DISCOVERED));
        assert!(close(graph.edge(1, 2).unwrap().cost_local, 0.66));
    }

    #[test]
    fn test_weak_link_is_dropped() {
        let mut graph = MeshGraph::new();
        graph.add_node(1, "");
        graph.add_node(2, "");
        graph.add_edge(1, 2, MeshEdge::new(0.95, 0.95)).unwrap();

        let mut table = NeighborTable::from_graph(&graph, 1);
        table.begin_round();
        table.end_round();

        let outcome = table.apply(&mut graph);
        assert_eq!(outcome.dropped, vec![2]);
        assert!(graph.edge(1, 2).is_none());
        assert!(graph.contains(2));
    }
}
