//! Weighted undirected mesh graph and A* path search.

use crate::TopologyError;
use bitflags::bitflags;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use tracing::{debug, warn};

/// Node serial number
pub type NodeId = u32;

/// Exponent applied to the worse link cost
pub const WEIGHT_EXPONENT: f64 = 1.1;

/// Format a node id the way graph files and logs show it: `0x%06X`
pub fn format_node_id(id: NodeId) -> String {
    format!("0x{:06X}", id)
}

/// Parse `0x`-prefixed hex or plain decimal node ids
pub fn parse_node_id(text: &str) -> Result<NodeId, TopologyError> {
    let trimmed = text.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => NodeId::from_str_radix(hex, 16),
        None => trimmed.parse::<NodeId>(),
    };
    parsed.map_err(|_| TopologyError::InvalidNodeId(text.to_string()))
}

bitflags! {
    /// Transient per-node state of a discovery sweep
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DiscoveryFlags: u8 {
        /// Reported by a neighbor table in this sweep
        const SEEN = 0b001;
        /// Its own neighbor table has been read
        const DISCOVERED = 0b010;
        /// Did not answer during the sweep
        const BUGGY = 0b100;
    }
}

/// A mesh node
#[derive(Debug, Clone, PartialEq)]
pub struct MeshNode {
    /// Serial number
    pub id: NodeId,
    /// Free-text tag
    pub tag: String,
    /// Firmware revision, when known
    pub firmware: Option<String>,
    /// Whether this node is attached to the hub's serial port
    pub coordinator: bool,
    /// Discovery sweep state
    pub discovery: DiscoveryFlags,
    /// Layout hint for graph editors, unused by routing
    pub position: Option<(f32, f32)>,
}

impl MeshNode {
    /// Node with default attributes
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            tag: String::new(),
            firmware: None,
            coordinator: false,
            discovery: DiscoveryFlags::empty(),
            position: None,
        }
    }
}

/// Link between two nodes, with the cost measured from each side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshEdge {
    /// Cost as seen by the remote end
    pub cost_remote: f64,
    /// Cost as seen locally
    pub cost_local: f64,
}

impl MeshEdge {
    /// New edge
    pub fn new(cost_remote: f64, cost_local: f64) -> Self {
        Self {
            cost_remote,
            cost_local,
        }
    }

    /// Routing weight: the worse direction raised to [`WEIGHT_EXPONENT`]
    pub fn weight(&self) -> f64 {
        self.cost_remote.max(self.cost_local).powf(WEIGHT_EXPONENT)
    }
}

fn edge_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Search frontier entry, ordered so the heap pops the lowest estimate first
#[derive(Debug, Clone, Copy)]
struct Frontier {
    estimate: f64,
    cost: f64,
    node: NodeId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .estimate
            .total_cmp(&self.estimate)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Undirected weighted graph of mesh nodes
#[derive(Debug, Clone, Default)]
pub struct MeshGraph {
    nodes: BTreeMap<NodeId, MeshNode>,
    edges: BTreeMap<(NodeId, NodeId), MeshEdge>,
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
    local: Option<NodeId>,
}

impl MeshGraph {
    /// Empty graph without a local node
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Whether `id` is a node of the graph
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Node lookup
    pub fn node(&self, id: NodeId) -> Option<&MeshNode> {
        self.nodes.get(&id)
    }

    /// Mutable node lookup
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut MeshNode> {
        self.nodes.get_mut(&id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &MeshNode> {
        self.nodes.values()
    }

    /// Edges in key order, lower id first
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId, &MeshEdge)> {
        self.edges.iter().map(|(&(a, b), edge)| (a, b, edge))
    }

    /// Add a node with default attributes, or return the existing one
    pub fn add_node(&mut self, id: NodeId, tag: &str) -> &mut MeshNode {
        self.adjacency.entry(id).or_default();
        self.nodes.entry(id).or_insert_with(|| {
            debug!("Adding node {}", format_node_id(id));
            let mut node = MeshNode::new(id);
            node.tag = tag.to_string();
            node
        })
    }

    /// Remove a node and its edges
    pub fn remove_node(&mut self, id: NodeId) -> Option<MeshNode> {
        let node = self.nodes.remove(&id)?;
        for neighbor in self.adjacency.remove(&id).unwrap_or_default() {
            self.edges.remove(&edge_key(id, neighbor));
            if let Some(set) = self.adjacency.get_mut(&neighbor) {
                set.remove(&id);
            }
        }
        if self.local == Some(id) {
            self.local = None;
        }
        Some(node)
    }

    /// Insert or replace the edge between two existing nodes
    pub fn add_edge(&mut self, a: NodeId, b: NodeId, edge: MeshEdge) -> Result<(), TopologyError> {
        for id in [a, b] {
            if !self.contains(id) {
                return Err(TopologyError::NodeNotFound(id));
            }
        }
        self.edges.insert(edge_key(a, b), edge);
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
        Ok(())
    }

    /// Remove the edge between two nodes
    pub fn remove_edge(&mut self, a: NodeId, b: NodeId) -> Option<MeshEdge> {
        let edge = self.edges.remove(&edge_key(a, b))?;
        if let Some(set) = self.adjacency.get_mut(&a) {
            set.remove(&b);
        }
        if let Some(set) = self.adjacency.get_mut(&b) {
            set.remove(&a);
        }
        Some(edge)
    }

    /// Edge lookup, in either direction
    pub fn edge(&self, a: NodeId, b: NodeId) -> Option<&MeshEdge> {
        self.edges.get(&edge_key(a, b))
    }

    /// Mutable edge lookup
    pub fn edge_mut(&mut self, a: NodeId, b: NodeId) -> Option<&mut MeshEdge> {
        self.edges.get_mut(&edge_key(a, b))
    }

    /// Neighbors of a node in id order
    pub fn neighbors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.adjacency.get(&id).into_iter().flatten().copied()
    }

    /// The node attached to the hub, the source of every path
    pub fn local_node(&self) -> Option<NodeId> {
        self.local
    }

    /// Set the local node, adding it if missing, and mark it as the only coordinator
    pub fn set_local_node(&mut self, id: NodeId) {
        if !self.contains(id) {
            warn!("Local node {} not in graph, adding it", format_node_id(id));
        }
        self.add_node(id, "");
        for node in self.nodes.values_mut() {
            node.coordinator = node.id == id;
        }
        self.local = Some(id);
    }

    /// Pick the local node back up from the coordinator flag
    pub(crate) fn restore_local_node(&mut self) {
        self.local = self.nodes.values().find(|n| n.coordinator).map(|n| n.id);
    }

    /// Clear discovery flags on every node
    pub fn clear_discovery_flags(&mut self) {
        for node in self.nodes.values_mut() {
            node.discovery = DiscoveryFlags::empty();
        }
    }

    /// Sum of edge weights along `path`, `None` if a hop is missing
    pub fn path_weight(&self, path: &[NodeId]) -> Option<f64> {
        path.windows(2)
            .map(|pair| self.edge(pair[0], pair[1]).map(MeshEdge::weight))
            .sum()
    }

    /// A* search from `from` to `to` with an admissible `heuristic`.
    ///
    /// Returns the node sequence including both endpoints.
    pub fn astar<H>(&self, from: NodeId, to: NodeId, heuristic: H) -> Result<Vec<NodeId>, TopologyError>
    where
        H: Fn(NodeId, NodeId) -> f64,
    {
        for id in [from, to] {
            if !self.contains(id) {
                return Err(TopologyError::NodeNotFound(id));
            }
        }

        let mut best: HashMap<NodeId, f64> = HashMap::new();
        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut open = BinaryHeap::new();

        best.insert(from, 0.0);
        open.push(Frontier {
            estimate: heuristic(from, to),
            cost: 0.0,
            node: from,
        });

        while let Some(Frontier { cost, node, .. }) = open.pop() {
            if node == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = previous.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Ok(path);
            }
            if cost > best.get(&node).copied().unwrap_or(f64::INFINITY) {
                continue;
            }

            for neighbor in self.neighbors(node) {
                let Some(edge) = self.edge(node, neighbor) else {
                    continue;
                };
                let next = cost + edge.weight();
                if next < best.get(&neighbor).copied().unwrap_or(f64::INFINITY) {
                    best.insert(neighbor, next);
                    previous.insert(neighbor, node);
                    open.push(Frontier {
                        estimate: next + heuristic(neighbor, to),
                        cost: next,
                        node: neighbor,
                    });
                }
            }
        }

        Err(TopologyError::NoPath { from, to })
    }

    /// Path from the local node to `target`.
    ///
    /// Without `include_source` the local node is left out, so a direct
    /// neighbor yields `[target]` and the local node itself yields `[]`.
    pub fn shortest_path(&self, target: NodeId, include_source: bool) -> Result<Vec<NodeId>, TopologyError> {
        let local = self.local.ok_or(TopologyError::NoLocalNode)?;
        // No geometry to estimate remaining cost from, the zero heuristic keeps A* exact
        let mut path = self.astar(local, target, |_, _| 0.0)?;
        if !include_source {
            path.remove(0);
        }
        debug!(
            "Path to {}: {}",
            format_node_id(target),
            path.iter().map(|id| format_node_id(*id)).collect::<Vec<_>>().join(" -> ")
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: NodeId = 0x0A;
    const B: NodeId = 0x0B;
    const C: NodeId = 0x0C;

    fn triangle() -> MeshGraph {
        let mut graph = MeshGraph::new();
        for id in [A, B, C] {
            graph.add_node(id, "");
        }
        graph.add_edge(A, B, MeshEdge::new(2.0, 2.0)).unwrap();
        graph.add_edge(B, C, MeshEdge::new(1.0, 1.0)).unwrap();
        graph.add_edge(A, C, MeshEdge::new(5.0, 5.0)).unwrap();
        graph.set_local_node(A);
        graph
    }

    #[test]
    fn test_shortest_path_prefers_cheaper_relay() {
        let graph = triangle();
        assert_eq!(graph.shortest_path(C, false).unwrap(), vec![B, C]);
        assert_eq!(graph.shortest_path(C, true).unwrap(), vec![A, B, C]);

        let via_b = graph.path_weight(&[A, B, C]).unwrap();
        let direct = graph.path_weight(&[A, C]).unwrap();
        assert!(via_b < direct);
    }

    #[test]
    fn test_shortest_path_to_local_node() {
        let graph = triangle();
        assert!(graph.shortest_path(A, false).unwrap().is_empty());
        assert_eq!(graph.shortest_path(A, true).unwrap(), vec![A]);
    }

    #[test]
    fn test_weight_penalizes_worse_direction() {
        let edge = MeshEdge::new(0.2, 0.8);
        assert!((edge.weight() - 0.8f64.powf(1.1)).abs() < 1e-12);
        assert_eq!(MeshEdge::new(1.0, 0.5).weight(), 1.0);
    }

    #[test]
    fn test_missing_endpoint() {
        let graph = triangle();
        assert!(matches!(
            graph.shortest_path(0x99, false),
            Err(TopologyError::NodeNotFound(0x99))
        ));
        assert!(matches!(
            MeshGraph::new().shortest_path(A, false),
            Err(TopologyError::NoLocalNode)
        ));
    }

    #[test]
    fn test_disconnected_node() {
        let mut graph = triangle();
        graph.add_node(0x0D, "island");
        assert!(matches!(
            graph.shortest_path(0x0D, false),
            Err(TopologyError::NoPath { from: A, to: 0x0D })
        ));
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut graph = triangle();
        graph.remove_node(B).unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.neighbors(A).collect::<Vec<_>>(), vec![C]);
        assert_eq!(graph.shortest_path(C, false).unwrap(), vec![C]);
    }

    #[test]
    fn test_set_local_node_adds_and_marks_coordinator() {
        let mut graph = triangle();
        graph.set_local_node(0x42);
        assert!(graph.contains(0x42));
        assert_eq!(graph.local_node(), Some(0x42));
        assert!(graph.node(0x42).unwrap().coordinator);
        assert!(!graph.node(A).unwrap().coordinator);
    }

    #[test]
    fn test_add_node_keeps_existing() {
        let mut graph = MeshGraph::new();
        graph.add_node(1, "kitchen");
        graph.add_node(1, "other");
        assert_eq!(graph.node(1).unwrap().tag, "kitchen");
        assert_eq!(graph.node(1).unwrap().discovery, DiscoveryFlags::empty());
    }

    #[test]
    fn test_add_edge_requires_nodes() {
        let mut graph = MeshGraph::new();
        graph.add_node(1, "");
        assert!(matches!(
            graph.add_edge(1, 2, MeshEdge::new(0.1, 0.1)),
            Err(TopologyError::NodeNotFound(2))
        ));
    }

    #[test]
    fn test_node_id_text() {
        assert_eq!(format_node_id(0x12AB), "0x0012AB");
        assert_eq!(parse_node_id("0x0012AB").unwrap(), 0x12AB);
        assert_eq!(parse_node_id("42").unwrap(), 42);
        assert!(parse_node_id("zz").is_err());
    }
}
