//! Mesh topology graph for the hub.
//!
//! The hub computes every route centrally: nodes never run a routing
//! protocol of their own. This crate holds the weighted node graph, its A*
//! path search, the cost smoothing used by discovery sweeps, and the file
//! store the graph is loaded from and saved to.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod discovery;
pub mod error;
pub mod graph;
pub mod store;

pub use discovery::{rssi_to_cost, NeighborTable, SweepOutcome};
pub use error::TopologyError;
pub use graph::{
    format_node_id, parse_node_id, DiscoveryFlags, MeshEdge, MeshGraph, MeshNode, NodeId,
    WEIGHT_EXPONENT,
};
pub use store::{FileStore, GraphDocument, GraphStore};
