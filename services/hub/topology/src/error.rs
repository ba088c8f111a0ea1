//! Topology error types.

use crate::NodeId;
use thiserror::Error;

/// Topology errors
#[derive(Error, Debug)]
pub enum TopologyError {
    /// Node is not in the graph
    #[error("node 0x{0:06X} not found")]
    NodeNotFound(NodeId),

    /// Both nodes exist but are not connected
    #[error("no path from 0x{from:06X} to 0x{to:06X}")]
    NoPath {
        /// Search source
        from: NodeId,
        /// Search target
        to: NodeId,
    },

    /// The local coordinator node has not been set
    #[error("local node not set")]
    NoLocalNode,

    /// Text is not a node id
    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),

    /// Graph file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON graph file could not be read or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML graph file could not be read or written
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
