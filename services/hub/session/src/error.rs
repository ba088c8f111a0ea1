//! Session error types.

use bytes::Bytes;
use mesh_routing::RouteError;
use mesh_topology::{NodeId, TopologyError};
use mesh_wire::{CodecError, WireError};
use std::time::Duration;
use thiserror::Error;

/// Why a circuit failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitError {
    /// The far end refused the open request
    #[error("connection refused")]
    Refused,

    /// No open acknowledgement in time
    #[error("open timed out")]
    OpenTimeout,

    /// The far end could not forward circuit data
    #[error("data transmission error")]
    DataError,

    /// The far end does not know the handle
    #[error("invalid handle")]
    InvalidHandle,

    /// No circuit data arrived in time
    #[error("reply not received")]
    ReplyTimeout,

    /// Closed by the local side
    #[error("circuit closed")]
    Closed,
}

/// Multiplexer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// No open circuit with this handle
    #[error("unknown circuit handle {0:#06X}")]
    UnknownHandle(u16),

    /// Data sent before the circuit became active
    #[error("circuit {0:#06X} is not active")]
    NotActive(u16),

    /// A reply is already awaited on this circuit
    #[error("circuit {0:#06X} already has a pending reply")]
    ReplyPending(u16),

    /// A circuit needs at least its target in the path
    #[error("empty circuit path")]
    EmptyPath,

    /// Every handle is in use
    #[error("no free circuit handle")]
    HandlesExhausted,

    /// Segment could not be encoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The circuit failed
    #[error("circuit error: {0}")]
    Circuit(#[from] CircuitError),
}

/// Errors surfaced to hub consumers
#[derive(Error, Debug)]
pub enum HubError {
    /// Command could not be built or its reply decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No route to the target
    #[error("route error: {0}")]
    Route(#[from] RouteError),

    /// Graph lookup or store failure
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Circuit failure
    #[error("circuit error: {0}")]
    Mux(#[from] MuxError),

    /// Serial link I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the bounded wait
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The node answered with an error reply
    #[error("node 0x{target:06X} replied with error {data:02X?}")]
    NodeError {
        /// Node that failed the command
        target: NodeId,
        /// Error payload
        data: Bytes,
    },

    /// The reply answers a different command
    #[error("expected reply '{expected}', got '{got}'")]
    MismatchedReply {
        /// Command leaf name
        expected: String,
        /// Reply id received
        got: &'static str,
    },

    /// The command is never answered
    #[error("command '{0}' has no reply")]
    NoReply(String),

    /// No graph is loaded
    #[error("no mesh graph loaded")]
    NoGraph,

    /// The startup handshake failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The serial link closed
    #[error("serial link closed")]
    LinkClosed,

    /// The hub task is gone
    #[error("hub stopped")]
    Stopped,
}
