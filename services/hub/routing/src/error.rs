//! Routing error types.

use mesh_topology::TopologyError;
use mesh_wire::CodecError;
use thiserror::Error;

/// Route planning and envelope errors
#[derive(Error, Debug)]
pub enum RouteError {
    /// The graph could not produce a path
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// An envelope could not be built
    #[error("envelope error: {0}")]
    Codec(#[from] CodecError),

    /// More relays than the hop count byte can carry
    #[error("path has {0} relays, at most 255 fit")]
    PathTooLong(usize),

    /// Circuit routes are carried by the multiplexer, not by an envelope
    #[error("circuit routes cannot be wrapped")]
    NotWrappable,
}
