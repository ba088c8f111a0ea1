//! Route planning and envelope wrapping.

use crate::{RouteError, RouteMode};
use bytes::Bytes;
use mesh_topology::{format_node_id, MeshGraph, NodeId};
use mesh_wire::{build_command, Args, STANDARD};
use tracing::debug;

/// Target id addressing the node on the serial port
pub const LOCAL_NODE: NodeId = 0;
/// Target id of polite broadcasts
pub const BROADCAST: u32 = 0xFFFF_FFFF;

/// How one command reaches its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Sent as is to the node on the serial port
    Local,
    /// Wrapped in a `unicast` envelope
    Unicast {
        /// Destination node
        target: NodeId,
    },
    /// Wrapped in a `multipath` envelope through `relays`
    Multipath {
        /// Destination node
        target: NodeId,
        /// Intermediate nodes, target excluded
        relays: Vec<NodeId>,
    },
    /// Carried over a connected-path circuit
    Circuit {
        /// Destination node
        target: NodeId,
    },
}

impl Route {
    /// Destination, `LOCAL_NODE` for local routes
    pub fn target(&self) -> NodeId {
        match self {
            Route::Local => LOCAL_NODE,
            Route::Unicast { target }
            | Route::Multipath { target, .. }
            | Route::Circuit { target } => *target,
        }
    }
}

/// Decide how a command for `target` is delivered
pub fn plan_route(mode: RouteMode, target: NodeId, graph: Option<&MeshGraph>) -> Result<Route, RouteError> {
    if target == LOCAL_NODE {
        return Ok(Route::Local);
    }

    let route = match (mode, graph) {
        (RouteMode::Connpath, _) => Route::Circuit { target },
        (RouteMode::Unicast, _) | (_, None) => Route::Unicast { target },
        (_, Some(graph)) => {
            let mut path = graph.shortest_path(target, false)?;
            match path.len() {
                0 => Route::Local,
                1 => Route::Unicast { target },
                _ => {
                    path.pop();
                    Route::Multipath {
                        target,
                        relays: path,
                    }
                }
            }
        }
    };

    debug!("Route to {} in {} mode: {:?}", format_node_id(target), mode, route);
    Ok(route)
}

/// Wrap a command payload in the envelope its route needs
pub fn wrap(route: &Route, payload: Bytes) -> Result<Bytes, RouteError> {
    match route {
        Route::Local => Ok(payload),
        Route::Unicast { target } => {
            let args = Args::new()
                .int("target", i64::from(*target))
                .bytes("payload", payload);
            Ok(build_command(&STANDARD, "unicast", &args)?)
        }
        Route::Multipath { target, relays } => {
            if relays.len() > usize::from(u8::MAX) {
                return Err(RouteError::PathTooLong(relays.len()));
            }
            let args = Args::new()
                .int("target", i64::from(*target))
                .int("pathlen", relays.len() as i64)
                .ints("path", relays.iter().map(|id| i64::from(*id)))
                .bytes("payload", payload);
            Ok(build_command(&STANDARD, "multipath", &args)?)
        }
        Route::Circuit { .. } => Err(RouteError::NotWrappable),
    }
}

/// Envelope for a command delivered politely to every node of a filter group
pub fn polite_broadcast(group: u32, payload: Bytes) -> Result<Bytes, RouteError> {
    let filtered = build_command(
        &STANDARD,
        "filter",
        &Args::new()
            .int("target", i64::from(group))
            .bytes("payload", payload),
    )?;
    let polite = build_command(
        &STANDARD,
        "polite",
        &Args::new()
            .int("target", i64::from(BROADCAST))
            .bytes("payload", filtered),
    )?;
    Ok(polite)
}
