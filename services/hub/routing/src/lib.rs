//! Delivery of hub commands into the mesh.
//!
//! Nodes do not route on their own: the hub decides, per command, whether
//! it goes to the local node as is, inside a `unicast` envelope, inside a
//! `multipath` envelope along the shortest path of its graph, or over a
//! connected-path circuit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod mode;
pub mod route;

pub use error::RouteError;
pub use mode::RouteMode;
pub use route::{plan_route, polite_broadcast, wrap, Route, BROADCAST, LOCAL_NODE};
