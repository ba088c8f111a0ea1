//! Serial transport, connected-path circuits and the hub event loop.
//!
//! The hub talks to a single coordinator node over a serial port. Everything
//! it sends to the mesh goes over that half-duplex link, so outbound traffic
//! that expects an answer is gated by a lock: one exchange is outstanding at
//! a time, and the rest wait in line.
//!
//! - [`SerialTransport`]: frame reassembly, handler dispatch and the send lock
//! - [`Multiplexer`]: connected-path circuits and their lifecycle
//! - [`HubHandle`]: the operations consumers use, served by one event loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{hub, link, HubOptions};
//! use mesh_wire::Args;
//!
//! # async fn example() -> Result<(), mesh_session::HubError> {
//! let port = link::open_serial("/dev/ttyUSB0", 115_200)?;
//! let (handle, _task) = hub::spawn(port, None, HubOptions::default());
//!
//! let info = handle.handshake().await?;
//! println!("coordinator 0x{:06X}", info.node_id);
//!
//! let reply = handle.send_command("firm", &Args::new(), 0x00A1B2).await?;
//! println!("{:?}", reply.bytes("revision"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hub;
pub mod link;
pub mod multiplexer;
pub mod transport;

pub use error::{CircuitError, HubError, MuxError};
pub use hub::{HandshakeInfo, HubHandle, HubOptions};
pub use multiplexer::{
    CircuitEvent, CircuitInfo, ConnectionLog, ConnectionState, LogEntry, MuxConfig, Multiplexer,
    TerminationReason,
};
pub use transport::{Delivery, FrameMatcher, HandlerId, SerialTransport, TransportConfig};
