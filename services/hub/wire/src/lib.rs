//! Serial wire protocol for meshmesh nodes.
//!
//! This crate covers everything that touches bytes on the serial link:
//! byte-stuffed framing, the declarative command/reply tables of the node
//! firmware, and the connected-path segment headers used by the circuit
//! multiplexer.
//!
//! ## Layers
//!
//! ```text
//! +-------------------------------+
//! | connpath segments / commands  |  codec, connpath
//! +-------------------------------+
//! | command/reply schema tables   |  schema, catalog
//! +-------------------------------+
//! | 0xFE ... 0xEF byte stuffing   |  frame
//! +-------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod codec;
pub mod connpath;
pub mod error;
pub mod frame;
pub mod schema;

pub use catalog::STANDARD;
pub use codec::{build_command, split_response, Args, CodecError, Reply, Value};
pub use connpath::{InboundSegment, SubMessage};
pub use error::WireError;
pub use frame::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE, END_BYTE, ESCAPE_BYTE, START_BYTE};
pub use schema::{Catalog, CommandDef, ReplyDef, SchemaError};
