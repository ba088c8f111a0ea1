//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Malformed or incomplete frame, the decoder resynchronizes on the next start byte
    #[error("malformed frame ({raw_len} raw bytes)")]
    Framing {
        /// Raw bytes accumulated when parsing was attempted
        raw_len: usize,
    },

    /// Payload does not fit the length field of its header
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Path does not fit the hop count field of an open request
    #[error("path too long: {0} hops")]
    PathTooLong(usize),

    /// Connected-path frame shorter than its fixed header
    #[error("connected-path frame truncated: {0} bytes")]
    Truncated(usize),

    /// Frame does not carry the connected-path reply opcode
    #[error("unexpected opcode 0x{0:02X}")]
    Opcode(u8),
}
