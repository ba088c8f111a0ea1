//! Connected-path segment headers.
//!
//! Outbound segments are sent with opcode [`REQUEST`]:
//!
//! ```text
//! +------+----------+-----+--------+------+-----+--------+-------------+
//! | 0x7A | protocol | sub | handle | 0x00 | seq | length | data...     |
//! |  u8  |    u8    | u8  | u16 LE |u16 LE|u16LE| u16 LE |             |
//! +------+----------+-----+--------+------+-----+--------+-------------+
//! ```
//!
//! An open request carries `port: u16`, `hops: u8` and the path node ids as
//! `u32` LE in its data. Inbound segments start with [`REPLY`], the
//! sub-message byte and the handle; the rest is the body.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::TryFrom;

/// Outbound connected-path opcode
pub const REQUEST: u8 = 0x7A;
/// Inbound connected-path opcode
pub const REPLY: u8 = 0x7B;
/// Protocol byte of connected-path segments
pub const PROTOCOL: u8 = 7;

/// Outbound header length
pub const HEADER_LEN: usize = 11;
/// Inbound header length: opcode, sub-message, handle
pub const INBOUND_HEADER_LEN: usize = 4;

/// Connected-path sub-messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubMessage {
    /// Open a circuit along a path
    OpenReq = 1,
    /// The handle is unknown to the peer
    InvalidHandle = 4,
    /// Circuit data
    SendData = 5,
    /// Circuit opened
    OpenAck = 6,
    /// Circuit refused
    OpenNack = 7,
    /// Close the circuit
    DisconnectReq = 8,
    /// The peer could not forward data
    SendDataError = 9,
    /// Drop all circuits of the coordinator
    Clear = 10,
}

impl TryFrom<u8> for SubMessage {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SubMessage::OpenReq),
            4 => Ok(SubMessage::InvalidHandle),
            5 => Ok(SubMessage::SendData),
            6 => Ok(SubMessage::OpenAck),
            7 => Ok(SubMessage::OpenNack),
            8 => Ok(SubMessage::DisconnectReq),
            9 => Ok(SubMessage::SendDataError),
            10 => Ok(SubMessage::Clear),
            other => Err(WireError::Opcode(other)),
        }
    }
}

fn put_header(buf: &mut BytesMut, sub: SubMessage, handle: u16, seq: u16, len: u16) {
    buf.put_u8(REQUEST);
    buf.put_u8(PROTOCOL);
    buf.put_u8(sub as u8);
    buf.put_u16_le(handle);
    buf.put_u16_le(0);
    buf.put_u16_le(seq);
    buf.put_u16_le(len);
}

/// Encode an outbound segment carrying `data`
pub fn encode_segment(sub: SubMessage, handle: u16, seq: u16, data: &[u8]) -> Result<Bytes, WireError> {
    let len = u16::try_from(data.len()).map_err(|_| WireError::PayloadTooLarge(data.len()))?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    put_header(&mut buf, sub, handle, seq, len);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Encode an open request for `path` toward `port`
pub fn encode_open(handle: u16, seq: u16, port: u16, path: &[u32]) -> Result<Bytes, WireError> {
    let hops = u8::try_from(path.len()).map_err(|_| WireError::PathTooLong(path.len()))?;
    let len = 3 + 4 * path.len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
    put_header(&mut buf, SubMessage::OpenReq, handle, seq, len as u16);
    buf.put_u16_le(port);
    buf.put_u8(hops);
    for id in path {
        buf.put_u32_le(*id);
    }
    Ok(buf.freeze())
}

/// Whether a frame payload is an inbound connected-path segment
pub fn is_inbound(payload: &[u8]) -> bool {
    payload.first() == Some(&REPLY)
}

/// A parsed inbound segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSegment {
    /// Sub-message, `Err` keeps unknown values for logging
    pub sub: Result<SubMessage, u8>,
    /// Circuit handle
    pub handle: u16,
    /// Bytes after the header
    pub body: Bytes,
}

impl InboundSegment {
    /// Parse an inbound frame payload
    pub fn parse(payload: &Bytes) -> Result<Self, WireError> {
        if payload.len() < INBOUND_HEADER_LEN {
            return Err(WireError::Truncated(payload.len()));
        }
        if payload[0] != REPLY {
            return Err(WireError::Opcode(payload[0]));
        }
        let sub = SubMessage::try_from(payload[1]).map_err(|_| payload[1]);
        let handle = u16::from_le_bytes([payload[2], payload[3]]);
        Ok(Self {
            sub,
            handle,
            body: payload.slice(INBOUND_HEADER_LEN..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_data_segment() {
        let seg = encode_segment(SubMessage::SendData, 0x0102, 7, b"hi").unwrap();
        assert_eq!(
            seg.as_ref(),
            &[0x7A, 7, 5, 0x02, 0x01, 0, 0, 7, 0, 2, 0, b'h', b'i']
        );
    }

    #[test]
    fn test_encode_disconnect_has_no_data() {
        let seg = encode_segment(SubMessage::DisconnectReq, 3, 1, &[]).unwrap();
        assert_eq!(seg.len(), HEADER_LEN);
        assert_eq!(seg[2], 8);
    }

    #[test]
    fn test_encode_open_request() {
        let seg = encode_open(1, 1, 80, &[0x112233, 0x445566]).unwrap();
        assert_eq!(seg.len(), HEADER_LEN + 3 + 8);
        assert_eq!(&seg[..HEADER_LEN], &[0x7A, 7, 1, 1, 0, 0, 0, 1, 0, 11, 0]);
        assert_eq!(&seg[HEADER_LEN..HEADER_LEN + 3], &[80, 0, 2]);
        assert_eq!(&seg[HEADER_LEN + 3..HEADER_LEN + 7], &[0x33, 0x22, 0x11, 0x00]);
    }

    #[test]
    fn test_open_path_limit() {
        let path = vec![1u32; 256];
        assert_eq!(encode_open(1, 1, 0, &path), Err(WireError::PathTooLong(256)));
    }

    #[test]
    fn test_payload_limit() {
        let data = vec![0u8; 70_000];
        assert_eq!(
            encode_segment(SubMessage::SendData, 1, 1, &data),
            Err(WireError::PayloadTooLarge(70_000))
        );
    }

    #[test]
    fn test_parse_inbound() {
        let frame = Bytes::from_static(&[0x7B, 5, 0x34, 0x12, 0xAA, 0xBB]);
        let seg = InboundSegment::parse(&frame).unwrap();
        assert_eq!(seg.sub, Ok(SubMessage::SendData));
        assert_eq!(seg.handle, 0x1234);
        assert_eq!(seg.body.as_ref(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_inbound_errors() {
        assert_eq!(
            InboundSegment::parse(&Bytes::from_static(&[0x7B, 6])),
            Err(WireError::Truncated(2))
        );
        assert_eq!(
            InboundSegment::parse(&Bytes::from_static(&[0x05, 6, 0, 0])),
            Err(WireError::Opcode(5))
        );
        let seg = InboundSegment::parse(&Bytes::from_static(&[0x7B, 2, 1, 0])).unwrap();
        assert_eq!(seg.sub, Err(2));
    }
}
