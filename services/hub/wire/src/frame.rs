//! Byte-stuffed framing for the serial link.
//!
//! A frame on the wire is `START`, the escaped payload, then `END`. There is
//! no length prefix: boundaries are recovered from the delimiter and escape
//! bytes alone. Any `START`, `ESCAPE` or `END` inside the payload is sent as
//! `ESCAPE` followed by the original byte.
//!
//! ```text
//! +------+--------------------------------+------+
//! | 0xFE | payload, 0xFE/0xEA/0xEF -> EA xx | 0xEF |
//! +------+--------------------------------+------+
//! ```

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// Frame start delimiter
pub const START_BYTE: u8 = 0xFE;
/// Escape marker, the following byte is taken literally
pub const ESCAPE_BYTE: u8 = 0xEA;
/// Frame end delimiter
pub const END_BYTE: u8 = 0xEF;

/// Largest raw (still delimited) frame the decoder accumulates before resynchronizing
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// Minimum raw bytes of a parseable frame: both delimiters plus one payload byte
const MIN_RAW_FRAME: usize = 3;

#[inline]
fn needs_escape(byte: u8) -> bool {
    matches!(byte, START_BYTE | ESCAPE_BYTE | END_BYTE)
}

/// Encode a payload into a delimited, byte-stuffed frame
pub fn encode(payload: &[u8]) -> Bytes {
    let escapes = payload.iter().filter(|b| needs_escape(**b)).count();
    let mut buf = BytesMut::with_capacity(payload.len() + escapes + 2);

    buf.put_u8(START_BYTE);
    for &byte in payload {
        if needs_escape(byte) {
            buf.put_u8(ESCAPE_BYTE);
        }
        buf.put_u8(byte);
    }
    buf.put_u8(END_BYTE);

    buf.freeze()
}

/// Frame checksum: `0xFF` minus the low byte of the payload sum.
///
/// The firmware protocol defines this value but the decoder does not require it.
pub fn checksum(payload: &[u8]) -> u8 {
    let total = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF - total
}

/// Check a payload against a trailing checksum byte
pub fn verify_checksum(payload: &[u8], checksum: u8) -> bool {
    let total = payload.iter().fold(checksum, |acc, b| acc.wrapping_add(*b));
    total == 0xFF
}

/// Incremental frame decoder.
///
/// Bytes are fed one at a time. While idle the decoder ignores everything
/// but `START`; an unescaped `START` inside a frame restarts the frame. The
/// tail of an oversized frame is skipped up to its unescaped `END`.
#[derive(Debug)]
pub struct FrameDecoder {
    raw: BytesMut,
    escape_pending: bool,
    complete: bool,
    discarding: bool,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom raw frame limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            raw: BytesMut::with_capacity(128),
            escape_pending: false,
            complete: false,
            discarding: false,
            max_frame_size: max_frame_size.max(MIN_RAW_FRAME),
        }
    }

    /// Whether a frame has been started and not yet parsed
    pub fn in_frame(&self) -> bool {
        !self.raw.is_empty()
    }

    /// Whether the accumulated frame is complete and ready for [`parse`](Self::parse)
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of raw bytes accumulated so far, delimiters included
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// Drop any partial frame and go back to hunting for `START`
    pub fn reset(&mut self) {
        self.raw.clear();
        self.escape_pending = false;
        self.complete = false;
        self.discarding = false;
    }

    /// Consume one byte. Returns `true` once an unescaped `END` closes the frame.
    pub fn feed(&mut self, byte: u8) -> bool {
        if self.complete {
            // Caller skipped parse(), start over
            self.reset();
        }

        if self.discarding {
            self.skip(byte);
            return false;
        }

        if self.raw.is_empty() {
            if byte == START_BYTE {
                self.raw.put_u8(byte);
            }
            return false;
        }

        if self.escape_pending {
            self.escape_pending = false;
            return self.push(byte, false);
        }

        match byte {
            ESCAPE_BYTE => {
                self.escape_pending = true;
                false
            }
            START_BYTE => {
                debug!("Unescaped start byte after {} bytes, restarting frame", self.raw.len());
                self.raw.clear();
                self.raw.put_u8(byte);
                false
            }
            _ => self.push(byte, byte == END_BYTE),
        }
    }

    fn push(&mut self, byte: u8, terminates: bool) -> bool {
        if self.raw.len() >= self.max_frame_size {
            debug!("Frame exceeds {} bytes, resynchronizing", self.max_frame_size);
            self.reset();
            self.discarding = !terminates;
            return false;
        }
        self.raw.put_u8(byte);
        self.complete = terminates;
        terminates
    }

    fn skip(&mut self, byte: u8) {
        if self.escape_pending {
            self.escape_pending = false;
            return;
        }
        match byte {
            ESCAPE_BYTE => self.escape_pending = true,
            END_BYTE => self.discarding = false,
            START_BYTE => {
                self.discarding = false;
                self.raw.put_u8(byte);
            }
            _ => {}
        }
    }

    /// Strip the delimiters from the completed frame and return its payload.
    ///
    /// The decoder is reset whether or not parsing succeeds.
    pub fn parse(&mut self) -> Result<Bytes, WireError> {
        let raw_len = self.raw.len();
        let complete = self.complete;
        let mut raw = self.raw.split();
        self.reset();

        if !complete || raw_len < MIN_RAW_FRAME {
            return Err(WireError::Framing { raw_len });
        }

        raw.truncate(raw_len - 1);
        Ok(raw.split_off(1).freeze())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        for &b in bytes {
            if decoder.feed(b) {
                out.push(decoder.parse().unwrap());
            }
        }
        out
    }

    #[test]
    fn test_encode_plain_payload() {
        assert_eq!(encode(&[0x04]).as_ref(), &[START_BYTE, 0x04, END_BYTE]);
    }

    #[test]
    fn test_encode_escapes_reserved_bytes() {
        let framed = encode(&[0x01, START_BYTE, ESCAPE_BYTE, END_BYTE, 0x02]);
        assert_eq!(
            framed.as_ref(),
            &[
                START_BYTE, 0x01, ESCAPE_BYTE, START_BYTE, ESCAPE_BYTE, ESCAPE_BYTE, ESCAPE_BYTE,
                END_BYTE, 0x02, END_BYTE
            ]
        );
    }

    #[test]
    fn test_reserved_bytes_survive_decoding() {
        let payloads: [&[u8]; 4] = [
            &[0x10, 0x20],
            &[END_BYTE],
            &[ESCAPE_BYTE, ESCAPE_BYTE, START_BYTE],
            &[END_BYTE, 0x00, START_BYTE, ESCAPE_BYTE, END_BYTE],
        ];

        let mut decoder = FrameDecoder::new();
        for payload in payloads {
            let frames = decode_all(&mut decoder, &encode(payload));
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].as_ref(), payload);
        }
    }

    #[test]
    fn test_escaped_end_does_not_terminate() {
        let mut decoder = FrameDecoder::new();
        assert!(!decoder.feed(START_BYTE));
        assert!(!decoder.feed(0x05));
        assert!(!decoder.feed(ESCAPE_BYTE));
        assert!(!decoder.feed(END_BYTE));
        assert!(decoder.in_frame());
        assert!(decoder.feed(END_BYTE));
        assert_eq!(decoder.parse().unwrap().as_ref(), &[0x05, END_BYTE]);
    }

    #[test]
    fn test_noise_before_frame_is_ignored() {
        let mut decoder = FrameDecoder::new();
        let mut stream = b"boot ok\r\n".to_vec();
        stream.extend_from_slice(&[END_BYTE, ESCAPE_BYTE, 0x33]);
        stream.extend_from_slice(&encode(&[0x05, 0x01, 0x02, 0x03, 0x04]));
        stream.extend_from_slice(&encode(&[0x01, 0x41]));

        let frames = decode_all(&mut decoder, &stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), &[0x05, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frames[1].as_ref(), &[0x01, 0x41]);
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_unescaped_start_restarts_frame() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![START_BYTE, 0x11, 0x22];
        stream.extend_from_slice(&encode(&[0x33]));

        let frames = decode_all(&mut decoder, &stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0x33]);
    }

    #[test]
    fn test_short_frame_is_framing_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(START_BYTE);
        assert!(decoder.feed(END_BYTE));
        assert!(matches!(decoder.parse(), Err(WireError::Framing { raw_len: 2 })));
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_parse_incomplete_frame_fails() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(START_BYTE);
        decoder.feed(0x01);
        decoder.feed(0x02);
        assert!(decoder.parse().is_err());
    }

    #[test]
    fn test_oversized_frame_resynchronizes() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let mut stream = vec![START_BYTE];
        stream.extend_from_slice(&[0x01; 16]);
        stream.push(END_BYTE);
        stream.extend_from_slice(&encode(&[0x07, 0x08]));

        let frames = decode_all(&mut decoder, &stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0x07, 0x08]);
    }

    #[test]
    fn test_escaped_start_in_oversized_tail_is_skipped() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let mut stream = vec![START_BYTE];
        stream.extend_from_slice(&[0x01; 10]);
        stream.extend_from_slice(&[ESCAPE_BYTE, START_BYTE, 0x02, 0x03]);
        stream.push(END_BYTE);
        stream.extend_from_slice(&encode(&[0x09]));

        let frames = decode_all(&mut decoder, &stream);
        assert_eq!(frames, vec![Bytes::from_static(&[0x09])]);
    }

    #[test]
    fn test_checksum() {
        let payload = [0x01, 0x02, 0x03];
        let chk = checksum(&payload);
        assert_eq!(chk, 0xFF - 0x06);
        assert!(verify_checksum(&payload, chk));
        assert!(!verify_checksum(&payload, chk.wrapping_add(1)));
    }
}
