//! Serial transport core.
//!
//! [`SerialTransport`] does no I/O: bytes read from the link go into
//! [`feed`](SerialTransport::feed), encoded frames to write come out of
//! [`take_outbound`](SerialTransport::take_outbound), and the caller passes
//! the current time so lock timeouts can be driven by any timer.
//!
//! The link is half-duplex in practice, so at most one exchange that waits
//! for an answer is outstanding. Such a send takes the lock; further locked
//! sends are queued until the answer releases it or its timeout expires.
//! Sends without a lock go out immediately.

use bytes::Bytes;
use mesh_wire::catalog::LOGEVENT_CODE;
use mesh_wire::frame::{self, FrameDecoder, START_BYTE};
use mesh_wire::{split_response, STANDARD};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest run of node text kept before it is logged without a line break
const MAX_STRAY_LINE: usize = 256;

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest raw frame accepted by the decoder
    pub max_frame_size: usize,
    /// A locked send arriving while the lock is older than this forces a release
    pub stale_lock: Option<Duration>,
    /// Unclaimed inbound frames kept before the oldest is dropped
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            stale_lock: Some(Duration::from_millis(250)),
            inbound_capacity: 64,
        }
    }
}

/// Matches inbound frames by one or two leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMatcher {
    first: u8,
    second: Option<u8>,
}

impl FrameMatcher {
    /// Frames starting with `first`
    pub fn first(first: u8) -> Self {
        Self {
            first,
            second: None,
        }
    }

    /// Frames starting with `first, second`
    pub fn pair(first: u8, second: u8) -> Self {
        Self {
            first,
            second: Some(second),
        }
    }

    /// Whether `payload` belongs to this matcher
    pub fn matches(&self, payload: &[u8]) -> bool {
        match (payload, self.second) {
            ([first, ..], None) => *first == self.first,
            ([first, second, ..], Some(expected)) => *first == self.first && *second == expected,
            _ => false,
        }
    }
}

/// Registered frame handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

/// Where a received frame went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Claimed by a registered handler
    Handler {
        /// Matching handler
        id: HandlerId,
        /// Frame payload
        payload: Bytes,
    },
    /// Appended to the generic inbound queue
    Queued,
}

#[derive(Debug)]
struct TxLock {
    since: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct PendingFrame {
    frame: Bytes,
    timeout: Duration,
}

/// Sans-IO serial transport
#[derive(Debug)]
pub struct SerialTransport {
    config: TransportConfig,
    decoder: FrameDecoder,
    handlers: Vec<(HandlerId, FrameMatcher)>,
    next_handler: u32,
    inbound: VecDeque<Bytes>,
    lock: Option<TxLock>,
    queued: VecDeque<PendingFrame>,
    outbound: VecDeque<Bytes>,
    stray: Vec<u8>,
}

impl SerialTransport {
    /// New transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            decoder: FrameDecoder::with_max_frame_size(config.max_frame_size),
            config,
            handlers: Vec::new(),
            next_handler: 0,
            inbound: VecDeque::new(),
            lock: None,
            queued: VecDeque::new(),
            outbound: VecDeque::new(),
            stray: Vec::new(),
        }
    }

    /// Claim frames accepted by `matcher`; earlier registrations win
    pub fn register(&mut self, matcher: FrameMatcher) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push((id, matcher));
        id
    }

    /// Stop claiming frames for `id`
    pub fn unregister(&mut self, id: HandlerId) {
        self.handlers.retain(|(handler, _)| *handler != id);
    }

    /// Consume bytes read from the link
    pub fn feed(&mut self, data: &[u8]) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for &byte in data {
            if !self.decoder.in_frame() && byte != START_BYTE {
                self.stray_byte(byte);
                continue;
            }
            if self.decoder.feed(byte) {
                match self.decoder.parse() {
                    Ok(payload) => deliveries.extend(self.dispatch(payload)),
                    Err(e) => debug!("Dropping frame: {}", e),
                }
            }
        }
        deliveries
    }

    fn stray_byte(&mut self, byte: u8) {
        if byte == b'\n' || byte == b'\r' {
            self.flush_stray();
        } else {
            self.stray.push(byte);
            if self.stray.len() >= MAX_STRAY_LINE {
                self.flush_stray();
            }
        }
    }

    fn flush_stray(&mut self) {
        if !self.stray.is_empty() {
            debug!("Node said: {}", String::from_utf8_lossy(&self.stray));
            self.stray.clear();
        }
    }

    fn dispatch(&mut self, payload: Bytes) -> Option<Delivery> {
        if payload.first() == Some(&LOGEVENT_CODE) {
            self.log_event(&payload);
            return None;
        }

        if let Some((id, _)) = self.handlers.iter().find(|(_, m)| m.matches(&payload)) {
            return Some(Delivery::Handler { id: *id, payload });
        }

        if self.inbound.len() >= self.config.inbound_capacity {
            if let Some(dropped) = self.inbound.pop_front() {
                warn!("Inbound queue full, dropping frame {:02X?}", dropped.as_ref());
            }
        }
        debug!("Queued inbound frame of {} bytes", payload.len());
        self.inbound.push_back(payload);
        Some(Delivery::Queued)
    }

    fn log_event(&self, payload: &[u8]) {
        match split_response(&STANDARD, payload) {
            Ok(event) => {
                let line = event.bytes("line").map(|b| String::from_utf8_lossy(b).into_owned());
                info!(
                    "Log from 0x{:08X} level {} {}",
                    event.int("from").unwrap_or_default(),
                    event.int("level").unwrap_or_default(),
                    line.unwrap_or_default().trim_end()
                );
            }
            Err(e) => warn!("Malformed log event: {}", e),
        }
    }

    /// Queue a payload for the link.
    ///
    /// With `lock`, the send waits its turn behind the current lock and then
    /// holds the lock until [`release`](Self::release) or the timeout.
    pub fn send(&mut self, payload: &[u8], lock: Option<Duration>, now: Instant) {
        let frame = frame::encode(payload);
        let Some(timeout) = lock else {
            self.outbound.push_back(frame);
            return;
        };

        let Some(current) = &self.lock else {
            self.transmit(frame, timeout, now);
            return;
        };

        let held = now.saturating_duration_since(current.since);
        self.queued.push_back(PendingFrame { frame, timeout });
        debug!("Link locked, {} frames queued", self.queued.len());

        if let Some(stale) = self.config.stale_lock {
            if held > stale {
                warn!("Lock held for {:?}, forcing release", held);
                self.release(now);
            }
        }
    }

    fn transmit(&mut self, frame: Bytes, timeout: Duration, now: Instant) {
        self.outbound.push_back(frame);
        self.lock = Some(TxLock {
            since: now,
            deadline: now + timeout,
        });
    }

    /// Drop the lock and transmit the oldest queued frame, if any
    pub fn release(&mut self, now: Instant) {
        self.lock = None;
        if let Some(next) = self.queued.pop_front() {
            self.transmit(next.frame, next.timeout, now);
        }
    }

    /// Release an expired lock. Returns whether it was released.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match &self.lock {
            Some(lock) if lock.deadline <= now => {
                warn!("Lock timed out, forcing release ({} queued)", self.queued.len());
                self.release(now);
                true
            }
            _ => false,
        }
    }

    /// When the current lock expires
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock.as_ref().map(|lock| lock.deadline)
    }

    /// Whether a locked exchange is outstanding
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Locked sends waiting for the link
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Encoded frames ready to be written, oldest first
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        self.outbound.drain(..).collect()
    }

    /// Oldest unclaimed inbound frame
    pub fn pop_inbound(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }

    /// Discard unclaimed inbound frames, returning how many were dropped
    pub fn flush_inbound(&mut self) -> usize {
        let flushed = self.inbound.len();
        if flushed > 0 {
            debug!("Flushing {} stale inbound frames", flushed);
        }
        self.inbound.clear();
        flushed
    }
}
