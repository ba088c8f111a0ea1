//! Connected-path circuit multiplexer.
//!
//! A circuit is opened along an explicit relay path and is then addressed by
//! a 16-bit handle. The multiplexer owns every circuit's state machine:
//!
//! ```text
//! INIT --ack--> ACTIVE
//!   |             |
//!   +--nack/timeout/data error--> ERROR (removed)
//! ```
//!
//! Like [`SerialTransport`], it does no I/O and takes the current time from
//! the caller. Consumers are notified through [`CircuitEvent`] channels and
//! oneshot waiters.

use crate::error::{CircuitError, MuxError};
use crate::transport::{FrameMatcher, HandlerId, SerialTransport};
use bytes::Bytes;
use chrono::{DateTime, Local};
use mesh_topology::{format_node_id, NodeId};
use mesh_wire::connpath::{self, InboundSegment, SubMessage};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Resolves once a circuit is active or has failed
pub type OpenSender = oneshot::Sender<Result<(), MuxError>>;
/// Resolves with the next data segment of a circuit
pub type ReplySender = oneshot::Sender<Result<Bytes, MuxError>>;

const LOG_HEADER: &str = "indx | port | hndl | Created on           | Elapsed         | Tr | path";
const LOG_RULE: &str = "-----|------|------|----------------------|-----------------|----|-------------------------------";

/// Multiplexer timing
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Link lock held by an open request
    pub open_lock: Duration,
    /// Wait for the open acknowledgement
    pub open_timeout: Duration,
    /// Wait for circuit data answering a request
    pub reply_timeout: Duration,
    /// Closed circuits kept in the log table
    pub log_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            open_lock: Duration::from_millis(500),
            open_timeout: Duration::from_millis(1300),
            reply_timeout: Duration::from_secs(5),
            log_capacity: 100,
        }
    }
}

/// Circuit lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open request sent
    Init,
    /// Acknowledged, data may flow
    Active,
    /// Failed
    Error,
}

/// Why a circuit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Closed by the local side
    ClientDisconnect,
    /// Refused or never acknowledged
    InitError,
    /// Failed after opening
    DataError,
}

impl TerminationReason {
    /// Two-letter code used in the log table
    pub fn code(&self) -> &'static str {
        match self {
            TerminationReason::ClientDisconnect => "CD",
            TerminationReason::InitError => "IE",
            TerminationReason::DataError => "DE",
        }
    }
}

/// Notification delivered to a circuit's consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    /// The circuit was acknowledged
    Active,
    /// Data arrived on the circuit
    Data(Bytes),
    /// The circuit failed and was removed
    Disconnected(CircuitError),
}

/// Snapshot of one circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitInfo {
    /// Circuit handle
    pub handle: u16,
    /// Last node of the path
    pub target: NodeId,
    /// Port at the target
    pub port: u16,
    /// Relay path, target last
    pub path: Vec<NodeId>,
    /// Lifecycle state
    pub state: ConnectionState,
}

#[derive(Debug)]
struct Connection {
    info: CircuitInfo,
    open_deadline: Option<Instant>,
    open_waiters: Vec<OpenSender>,
    reply: Option<(ReplySender, Instant)>,
    events: Option<mpsc::UnboundedSender<CircuitEvent>>,
    log_index: u64,
}

impl Connection {
    fn has_reply_waiter(&self) -> bool {
        self.reply.as_ref().is_some_and(|(tx, _)| !tx.is_closed())
    }

    fn fail(mut self, reason: CircuitError) {
        self.info.state = ConnectionState::Error;
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(reason.into()));
        }
        if let Some(events) = self.events.take() {
            let _ = events.send(CircuitEvent::Disconnected(reason));
        }
        if let Some((reply, _)) = self.reply.take() {
            let _ = reply.send(Err(reason.into()));
        }
    }
}

/// One row of the circuit log
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Monotonic row number
    pub index: u64,
    /// Target port
    pub port: u16,
    /// Circuit handle
    pub handle: u16,
    /// Relay path, target last
    pub path: Vec<NodeId>,
    /// When the open request was sent
    pub created: DateTime<Local>,
    /// When the circuit ended
    pub finished: Option<DateTime<Local>>,
    /// Why it ended
    pub reason: Option<TerminationReason>,
}

/// Bounded history of circuits, rendered as a text table
#[derive(Debug)]
pub struct ConnectionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_index: u64,
}

impl ConnectionLog {
    /// Empty log keeping at most `capacity` rows
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_index: 0,
        }
    }

    /// Record a new circuit, returning its row index
    pub fn opened(&mut self, handle: u16, port: u16, path: &[NodeId], at: DateTime<Local>) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            index,
            port,
            handle,
            path: path.to_vec(),
            created: at,
            finished: None,
            reason: None,
        });
        index
    }

    /// Mark row `index` as ended
    pub fn closed(&mut self, index: u64, reason: TerminationReason, at: DateTime<Local>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) {
            entry.finished = Some(at);
            entry.reason = Some(reason);
        }
    }

    /// Rows, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Text table of every row; open circuits show their age at `now`
    pub fn render(&self, now: DateTime<Local>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", LOG_HEADER);
        let _ = writeln!(out, "{}", LOG_RULE);
        for entry in &self.entries {
            let elapsed = entry.finished.unwrap_or(now) - entry.created;
            let path = entry
                .path
                .iter()
                .map(|id| format!("{:06X}", id))
                .collect::<Vec<_>>()
                .join(" -> ");
            let _ = writeln!(
                out,
                "{:04} | {:04} | {:04X} | {:<20} | {:<15} | {:<2} | {}",
                entry.index,
                entry.port,
                entry.handle,
                entry.created.format("%m/%d/%Y, %H:%M:%S").to_string(),
                format_elapsed(elapsed),
                entry.reason.map(|r| r.code()).unwrap_or(""),
                path
            );
        }
        out
    }
}

fn format_elapsed(elapsed: chrono::Duration) -> String {
    let millis = elapsed.num_milliseconds().max(0);
    let secs = millis / 1000;
    format!("{}:{:02}:{:02}.{:03}", secs / 3600, (secs / 60) % 60, secs % 60, millis % 1000)
}

fn wrap_next(counter: &mut u16) -> u16 {
    *counter = if *counter == u16::MAX { 1 } else { *counter + 1 };
    *counter
}

/// Circuit multiplexer
#[derive(Debug)]
pub struct Multiplexer {
    config: MuxConfig,
    connections: BTreeMap<u16, Connection>,
    handler: Option<HandlerId>,
    last_handle: u16,
    last_seq: u16,
    log: ConnectionLog,
}

impl Multiplexer {
    /// New multiplexer
    pub fn new(config: MuxConfig) -> Self {
        Self {
            log: ConnectionLog::new(config.log_capacity),
            config,
            connections: BTreeMap::new(),
            handler: None,
            last_handle: 0,
            last_seq: 0,
        }
    }

    /// Claim inbound segments on `transport`
    pub fn register(&mut self, transport: &mut SerialTransport) -> HandlerId {
        if let Some(id) = self.handler {
            return id;
        }
        let id = transport.register(FrameMatcher::first(connpath::REPLY));
        self.handler = Some(id);
        id
    }

    /// Transport handler claiming inbound segments
    pub fn handler(&self) -> Option<HandlerId> {
        self.handler
    }

    /// Ask the coordinator to drop every circuit, ours and any left from a
    /// previous session
    pub fn clear(&mut self, transport: &mut SerialTransport, now: Instant) -> Result<(), MuxError> {
        let seq = wrap_next(&mut self.last_seq);
        let frame = connpath::encode_segment(SubMessage::Clear, 0, seq, &[])?;
        transport.send(&frame, None, now);
        let handles: Vec<u16> = self.connections.keys().copied().collect();
        for handle in handles {
            self.terminate(handle, TerminationReason::ClientDisconnect, CircuitError::Closed);
        }
        info!("Cleared all circuits");
        Ok(())
    }

    fn allocate_handle(&mut self) -> Result<u16, MuxError> {
        for _ in 0..u16::MAX {
            let handle = wrap_next(&mut self.last_handle);
            if !self.connections.contains_key(&handle) {
                return Ok(handle);
            }
        }
        Err(MuxError::HandlesExhausted)
    }

    /// Send an open request along `path` (target last) and return the new handle
    pub fn open(
        &mut self,
        transport: &mut SerialTransport,
        path: Vec<NodeId>,
        port: u16,
        events: Option<mpsc::UnboundedSender<CircuitEvent>>,
        now: Instant,
    ) -> Result<u16, MuxError> {
        let target = *path.last().ok_or(MuxError::EmptyPath)?;
        let handle = self.allocate_handle()?;
        let seq = wrap_next(&mut self.last_seq);
        let frame = connpath::encode_open(handle, seq, port, &path)?;
        transport.send(&frame, Some(self.config.open_lock), now);

        let log_index = self.log.opened(handle, port, &path, Local::now());
        debug!(
            "Opening circuit {:04X} to {} port {} over {} hops",
            handle,
            format_node_id(target),
            port,
            path.len()
        );
        self.connections.insert(
            handle,
            Connection {
                info: CircuitInfo {
                    handle,
                    target,
                    port,
                    path,
                    state: ConnectionState::Init,
                },
                open_deadline: Some(now + self.config.open_timeout),
                open_waiters: Vec::new(),
                reply: None,
                events,
                log_index,
            },
        );
        Ok(handle)
    }

    /// Resolve `waiter` once `handle` is active
    pub fn wait_open(&mut self, handle: u16, waiter: OpenSender) {
        match self.connections.get_mut(&handle) {
            Some(conn) if conn.info.state == ConnectionState::Active => {
                let _ = waiter.send(Ok(()));
            }
            Some(conn) => conn.open_waiters.push(waiter),
            None => {
                let _ = waiter.send(Err(MuxError::UnknownHandle(handle)));
            }
        }
    }

    /// Live circuit to `target` at `port`
    pub fn find(&self, target: NodeId, port: u16) -> Option<u16> {
        self.connections
            .values()
            .find(|c| c.info.target == target && c.info.port == port && c.info.state != ConnectionState::Error)
            .map(|c| c.info.handle)
    }

    /// Current state of `handle`
    pub fn state(&self, handle: u16) -> Option<ConnectionState> {
        self.connections.get(&handle).map(|c| c.info.state)
    }

    /// Snapshot of every live circuit
    pub fn circuits(&self) -> Vec<CircuitInfo> {
        self.connections.values().map(|c| c.info.clone()).collect()
    }

    /// Circuit history
    pub fn log(&self) -> &ConnectionLog {
        &self.log
    }

    /// Send data on an active circuit
    pub fn send_data(
        &mut self,
        transport: &mut SerialTransport,
        handle: u16,
        data: &[u8],
        now: Instant,
    ) -> Result<(), MuxError> {
        let conn = self.connections.get(&handle).ok_or(MuxError::UnknownHandle(handle))?;
        if conn.info.state != ConnectionState::Active {
            return Err(MuxError::NotActive(handle));
        }
        let seq = wrap_next(&mut self.last_seq);
        let frame = connpath::encode_segment(SubMessage::SendData, handle, seq, data)?;
        transport.send(&frame, None, now);
        Ok(())
    }

    /// Send `data` and resolve `reply` with the next segment on the circuit.
    ///
    /// Failures are reported through `reply`.
    pub fn request(
        &mut self,
        transport: &mut SerialTransport,
        handle: u16,
        data: &[u8],
        reply: ReplySender,
        now: Instant,
    ) {
        match self.connections.get(&handle) {
            None => {
                let _ = reply.send(Err(MuxError::UnknownHandle(handle)));
                return;
            }
            Some(conn) if conn.has_reply_waiter() => {
                let _ = reply.send(Err(MuxError::ReplyPending(handle)));
                return;
            }
            Some(_) => {}
        }

        if let Err(e) = self.send_data(transport, handle, data, now) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.reply = Some((reply, now + self.config.reply_timeout));
        }
    }

    /// Close `handle` from the local side.
    ///
    /// The consumer is unregistered first and gets no disconnect event.
    pub fn disconnect(&mut self, transport: &mut SerialTransport, handle: u16, now: Instant) -> Result<(), MuxError> {
        let conn = self.connections.get_mut(&handle).ok_or(MuxError::UnknownHandle(handle))?;
        conn.events = None;
        let seq = wrap_next(&mut self.last_seq);
        let frame = connpath::encode_segment(SubMessage::DisconnectReq, handle, seq, &[])?;
        transport.send(&frame, None, now);
        self.terminate(handle, TerminationReason::ClientDisconnect, CircuitError::Closed);
        Ok(())
    }

    fn terminate(&mut self, handle: u16, reason: TerminationReason, error: CircuitError) {
        if let Some(conn) = self.connections.remove(&handle) {
            self.log.closed(conn.log_index, reason, Local::now());
            info!(
                "Circuit {:04X} to {} ended: {} ({})",
                handle,
                format_node_id(conn.info.target),
                reason.code(),
                error
            );
            conn.fail(error);
        }
    }

    /// Handle an inbound segment claimed by the multiplexer's handler
    pub fn receive(&mut self, transport: &mut SerialTransport, payload: &Bytes, now: Instant) {
        let segment = match InboundSegment::parse(payload) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("Malformed circuit segment: {}", e);
                return;
            }
        };

        let handle = segment.handle;
        if !self.connections.contains_key(&handle) {
            error!("Segment {:?} for unknown circuit {:04X}", segment.sub, handle);
            self.reject_handle(transport, handle, now);
            return;
        }

        let sub = match segment.sub {
            Ok(sub) => sub,
            Err(code) => {
                warn!("Unknown circuit sub-message {} on {:04X}", code, handle);
                return;
            }
        };

        match sub {
            SubMessage::OpenAck => self.on_open_ack(handle),
            SubMessage::OpenNack => {
                self.terminate(handle, TerminationReason::InitError, CircuitError::Refused)
            }
            SubMessage::SendData => self.on_data(handle, segment.body),
            SubMessage::SendDataError => {
                self.terminate(handle, TerminationReason::DataError, CircuitError::DataError)
            }
            SubMessage::InvalidHandle => {
                self.terminate(handle, TerminationReason::DataError, CircuitError::InvalidHandle)
            }
            other => warn!("Unexpected {:?} on circuit {:04X}", other, handle),
        }

        if matches!(
            sub,
            SubMessage::OpenAck | SubMessage::OpenNack | SubMessage::SendDataError | SubMessage::InvalidHandle
        ) {
            transport.release(now);
        }
    }

    fn reject_handle(&mut self, transport: &mut SerialTransport, handle: u16, now: Instant) {
        let seq = wrap_next(&mut self.last_seq);
        match connpath::encode_segment(SubMessage::InvalidHandle, handle, seq, &[]) {
            Ok(frame) => transport.send(&frame, None, now),
            Err(e) => warn!("Could not reject circuit {:04X}: {}", handle, e),
        }
    }

    fn on_open_ack(&mut self, handle: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if conn.info.state != ConnectionState::Init {
            error!("Open acknowledgement for circuit {:04X} in state {:?}", handle, conn.info.state);
            return;
        }
        conn.info.state = ConnectionState::Active;
        conn.open_deadline = None;
        for waiter in conn.open_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if let Some(events) = &conn.events {
            if events.send(CircuitEvent::Active).is_err() {
                conn.events = None;
            }
        }
        info!("Circuit {:04X} to {} is active", handle, format_node_id(conn.info.target));
    }

    fn on_data(&mut self, handle: u16, body: Bytes) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let body = match &conn.events {
            Some(events) => match events.send(CircuitEvent::Data(body)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    conn.events = None;
                    match event {
                        CircuitEvent::Data(body) => body,
                        _ => return,
                    }
                }
            },
            None => body,
        };
        match conn.reply.take() {
            Some((reply, _)) => {
                let _ = reply.send(Ok(body));
            }
            None => debug!("Dropping {} unclaimed bytes on circuit {:04X}", body.len(), handle),
        }
    }

    /// Expire open and reply waits due at `now`
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .connections
            .values()
            .filter(|c| c.info.state == ConnectionState::Init && c.open_deadline.is_some_and(|d| d <= now))
            .map(|c| c.info.handle)
            .collect();
        for handle in expired {
            self.terminate(handle, TerminationReason::InitError, CircuitError::OpenTimeout);
        }

        for conn in self.connections.values_mut() {
            if conn.reply.as_ref().is_some_and(|(_, deadline)| *deadline <= now) {
                if let Some((reply, _)) = conn.reply.take() {
                    warn!("No reply on circuit {:04X}", conn.info.handle);
                    let _ = reply.send(Err(CircuitError::ReplyTimeout.into()));
                }
            }
        }
    }

    /// Earliest pending open or reply deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.connections
            .values()
            .flat_map(|c| [c.open_deadline, c.reply.as_ref().map(|(_, d)| *d)])
            .flatten()
            .min()
    }
}
