//! Hub event loop and its consumer handle.
//!
//! One task owns the serial link, the transport, the multiplexer and the
//! graph. Consumers talk to it through [`HubHandle`], which can be cloned
//! freely; every operation is a message to the loop answered on a oneshot.
//! Locked command exchanges are serialized here: the next one starts only
//! when the previous one got its reply or timed out.

use crate::error::{HubError, MuxError};
use crate::link::{self, CHUNK_DELAY, CHUNK_SIZE};
use crate::multiplexer::{CircuitEvent, CircuitInfo, MuxConfig, Multiplexer, OpenSender, ReplySender};
use crate::transport::{Delivery, HandlerId, SerialTransport, TransportConfig};
use bytes::Bytes;
use chrono::Local;
use mesh_routing::{plan_route, polite_broadcast, wrap, Route, RouteMode, LOCAL_NODE};
use mesh_topology::{format_node_id, GraphStore, MeshGraph, NeighborTable, NodeId, SweepOutcome};
use mesh_wire::schema::ReplyCoding;
use mesh_wire::{build_command, split_response, Args, CodecError, Reply, STANDARD};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Text the node must echo during the handshake
const HANDSHAKE_ECHO: &[u8] = b"CIAO";

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// How commands reach remote nodes
    pub mode: RouteMode,
    /// Wait for the reply to a command exchange
    pub reply_timeout: Duration,
    /// Pause after each reply in polite mode
    pub polite_pause: Duration,
    /// Serial write chunk
    pub chunk_size: usize,
    /// Pause after each serial chunk
    pub chunk_delay: Duration,
    /// Transport tuning
    pub transport: TransportConfig,
    /// Circuit timing
    pub mux: MuxConfig,
    /// File the circuit table is written to
    pub log_table: Option<PathBuf>,
    /// How often the circuit table is written
    pub log_flush_interval: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            mode: RouteMode::default(),
            reply_timeout: Duration::from_secs(3),
            polite_pause: Duration::from_millis(500),
            chunk_size: CHUNK_SIZE,
            chunk_delay: CHUNK_DELAY,
            transport: TransportConfig::default(),
            mux: MuxConfig::default(),
            log_table: None,
            log_flush_interval: Duration::from_secs(5),
        }
    }
}

/// Identity of the node on the serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Serial number
    pub node_id: NodeId,
    /// Firmware revision
    pub firmware: String,
}

type GraphJob = Box<dyn FnOnce(&mut Option<MeshGraph>) + Send>;

enum Command {
    Exchange {
        payload: Bytes,
        timeout: Duration,
        reply: oneshot::Sender<Result<Bytes, HubError>>,
    },
    Post {
        payload: Bytes,
        flush: bool,
    },
    OpenCircuit {
        target: NodeId,
        port: u16,
        events: Option<mpsc::UnboundedSender<CircuitEvent>>,
        reply: oneshot::Sender<Result<u16, HubError>>,
    },
    EnsureCircuit {
        target: NodeId,
        port: u16,
        reply: oneshot::Sender<Result<u16, HubError>>,
    },
    WaitOpen {
        handle: u16,
        reply: OpenSender,
    },
    SendOnCircuit {
        handle: u16,
        data: Bytes,
        reply: oneshot::Sender<Result<(), MuxError>>,
    },
    CircuitRequest {
        handle: u16,
        data: Bytes,
        reply: ReplySender,
    },
    CloseCircuit {
        handle: u16,
        reply: oneshot::Sender<Result<(), MuxError>>,
    },
    ClearCircuits {
        reply: oneshot::Sender<Result<(), MuxError>>,
    },
    Circuits {
        reply: oneshot::Sender<Vec<CircuitInfo>>,
    },
    Graph(GraphJob),
}

struct PendingExchange {
    payload: Bytes,
    timeout: Duration,
    reply: oneshot::Sender<Result<Bytes, HubError>>,
}

struct ActiveExchange {
    reply: oneshot::Sender<Result<Bytes, HubError>>,
    timeout: Duration,
    deadline: Instant,
}

/// Start the hub on `link`
pub fn spawn<L>(link: L, graph: Option<MeshGraph>, options: HubOptions) -> (HubHandle, JoinHandle<Result<(), HubError>>)
where
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let handle = HubHandle {
        commands: tx,
        mode: options.mode,
        reply_timeout: options.reply_timeout,
        polite_pause: options.polite_pause,
    };
    let mut transport = SerialTransport::new(options.transport.clone());
    let mut mux = Multiplexer::new(options.mux.clone());
    let mux_handler = mux.register(&mut transport);
    let hub = Hub {
        options,
        transport,
        mux,
        mux_handler,
        graph,
        commands: rx,
        exchanges: VecDeque::new(),
        active: None,
    };
    (handle, tokio::spawn(hub.run(link)))
}

struct Hub {
    options: HubOptions,
    transport: SerialTransport,
    mux: Multiplexer,
    mux_handler: HandlerId,
    graph: Option<MeshGraph>,
    commands: mpsc::Receiver<Command>,
    exchanges: VecDeque<PendingExchange>,
    active: Option<ActiveExchange>,
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Hub {
    async fn run<L>(mut self, link: L) -> Result<(), HubError>
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(link);
        let mut buf = vec![0u8; 512];
        let mut flush = tokio::time::interval(self.options.log_flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Hub started in {} mode", self.options.mode);

        let result = loop {
            let deadline = self.next_deadline();
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Err(HubError::LinkClosed),
                    Ok(n) => self.on_bytes(&buf[..n]),
                    Err(e) => break Err(e.into()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        info!("All hub handles dropped, stopping");
                        break Ok(());
                    }
                },
                _ = sleep_until_some(deadline) => self.on_deadline(),
                _ = flush.tick() => self.flush_log().await,
            }
            self.start_next_exchange(Instant::now());

            if let Err(e) = self.write_pending(&mut writer).await {
                break Err(e.into());
            }
        };

        match &result {
            Ok(()) => info!("Hub stopped"),
            Err(e) => error!("Hub stopped: {}", e),
        }
        self.flush_log().await;
        result
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.transport.next_deadline(),
            self.mux.next_deadline(),
            self.active.as_ref().map(|a| a.deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_bytes(&mut self, data: &[u8]) {
        let now = Instant::now();
        for delivery in self.transport.feed(data) {
            match delivery {
                Delivery::Handler { id, payload } if id == self.mux_handler => {
                    self.mux.receive(&mut self.transport, &payload, now)
                }
                Delivery::Handler { payload, .. } => {
                    debug!("Unclaimed handler frame {:02X?}", payload.as_ref())
                }
                Delivery::Queued => self.complete_exchange(now),
            }
        }
    }

    fn complete_exchange(&mut self, now: Instant) {
        let Some(active) = self.active.take() else {
            debug!("Inbound frame with no exchange pending");
            return;
        };
        match self.transport.pop_inbound() {
            Some(frame) => {
                if self.transport.next_deadline() == Some(active.deadline) {
                    self.transport.release(now);
                }
                let _ = active.reply.send(Ok(frame));
                self.start_next_exchange(now);
            }
            None => self.active = Some(active),
        }
    }

    /// Transmit the next queued exchange once the link is free.
    ///
    /// The exchange deadline and the transport lock start together, so a
    /// timeout always releases the lock of the frame that went unanswered.
    fn start_next_exchange(&mut self, now: Instant) {
        if self.active.is_some() || self.transport.is_locked() {
            return;
        }
        while let Some(exchange) = self.exchanges.pop_front() {
            if exchange.reply.is_closed() {
                continue;
            }
            self.transport.flush_inbound();
            self.transport.send(&exchange.payload, Some(exchange.timeout), now);
            self.active = Some(ActiveExchange {
                reply: exchange.reply,
                timeout: exchange.timeout,
                deadline: now + exchange.timeout,
            });
            break;
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired = self.active.as_ref().is_some_and(|a| a.deadline <= now);
        if let Some(active) = expired.then(|| self.active.take()).flatten() {
            warn!("No reply within {:?}", active.timeout);
            // The lock still belongs to this exchange unless the stale guard took it
            if self.transport.next_deadline() == Some(active.deadline) {
                self.transport.release(now);
            }
            let dropped = self.transport.flush_inbound();
            if dropped > 0 {
                debug!("Dropped {} frames of the abandoned exchange", dropped);
            }
            let _ = active.reply.send(Err(HubError::Timeout(active.timeout)));
        }
        self.transport.poll_timeout(now);
        self.mux.poll_timeouts(now);
        self.start_next_exchange(now);
    }

    fn circuit_path(&self, target: NodeId) -> Result<Vec<NodeId>, HubError> {
        let graph = self.graph.as_ref().ok_or(HubError::NoGraph)?;
        Ok(graph.shortest_path(target, false)?)
    }

    fn open_circuit(
        &mut self,
        target: NodeId,
        port: u16,
        events: Option<mpsc::UnboundedSender<CircuitEvent>>,
        now: Instant,
    ) -> Result<u16, HubError> {
        let path = self.circuit_path(target)?;
        Ok(self.mux.open(&mut self.transport, path, port, events, now)?)
    }

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Exchange { payload, timeout, reply } => {
                self.exchanges.push_back(PendingExchange { payload, timeout, reply });
                self.start_next_exchange(now);
            }
            Command::Post { payload, flush } => {
                if flush {
                    self.transport.flush_inbound();
                }
                self.transport.send(&payload, None, now);
            }
            Command::OpenCircuit { target, port, events, reply } => {
                let _ = reply.send(self.open_circuit(target, port, events, now));
            }
            Command::EnsureCircuit { target, port, reply } => {
                let result = match self.mux.find(target, port) {
                    Some(handle) => Ok(handle),
                    None => self.open_circuit(target, port, None, now),
                };
                let _ = reply.send(result);
            }
            Command::WaitOpen { handle, reply } => self.mux.wait_open(handle, reply),
            Command::SendOnCircuit { handle, data, reply } => {
                let _ = reply.send(self.mux.send_data(&mut self.transport, handle, &data, now));
            }
            Command::CircuitRequest { handle, data, reply } => {
                self.mux.request(&mut self.transport, handle, &data, reply, now)
            }
            Command::CloseCircuit { handle, reply } => {
                let _ = reply.send(self.mux.disconnect(&mut self.transport, handle, now));
            }
            Command::ClearCircuits { reply } => {
                let _ = reply.send(self.mux.clear(&mut self.transport, now));
            }
            Command::Circuits { reply } => {
                let _ = reply.send(self.mux.circuits());
            }
            Command::Graph(job) => job(&mut self.graph),
        }
    }

    async fn write_pending<L>(&mut self, writer: &mut WriteHalf<L>) -> std::io::Result<()>
    where
        L: AsyncRead + AsyncWrite,
    {
        for frame in self.transport.take_outbound() {
            debug!("Writing {} byte frame", frame.len());
            link::write_chunked(writer, &frame, self.options.chunk_size, self.options.chunk_delay).await?;
        }
        Ok(())
    }

    async fn flush_log(&self) {
        let Some(path) = &self.options.log_table else {
            return;
        };
        let table = self.mux.log().render(Local::now());
        if let Err(e) = tokio::fs::write(path, table).await {
            warn!("Could not write circuit table to {}: {}", path.display(), e);
        }
    }
}

/// Cloneable handle to a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    mode: RouteMode,
    reply_timeout: Duration,
    polite_pause: Duration,
}

impl HubHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).await.map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Delivery mode in use
    pub fn mode(&self) -> RouteMode {
        self.mode
    }

    /// Send `payload` locked and return the next unclaimed inbound frame
    pub async fn exchange(&self, payload: Bytes) -> Result<Bytes, HubError> {
        let timeout = self.reply_timeout;
        self.call(|reply| Command::Exchange { payload, timeout, reply }).await?
    }

    /// Send `payload` without waiting for anything
    pub async fn post(&self, payload: Bytes) -> Result<(), HubError> {
        self.commands
            .send(Command::Post { payload, flush: false })
            .await
            .map_err(|_| HubError::Stopped)
    }

    async fn route(&self, target: NodeId) -> Result<Route, HubError> {
        let mode = self.mode;
        Ok(self.with_graph(move |graph| plan_route(mode, target, graph.as_ref())).await??)
    }

    /// Send command `name` to `target` (0 for the local node) and decode its reply
    pub async fn send_command(&self, name: &str, args: &Args, target: NodeId) -> Result<Reply, HubError> {
        let (def, _) = STANDARD
            .resolve(name)
            .ok_or_else(|| CodecError::UnknownCommand(name.to_string()))?;
        if def.reply == ReplyCoding::None {
            return Err(HubError::NoReply(name.to_string()));
        }
        let payload = build_command(&STANDARD, name, args)?;

        let raw = match self.route(target).await? {
            Route::Circuit { target } => self.send_and_receive(target, payload).await?,
            route => self.exchange(wrap(&route, payload)?).await?,
        };

        let reply = split_response(&STANDARD, &raw)?;
        if reply.is_error() {
            return Err(HubError::NodeError {
                target,
                data: reply.bytes("data").cloned().unwrap_or_default(),
            });
        }
        let leaf = name.rsplit('/').next().unwrap_or(name);
        if reply.id != leaf {
            return Err(HubError::MismatchedReply {
                expected: leaf.to_string(),
                got: reply.id,
            });
        }

        if self.mode == RouteMode::Polite && target != LOCAL_NODE {
            tokio::time::sleep(self.polite_pause).await;
        }
        Ok(reply)
    }

    /// Send command `name` to `target` without waiting for a reply
    pub async fn post_command(&self, name: &str, args: &Args, target: NodeId) -> Result<(), HubError> {
        let payload = build_command(&STANDARD, name, args)?;
        match self.route(target).await? {
            Route::Circuit { target } => {
                let handle = self.call(|reply| Command::EnsureCircuit { target, port: 0, reply }).await??;
                self.wait_open(handle).await?;
                self.send_on_circuit(handle, payload).await
            }
            route => self.post(wrap(&route, payload)?).await,
        }
    }

    /// Deliver command `name` to every node of filter `group`, politely
    pub async fn broadcast_polite(&self, group: u32, name: &str, args: &Args) -> Result<(), HubError> {
        let payload = polite_broadcast(group, build_command(&STANDARD, name, args)?)?;
        debug!("Polite broadcast of '{}' to group {:#X}", name, group);
        self.commands
            .send(Command::Post { payload, flush: true })
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Open a circuit to `target` along the graph's shortest path.
    ///
    /// Returns the handle right away; `events` reports when the circuit
    /// becomes active, its data, and its failure.
    pub async fn open_circuit(
        &self,
        target: NodeId,
        port: u16,
        events: mpsc::UnboundedSender<CircuitEvent>,
    ) -> Result<u16, HubError> {
        self.call(|reply| Command::OpenCircuit {
            target,
            port,
            events: Some(events),
            reply,
        })
        .await?
    }

    /// Wait until `handle` is active
    pub async fn wait_open(&self, handle: u16) -> Result<(), HubError> {
        Ok(self.call(|reply| Command::WaitOpen { handle, reply }).await??)
    }

    /// Send data on an active circuit
    pub async fn send_on_circuit(&self, handle: u16, data: Bytes) -> Result<(), HubError> {
        Ok(self.call(|reply| Command::SendOnCircuit { handle, data, reply }).await??)
    }

    /// Close a circuit; its consumer gets no further events
    pub async fn close_circuit(&self, handle: u16) -> Result<(), HubError> {
        Ok(self.call(|reply| Command::CloseCircuit { handle, reply }).await??)
    }

    /// Drop every circuit on the coordinator
    pub async fn clear_circuits(&self) -> Result<(), HubError> {
        Ok(self.call(|reply| Command::ClearCircuits { reply }).await??)
    }

    /// Live circuits
    pub async fn circuits(&self) -> Result<Vec<CircuitInfo>, HubError> {
        self.call(|reply| Command::Circuits { reply }).await
    }

    /// Send `data` to port 0 of `target` over a circuit and return the next
    /// data it sends back. An existing circuit is reused.
    pub async fn send_and_receive(&self, target: NodeId, data: Bytes) -> Result<Bytes, HubError> {
        let handle = self.call(|reply| Command::EnsureCircuit { target, port: 0, reply }).await??;
        self.wait_open(handle).await?;
        Ok(self.call(|reply| Command::CircuitRequest { handle, data, reply }).await??)
    }

    /// Path from the local node to `target`, both included
    pub async fn resolve_path(&self, target: NodeId) -> Result<Vec<NodeId>, HubError> {
        self.with_graph(move |graph| match graph {
            Some(graph) => graph.shortest_path(target, true).map_err(HubError::from),
            None => Err(HubError::NoGraph),
        })
        .await?
    }

    /// Run `f` on the hub's graph inside the event loop
    pub async fn with_graph<R, F>(&self, f: F) -> Result<R, HubError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Option<MeshGraph>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: GraphJob = Box::new(move |graph| {
            let _ = tx.send(f(graph));
        });
        self.commands.send(Command::Graph(job)).await.map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Replace the graph with the one in `store`, returning its node count
    pub async fn load_graph(&self, store: &dyn GraphStore) -> Result<usize, HubError> {
        let graph = store.load()?;
        let nodes = graph.node_count();
        self.with_graph(move |current| *current = Some(graph)).await?;
        info!("Loaded graph with {} nodes", nodes);
        Ok(nodes)
    }

    /// Write the graph to `store`
    pub async fn save_graph(&self, store: &dyn GraphStore, backup: bool) -> Result<(), HubError> {
        let graph = self
            .with_graph(|graph| graph.clone())
            .await?
            .ok_or(HubError::NoGraph)?;
        store.save(&graph, backup)?;
        Ok(())
    }

    /// Check the node on the serial port answers and learn its identity.
    ///
    /// The node becomes the graph's coordinator and every circuit left on
    /// it from a previous run is cleared.
    pub async fn handshake(&self) -> Result<HandshakeInfo, HubError> {
        let echo = self
            .send_command(
                "echo",
                &Args::new().bytes("echo", Bytes::from_static(HANDSHAKE_ECHO)),
                LOCAL_NODE,
            )
            .await?;
        if echo.bytes("echo").map(|b| b.as_ref()) != Some(HANDSHAKE_ECHO) {
            return Err(HubError::Handshake(format!("unexpected echo {:02X?}", echo.bytes("echo"))));
        }

        let serial = self
            .send_command("nodeId", &Args::new(), LOCAL_NODE)
            .await?
            .int("serial")
            .ok_or_else(|| HubError::Handshake("nodeId reply without serial".into()))?;
        let node_id = NodeId::try_from(serial).map_err(|_| HubError::Handshake(format!("bad serial {}", serial)))?;

        let firm = self.send_command("firm", &Args::new(), LOCAL_NODE).await?;
        let firmware = firm
            .bytes("revision")
            .map(|b| String::from_utf8_lossy(b).trim_end_matches(['\r', '\n', '\0']).to_string())
            .unwrap_or_default();

        let revision = firmware.clone();
        self.with_graph(move |graph| {
            if let Some(graph) = graph {
                graph.set_local_node(node_id);
                if let Some(node) = graph.node_mut(node_id) {
                    node.firmware = Some(revision);
                }
            }
        })
        .await?;
        self.clear_circuits().await?;

        info!("Coordinator {} running firmware {}", format_node_id(node_id), firmware);
        Ok(HandshakeInfo { node_id, firmware })
    }

    /// Measure the neighbors of `node` over `rounds` discovery rounds and
    /// write the smoothed link costs back to the graph
    pub async fn discover(&self, node: NodeId, rounds: usize, listen: Duration) -> Result<SweepOutcome, HubError> {
        let (local, table) = self
            .with_graph(move |graph| {
                graph
                    .as_ref()
                    .map(|g| (g.local_node(), NeighborTable::from_graph(g, node)))
            })
            .await?
            .ok_or(HubError::NoGraph)?;
        let mut table = table;
        let target = if local == Some(node) { LOCAL_NODE } else { node };

        for round in 0..rounds {
            debug!("Discovery round {} on {}", round + 1, format_node_id(node));
            table.begin_round();
            self.send_command("discovery/reset", &Args::new(), target).await?;
            let start = Args::new().int("mask", 0).int("filter", 0).int("slots", 100);
            self.send_command("discovery/start", &start, target).await?;
            tokio::time::sleep(listen).await;

            let count = self
                .send_command("discovery/count", &Args::new(), target)
                .await?
                .int("size")
                .unwrap_or(0);
            for index in 0..count {
                let entry = self
                    .send_command("discovery/get", &Args::new().int("index", index), target)
                    .await?;
                let (Some(serial), Some(rssi1), Some(rssi2)) =
                    (entry.int("serial"), entry.int("rssi1"), entry.int("rssi2"))
                else {
                    continue;
                };
                let rssi2 = if rssi2 >= 0 { rssi2 } else { rssi1 };
                let (Ok(neighbor), Ok(remote), Ok(local)) =
                    (NodeId::try_from(serial), i16::try_from(rssi1), i16::try_from(rssi2))
                else {
                    warn!("Discarding discovery entry {:?}", entry);
                    continue;
                };
                table.record(neighbor, remote, local);
            }
            table.end_round();
        }

        self.with_graph(move |graph| graph.as_mut().map(|g| table.apply(g)))
            .await?
            .ok_or(HubError::NoGraph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CircuitError;
    use mesh_topology::{FileStore, MeshEdge};
    use mesh_wire::connpath;
    use mesh_wire::frame::{encode, FrameDecoder};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Answers each frame the hub writes with whatever `respond` returns
    fn fake_node<F>(mut far: DuplexStream, mut respond: F) -> JoinHandle<Vec<Bytes>>
    where
        F: FnMut(&Bytes) -> Vec<Vec<u8>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 256];
            loop {
                let n = match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    if decoder.feed(byte) {
                        let Ok(payload) = decoder.parse() else { continue };
                        for answer in respond(&payload) {
                            if far.write_all(&encode(&answer)).await.is_err() {
                                return seen;
                            }
                        }
                        seen.push(payload);
                    }
                }
            }
            seen
        })
    }

    fn options(mode: RouteMode) -> HubOptions {
        HubOptions {
            mode,
            ..Default::default()
        }
    }

    fn chain() -> MeshGraph {
        let mut graph = MeshGraph::new();
        for id in [1, 2, 3] {
            graph.add_node(id, "");
        }
        graph.add_edge(1, 2, MeshEdge::new(0.2, 0.2)).unwrap();
        graph.add_edge(2, 3, MeshEdge::new(0.2, 0.2)).unwrap();
        graph.set_local_node(1);
        graph
    }

    fn coordinator(payload: &Bytes) -> Vec<Vec<u8>> {
        match payload.as_ref() {
            [0x00, rest @ ..] => {
                let mut reply = vec![0x01];
                reply.extend_from_slice(rest);
                vec![reply]
            }
            [0x02] => vec![b"\x03v1.4.2\0".to_vec()],
            [0x04] => vec![vec![0x05, 0x01, 0, 0, 0]],
            _ => Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_command() {
        let (near, far) = tokio::io::duplex(1024);
        let node = fake_node(far, |_| vec![vec![0x05, 0x78, 0x56, 0x34, 0x12]]);
        let (hub, task) = spawn(near, None, HubOptions::default());

        let reply = hub.send_command("nodeId", &Args::new(), 0).await.unwrap();
        assert_eq!(reply.int("serial"), Some(0x1234_5678));

        drop(hub);
        task.await.unwrap().unwrap();
        assert_eq!(node.await.unwrap(), vec![Bytes::from_static(&[0x04])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_command_times_out() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, |_| Vec::new());
        let (hub, _task) = spawn(near, None, HubOptions::default());

        let start = Instant::now();
        let err = hub.send_command("firm", &Args::new(), 0).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout(t) if t == Duration::from_secs(3)));
        assert!(start.elapsed() >= Duration::from_secs(3));

        let err = hub.send_command("firm", &Args::new(), 0).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_and_mismatched_replies() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, |payload| match payload.as_ref() {
            [0x04] => vec![vec![0x7F, 0x02]],
            _ => vec![vec![0x05, 1, 0, 0, 0]],
        });
        let (hub, _task) = spawn(near, None, HubOptions::default());

        let err = hub.send_command("nodeId", &Args::new(), 0).await.unwrap_err();
        assert!(matches!(err, HubError::NodeError { target: 0, ref data } if data.as_ref() == [0x02]));

        let err = hub.send_command("firm", &Args::new(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::MismatchedReply { ref expected, got: "nodeId" } if expected == "firm"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_command_is_refused() {
        let (near, _far) = tokio::io::duplex(1024);
        let (hub, _task) = spawn(near, None, HubOptions::default());
        let err = hub
            .send_command("readBinarySensor", &Args::new().int("hash", 1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NoReply(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_envelope() {
        let (near, far) = tokio::io::duplex(1024);
        let node = fake_node(far, |_| vec![vec![0x03, b'x']]);
        let (hub, task) = spawn(near, None, HubOptions::default());

        hub.send_command("firm", &Args::new(), 0x42).await.unwrap();
        drop(hub);
        task.await.unwrap().unwrap();
        assert_eq!(
            node.await.unwrap(),
            vec![Bytes::from_static(&[114, 0x42, 0, 0, 0, 0x02])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polite_mode_routes_and_pauses() {
        let (near, far) = tokio::io::duplex(1024);
        let node = fake_node(far, |_| vec![vec![0x03, b'x']]);
        let (hub, task) = spawn(near, Some(chain()), options(RouteMode::Polite));

        let start = Instant::now();
        hub.send_command("firm", &Args::new(), 3).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));

        drop(hub);
        task.await.unwrap().unwrap();
        assert_eq!(
            node.await.unwrap(),
            vec![Bytes::from_static(&[118, 3, 0, 0, 0, 1, 2, 0, 0, 0, 0x02])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_commands_are_serialized() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, coordinator);
        let (hub, _task) = spawn(near, None, HubOptions::default());

        let args_a = Args::new();
        let args_b = Args::new();
        let (a, b) = tokio::join!(
            hub.send_command("nodeId", &args_a, 0),
            hub.send_command("firm", &args_b, 0)
        );
        assert_eq!(a.unwrap().int("serial"), Some(1));
        assert_eq!(b.unwrap().bytes("revision").unwrap().as_ref(), b"v1.4.2\0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_waits_for_circuit_lock() {
        let (near, mut far) = tokio::io::duplex(1024);
        let node = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 256];
            let mut answered = 0u8;
            loop {
                let n = match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    if !decoder.feed(byte) {
                        continue;
                    }
                    let Ok(payload) = decoder.parse() else { continue };
                    if payload.as_ref() != [0x04] {
                        continue;
                    }
                    // Slow first answer, prompt ones afterwards
                    let serial = if answered == 0 {
                        tokio::time::sleep(Duration::from_millis(2700)).await;
                        111
                    } else {
                        222
                    };
                    answered += 1;
                    if far.write_all(&encode(&[0x05, serial, 0, 0, 0])).await.is_err() {
                        return;
                    }
                }
            }
        });
        let (hub, _task) = spawn(near, Some(chain()), HubOptions::default());

        let (tx, _rx) = mpsc::unbounded_channel();
        hub.open_circuit(2, 0, tx).await.unwrap();

        let first = hub.send_command("nodeId", &Args::new(), 0).await.unwrap();
        assert_eq!(first.int("serial"), Some(111));
        let second = hub.send_command("nodeId", &Args::new(), 0).await.unwrap();
        assert_eq!(second.int("serial"), Some(222));
        node.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_handed_to_next_exchange() {
        let (near, mut far) = tokio::io::duplex(1024);
        let node = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 256];
            let mut answered = 0u8;
            loop {
                let n = match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    if !decoder.feed(byte) || decoder.parse().is_err() {
                        continue;
                    }
                    let serial = if answered == 0 {
                        // Too late for the first exchange
                        tokio::time::sleep(Duration::from_millis(3100)).await;
                        111
                    } else {
                        222
                    };
                    answered += 1;
                    if far.write_all(&encode(&[0x05, serial, 0, 0, 0])).await.is_err() {
                        return;
                    }
                }
            }
        });
        let (hub, _task) = spawn(near, None, HubOptions::default());

        let err = hub.send_command("nodeId", &Args::new(), 0).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout(_)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = hub.send_command("nodeId", &Args::new(), 0).await.unwrap();
        assert_eq!(second.int("serial"), Some(222));
        node.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_sets_coordinator() {
        let (near, far) = tokio::io::duplex(1024);
        let node = fake_node(far, coordinator);
        let (hub, task) = spawn(near, Some(MeshGraph::new()), HubOptions::default());

        let info = hub.handshake().await.unwrap();
        assert_eq!(
            info,
            HandshakeInfo {
                node_id: 1,
                firmware: "v1.4.2".into()
            }
        );
        let firmware = hub
            .with_graph(|g| g.as_ref().and_then(|g| g.node(1)).and_then(|n| n.firmware.clone()))
            .await
            .unwrap();
        assert_eq!(firmware.as_deref(), Some("v1.4.2"));
        assert_eq!(hub.resolve_path(1).await.unwrap(), vec![1]);

        drop(hub);
        task.await.unwrap().unwrap();
        let seen = node.await.unwrap();
        let clear = seen.last().unwrap();
        assert_eq!(&clear[..3], &[connpath::REQUEST, connpath::PROTOCOL, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_rejects_bad_echo() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, |_| vec![b"\x01HELO".to_vec()]);
        let (hub, _task) = spawn(near, None, HubOptions::default());
        assert!(matches!(hub.handshake().await, Err(HubError::Handshake(_))));
    }

    fn circuit_peer(payload: &Bytes) -> Vec<Vec<u8>> {
        if payload.first() != Some(&connpath::REQUEST) {
            return Vec::new();
        }
        let handle = [payload[3], payload[4]];
        match payload[2] {
            1 => vec![vec![connpath::REPLY, 6, handle[0], handle[1]]],
            5 => {
                let mut reply = vec![connpath::REPLY, 5, handle[0], handle[1]];
                reply.extend_from_slice(&[0x03, b'v', b'2']);
                vec![reply]
            }
            _ => Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connpath_command_reuses_circuit() {
        let (near, far) = tokio::io::duplex(1024);
        let node = fake_node(far, circuit_peer);
        let (hub, task) = spawn(near, Some(chain()), options(RouteMode::Connpath));

        let reply = hub.send_command("firm", &Args::new(), 3).await.unwrap();
        assert_eq!(reply.bytes("revision").unwrap().as_ref(), b"v2");
        hub.send_command("firm", &Args::new(), 3).await.unwrap();

        let circuits = hub.circuits().await.unwrap();
        assert_eq!(circuits.len(), 1);
        assert_eq!(circuits[0].path, vec![2, 3]);

        drop(hub);
        task.await.unwrap().unwrap();
        let opens = node.await.unwrap().iter().filter(|p| p[2] == 1).count();
        assert_eq!(opens, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_events_and_close() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, circuit_peer);
        let (hub, _task) = spawn(near, Some(chain()), HubOptions::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = hub.open_circuit(3, 7, tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(CircuitEvent::Active));

        hub.send_on_circuit(handle, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(CircuitEvent::Data(Bytes::from_static(&[0x03, b'v', b'2'])))
        );

        hub.close_circuit(handle).await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert!(hub.circuits().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_circuit_fails() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, |_| Vec::new());
        let (hub, _task) = spawn(near, Some(chain()), HubOptions::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = hub.open_circuit(2, 0, tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(CircuitEvent::Disconnected(CircuitError::OpenTimeout))
        );
        assert_eq!(rx.recv().await, None);
        assert!(matches!(
            hub.wait_open(handle).await,
            Err(HubError::Mux(MuxError::UnknownHandle(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_needs_graph() {
        let (near, _far) = tokio::io::duplex(1024);
        let (hub, _task) = spawn(near, None, HubOptions::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(hub.open_circuit(3, 0, tx).await, Err(HubError::NoGraph)));
        assert!(matches!(hub.resolve_path(3).await, Err(HubError::NoGraph)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polite_broadcast_is_posted() {
        let (near, far) = tokio::io::duplex(1024);
        let node = fake_node(far, |_| Vec::new());
        let (hub, task) = spawn(near, None, HubOptions::default());

        hub.broadcast_polite(0x10, "reboot", &Args::new()).await.unwrap();
        drop(hub);
        task.await.unwrap().unwrap();
        assert_eq!(
            node.await.unwrap(),
            vec![Bytes::from_static(&[120, 0xFF, 0xFF, 0xFF, 0xFF, 124, 0x10, 0, 0, 0, 24])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_closed() {
        let (near, far) = tokio::io::duplex(64);
        let (hub, task) = spawn(near, None, HubOptions::default());
        drop(far);
        assert!(matches!(task.await.unwrap(), Err(HubError::LinkClosed)));
        assert!(matches!(hub.circuits().await, Err(HubError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mesh.json"));
        let (near, _far) = tokio::io::duplex(64);
        let (hub, _task) = spawn(near, Some(chain()), HubOptions::default());

        hub.save_graph(&store, false).await.unwrap();
        hub.with_graph(|g| *g = None).await.unwrap();
        assert_eq!(hub.load_graph(&store).await.unwrap(), 3);
        assert_eq!(hub.resolve_path(3).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_table_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("connectedpath.log");
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, circuit_peer);
        let (hub, _task) = spawn(
            near,
            Some(chain()),
            HubOptions {
                log_table: Some(table.clone()),
                ..Default::default()
            },
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.open_circuit(3, 0, tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(CircuitEvent::Active));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let text = std::fs::read_to_string(&table).unwrap();
        assert!(text.starts_with("indx | port | hndl"));
        assert!(text.contains("000002 -> 000003"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_updates_links() {
        let (near, far) = tokio::io::duplex(1024);
        let _node = fake_node(far, |payload| match payload.as_ref() {
            [26, 0] => vec![vec![27, 1]],
            [26, 6, ..] => vec![vec![27, 7]],
            [26, 2] => vec![vec![27, 3, 1]],
            [26, 4, 0] => vec![vec![27, 5, 0, 9, 0, 0, 0, 30, 0, 0xFF, 0xFF, 0, 0]],
            _ => Vec::new(),
        });
        let (hub, _task) = spawn(near, Some(chain()), HubOptions::default());

        let outcome = hub.discover(1, 1, Duration::from_secs(3)).await.unwrap();
        assert!(outcome.updated.contains(&9));
        let linked = hub
            .with_graph(|g| g.as_ref().is_some_and(|g| g.edge(1, 9).is_some()))
            .await
            .unwrap();
        assert!(linked);
    }
}
