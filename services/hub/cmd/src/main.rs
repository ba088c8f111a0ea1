//! meshmesh hub binary.
//!
//! Opens the serial port the coordinator node is attached to, runs the hub
//! event loop on it and keeps the mesh graph on disk. Besides the long
//! running `run` mode it can execute a single command or print a route.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mesh_routing::RouteMode;
use mesh_session::{hub, link, HubHandle};
use mesh_topology::{format_node_id, parse_node_id, FileStore, GraphStore, MeshGraph, NodeId};
use mesh_wire::Args as CommandArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::HubConfig;
use logging::HubLogFormatter;

/// Hub bridging a serial-attached coordinator to a meshmesh network
#[derive(Parser, Debug)]
#[command(name = "meshmesh-hub", version, about = "Serial to meshmesh hub")]
struct Args {
    /// Configuration file, YAML or TOML
    #[arg(long, default_value = "meshmeshhub.yaml")]
    config: PathBuf,

    /// Serial device of the coordinator
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// How commands reach remote nodes (unicast, multipath, polite, connpath)
    #[arg(long)]
    protocol: Option<RouteMode>,

    /// Start with an empty graph instead of loading the graph file
    #[arg(long)]
    empty_graph: bool,

    /// Graph file, JSON or YAML
    #[arg(long)]
    graph_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command reply timeout, e.g. 3s
    #[arg(long)]
    reply_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run the hub until interrupted (default)
    Run,
    /// Send one command and print its reply as JSON
    Exec {
        /// Command path, e.g. `nodeId` or `spiflash/getmd5`
        name: String,
        /// Arguments as name=value pairs
        args: Vec<String>,
        /// Destination node, 0 for the coordinator
        #[arg(long, default_value = "0")]
        target: String,
    },
    /// Print the route to a node from the graph file
    Path {
        /// Destination node
        target: String,
    },
}

impl Args {
    fn apply(&self, config: &mut HubConfig) {
        if let Some(port) = &self.serial_port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud = baud;
        }
        if let Some(mode) = self.protocol {
            config.protocol = mode;
        }
        if let Some(path) = &self.graph_file {
            config.graph_file = path.clone();
        }
        if let Some(timeout) = self.reply_timeout {
            config.timeouts.reply = timeout.into();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("warn");
    for krate in ["meshmesh_hub", "mesh_session", "mesh_wire", "mesh_topology", "mesh_routing"] {
        env_filter = env_filter.add_directive(format!("{}={}", krate, args.log_level).parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(HubLogFormatter::new("hub"))
        .init();

    let mut config = HubConfig::load_or_create(&args.config)?;
    args.apply(&mut config);

    match &args.command {
        None | Some(Action::Run) => run(&config, args.empty_graph).await,
        Some(Action::Exec { name, args: pairs, target }) => {
            exec(&config, args.empty_graph, name, pairs, parse_node_id(target)?).await
        }
        Some(Action::Path { target }) => print_path(&config, parse_node_id(target)?),
    }
}

fn load_graph(config: &HubConfig, empty: bool) -> Option<MeshGraph> {
    if empty {
        component_info!("graph", "Starting with an empty graph");
        return Some(MeshGraph::new());
    }
    match FileStore::new(&config.graph_file).load() {
        Ok(graph) => Some(graph),
        Err(e) => {
            component_warn!("graph", "Could not load {}: {}", config.graph_file.display(), e);
            None
        }
    }
}

/// Open the serial port, start the hub and shake hands with the coordinator
async fn connect(
    config: &HubConfig,
    empty_graph: bool,
) -> Result<(HubHandle, tokio::task::JoinHandle<std::result::Result<(), mesh_session::HubError>>)> {
    let port = link::open_serial(&config.serial.port, config.serial.baud)
        .with_context(|| format!("Failed to open serial port {}", config.serial.port))?;
    let (hub, task) = hub::spawn(port, load_graph(config, empty_graph), config.hub_options());

    let info = hub.handshake().await.context("Handshake with coordinator failed")?;
    component_info!(
        "serial",
        "Coordinator {} firmware {} on {}",
        format_node_id(info.node_id),
        info.firmware,
        config.serial.port
    );
    Ok((hub, task))
}

/// The hub itself does not listen; the bind address is only handed on
fn startup_summary(config: &HubConfig, mode: RouteMode) -> String {
    format!(
        "Running in {} mode, RPC bind address configured as {}:{}",
        mode, config.server.bind_ip, config.server.bind_port
    )
}

async fn run(config: &HubConfig, empty_graph: bool) -> Result<()> {
    let (hub, task) = connect(config, empty_graph).await?;
    component_info!("hub", "{}", startup_summary(config, hub.mode()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            component_info!("hub", "Shutting down");
        }
        result = task => {
            match result {
                Ok(Ok(())) => component_warn!("hub", "Hub loop stopped"),
                Ok(Err(e)) => bail!("Hub loop failed: {}", e),
                Err(e) => bail!("Hub task panicked: {}", e),
            }
            return Ok(());
        }
    }

    if let Err(e) = hub.clear_circuits().await {
        component_warn!("connpath", "Could not clear circuits on shutdown: {}", e);
    }
    let store = FileStore::new(&config.graph_file);
    match hub.save_graph(&store, true).await {
        Ok(()) => {}
        Err(mesh_session::HubError::NoGraph) => {}
        Err(e) => component_error!("graph", "Could not save graph: {}", e),
    }
    Ok(())
}

async fn exec(config: &HubConfig, empty_graph: bool, name: &str, pairs: &[String], target: NodeId) -> Result<()> {
    let command_args = CommandArgs::parse_pairs(pairs.iter().map(String::as_str))
        .with_context(|| format!("Invalid arguments for {}", name))?;
    let (hub, _task) = connect(config, empty_graph).await?;

    component_debug!("hub", "Sending {} to {}", name, format_node_id(target));
    let reply = hub
        .send_command(name, &command_args, target)
        .await
        .with_context(|| format!("{} to {} failed", name, format_node_id(target)))?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

fn print_path(config: &HubConfig, target: NodeId) -> Result<()> {
    let graph = FileStore::new(&config.graph_file)
        .load()
        .with_context(|| format!("Failed to load {}", config.graph_file.display()))?;
    if graph.local_node().is_none() {
        bail!("Graph {} has no coordinator node", config.graph_file.display());
    }
    let path = graph.shortest_path(target, true)?;
    let hops: Vec<String> = path.into_iter().map(format_node_id).collect();
    println!("{}", hops.join(" -> "));
    Ok(())
}
