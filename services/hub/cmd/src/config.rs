//! Configuration handling for the hub.
//!
//! Settings come from a YAML or TOML file (picked by extension), then
//! `MESHHUB_*` environment variables, then command-line flags.

use anyhow::{Context, Result};
use mesh_routing::RouteMode;
use mesh_session::{HubOptions, MuxConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Durations written the way humans type them: `5ms`, `1s 300ms`
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path
    pub port: String,
    /// Baud rate
    pub baud: u32,
    /// Bytes written per chunk
    pub chunk_size: usize,
    /// Pause after each chunk
    #[serde(with = "human_duration")]
    pub chunk_delay: Duration,
    /// Age after which a held lock is forced open by the next locked send
    #[serde(with = "human_duration")]
    pub stale_lock: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            chunk_size: 64,
            chunk_delay: Duration::from_millis(5),
            stale_lock: Duration::from_millis(250),
        }
    }
}

/// Address handed to the RPC front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub bind_ip: String,
    /// Bind port
    pub bind_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "localhost".to_string(),
            bind_port: 8801,
        }
    }
}

/// Command and circuit timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for a command reply
    #[serde(with = "human_duration")]
    pub reply: Duration,
    /// Pause after each reply in polite mode
    #[serde(with = "human_duration")]
    pub polite_pause: Duration,
    /// Link lock held by a circuit open request
    #[serde(with = "human_duration")]
    pub circuit_open_lock: Duration,
    /// Wait for a circuit to be acknowledged
    #[serde(with = "human_duration")]
    pub circuit_open: Duration,
    /// Wait for data answering a circuit request
    #[serde(with = "human_duration")]
    pub circuit_reply: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reply: Duration::from_secs(3),
            polite_pause: Duration::from_millis(500),
            circuit_open_lock: Duration::from_millis(500),
            circuit_open: Duration::from_millis(1300),
            circuit_reply: Duration::from_secs(5),
        }
    }
}

/// Circuit table written for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLogConfig {
    /// Output file, empty to disable
    pub file: PathBuf,
    /// Rewrite interval
    #[serde(with = "human_duration")]
    pub flush_interval: Duration,
    /// Circuits kept in the table
    pub capacity: usize,
}

impl Default for ConnectionLogConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/dev/shm/connectedpath.log"),
            flush_interval: Duration::from_secs(5),
            capacity: 100,
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Serial port
    pub serial: SerialConfig,
    /// RPC bind address
    pub server: ServerConfig,
    /// Graph file, JSON or YAML by extension
    pub graph_file: PathBuf,
    /// Delivery mode for remote commands
    pub protocol: RouteMode,
    /// Timing
    pub timeouts: TimeoutConfig,
    /// Circuit table
    pub connection_log: ConnectionLogConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            server: ServerConfig::default(),
            graph_file: PathBuf::from("meshmesh.graph.json"),
            protocol: RouteMode::default(),
            timeouts: TimeoutConfig::default(),
            connection_log: ConnectionLogConfig::default(),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

impl HubConfig {
    /// Parse `content` as TOML or YAML depending on `path`
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        if is_toml(path) {
            toml::from_str(content).context("invalid TOML configuration")
        } else {
            serde_yaml::from_str(content).context("invalid YAML configuration")
        }
    }

    /// Serialize in the format `path` calls for
    pub fn render(&self, path: &Path) -> Result<String> {
        if is_toml(path) {
            toml::to_string_pretty(self).context("could not serialize configuration")
        } else {
            serde_yaml::to_string(self).context("could not serialize configuration")
        }
    }

    /// Load `path`, then apply environment overrides.
    ///
    /// A missing file is created with the defaults; an unreadable one is
    /// reported and the defaults are used.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match Self::parse(path, &content) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {:#}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, writing defaults", path.display());
                let config = Self::default();
                if let Err(e) = std::fs::write(path, config.render(path)?) {
                    warn!("Could not create {}: {}", path.display(), e);
                }
                config
            }
            Err(e) => {
                warn!("Could not read {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `MESHHUB_*` overrides found by `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("MESHHUB_SERIAL_PORT") {
            info!("Serial port overridden by environment: {}", port);
            self.serial.port = port;
        }
        if let Some(baud) = lookup("MESHHUB_SERIAL_BAUD") {
            match baud.parse() {
                Ok(baud) => self.serial.baud = baud,
                Err(_) => warn!("Ignoring invalid MESHHUB_SERIAL_BAUD '{}'", baud),
            }
        }
        if let Some(ip) = lookup("MESHHUB_BIND_IP") {
            self.server.bind_ip = ip;
        }
        if let Some(port) = lookup("MESHHUB_BIND_PORT") {
            match port.parse() {
                Ok(port) => self.server.bind_port = port,
                Err(_) => warn!("Ignoring invalid MESHHUB_BIND_PORT '{}'", port),
            }
        }
        if let Some(protocol) = lookup("MESHHUB_PROTOCOL") {
            match protocol.parse() {
                Ok(mode) => self.protocol = mode,
                Err(e) => warn!("Ignoring MESHHUB_PROTOCOL: {}", e),
            }
        }
    }

    /// Hub settings derived from this configuration
    pub fn hub_options(&self) -> HubOptions {
        let log_table = Some(self.connection_log.file.clone()).filter(|p| !p.as_os_str().is_empty());
        HubOptions {
            mode: self.protocol,
            reply_timeout: self.timeouts.reply,
            polite_pause: self.timeouts.polite_pause,
            chunk_size: self.serial.chunk_size,
            chunk_delay: self.serial.chunk_delay,
            transport: TransportConfig {
                stale_lock: Some(self.serial.stale_lock).filter(|d| !d.is_zero()),
                ..TransportConfig::default()
            },
            mux: MuxConfig {
                open_lock: self.timeouts.circuit_open_lock,
                open_timeout: self.timeouts.circuit_open,
                reply_timeout: self.timeouts.circuit_reply,
                log_capacity: self.connection_log.capacity,
            },
            log_table,
            log_flush_interval: self.connection_log.flush_interval,
        }
    }
}
