//! Configuration system for the `weektodo` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/weektodo/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::peer::identity::{DeviceProfile, IDENTITY_FILE};
use crate::peer::manager::ManagerOptions;
use crate::peer::reconnect::{HEALTH_CHECK_INTERVAL, ReconnectPolicy};
use crate::store::file::TODOS_FILE;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A URL setting is not a valid URL.
    #[error("invalid {field} {value:?}: {source}")]
    InvalidUrl {
        /// Setting name.
        field: &'static str,
        /// Raw value.
        value: String,
        /// Parser error.
        source: url::ParseError,
    },
}

/// Where tasks are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the data directory.
    #[default]
    File,
    /// Process memory only.
    Memory,
}

// TOML file structs. Every field is optional so a file can override a subset.

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    peer: PeerFileConfig,
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    storage: StorageFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PeerFileConfig {
    peer_id: Option<String>,
    device_name: Option<String>,
    device_type: Option<String>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    rest_url: Option<String>,
    peers: Option<Vec<String>>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    interval_secs: Option<u64>,
    max_attempts: Option<u32>,
    health_interval_secs: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    backend: Option<StorageBackend>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Peer --
    /// Forced peerId; generated and persisted when absent.
    pub peer_id: Option<String>,
    /// Human-readable device name.
    pub device_name: Option<String>,
    /// Device class.
    pub device_type: Option<String>,
    /// Directory holding `peer.json` and `todos.json`.
    pub data_dir: PathBuf,

    // -- Network --
    /// WebSocket URL of the relay broker.
    pub relay_url: Option<Url>,
    /// Base URL of the REST mirror.
    pub rest_url: Option<Url>,
    /// Peers to dial on start, in addition to the persisted ones.
    pub peers: Vec<String>,
    /// Bound on a single handshake.
    pub connect_timeout: Duration,
    /// Capacity of per-link frame channels.
    pub channel_capacity: usize,

    // -- Reconnect --
    /// Backoff for lost peers.
    pub reconnect: ReconnectPolicy,
    /// Interval of the health check.
    pub health_interval: Duration,

    // -- Storage --
    /// Task storage backend.
    pub storage: StorageBackend,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            device_name: None,
            device_type: None,
            data_dir: default_data_dir(),
            relay_url: None,
            rest_url: None,
            peers: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            reconnect: ReconnectPolicy::default(),
            health_interval: HEALTH_CHECK_INTERVAL,
            storage: StorageBackend::File,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// any file cannot be parsed, or a URL setting is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let relay_url = cli
            .relay_url
            .clone()
            .or_else(|| file.network.relay_url.clone())
            .map(|raw| parse_url("relay_url", raw))
            .transpose()?;
        let rest_url = cli
            .rest_url
            .clone()
            .or_else(|| file.network.rest_url.clone())
            .map(|raw| parse_url("rest_url", raw))
            .transpose()?;

        let mut peers = file.network.peers.clone().unwrap_or_default();
        for extra in &cli.connect {
            if !peers.contains(extra) {
                peers.push(extra.clone());
            }
        }

        Ok(Self {
            peer_id: cli.peer_id.clone().or_else(|| file.peer.peer_id.clone()),
            device_name: cli
                .device_name
                .clone()
                .or_else(|| file.peer.device_name.clone()),
            device_type: file.peer.device_type.clone(),
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.peer.data_dir.clone())
                .unwrap_or(defaults.data_dir),
            relay_url,
            rest_url,
            peers,
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectPolicy {
                interval: file
                    .reconnect
                    .interval_secs
                    .map_or(defaults.reconnect.interval, Duration::from_secs),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
            },
            health_interval: file
                .reconnect
                .health_interval_secs
                .map_or(defaults.health_interval, Duration::from_secs),
            storage: cli
                .storage
                .or(file.storage.backend)
                .unwrap_or(defaults.storage),
        })
    }

    /// Path of the persisted peer identity.
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILE)
    }

    /// Path of the task file for the `file` backend.
    #[must_use]
    pub fn todos_path(&self) -> PathBuf {
        self.data_dir.join(TODOS_FILE)
    }

    /// Identity overrides taken from configuration.
    #[must_use]
    pub fn device_profile(&self) -> DeviceProfile {
        DeviceProfile {
            peer_id: self.peer_id.clone(),
            device_name: self.device_name.clone(),
            device_type: self.device_type.clone(),
        }
    }

    /// Connection manager tunables.
    #[must_use]
    pub const fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect,
            health_interval: self.health_interval,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Peer-to-peer weekly todo list")]
pub struct CliArgs {
    /// WebSocket URL of the relay broker.
    #[arg(long, env = "WEEKTODO_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Base URL of the REST mirror.
    #[arg(long, env = "WEEKTODO_REST_URL")]
    pub rest_url: Option<String>,

    /// Local peer identity (generated on first start when absent).
    #[arg(long, env = "WEEKTODO_PEER_ID")]
    pub peer_id: Option<String>,

    /// Human-readable device name.
    #[arg(long, env = "WEEKTODO_DEVICE_NAME")]
    pub device_name: Option<String>,

    /// Directory for the identity and task files.
    #[arg(long, env = "WEEKTODO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Peer to dial on start. Repeatable.
    #[arg(long = "connect", value_name = "PEER_ID")]
    pub connect: Vec<String>,

    /// Task storage backend.
    #[arg(long, value_enum)]
    pub storage: Option<StorageBackend>,

    /// Path to config file (default: `~/.config/weektodo/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "WEEKTODO_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/weektodo.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".weektodo"), |d| d.join("weektodo"))
}

fn parse_url(field: &'static str, raw: String) -> Result<Url, ConfigError> {
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: raw,
        source,
    })
}

/// Load and parse a TOML config file.
///
/// An explicit path must exist. Without one, the default path is tried and a
/// missing file is treated as an empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("weektodo").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
