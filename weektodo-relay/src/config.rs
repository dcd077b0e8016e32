//! Relay settings, layered as CLI flag, then environment, then
//! `~/.config/weektodo-relay/config.toml`, then built-in defaults.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9000"
//! max_payload_size = 1048576
//! log_level = "info"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::relay::DEFAULT_MAX_PAYLOAD_SIZE;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Why the relay configuration could not be built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read, or an explicit
    /// `--config` path is missing.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        /// File that was tried.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("invalid config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// `bind_addr` is not a socket address.
    #[error("invalid bind address {value:?}: {source}")]
    InvalidBindAddr {
        /// Rejected value.
        value: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// `max_payload_size` of zero would reject every `Data` frame.
    #[error("max_payload_size must be positive")]
    ZeroPayloadLimit,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FileConfig {
    server: ServerSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
    log_level: Option<String>,
}

/// Command line of `weektodo-relay`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "WeekTodo relay and REST mirror")]
pub struct RelayCliArgs {
    /// Listen address, e.g. `127.0.0.1:9000`.
    #[arg(short, long, env = "WEEKTODO_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Config file to use instead of the per-user default.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted `Data` payload, in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, env = "WEEKTODO_RELAY_LOG")]
    pub log_level: Option<String>,
}

/// Resolved relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Largest accepted `Data` payload, in bytes.
    pub max_payload_size: usize,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl RelayConfig {
    /// Reads the config file (if any) and applies `cli` on top.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`]. A missing file at the default location is not an
    /// error.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = read_file(cli.config.as_deref())?;
        Self::resolve(cli, file.server)
    }

    fn resolve(cli: &RelayCliArgs, server: ServerSection) -> Result<Self, ConfigError> {
        let bind = cli
            .bind
            .clone()
            .or(server.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr { value: bind, source })?;

        let max_payload_size = cli
            .max_payload_size
            .or(server.max_payload_size)
            .unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE);
        if max_payload_size == 0 {
            return Err(ConfigError::ZeroPayloadLimit);
        }

        Ok(Self {
            bind_addr,
            max_payload_size,
            log_level: cli
                .log_level
                .clone()
                .or(server.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

fn read_file(explicit: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match dirs::config_dir() {
            Some(dir) => dir.join("weektodo-relay").join("config.toml"),
            None => return Ok(FileConfig::default()),
        },
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if explicit.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(FileConfig::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(text: &str) -> ServerSection {
        toml::from_str::<FileConfig>(text).unwrap().server
    }

    #[test]
    fn empty_everything_gives_defaults() {
        let config = RelayConfig::resolve(&RelayCliArgs::default(), ServerSection::default()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.max_payload_size, 1024 * 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn file_fills_what_cli_leaves_out() {
        let server = section(
            r#"
[server]
bind_addr = "127.0.0.1:8080"
max_payload_size = 4096
log_level = "debug"
"#,
        );
        let cli = RelayCliArgs {
            bind: Some("127.0.0.1:3000".into()),
            ..Default::default()
        };
        let config = RelayConfig::resolve(&cli, server).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.max_payload_size, 4096);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let cli = RelayCliArgs {
            bind: Some("localhost".into()),
            ..Default::default()
        };
        let err = RelayConfig::resolve(&cli, ServerSection::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddr { ref value, .. } if value == "localhost"));
    }

    #[test]
    fn zero_payload_limit_is_rejected() {
        let server = section("[server]\nmax_payload_size = 0\n");
        assert!(matches!(
            RelayConfig::resolve(&RelayCliArgs::default(), server),
            Err(ConfigError::ZeroPayloadLimit)
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = read_file(Some(Path::new("/nonexistent/weektodo-relay.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
