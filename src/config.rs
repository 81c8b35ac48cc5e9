//! Configuration for the server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Connection handling mode of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Thread per connection; the accept loop blocks in `accept`.
    #[default]
    Blocking,
    /// Single-threaded readiness polling over all sockets.
    NonBlocking,
}

/// Command-line arguments for the echo server binary
#[derive(Parser, Debug, Default)]
#[command(name = "tcpcore")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo server built on tcpcore", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connection handling mode
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Accept timeout in seconds (0 = wait forever)
    #[arg(short = 't', long)]
    pub accept_timeout: Option<u64>,

    /// Maximum concurrent connections in non-blocking mode
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Text prepended to every echoed reply
    #[arg(long)]
    pub prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` table
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: Mode,
    /// Seconds; 0 disables the timeout
    #[serde(default)]
    pub accept_timeout: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_poll_batch")]
    pub poll_batch: usize,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: Mode::default(),
            accept_timeout: 0,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            poll_batch: default_poll_batch(),
            prefix: default_prefix(),
        }
    }
}

/// `[client]` table
#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    /// Seconds; 0 leaves the connect deadline to the OS
    #[serde(default)]
    pub connect_timeout: u64,
}

/// `[logging]` table
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_poll_batch() -> usize {
    256
}

fn default_prefix() -> String {
    "Server: ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings consumed by [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub mode: Mode,
    pub accept_timeout: Option<Duration>,
    /// Connection cap for the non-blocking event loop.
    pub max_connections: usize,
    /// Bytes read per readiness dispatch.
    pub buffer_size: usize,
    /// Events drained per poll wakeup.
    pub poll_batch: usize,
}

impl ServerConfig {
    /// Settings for a server on every interface.
    pub fn new(port: u16, mode: Mode, accept_timeout: Option<Duration>) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            mode,
            accept_timeout,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            poll_batch: default_poll_batch(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(default_port(), Mode::default(), None)
    }
}

/// Resolved client settings.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub connect_timeout: Option<Duration>,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub prefix: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML config (CLI takes precedence).
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let host_str = cli.host.unwrap_or(server.host);
        let host: IpAddr = host_str
            .parse()
            .map_err(|_| ConfigError::InvalidHost(host_str.clone()))?;

        let accept_timeout = cli.accept_timeout.unwrap_or(server.accept_timeout);
        let connect_timeout = toml_config.client.connect_timeout;

        Ok(Config {
            server: ServerConfig {
                host,
                port: cli.port.unwrap_or(server.port),
                mode: cli.mode.unwrap_or(server.mode),
                accept_timeout: seconds(accept_timeout),
                max_connections: cli.max_connections.unwrap_or(server.max_connections),
                buffer_size: server.buffer_size.max(1),
                poll_batch: server.poll_batch.max(1),
            },
            client: ClientConfig {
                connect_timeout: seconds(connect_timeout),
            },
            prefix: cli.prefix.unwrap_or(server.prefix),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid bind address '{0}'")]
    InvalidHost(String),
}
