//! Configuration for the framewire binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::ReactorConfig;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "framewire")]
#[command(author = "framewire authors")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed request/response TCP transport", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run a server with one of the sample handlers
    Serve {
        /// Address to bind to (e.g., 0.0.0.0:9500)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Request handler
        #[arg(long, value_enum, default_value_t = HandlerKind::Echo)]
        handler: HandlerKind,

        /// Maximum number of live connections
        #[arg(short = 'm', long)]
        max_connections: Option<usize>,

        /// Seconds to wait for a peer when no connection is live
        #[arg(long)]
        accept_timeout: Option<u64>,

        /// Seconds each multiplexed wait may block
        #[arg(long)]
        poll_timeout: Option<u64>,
    },
    /// Send one request and print the reply
    Request {
        /// Payload to send
        payload: String,

        /// Server address (e.g., 127.0.0.1:9500)
        #[arg(short = 'a', long)]
        connect: Option<String>,

        /// Send the payload without a length prefix and print raw bytes back
        #[arg(long)]
        raw: bool,

        /// Seconds allowed for the whole exchange
        #[arg(short = 'w', long)]
        wait_budget: Option<u64>,

        /// Seconds allowed for establishing the connection
        #[arg(long)]
        connect_timeout: Option<u64>,
    },
}

/// Sample handler served by `framewire serve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HandlerKind {
    Echo,
    Ping,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Accept wait in seconds when idle
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout: u64,
    /// Multiplexed wait in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            accept_timeout: default_accept_timeout(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Server address to connect to
    #[serde(default = "default_connect")]
    pub connect: String,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Wait budget for a whole exchange in seconds
    #[serde(default = "default_wait_budget")]
    pub wait_budget: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            connect_timeout: default_connect_timeout(),
            wait_budget: default_wait_budget(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9500".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_accept_timeout() -> u64 {
    10
}

fn default_poll_timeout() -> u64 {
    5
}

fn default_connect() -> String {
    "127.0.0.1:9500".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_wait_budget() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve {
        handler: HandlerKind,
    },
    Request {
        payload: String,
        raw: bool,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub max_connections: usize,
    pub accept_timeout: u64,
    pub poll_timeout: u64,
    pub connect: String,
    pub connect_timeout: u64,
    pub wait_budget: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut config = Config {
            mode: Mode::Serve {
                handler: HandlerKind::Echo,
            },
            listen: toml_config.server.listen,
            max_connections: toml_config.server.max_connections,
            accept_timeout: toml_config.server.accept_timeout,
            poll_timeout: toml_config.server.poll_timeout,
            connect: toml_config.client.connect,
            connect_timeout: toml_config.client.connect_timeout,
            wait_budget: toml_config.client.wait_budget,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        match cli.command {
            CliCommand::Serve {
                listen,
                handler,
                max_connections,
                accept_timeout,
                poll_timeout,
            } => {
                config.mode = Mode::Serve { handler };
                config.listen = listen.unwrap_or(config.listen);
                config.max_connections = max_connections.unwrap_or(config.max_connections);
                config.accept_timeout = accept_timeout.unwrap_or(config.accept_timeout);
                config.poll_timeout = poll_timeout.unwrap_or(config.poll_timeout);
            }
            CliCommand::Request {
                payload,
                connect,
                raw,
                wait_budget,
                connect_timeout,
            } => {
                config.mode = Mode::Request { payload, raw };
                config.connect = connect.unwrap_or(config.connect);
                config.wait_budget = wait_budget.unwrap_or(config.wait_budget);
                config.connect_timeout = connect_timeout.unwrap_or(config.connect_timeout);
            }
        }

        config
    }

    /// Reactor settings derived from the server section.
    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            accept_timeout: Duration::from_secs(self.accept_timeout),
            poll_timeout: Duration::from_secs(self.poll_timeout),
            max_connections: self.max_connections,
        }
    }

    /// Split `connect` into host and port.
    pub fn connect_target(&self) -> Result<(String, u16), ConfigError> {
        let (host, port) = self
            .connect
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(self.connect.clone()))?;
        let port = port
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.connect.clone()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host.to_string(), port))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidAddress(addr) => {
                write!(f, "Invalid address '{}': expected host:port", addr)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
