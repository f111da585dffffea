//! Configuration module for the diag-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "diag-echo")]
#[command(author = "diag-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server with diagnostic logging", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of simultaneously open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Identifier assigned to the first accepted client
    #[arg(long)]
    pub first_client_id: Option<u64>,

    /// Tag attached to every log line of this server instance
    #[arg(long)]
    pub instance_id: Option<u32>,

    /// Status report interval in milliseconds (0 = disabled)
    #[arg(long)]
    pub status_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Queued outbound bytes per connection above which reading pauses
    #[serde(default = "default_max_outbound")]
    pub max_outbound: usize,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Size of a single read syscall; a read event may span several
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Capacity of the poll event batch
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_first_client_id")]
    pub first_client_id: u64,
    #[serde(default = "default_instance_id")]
    pub instance_id: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_outbound: default_max_outbound(),
            backlog: default_backlog(),
            read_chunk_size: default_read_chunk_size(),
            events_capacity: default_events_capacity(),
            first_client_id: default_first_client_id(),
            instance_id: default_instance_id(),
        }
    }
}

/// Status reporter configuration
#[derive(Debug, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_interval_ms")]
    pub interval_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_status_interval_ms(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50001
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_outbound() -> usize {
    4 * 1024 * 1024 // 4 MB
}

fn default_backlog() -> i32 {
    1024
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_events_capacity() -> usize {
    256
}

fn default_first_client_id() -> u64 {
    1
}

fn default_instance_id() -> u32 {
    1
}

fn default_status_interval_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_outbound: usize,
    pub backlog: i32,
    pub read_chunk_size: usize,
    pub events_capacity: usize,
    pub first_client_id: u64,
    pub instance_id: u32,
    /// `None` disables the periodic status report.
    pub status_interval: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                host: None,
                port: None,
                max_connections: None,
                first_client_id: None,
                instance_id: None,
                status_interval_ms: None,
                log_level: None,
            },
            TomlConfig::default(),
        )
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI args, reading the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let interval_ms = cli
            .status_interval_ms
            .unwrap_or(toml_config.status.interval_ms);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_outbound: toml_config.server.max_outbound,
            backlog: toml_config.server.backlog,
            read_chunk_size: toml_config.server.read_chunk_size,
            events_capacity: toml_config.server.events_capacity,
            first_client_id: cli
                .first_client_id
                .unwrap_or(toml_config.server.first_client_id),
            instance_id: cli.instance_id.unwrap_or(toml_config.server.instance_id),
            status_interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("server.read_chunk_size must be > 0"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("server.events_capacity must be > 0"));
        }
        if self.max_outbound == 0 {
            return Err(ConfigError::Invalid("server.max_outbound must be > 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
