//! Configuration module for the chat relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay server
#[derive(Parser, Debug, Default)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client text chat relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., localhost, 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads shared by all connections
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Per-read buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Messages queued per recipient before deliveries are dropped
    #[arg(long)]
    pub outbound_queue: Option<usize>,

    /// Tell remaining clients when someone disconnects
    #[arg(long)]
    pub notify_departures: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the interactive client
#[derive(Parser, Debug)]
#[command(name = "chat-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for the chat relay", long_about = None)]
pub struct ClientArgs {
    /// Relay host to connect to
    #[arg(short = 'H', long, default_value_t = default_host())]
    pub host: String,

    /// Relay port to connect to
    #[arg(short, long, default_value_t = default_port())]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
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
    /// Size of the worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default)]
    pub notify_departures: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            buffer_size: default_buffer_size(),
            outbound_queue: default_outbound_queue(),
            notify_departures: false,
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
    "localhost".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_workers() -> usize {
    10
}

fn default_buffer_size() -> usize {
    1024
}

fn default_outbound_queue() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub buffer_size: usize,
    pub outbound_queue: usize,
    pub notify_departures: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            workers: cli.workers.unwrap_or(server.workers),
            buffer_size: cli.buffer_size.unwrap_or(server.buffer_size),
            outbound_queue: cli.outbound_queue.unwrap_or(server.outbound_queue),
            notify_departures: cli.notify_departures || server.notify_departures,
            // clap fills "info" when the flag is absent, so only a
            // non-default CLI value overrides the file
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("workers", self.workers),
            ("buffer_size", self.buffer_size),
            ("outbound_queue", self.outbound_queue),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// `host:port` string used for address resolution.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
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
            ConfigError::Invalid(key, reason) => {
                write!(f, "Invalid value for '{key}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
