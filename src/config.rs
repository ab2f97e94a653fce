//! Configuration module for the easywire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::handler::{HandlerConfig, HeartbeatPolicy, IdlePolicy};
use crate::liveness::IdleConfig;
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::registry::OUTBOUND_QUEUE_SIZE;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "easywire")]
#[command(author = "easywire authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed binary message server over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9879)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Largest accepted payload in bytes (at most 1 GiB)
    #[arg(long)]
    pub max_message_size: Option<u32>,

    /// Seconds without reads or writes before a connection is idle (0 = off)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// What to do with an idle connection
    #[arg(long, value_enum)]
    pub idle_policy: Option<IdlePolicy>,

    /// Which responder answers messages
    #[arg(long, value_enum)]
    pub responder: Option<ResponderKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Default for CliArgs {
    /// Same values as parsing an empty command line.
    fn default() -> Self {
        Self {
            config: None,
            listen: None,
            workers: None,
            max_message_size: None,
            idle_timeout: None,
            idle_policy: None,
            responder: None,
            log_level: default_log_level(),
        }
    }
}

/// Built-in responders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResponderKind {
    /// Answer every message with a fixed payload
    Reply,
    /// Send every payload back
    Echo,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub idle: IdleSection,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Disable Nagle's algorithm on accepted sockets
    #[serde(default)]
    pub nodelay: bool,
    /// Enable TCP keep-alive probes on accepted sockets
    #[serde(default)]
    pub keepalive: bool,
    /// Frames that may wait for one connection before senders are refused
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            nodelay: false,
            keepalive: false,
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted payload in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
    /// How incoming heartbeats are answered
    #[serde(default = "default_heartbeat")]
    pub heartbeat: HeartbeatPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            heartbeat: default_heartbeat(),
        }
    }
}

/// Idle detection configuration. A value of 0 disables a check.
#[derive(Debug, Deserialize)]
pub struct IdleSection {
    #[serde(default)]
    pub reader_secs: u64,
    #[serde(default)]
    pub writer_secs: u64,
    #[serde(default = "default_all_idle_secs")]
    pub all_secs: u64,
    #[serde(default = "default_idle_policy")]
    pub policy: IdlePolicy,
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            reader_secs: 0,
            writer_secs: 0,
            all_secs: default_all_idle_secs(),
            policy: default_idle_policy(),
        }
    }
}

/// Responder configuration
#[derive(Debug, Deserialize)]
pub struct ResponderConfig {
    #[serde(default = "default_responder_kind")]
    pub kind: ResponderKind,
    /// Payload sent by the reply responder
    #[serde(default = "default_reply_text")]
    pub reply_text: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            kind: default_responder_kind(),
            reply_text: default_reply_text(),
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
    "127.0.0.1:9879".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_outbound_queue() -> usize {
    OUTBOUND_QUEUE_SIZE
}

fn default_max_message_size() -> u32 {
    MAX_MESSAGE_SIZE
}

fn default_heartbeat() -> HeartbeatPolicy {
    HeartbeatPolicy::Reply
}

fn default_all_idle_secs() -> u64 {
    10
}

fn default_idle_policy() -> IdlePolicy {
    IdlePolicy::Ignore
}

fn default_responder_kind() -> ResponderKind {
    ResponderKind::Reply
}

fn default_reply_text() -> String {
    "Response".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub backlog: u32,
    pub max_connections: usize,
    pub nodelay: bool,
    pub keepalive: bool,
    pub handler: HandlerConfig,
    pub responder: ResponderKind,
    pub reply_text: String,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let max_message_size = cli
            .max_message_size
            .unwrap_or(toml_config.protocol.max_message_size);
        if max_message_size > MAX_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_message_size {max_message_size} exceeds the protocol limit {MAX_MESSAGE_SIZE}"
            )));
        }

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }

        let max_connections = toml_config.server.max_connections;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let outbound_queue = toml_config.server.outbound_queue;
        if outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue must be at least 1".to_string(),
            ));
        }

        let idle = IdleConfig {
            reader: Duration::from_secs(toml_config.idle.reader_secs),
            writer: Duration::from_secs(toml_config.idle.writer_secs),
            all: Duration::from_secs(cli.idle_timeout.unwrap_or(toml_config.idle.all_secs)),
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers,
            backlog: toml_config.server.backlog,
            max_connections,
            nodelay: toml_config.server.nodelay,
            keepalive: toml_config.server.keepalive,
            handler: HandlerConfig {
                max_message_size,
                idle,
                idle_policy: cli.idle_policy.unwrap_or(toml_config.idle.policy),
                heartbeat: toml_config.protocol.heartbeat,
                outbound_queue,
            },
            responder: cli.responder.unwrap_or(toml_config.responder.kind),
            reply_text: toml_config.responder.reply_text,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
