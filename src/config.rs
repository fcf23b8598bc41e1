//! Configuration module for the lottery server.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI arguments (or their environment variables) take
//! precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the lottery server
#[derive(Parser, Debug)]
#[command(name = "lottery-server")]
#[command(author = "lottery-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Collects agency bets and reports winners back to each agency", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "SERVER_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Accept backlog for the listening socket
    #[arg(short = 'b', long, env = "SERVER_LISTEN_BACKLOG")]
    pub listen_backlog: Option<i32>,

    /// Number of agencies expected to finish before the draw
    #[arg(short = 'n', long, env = "CLIENT_TOTAL")]
    pub client_total: Option<usize>,

    /// Seconds the acceptor waits before re-checking for shutdown
    #[arg(short = 't', long, env = "TIMEOUT")]
    pub accept_timeout: Option<u64>,

    /// Seconds allowed for delivering one agency's winners
    #[arg(long)]
    pub send_timeout: Option<u64>,

    /// Seconds to wait for every agency before giving up (0 = wait forever)
    #[arg(long, env = "BARRIER_DEADLINE")]
    pub barrier_deadline: Option<u64>,

    /// Chosen number that wins the draw
    #[arg(short = 'w', long, env = "WINNING_NUMBER")]
    pub winning_number: Option<u32>,

    /// CSV file bets are appended to (in-memory if omitted)
    #[arg(long, env = "BETS_FILE")]
    pub bets_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOGGING_LEVEL")]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lottery: LotteryConfig,
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
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Acceptor poll interval in seconds
    #[serde(default = "default_timeout")]
    pub accept_timeout: u64,
    /// Bound on a single winners send in seconds
    #[serde(default = "default_timeout")]
    pub send_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            listen_backlog: default_listen_backlog(),
            accept_timeout: default_timeout(),
            send_timeout: default_timeout(),
        }
    }
}

/// Draw-related configuration
#[derive(Debug, Deserialize)]
pub struct LotteryConfig {
    /// Number of agencies that must finish before the draw
    #[serde(default = "default_client_total")]
    pub client_total: usize,
    /// Seconds to wait for all agencies (0 = forever)
    #[serde(default)]
    pub barrier_deadline: u64,
    #[serde(default = "default_winning_number")]
    pub winning_number: u32,
    pub bets_file: Option<PathBuf>,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            client_total: default_client_total(),
            barrier_deadline: 0,
            winning_number: default_winning_number(),
            bets_file: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    12345
}

fn default_listen_backlog() -> i32 {
    5
}

fn default_timeout() -> u64 {
    10
}

fn default_client_total() -> usize {
    5
}

fn default_winning_number() -> u32 {
    7574
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub listen_backlog: i32,
    pub client_total: usize,
    pub accept_timeout: Duration,
    pub send_timeout: Duration,
    /// `None` means the barrier waits forever.
    pub barrier_deadline: Option<Duration>,
    pub winning_number: u32,
    pub bets_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args, environment and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let client_total = cli
            .client_total
            .unwrap_or(toml_config.lottery.client_total);
        if client_total == 0 {
            return Err(ConfigError::Invalid("client_total must be at least 1".into()));
        }

        let accept_timeout = cli
            .accept_timeout
            .unwrap_or(toml_config.server.accept_timeout);
        if accept_timeout == 0 {
            return Err(ConfigError::Invalid("accept_timeout must be at least 1 second".into()));
        }

        let barrier_deadline = cli
            .barrier_deadline
            .unwrap_or(toml_config.lottery.barrier_deadline);

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            listen_backlog: cli
                .listen_backlog
                .unwrap_or(toml_config.server.listen_backlog),
            client_total,
            accept_timeout: Duration::from_secs(accept_timeout),
            send_timeout: Duration::from_secs(
                cli.send_timeout.unwrap_or(toml_config.server.send_timeout),
            ),
            barrier_deadline: (barrier_deadline > 0).then(|| Duration::from_secs(barrier_deadline)),
            winning_number: cli
                .winning_number
                .unwrap_or(toml_config.lottery.winning_number),
            bets_file: cli.bets_file.or(toml_config.lottery.bets_file),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Resolve `host:port` into a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{addr}'")))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
