//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`HUDDLE_CONFIG`, or the first of the default paths)
//! - Environment variables (`HUDDLE_*`, `__` separates nested keys)

use anyhow::{Context, Result};
use huddle_core::HubConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HUDDLE_CONFIG";

/// Files tried in order when `HUDDLE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Message log configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Message log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the JSON history file. `~` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Write "left the chat" notices to the log.
    #[serde(default = "default_true")]
    pub persist_departures: bool,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum chat message length, in characters.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    /// Maximum display name length, in characters.
    #[serde(default = "default_max_identity_length")]
    pub max_identity_length: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Frames buffered per connection before deliveries are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_store_path() -> String {
    "data.json".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_text_length() -> usize {
    huddle_core::message::MAX_TEXT_LENGTH
}

fn default_max_identity_length() -> usize {
    huddle_core::message::MAX_IDENTITY_LENGTH
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbox_capacity() -> usize {
    huddle_core::bus::DEFAULT_OUTBOX_CAPACITY
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store: StoreConfig::default(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            persist_departures: true,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_text_length: default_max_text_length(),
            max_identity_length: default_max_identity_length(),
            max_frame_size: default_max_frame_size(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// `HUDDLE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `HUDDLE_CONFIG` names a missing file, or if a
    /// config file or override cannot be parsed.
    pub fn load() -> Result<Self> {
        let file = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let path = PathBuf::from(shellexpand::tilde(&path).as_ref());
                if !path.exists() {
                    anyhow::bail!("{CONFIG_ENV} points to a missing file: {}", path.display());
                }
                Some(path)
            }
            Err(_) => DEFAULT_CONFIG_PATHS
                .iter()
                .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
                .find(|path| path.exists()),
        };

        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Loading configuration file");
        }

        Self::layered(file.as_deref(), Self::environment())
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn environment() -> ::config::Environment {
        ::config::Environment::with_prefix("HUDDLE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn layered(file: Option<&Path>, environment: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(environment)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Path of the history file with `~` expanded.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store.path).as_ref())
    }

    /// Settings for the hub.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_text_length: self.limits.max_text_length,
            max_identity_length: self.limits.max_identity_length,
            persist_departures: self.store.persist_departures,
        }
    }
}
