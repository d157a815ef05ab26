/*!
 * Configuration types for the federation broker
 */

use crate::error::{BrokerError, Result};
use crate::routes::{default_routes, validate_routes, Route, Side};
use fedbroker_core_interface::{static_resolver, Server, ServerResolver};
use fedbroker_core_resilience::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Collective side connection settings
    #[serde(default)]
    pub collective: SideConfig,

    /// Federation side connection settings
    #[serde(default)]
    pub federation: SideConfig,

    /// Capacity of every subscription delivery channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Upper bound for a single relayed publish
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// How often each side's connection health is polled
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Reconnect and resubscribe backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Relay rules; empty means the cluster's default routes
    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for one side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideConfig {
    /// Server URLs, tried in order on every (re)connect
    #[serde(default)]
    pub servers: Vec<String>,

    /// Connector name (None = `<cluster>_<side>`)
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Relative jitter in `[0.0, 1.0]`
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Give up after this many attempts (None = retry until shutdown)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// JSON output on stdout as well
    #[serde(default)]
    pub json: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            collective: SideConfig::default(),
            federation: SideConfig::default(),
            channel_capacity: default_channel_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            health_interval_ms: default_health_interval_ms(),
            reconnect: ReconnectConfig::default(),
            routes: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_publish_timeout_ms() -> u64 {
    2000
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: BrokerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| BrokerError::Configuration(format!("Failed to serialize: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every value the broker relies on
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(BrokerError::Configuration(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.publish_timeout_ms == 0 {
            return Err(BrokerError::Configuration(
                "publish_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.health_interval_ms == 0 {
            return Err(BrokerError::Configuration(
                "health_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.initial_ms == 0 || self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(BrokerError::Configuration(format!(
                "reconnect delays must satisfy 0 < initial_ms ({}) <= max_ms ({})",
                self.reconnect.initial_ms, self.reconnect.max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(BrokerError::Configuration(format!(
                "reconnect.jitter must be within [0.0, 1.0], got {}",
                self.reconnect.jitter
            )));
        }

        for side in Side::ALL {
            self.servers(side)?;
        }

        validate_routes(&self.routes).map_err(BrokerError::Configuration)
    }

    pub fn side(&self, side: Side) -> &SideConfig {
        match side {
            Side::Collective => &self.collective,
            Side::Federation => &self.federation,
        }
    }

    /// Parsed server list for a side
    pub fn servers(&self, side: Side) -> Result<Vec<Server>> {
        self.side(side)
            .servers
            .iter()
            .map(|address| {
                Server::parse(address).map_err(|e| {
                    BrokerError::Configuration(format!("{} servers: {}", side, e))
                })
            })
            .collect()
    }

    /// Resolver over the configured servers of a side
    pub fn resolver(&self, side: Side) -> Result<ServerResolver> {
        Ok(static_resolver(self.servers(side)?))
    }

    /// Configured name, or `<cluster>_<side>`
    pub fn connector_name(&self, side: Side, cluster: &str) -> String {
        self.side(side)
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", cluster, side))
    }

    /// Routes the broker should run for `cluster`
    pub fn routes_for(&self, cluster: &str) -> Vec<Route> {
        if self.routes.is_empty() {
            default_routes(cluster)
        } else {
            self.routes.clone()
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.reconnect.initial_ms),
            max: Duration::from_millis(self.reconnect.max_ms),
            multiplier: self.reconnect.multiplier,
            jitter: self.reconnect.jitter,
            max_retries: self.reconnect.max_attempts,
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}
