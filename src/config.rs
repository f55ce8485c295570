//! Configuration management for the gatekeeper layer.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};
use crate::limit::{KeySource, StrategyDefinition, StrategyId};
use crate::metrics::MetricsConfig;

/// Main configuration for the gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Throttling configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Request deduplication configuration
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Metrics aggregation configuration
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address for the demo server
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Strategy overrides; anything not listed keeps its built-in definition
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,

    /// Adaptive limit adjustment
    #[serde(default)]
    pub adaptive: AdaptiveSection,

    /// Cadence of the periodic cleanup task, in seconds
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            adaptive: AdaptiveSection::default(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

fn default_janitor_interval() -> u64 {
    60
}

/// One strategy override in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEntry {
    /// Strategy name; must match a member of the closed strategy set
    pub name: String,
    #[serde(default = "default_key_source")]
    pub key_source: KeySource,
    pub points: u64,
    pub window_secs: u64,
    #[serde(default)]
    pub block_secs: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_key_source() -> KeySource {
    KeySource::UserOrIp
}

impl StrategyEntry {
    /// Convert to a typed definition. Unknown names are a startup error,
    /// not something to discover per request.
    pub fn to_definition(&self) -> Result<StrategyDefinition> {
        let id = StrategyId::from_name(&self.name).ok_or_else(|| {
            GatekeeperError::Config(format!("unknown strategy '{}'", self.name))
        })?;
        Ok(StrategyDefinition {
            id,
            key_source: self.key_source,
            limit_points: self.points,
            window: Duration::from_secs(self.window_secs),
            block_duration: self.block_secs.map(Duration::from_secs),
            message: self
                .message
                .clone()
                .unwrap_or_else(|| "Too many requests, please slow down.".to_string()),
        })
    }
}

/// Adaptive controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limits never shrink below this many points
    #[serde(default = "default_min_limit")]
    pub min_limit: u64,

    /// Memory budget used to scale the RSS load signal, in megabytes
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_limit: default_min_limit(),
            memory_budget_mb: default_memory_budget_mb(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_limit() -> u64 {
    5
}

fn default_memory_budget_mb() -> u64 {
    1024
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Upper bound on how long a follower waits for the shared outcome
    #[serde(default = "default_dedup_wait")]
    pub wait_timeout_secs: u64,

    /// Largest request body the dedup layer will buffer for hashing
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_dedup_wait(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_dedup_wait() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Metrics configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_ledger_window")]
    pub ledger_window_secs: u64,

    #[serde(default = "default_slow_request_ms")]
    pub slow_request_ms: u64,

    #[serde(default = "default_ledger_cap")]
    pub ledger_cap: usize,

    #[serde(default = "default_degraded_error_rate")]
    pub degraded_error_rate: f64,

    #[serde(default = "default_critical_error_rate")]
    pub critical_error_rate: f64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            ledger_window_secs: default_ledger_window(),
            slow_request_ms: default_slow_request_ms(),
            ledger_cap: default_ledger_cap(),
            degraded_error_rate: default_degraded_error_rate(),
            critical_error_rate: default_critical_error_rate(),
        }
    }
}

fn default_ledger_window() -> u64 {
    300
}

fn default_slow_request_ms() -> u64 {
    3000
}

fn default_ledger_cap() -> usize {
    100_000
}

fn default_degraded_error_rate() -> f64 {
    0.05
}

fn default_critical_error_rate() -> f64 {
    0.25
}

impl MetricsSection {
    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            ledger_window: Duration::from_secs(self.ledger_window_secs),
            slow_request_threshold: Duration::from_millis(self.slow_request_ms),
            ledger_cap: self.ledger_cap,
            degraded_error_rate: self.degraded_error_rate,
            critical_error_rate: self.critical_error_rate,
        }
    }
}

impl GatekeeperConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))
    }

    /// Validated strategy definitions from the `strategies` section.
    pub fn strategy_definitions(&self) -> Result<Vec<StrategyDefinition>> {
        self.throttle
            .strategies
            .iter()
            .map(StrategyEntry::to_definition)
            .collect()
    }
}
