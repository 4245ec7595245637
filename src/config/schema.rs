use std::time::Duration;

use serde::Deserialize;

use crate::health::{TabletAlias, TabletType};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Identity of this tablet
    #[serde(default)]
    pub tablet: TabletConfig,
    /// The local mysqld this agent watches
    #[serde(default)]
    pub backend: BackendConfig,
    /// Health streaming and schema-change signaling
    #[serde(default)]
    pub health: HealthConfig,
    /// Local state probing
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Prometheus / status endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ============================================================================
// Tablet identity
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TabletConfig {
    #[serde(default = "default_alias")]
    pub alias: TabletAlias,
    #[serde(default)]
    pub keyspace: String,
    #[serde(default = "default_shard")]
    pub shard: String,
    /// Type assumed until the first probe completes
    #[serde(default = "default_tablet_type")]
    pub tablet_type: TabletType,
}

fn default_alias() -> TabletAlias {
    TabletAlias::new("zone1", 100)
}

fn default_shard() -> String {
    "0".to_string()
}

fn default_tablet_type() -> TabletType {
    TabletType::Replica
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            keyspace: String::new(),
            shard: default_shard(),
            tablet_type: default_tablet_type(),
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

impl BackendConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: None,
        }
    }
}

// ============================================================================
// Health streaming
// ============================================================================

/// Health streamer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Replication lag above this is reported as degraded
    #[serde(default = "default_degraded_threshold_secs")]
    pub degraded_threshold_secs: u64,
    /// Replication lag above this is reported as unhealthy
    #[serde(default = "default_unhealthy_threshold_secs")]
    pub unhealthy_threshold_secs: u64,
    /// Max buffered health entries per streaming client
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    /// Whether to broadcast the list of tables whose schema changed
    #[serde(default)]
    pub signal_when_schema_change: bool,
    /// Interval between schema-change checks (seconds)
    #[serde(default = "default_reload_interval_secs")]
    pub schema_change_reload_interval_secs: u64,
    /// Random spread applied to each reload interval, as a fraction of it
    #[serde(default = "default_reload_jitter")]
    pub schema_change_reload_jitter: f64,
    /// Idle connections of the schema-change pool are closed after this
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Per-statement timeout for schema-change queries (milliseconds)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_degraded_threshold_secs() -> u64 {
    30
}

fn default_unhealthy_threshold_secs() -> u64 {
    7200
}

fn default_stream_buffer_size() -> usize {
    20
}

fn default_reload_interval_secs() -> u64 {
    5
}

fn default_reload_jitter() -> f64 {
    0.1
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

impl HealthConfig {
    pub fn degraded_threshold(&self) -> Duration {
        Duration::from_secs(self.degraded_threshold_secs)
    }

    pub fn unhealthy_threshold(&self) -> Duration {
        Duration::from_secs(self.unhealthy_threshold_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.schema_change_reload_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold_secs: default_degraded_threshold_secs(),
            unhealthy_threshold_secs: default_unhealthy_threshold_secs(),
            stream_buffer_size: default_stream_buffer_size(),
            signal_when_schema_change: false,
            schema_change_reload_interval_secs: default_reload_interval_secs(),
            schema_change_reload_jitter: default_reload_jitter(),
            idle_timeout_secs: default_idle_timeout_secs(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

// ============================================================================
// State monitor
// ============================================================================

/// Local mysqld probing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
    /// Interval between probes (milliseconds)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Timeout for one probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_probe_interval_ms() -> u64 {
    20_000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "127.0.0.1:15100".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_addr: default_metrics_addr(),
        }
    }
}
