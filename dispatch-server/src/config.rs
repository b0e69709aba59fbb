//! Configuration for the dispatch server.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::dispatch::{EvictionStrategy, SchedulerOptions};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when RUST_LOG is not set.
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

/// Algorithm registry liveness settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Instances without a heartbeat for this long are removed.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// How often the liveness sweep runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Intake queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub strategy: EvictionStrategy,
    /// Occupancy above which backlog alerts fire. Defaults to half the capacity.
    #[serde(default)]
    pub alert_threshold: Option<usize>,
    #[serde(default = "default_alert_interval")]
    pub alert_interval_secs: u64,
    /// Delete the backing object of evicted images.
    #[serde(default = "default_true")]
    pub delete_evicted: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            strategy: EvictionStrategy::default(),
            alert_threshold: None,
            alert_interval_secs: default_alert_interval(),
            delete_evicted: true,
        }
    }
}

/// Scheduler and worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Process-wide bound on in-flight inference calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Number of queue-draining workers. Defaults to `max_concurrent`.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Upper bound on waiting for an admission slot. Unset waits forever.
    #[serde(default)]
    pub admission_timeout_secs: Option<u64>,
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl_secs: u64,
    /// Skip persisting and publishing results without detections.
    #[serde(default)]
    pub save_only_with_detection: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            workers: None,
            request_timeout_secs: default_request_timeout(),
            admission_timeout_secs: None,
            signed_url_ttl_secs: default_signed_url_ttl(),
            save_only_with_detection: false,
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.max_concurrent).max(1)
    }

    /// Scheduler tunables; frames with detections move under `alert_base_path`.
    pub fn options(&self, alert_base_path: &str) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrent: self.max_concurrent,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            admission_timeout: self.admission_timeout_secs.map(Duration::from_secs),
            url_ttl: Duration::from_secs(self.signed_url_ttl_secs),
            save_only_with_detection: self.save_only_with_detection,
            alert_base_path: alert_base_path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_ms: u64,
    #[serde(default = "default_stats_log_interval")]
    pub stats_log_interval_secs: u64,
    /// Drop rate above which the subsystem reports itself unhealthy.
    #[serde(default = "default_high_drop_rate")]
    pub high_drop_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: default_slow_threshold(),
            stats_log_interval_secs: default_stats_log_interval(),
            high_drop_rate: default_high_drop_rate(),
        }
    }
}

/// How new images are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    /// Periodic full listing of the store.
    #[default]
    Scan,
    /// Change-notification subscription.
    Listen,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub mode: ProducerMode,
    /// Key prefix under which frames land as `<base>/<task_type>/<task_id>/<file>`.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Key prefix reserved for alert images; never picked up.
    #[serde(default = "default_alert_base_path")]
    pub alert_base_path: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// TTL of the processed set. Defaults to 24h for the scanner, 30min for the listener.
    #[serde(default)]
    pub processed_ttl_secs: Option<u64>,
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            mode: ProducerMode::default(),
            base_path: default_base_path(),
            alert_base_path: default_alert_base_path(),
            scan_interval_ms: default_scan_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            processed_ttl_secs: None,
            prune_threshold: default_prune_threshold(),
        }
    }
}

impl ProducerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(MIN_SCAN_INTERVAL_MS))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn processed_ttl(&self) -> Duration {
        let default = match self.mode {
            ProducerMode::Scan => 24 * 60 * 60,
            ProducerMode::Listen => 30 * 60,
        };
        Duration::from_secs(self.processed_ttl_secs.unwrap_or(default))
    }
}

/// Local object store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the object tree.
    #[serde(default = "default_store_root")]
    pub root: String,
    /// Externally reachable base URL used in signed links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,
    /// Poll interval backing change subscriptions.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            public_base_url: default_public_base_url(),
            signing_secret: default_signing_secret(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    #[default]
    None,
    Websocket,
}

/// Outbound alert publisher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Alerts buffered while disconnected.
    #[serde(default = "default_broker_buffer")]
    pub buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: None,
            reconnect_delay_secs: default_reconnect_delay(),
            buffer: default_broker_buffer(),
        }
    }
}

const MIN_SCAN_INTERVAL_MS: u64 = 100;

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    100
}
fn default_alert_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> usize {
    5
}
fn default_request_timeout() -> u64 {
    30
}
fn default_signed_url_ttl() -> u64 {
    3600
}
fn default_slow_threshold() -> u64 {
    5000
}
fn default_stats_log_interval() -> u64 {
    60
}
fn default_high_drop_rate() -> f64 {
    0.3
}
fn default_base_path() -> String {
    "frames".to_string()
}
fn default_alert_base_path() -> String {
    "alerts".to_string()
}
fn default_scan_interval() -> u64 {
    10_000
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_prune_threshold() -> usize {
    10_000
}
fn default_store_root() -> String {
    "./data/objects".to_string()
}
fn default_public_base_url() -> String {
    "http://127.0.0.1:8090".to_string()
}
fn default_signing_secret() -> String {
    "change-me".to_string()
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_database_url() -> String {
    "sqlite:./data/alerts.db".to_string()
}
fn default_broker_buffer() -> usize {
    256
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (DISPATCH__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("queue.capacity", default_queue_capacity() as i64)?
            .set_default("queue.strategy", "drop_oldest")?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Message(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.monitor.stats_log_interval_secs == 0 {
            return Err(ConfigError::Message(
                "monitor.stats_log_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.store.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "store.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.broker.kind == BrokerKind::Websocket && self.broker.url.is_none() {
            return Err(ConfigError::Message(
                "broker.url is required for the websocket broker".to_string(),
            ));
        }
        Ok(())
    }
}
