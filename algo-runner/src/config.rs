//! Configuration for the algorithm runner.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the algorithm runner.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Dispatcher control plane. Without it the runner only serves requests.
    #[serde(default)]
    pub control_plane: Option<ControlPlaneConfig>,
    #[serde(default)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Task types this service analyses.
    pub task_types: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// URL the dispatcher should POST to. Derived from the API address when unset.
    #[serde(default)]
    pub advertise_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    /// Dispatcher base URL, e.g. `http://127.0.0.1:8090`.
    pub base_url: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_retry_delay() -> u64 {
    5
}
fn default_max_image_bytes() -> usize {
    20 * 1024 * 1024
}
fn default_fetch_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (RUNNER__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("RUNNER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("service.task_types")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        if config.service.task_types.is_empty() {
            return Err(ConfigError::Message(
                "service.task_types must list at least one task type".to_string(),
            ));
        }
        Ok(config)
    }

    /// Display name, falling back to the service id.
    pub fn service_name(&self) -> &str {
        if self.service.name.is_empty() {
            &self.service.id
        } else {
            &self.service.name
        }
    }

    /// Inference endpoint announced to the dispatcher.
    pub fn endpoint(&self) -> String {
        if let Some(url) = &self.service.advertise_url {
            return url.clone();
        }
        let host = match self.api.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}/infer", host, self.api.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        ConfigLoader::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_minimal_config() {
        let config = parse("[service]\nid = \"probe\"\ntask_types = [\"helmet\"]\n");
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.service_name(), "probe");
        assert!(config.control_plane.is_none());
        assert_eq!(config.endpoint(), "http://127.0.0.1:9000/infer");
    }

    #[test]
    fn test_advertise_url_wins() {
        let config = parse(
            "[service]\nid = \"probe\"\nname = \"Probe\"\ntask_types = [\"a\"]\nadvertise_url = \"http://10.0.0.7:9000/infer\"\n\
             [control_plane]\nbase_url = \"http://dispatch:8090\"\n",
        );
        assert_eq!(config.endpoint(), "http://10.0.0.7:9000/infer");
        assert_eq!(config.service_name(), "Probe");
        let control = config.control_plane.unwrap();
        assert_eq!(control.heartbeat_interval_secs, 30);
        assert_eq!(control.retry_delay_secs, 5);
    }
}
