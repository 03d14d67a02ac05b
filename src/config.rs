use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the gridscope agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Telemetry server connection configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Buffering and publishing configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Liveness probing configuration.
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Telemetry server connection configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint (e.g., "ws://localhost:8080/socket").
    #[serde(default)]
    pub socket_url: String,

    /// Grid-search run to join on connect.
    #[serde(default)]
    pub grid_search_id: String,

    /// REST endpoint surfaced to the consumer alongside connection status.
    #[serde(default)]
    pub rest_api_url: Option<String>,
}

/// Buffering and publishing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Buffered events that force a flush before the window elapses.
    /// Default: 512.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Maximum time a buffered event waits before publishing. Default: 1s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// How often throughput status is published. Default: 1s.
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,

    /// Transport-to-pipeline channel capacity. Default: 4096.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Liveness probing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// How often a ping probe is attempted. Default: 5s.
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_messages() -> usize {
    512
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            liveness: LivenessConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            window: default_window(),
            status_interval: default_status_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.socket_url.is_empty() {
            bail!("server.socket_url is required");
        }

        if self.server.grid_search_id.is_empty() {
            bail!("server.grid_search_id is required");
        }

        if self.pipeline.max_messages == 0 {
            bail!("pipeline.max_messages must be positive");
        }

        if self.pipeline.window.is_zero() {
            bail!("pipeline.window must be positive");
        }

        if self.pipeline.status_interval.is_zero() {
            bail!("pipeline.status_interval must be positive");
        }

        if self.pipeline.channel_capacity == 0 {
            bail!("pipeline.channel_capacity must be positive");
        }

        if self.liveness.ping_interval.is_zero() {
            bail!("liveness.ping_interval must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                socket_url: "ws://localhost:8080/socket".to_string(),
                grid_search_id: "gs-1".to_string(),
                rest_api_url: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.pipeline.max_messages, 512);
        assert_eq!(cfg.pipeline.window, Duration::from_secs(1));
        assert_eq!(cfg.liveness.ping_interval, Duration::from_secs(5));
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_validation_missing_socket_url() {
        let mut cfg = valid_config();
        cfg.server.socket_url.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server.socket_url"));
    }

    #[test]
    fn test_validation_missing_grid_search_id() {
        let mut cfg = valid_config();
        cfg.server.grid_search_id.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server.grid_search_id"));
    }

    #[test]
    fn test_validation_zero_bounds_rejected() {
        let mut cfg = valid_config();
        cfg.pipeline.max_messages = 0;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_messages"));

        let mut cfg = valid_config();
        cfg.pipeline.window = Duration::ZERO;
        assert!(cfg.validate().unwrap_err().to_string().contains("window"));

        let mut cfg = valid_config();
        cfg.liveness.ping_interval = Duration::ZERO;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("ping_interval"));
    }

    #[test]
    fn test_yaml_durations_and_defaults() {
        let yaml = r#"
server:
  socket_url: "ws://localhost:8080/socket"
  grid_search_id: "gs-7"
  rest_api_url: "http://localhost:8080/api"
pipeline:
  max_messages: 256
  window: 500ms
liveness:
  ping_interval: 2s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.pipeline.max_messages, 256);
        assert_eq!(cfg.pipeline.window, Duration::from_millis(500));
        assert_eq!(cfg.pipeline.status_interval, Duration::from_secs(1));
        assert_eq!(cfg.liveness.ping_interval, Duration::from_secs(2));
        assert_eq!(
            cfg.server.rest_api_url.as_deref(),
            Some("http://localhost:8080/api")
        );
    }
}
