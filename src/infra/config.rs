//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique deployment identifier (e.g., "cityhall", "clinic-3")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "queueless".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue-ahead count at or below which WAITING tokens become NEAR
    #[serde(default = "default_near_threshold")]
    pub near_threshold: usize,
    /// Seconds a CALLED token may go unanswered before it is marked MISSED
    #[serde(default = "default_called_timeout_secs")]
    pub called_timeout_secs: u64,
    /// Maximum total seconds a WAITING/NEAR token may wait before EXPIRED
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Interval between timeout sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Presence radius applied when a service is created without one
    #[serde(default = "default_presence_radius_m")]
    pub default_presence_radius_m: f64,
}

fn default_near_threshold() -> usize {
    2
}

fn default_called_timeout_secs() -> u64 {
    120
}

fn default_max_wait_secs() -> u64 {
    7200
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_presence_radius_m() -> f64 {
    100.0
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            near_threshold: default_near_threshold(),
            called_timeout_secs: default_called_timeout_secs(),
            max_wait_secs: default_max_wait_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_presence_radius_m: default_presence_radius_m(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind_address")]
    pub bind_address: String,
    /// HTTP API port (0 to disable)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind_address: default_api_bind_address(), port: default_api_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Per-service broadcast buffer; subscribers further behind than this lag
    #[serde(default = "default_events_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_events_channel_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { channel_capacity: default_events_channel_capacity() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    near_threshold: usize,
    called_timeout_secs: u64,
    max_wait_secs: u64,
    sweep_interval_secs: u64,
    default_presence_radius_m: f64,
    api_bind_address: String,
    api_port: u16,
    events_channel_capacity: usize,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            near_threshold: default_near_threshold(),
            called_timeout_secs: default_called_timeout_secs(),
            max_wait_secs: default_max_wait_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_presence_radius_m: default_presence_radius_m(),
            api_bind_address: default_api_bind_address(),
            api_port: default_api_port(),
            events_channel_capacity: default_events_channel_capacity(),
            metrics_interval_secs: default_metrics_interval_secs(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            site_id: toml_config.site.id,
            near_threshold: toml_config.queue.near_threshold,
            called_timeout_secs: toml_config.queue.called_timeout_secs,
            max_wait_secs: toml_config.queue.max_wait_secs,
            sweep_interval_secs: toml_config.queue.sweep_interval_secs,
            default_presence_radius_m: toml_config.queue.default_presence_radius_m,
            api_bind_address: toml_config.api.bind_address,
            api_port: toml_config.api.port,
            events_channel_capacity: toml_config.events.channel_capacity,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Load from a path, falling back to defaults if missing or malformed
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn near_threshold(&self) -> usize {
        self.near_threshold
    }

    pub fn called_timeout(&self) -> Duration {
        Duration::from_secs(self.called_timeout_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn default_presence_radius_m(&self) -> f64 {
        self.default_presence_radius_m
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn events_channel_capacity(&self) -> usize {
        self.events_channel_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder methods for tests and tooling to tighten queue policy
    pub fn with_near_threshold(mut self, threshold: usize) -> Self {
        self.near_threshold = threshold;
        self
    }

    pub fn with_called_timeout_secs(mut self, secs: u64) -> Self {
        self.called_timeout_secs = secs;
        self
    }

    pub fn with_max_wait_secs(mut self, secs: u64) -> Self {
        self.max_wait_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "queueless");
        assert_eq!(config.near_threshold(), 2);
        assert_eq!(config.called_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_wait(), Duration::from_secs(7200));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.default_presence_radius_m(), 100.0);
        assert_eq!(config.api_port(), 8000);
        assert_eq!(config.events_channel_capacity(), 256);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["queueless".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "queueless".to_string(),
            "--config".to_string(),
            "config/cityhall.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/cityhall.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["queueless".to_string(), "--config=config/clinic.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/clinic.toml");
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[queue]
near_threshold = 5
"#,
        )
        .unwrap();
        assert_eq!(toml_config.queue.near_threshold, 5);
        assert_eq!(toml_config.queue.called_timeout_secs, 120);
        assert_eq!(toml_config.api.port, 8000);
    }
}
