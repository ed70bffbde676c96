//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-call request timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retry behavior for store-and-forward producers.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Consumer worker-pool configuration.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root directory for the durable store.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum message payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum send attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds; attempt `n` waits `base * n`.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

/// Consumer worker-pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum messages one group processes in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay between polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
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

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7070)
}

fn default_request_timeout() -> u64 {
    5_000
}

fn default_storage_root() -> PathBuf {
    std::env::var("RELAY_STORAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./relay-data"))
}

fn default_true() -> bool {
    true
}

fn default_max_topics() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    200
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    250
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            consumer: ConsumerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_topics: default_max_topics(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Get the broker-core configuration slice.
    #[must_use]
    pub fn broker_config(&self) -> relay_core::BrokerConfig {
        relay_core::BrokerConfig {
            max_topics: self.limits.max_topics,
            max_message_size: self.limits.max_message_size,
        }
    }

    /// Get the retry policy for store-and-forward producers.
    #[must_use]
    pub fn retry_policy(&self) -> relay_client::RetryPolicy {
        relay_client::RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Get the consumer worker-pool configuration.
    #[must_use]
    pub fn consumer_config(&self) -> relay_client::ConsumerConfig {
        relay_client::ConsumerConfig {
            concurrency: self.consumer.concurrency,
            poll_interval: Duration::from_millis(self.consumer.poll_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 7070);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 7070);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [storage]
            root = "/var/lib/relay"

            [retry]
            max_attempts = 3
            base_delay_ms = 100

            [consumer]
            concurrency = 8
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/relay"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.consumer.concurrency, 8);
    }

    #[test]
    fn test_config_slices() {
        let config = Config::default();

        let broker = config.broker_config();
        assert_eq!(broker.max_topics, config.limits.max_topics);

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(200));
        assert_eq!(retry.request_timeout, Duration::from_millis(5_000));

        let consumer = config.consumer_config();
        assert_eq!(consumer.concurrency, 4);
        assert_eq!(consumer.poll_interval, Duration::from_millis(250));
    }
}
