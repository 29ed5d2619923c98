//! Configuration management for trailbeacon.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sample::Position;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "trailbeacon";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "trailbeacon.db";

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "TRAILBEACON_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `TRAILBEACON_`, sections split on `__`,
///    e.g. `TRAILBEACON_RETRY__FAILURE_THRESHOLD=5`)
/// 2. TOML config file at `~/.config/trailbeacon/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Position sampling.
    pub sampling: SamplingConfig,
    /// Durable queue.
    pub queue: QueueConfig,
    /// Remote collector.
    pub collector: CollectorConfig,
    /// Retry and backoff.
    pub retry: RetryConfig,
    /// Emergency SMS fallback.
    pub fallback: FallbackConfig,
}

/// Where position fixes come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A gpsd daemon.
    #[default]
    Gpsd,
    /// Fixed coordinates from this config.
    Fixed,
}

/// Sampling-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Seconds between samples.
    pub interval_secs: u64,
    /// Seconds allowed for one position fix.
    pub acquisition_timeout_secs: u64,
    /// Position source.
    pub source: SourceKind,
    /// gpsd address (`host:port`).
    pub gpsd_address: String,
    /// Latitude reported by the `fixed` source.
    pub fixed_latitude: Option<f64>,
    /// Longitude reported by the `fixed` source.
    pub fixed_longitude: Option<f64>,
}

/// Queue-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/trailbeacon/trailbeacon.db`
    pub database_path: Option<PathBuf>,
    /// Maximum number of queued samples. The oldest are dropped beyond this.
    pub capacity: usize,
}

/// Collector-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Base URL of the collector.
    pub url: String,
    /// Hard deadline for one delivery, in seconds.
    pub send_timeout_secs: u64,
}

/// Retry-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure, in seconds.
    pub base_delay_secs: u64,
    /// Ceiling on the retry delay, in seconds.
    pub max_delay_secs: u64,
    /// Consecutive failures before the emergency message goes out.
    pub failure_threshold: u32,
}

/// Fallback-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// HTTP SMS gateway. Without one, SMS is unavailable.
    pub sms_gateway_url: Option<String>,
    /// Timeout for one gateway request, in seconds.
    pub gateway_timeout_secs: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 60,
            acquisition_timeout_secs: 10,
            source: SourceKind::Gpsd,
            gpsd_address: "127.0.0.1:2947".to_string(),
            fixed_latitude: None,
            fixed_longitude: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            capacity: crate::queue::DEFAULT_CAPACITY,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000".to_string(),
            send_timeout_secs: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 600,
            failure_threshold: crate::controller::DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            sms_gateway_url: None,
            gateway_timeout_secs: 10,
        }
    }
}

impl SamplingConfig {
    /// The configured fixed position, if both coordinates are set.
    #[must_use]
    pub fn fixed_position(&self) -> Option<Position> {
        Some(Position::new(self.fixed_latitude?, self.fixed_longitude?))
    }
}

fn require_nonzero(value: u64, name: &str) -> Result<()> {
    if value == 0 {
        return Err(Error::config(format!("{name} must be greater than 0")));
    }
    Ok(())
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `TRAILBEACON_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        require_nonzero(self.sampling.interval_secs, "sampling.interval_secs")?;
        require_nonzero(
            self.sampling.acquisition_timeout_secs,
            "sampling.acquisition_timeout_secs",
        )?;
        require_nonzero(self.collector.send_timeout_secs, "collector.send_timeout_secs")?;
        require_nonzero(self.retry.base_delay_secs, "retry.base_delay_secs")?;
        require_nonzero(
            self.fallback.gateway_timeout_secs,
            "fallback.gateway_timeout_secs",
        )?;

        if self.queue.capacity == 0 {
            return Err(Error::config("queue.capacity must be greater than 0"));
        }
        if self.retry.failure_threshold == 0 {
            return Err(Error::config("retry.failure_threshold must be greater than 0"));
        }

        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(Error::config(format!(
                "retry.base_delay_secs ({}) cannot be greater than retry.max_delay_secs ({})",
                self.retry.base_delay_secs, self.retry.max_delay_secs
            )));
        }

        crate::transmit::endpoint_url(&self.collector.url)?;

        if let Some(url) = &self.fallback.sms_gateway_url {
            if reqwest::Url::parse(url).is_err() {
                return Err(Error::config(format!("invalid fallback.sms_gateway_url: {url}")));
            }
        }

        if self.sampling.source == SourceKind::Fixed {
            match self.sampling.fixed_position() {
                Some(position) if position.is_valid() => {}
                Some(_) => {
                    return Err(Error::config(
                        "sampling.fixed_latitude/fixed_longitude are out of range",
                    ))
                }
                None => {
                    return Err(Error::config(
                        "sampling.source = \"fixed\" requires fixed_latitude and fixed_longitude",
                    ))
                }
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.queue
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the sampling interval as a Duration.
    #[must_use]
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling.interval_secs)
    }

    /// Get the acquisition timeout as a Duration.
    #[must_use]
    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.sampling.acquisition_timeout_secs)
    }

    /// Get the send timeout as a Duration.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.collector.send_timeout_secs)
    }

    /// Get the gateway timeout as a Duration.
    #[must_use]
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback.gateway_timeout_secs)
    }

    /// Get the backoff policy.
    #[must_use]
    pub fn backoff(&self) -> crate::controller::BackoffPolicy {
        crate::controller::BackoffPolicy {
            base: Duration::from_secs(self.retry.base_delay_secs),
            max: Duration::from_secs(self.retry.max_delay_secs),
        }
    }
}
