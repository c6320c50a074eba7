//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`/dev/ttyUSB0`, 8 second travel time, ...)
//! 2. A TOML file (default `config/somfy_urts.toml`)
//! 3. Environment variables prefixed with `SOMFY_URTS_`, nested keys separated by `__`
//!    (e.g. `SOMFY_URTS_SERIAL__PORT=socket://192.168.1.20:4001`)
//!
//! Missing values are not errors: the documented defaults are substituted and
//! startup continues.
//!
//! # Example
//! ```no_run
//! use somfy_urts::config::UrtsConfig;
//!
//! let config = UrtsConfig::load()?;
//! println!("Serial port: {}", config.serial.port);
//! # Ok::<(), somfy_urts::error::UrtsError>(())
//! ```

use crate::error::{AppResult, UrtsError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

/// Serial device used when none is configured.
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
/// Full-travel time used when a shade has no calibration.
pub const DEFAULT_TRAVEL_TIME_SECS: f64 = 8.0;
/// Largest accepted full-travel time.
pub const MAX_TRAVEL_TIME_SECS: f64 = 60.0;
/// Number of channels on one URTSii unit.
pub const MAX_CHANNELS: u8 = 16;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/somfy_urts.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrtsConfig {
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Discovery and polling settings
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Per-shade travel time overrides keyed by channel address (`01_01_03`).
    ///
    /// Kept as raw values so that a malformed entry only affects its own shade.
    #[serde(default)]
    pub travel_times: BTreeMap<String, toml::Value>,
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Local device path or `socket://host:port` URL
    #[serde(default = "default_port")]
    pub port: String,
    /// Per-attempt timeout for opening the port
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,
    /// Per-attempt timeout for writing one frame
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Pause between retry attempts
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Discovery and polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between link health checks (0 disables the long poll)
    #[serde(default = "default_long_poll")]
    pub long_poll_secs: u64,
    /// Channels to create shades for; all 16 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<u8>>,
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_open_timeout() -> u64 {
    2000
}

fn default_write_timeout() -> u64 {
    1000
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_long_poll() -> u64 {
    10
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            open_timeout_ms: default_open_timeout(),
            write_timeout_ms: default_write_timeout(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            long_poll_secs: default_long_poll(),
            channels: None,
        }
    }
}

impl SerialConfig {
    /// Per-attempt open timeout
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Per-attempt write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Pause between retries
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl ControllerConfig {
    /// Channel numbers discovery should create, in ascending order.
    pub fn channels(&self) -> Vec<u8> {
        match &self.channels {
            Some(channels) => {
                let mut channels = channels.clone();
                channels.sort_unstable();
                channels.dedup();
                channels
            }
            None => (1..=MAX_CHANNELS).collect(),
        }
    }

    /// Long poll interval, `None` when disabled.
    pub fn long_poll(&self) -> Option<Duration> {
        (self.long_poll_secs > 0).then(|| Duration::from_secs(self.long_poll_secs))
    }
}

impl UrtsConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                path = %path.display(),
                "Configuration file not found, using defaults (port {DEFAULT_PORT})"
            );
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SOMFY_URTS_").split("__"))
            .extract()?;

        debug!(port = %config.serial.port, "Loaded serial configuration");
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(UrtsError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(UrtsError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.serial.port.trim().is_empty() {
            return Err(UrtsError::Configuration(
                "Serial port must not be empty".to_string(),
            ));
        }

        if let Some(channels) = &self.controller.channels {
            if let Some(bad) = channels.iter().find(|c| **c == 0 || **c > MAX_CHANNELS) {
                return Err(UrtsError::Configuration(format!(
                    "Invalid channel {bad}. Must be 1-{MAX_CHANNELS}"
                )));
            }
        }

        Ok(())
    }

    /// Travel time for a shade, falling back to the default when the entry is
    /// missing, non-numeric, or outside `[0, 60]` seconds.
    pub fn travel_time_for(&self, address: &str) -> f64 {
        let Some(raw) = self.travel_times.get(address) else {
            info!(
                address,
                "No travel time found in configuration, defaulting to {DEFAULT_TRAVEL_TIME_SECS} seconds"
            );
            return DEFAULT_TRAVEL_TIME_SECS;
        };

        let parsed = match raw {
            toml::Value::Float(f) => Some(*f),
            toml::Value::Integer(i) => Some(*i as f64),
            toml::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        match parsed {
            Some(secs) if (0.0..=MAX_TRAVEL_TIME_SECS).contains(&secs) => secs,
            _ => {
                error!(
                    address,
                    value = %raw,
                    "Invalid travel time in configuration, defaulting to {DEFAULT_TRAVEL_TIME_SECS} seconds"
                );
                DEFAULT_TRAVEL_TIME_SECS
            }
        }
    }
}
