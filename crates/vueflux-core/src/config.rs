//! Typed configuration loaded from the JSON config file.
//!
//! Every key that may be absent in the file is an `Option` or a defaulted
//! collection; lookups never fail on missing data.
//!
//! ```json
//! {
//!   "vue": {
//!     "username": "me@example.com",
//!     "password": "secret",
//!     "devices": {
//!       "12345": {
//!         "custom-id": "house",
//!         "channels": ["Kitchen", null, "Dryer"],
//!         "tags": { "site": "home" }
//!       }
//!     }
//!   },
//!   "influx": {
//!     "url": "http://localhost:8086",
//!     "token": "...",
//!     "org-id": "...",
//!     "bucket": "energy",
//!     "tags": { "source": "vue" },
//!     "client-options": { "batch-size": 500 }
//!   },
//!   "metrics": { "interval": 60, "resolution": 60 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Deserializer};

use crate::window::Scale;

/// Error type for configuration loading and validation.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    Io(PathBuf, std::io::Error),
    /// Config file is not valid JSON or has the wrong shape.
    Parse(serde_json::Error),
    /// A required key is absent.
    Missing(&'static str),
    /// Values are present but inconsistent.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
            ConfigError::Missing(key) => write!(f, "missing config key '{}'", key),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Root of the config document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub vue: VueConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Reads and parses the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_json(&content)
    }

    /// Parses a config document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Checks the poll settings before any polling begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let MetricsConfig {
            interval,
            resolution,
        } = self.metrics;

        if interval == 0 {
            return Err(ConfigError::Invalid("metrics.interval must be positive".into()));
        }
        if resolution == 0 {
            return Err(ConfigError::Invalid(
                "metrics.resolution must be positive".into(),
            ));
        }
        if interval % resolution != 0 {
            return Err(ConfigError::Invalid(format!(
                "poll interval ({}s) must be a multiple of resolution ({}s)",
                interval, resolution
            )));
        }
        if self.metrics.interval_duration().is_none() {
            return Err(ConfigError::Invalid(format!(
                "metrics.interval ({}s) is out of range",
                interval
            )));
        }
        Ok(())
    }

    /// Per-device settings for `device_id`, if configured.
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.vue.devices.as_ref()?.get(device_id)
    }

    /// Whether `device_id` should be polled.
    ///
    /// With no `vue.devices` section every device is polled; otherwise only the
    /// listed ones.
    pub fn is_polled(&self, device_id: &str) -> bool {
        match &self.vue.devices {
            Some(devices) => devices.contains_key(device_id),
            None => true,
        }
    }

    /// Value of the `device` tag: the configured custom id, else the raw id.
    pub fn device_label(&self, device_id: &str) -> String {
        self.device(device_id)
            .and_then(|d| d.custom_id.clone())
            .unwrap_or_else(|| device_id.to_string())
    }
}

/// `vue` section: meter account and per-device settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VueConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keyed by device id (as a string).
    pub devices: Option<BTreeMap<String, DeviceConfig>>,
}

/// `vue.devices.<id>` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceConfig {
    pub custom_id: Option<String>,
    pub channels: Option<ChannelNames>,
    #[serde(default, deserialize_with = "tag_map")]
    pub tags: BTreeMap<String, String>,
}

impl DeviceConfig {
    /// Friendly name configured at zero-based `index`.
    pub fn channel_name(&self, index: usize) -> Option<&str> {
        self.channels.as_ref()?.get(index)
    }
}

/// Friendly channel names, either positional or keyed by index.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChannelNames {
    List(Vec<Option<String>>),
    Map(BTreeMap<String, Option<String>>),
}

impl ChannelNames {
    pub fn get(&self, index: usize) -> Option<&str> {
        match self {
            ChannelNames::List(names) => names.get(index)?.as_deref(),
            ChannelNames::Map(names) => names.get(&index.to_string())?.as_deref(),
        }
    }
}

/// `influx` section: write target and client tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InfluxConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub org_id: Option<String>,
    pub bucket: Option<String>,
    #[serde(default, deserialize_with = "tag_map")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub client_options: ClientOptions,
}

impl InfluxConfig {
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url.as_deref().ok_or(ConfigError::Missing("influx.url"))
    }

    pub fn require_bucket(&self) -> Result<&str, ConfigError> {
        self.bucket
            .as_deref()
            .ok_or(ConfigError::Missing("influx.bucket"))
    }
}

/// `influx.client-options`: batching and retry behavior of the write client.
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientOptions {
    #[serde(alias = "batch_size")]
    pub batch_size: usize,
    #[serde(alias = "flush_interval")]
    pub flush_interval: u64,
    #[serde(alias = "jitter_interval")]
    pub jitter_interval: u64,
    #[serde(alias = "retry_interval")]
    pub retry_interval: u64,
    #[serde(alias = "max_retries")]
    pub max_retries: u32,
    #[serde(alias = "max_retry_delay")]
    pub max_retry_delay: u64,
    #[serde(alias = "exponential_base")]
    pub exponential_base: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            flush_interval: 10_000,
            jitter_interval: 1_000,
            retry_interval: 5_000,
            max_retries: 5,
            max_retry_delay: 125_000,
            exponential_base: 2,
        }
    }
}

/// `metrics` section: poll cadence and output resolution, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval: u64,
    pub resolution: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            resolution: 60,
        }
    }
}

impl MetricsConfig {
    pub fn scale(&self) -> Scale {
        Scale::for_resolution(self.resolution)
    }

    /// Raw samples per output bucket.
    pub fn step(&self) -> usize {
        self.scale().step(self.resolution)
    }

    /// `None` when the interval does not fit a `Duration`.
    pub fn interval_duration(&self) -> Option<Duration> {
        Duration::try_seconds(i64::try_from(self.interval).ok()?)
    }

    /// Whether the minute-scale step drops a partial minute of `resolution`.
    pub fn step_truncated(&self) -> bool {
        self.scale() == Scale::Minute && self.resolution % 60 != 0
    }
}

/// Accepts string, number and boolean tag values, storing them as strings.
fn tag_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    let mut tags = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => continue,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "tag '{}' must be a scalar, got {}",
                    key, other
                )));
            }
        };
        tags.insert(key, value);
    }
    Ok(tags)
}
