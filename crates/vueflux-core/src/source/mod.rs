//! Meter data sources.
//!
//! The `MeterSource` trait lets the pipeline read devices and usage samples
//! from the Emporia Vue cloud API in production and from an in-memory mock in
//! tests.
//!
//! ```text
//!            ┌──────────────┐
//!            │ MeterSource  │ (trait)
//!            └──────┬───────┘
//!          ┌────────┴────────┐
//!   ┌──────▼──────┐   ┌──────▼──────┐
//!   │  VueClient  │   │ MockSource  │
//!   │ (HTTP API)  │   │  (Testing)  │
//!   └──────┬──────┘   └─────────────┘
//!   ┌──────▼──────┐
//!   │Authenticator│ (Cognito tokens, token file)
//!   └─────────────┘
//! ```

pub mod auth;
pub mod mock;
pub mod vue;

pub use auth::{Authenticator, Credentials, Tokens};
pub use mock::MockSource;
pub use vue::VueClient;

use chrono::{DateTime, Utc};

use crate::rates::Unit;
use crate::window::Scale;

/// Error type for meter source operations.
#[derive(Debug)]
pub enum SourceError {
    /// Request could not be sent or the response could not be read.
    Http(String),
    /// Server answered with a non-success status.
    Status(u16, String),
    /// Authentication failed or no credentials are available.
    Auth(String),
    /// Response body had an unexpected shape.
    Parse(String),
    /// Token file could not be read or written.
    Io(std::io::Error),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Http(msg) => write!(f, "meter API request failed: {}", msg),
            SourceError::Status(code, body) => write!(f, "meter API returned {}: {}", code, body),
            SourceError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            SourceError::Parse(msg) => write!(f, "unexpected meter API response: {}", msg),
            SourceError::Io(e) => write!(f, "token file error: {}", e),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Http(e.to_string())
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io(e)
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Parse(e.to_string())
    }
}

/// A metering device and its channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Device id (the API's `deviceGid`, as a string).
    pub id: String,
    /// Location name, when the API provides one.
    pub name: Option<String>,
    pub channels: Vec<Channel>,
}

/// A sub-circuit or aggregate reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Id of the device the API reports this channel under.
    pub device_id: String,
    /// Channel number, e.g. "1" or the three-phase aggregate "1,2,3".
    pub channel_num: String,
    pub name: Option<String>,
    pub multiplier: f64,
}

/// Usage samples for one channel, unit and time range.
#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    /// Sample `i` covers the scale unit starting `i` units after `first_timestamp`.
    pub samples: Vec<Option<f64>>,
    pub first_timestamp: DateTime<Utc>,
}

/// Source of devices and usage samples.
pub trait MeterSource {
    /// Lists every device visible to the account, nested devices flattened.
    fn devices(&mut self) -> Result<Vec<Device>, SourceError>;

    /// Fetches usage for `channel` over `[start, end)`.
    ///
    /// May return fewer samples than the range covers when the meter has no
    /// data yet for recent instants.
    fn usage(
        &mut self,
        channel: &Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        scale: Scale,
        unit: Unit,
    ) -> Result<Usage, SourceError>;
}

/// Removes repeated device ids, keeping the first record of each.
///
/// The API sometimes returns the same device more than once.
pub fn dedup_devices(devices: Vec<Device>) -> Vec<Device> {
    let mut seen = std::collections::HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.id.clone()))
        .collect()
}
