//! Emporia Vue cloud API client.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Authenticator, Channel, Device, MeterSource, SourceError, Tokens, Usage};
use crate::rates::Unit;
use crate::window::Scale;

/// Base URL of the Emporia API.
pub const API_ROOT: &str = "https://api.emporiaenergy.com";

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<ApiDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiDevice {
    device_gid: u64,
    #[serde(default)]
    channels: Vec<ApiChannel>,
    #[serde(default)]
    devices: Vec<ApiDevice>,
    location_properties: Option<LocationProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiChannel {
    device_gid: Option<u64>,
    name: Option<String>,
    channel_num: String,
    channel_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationProperties {
    device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartUsageResponse {
    first_usage_instant: Option<DateTime<Utc>>,
    #[serde(default)]
    usage_list: Vec<Option<f64>>,
}

/// Parses a `customers/devices` response, flattening nested devices.
fn parse_devices(body: &str) -> Result<Vec<Device>, SourceError> {
    let response: DevicesResponse = serde_json::from_str(body)?;
    let mut devices = Vec::new();
    for device in response.devices {
        flatten_device(device, &mut devices);
    }
    Ok(devices)
}

fn flatten_device(device: ApiDevice, out: &mut Vec<Device>) {
    let id = device.device_gid.to_string();
    let channels = device
        .channels
        .into_iter()
        .map(|c| Channel {
            device_id: c.device_gid.map(|g| g.to_string()).unwrap_or_else(|| id.clone()),
            channel_num: c.channel_num,
            name: c.name,
            multiplier: c.channel_multiplier.unwrap_or(1.0),
        })
        .collect();

    out.push(Device {
        id,
        name: device.location_properties.and_then(|p| p.device_name),
        channels,
    });

    for nested in device.devices {
        flatten_device(nested, out);
    }
}

/// Parses a `getChartUsage` response.
///
/// An absent `firstUsageInstant` means no data; `fallback` is used as the
/// first-sample time.
fn parse_usage(body: &str, fallback: DateTime<Utc>) -> Result<Usage, SourceError> {
    let response: ChartUsageResponse = serde_json::from_str(body)?;
    Ok(Usage {
        samples: response.usage_list,
        first_timestamp: response.first_usage_instant.unwrap_or(fallback),
    })
}

fn scale_param(scale: Scale) -> &'static str {
    match scale {
        Scale::Second => "1S",
        Scale::Minute => "1MIN",
    }
}

fn unit_param(unit: Unit) -> &'static str {
    match unit {
        Unit::Energy => "KilowattHours",
        Unit::Charge => "AmpHours",
    }
}

fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Blocking client for the Emporia Vue API.
pub struct VueClient {
    http: reqwest::blocking::Client,
    base_url: String,
    auth: Authenticator,
    tokens: Tokens,
}

impl VueClient {
    /// Logs in and returns a ready client.
    pub fn connect(auth: Authenticator) -> Result<Self, SourceError> {
        let tokens = auth.login()?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        info!(
            "Logged in to Emporia API{}",
            tokens
                .username
                .as_deref()
                .map(|u| format!(" as {}", u))
                .unwrap_or_default()
        );

        Ok(Self {
            http,
            base_url: API_ROOT.to_string(),
            auth,
            tokens,
        })
    }

    /// Overrides the API base URL.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Sends a GET request, refreshing the token once on 401.
    fn get(&mut self, path: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        match self.get_once(path, query) {
            Err(SourceError::Status(401, _)) => {
                debug!("Token expired, refreshing");
                self.tokens = match self.auth.refresh(&self.tokens) {
                    Ok(tokens) => tokens,
                    Err(_) => self.auth.login()?,
                };
                self.get_once(path, query)
            }
            other => other,
        }
    }

    fn get_once(&self, path: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .header("authtoken", &self.tokens.id_token)
            .query(query)
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if status == StatusCode::OK {
            Ok(body)
        } else {
            Err(SourceError::Status(status.as_u16(), body))
        }
    }
}

impl MeterSource for VueClient {
    fn devices(&mut self) -> Result<Vec<Device>, SourceError> {
        let body = self.get("customers/devices", &[])?;
        parse_devices(&body)
    }

    fn usage(
        &mut self,
        channel: &Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        scale: Scale,
        unit: Unit,
    ) -> Result<Usage, SourceError> {
        let query = [
            ("apiMethod", "getChartUsage".to_string()),
            ("deviceGid", channel.device_id.clone()),
            ("channel", channel.channel_num.clone()),
            ("start", format_instant(start)),
            ("end", format_instant(end)),
            ("scale", scale_param(scale).to_string()),
            ("energyUnit", unit_param(unit).to_string()),
        ];
        let body = self.get("AppAPI", &query)?;
        parse_usage(&body, start)
    }
}
