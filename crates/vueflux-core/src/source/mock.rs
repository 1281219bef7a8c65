//! In-memory meter source for testing the pipeline without the cloud API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::{Channel, Device, MeterSource, SourceError, Usage};
use crate::rates::Unit;
use crate::window::Scale;

type FetchHook = Box<dyn FnMut(&Channel, Unit) + Send>;

/// One recorded `usage` call.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageCall {
    pub device_id: String,
    pub channel_num: String,
    pub unit: Unit,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub scale: Scale,
}

/// Mock source serving canned devices and samples.
///
/// Samples are keyed by `(device_id, channel_num, unit)`. Channels without
/// canned samples return an empty sequence starting at the requested start.
#[derive(Default)]
pub struct MockSource {
    devices: Vec<Device>,
    samples: HashMap<(String, String, Unit), Vec<Option<f64>>>,
    calls: Vec<UsageCall>,
    on_fetch: Option<FetchHook>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device with the given channel numbers.
    pub fn add_device(&mut self, id: &str, channels: &[&str]) {
        self.devices.push(Device {
            id: id.to_string(),
            name: Some(format!("Device {}", id)),
            channels: channels
                .iter()
                .map(|num| Channel {
                    device_id: id.to_string(),
                    channel_num: num.to_string(),
                    name: None,
                    multiplier: 1.0,
                })
                .collect(),
        });
    }

    /// Sets the samples returned for one channel and unit.
    pub fn set_samples(
        &mut self,
        device_id: &str,
        channel_num: &str,
        unit: Unit,
        samples: Vec<Option<f64>>,
    ) {
        self.samples.insert(
            (device_id.to_string(), channel_num.to_string(), unit),
            samples,
        );
    }

    /// Installs a hook run on every `usage` call, before samples are returned.
    ///
    /// Tests use it to advance a mock clock or to request stop mid-sweep.
    pub fn on_fetch(&mut self, hook: impl FnMut(&Channel, Unit) + Send + 'static) {
        self.on_fetch = Some(Box::new(hook));
    }

    /// All `usage` calls made so far, in order.
    pub fn calls(&self) -> &[UsageCall] {
        &self.calls
    }
}

impl MeterSource for MockSource {
    fn devices(&mut self) -> Result<Vec<Device>, SourceError> {
        Ok(self.devices.clone())
    }

    fn usage(
        &mut self,
        channel: &Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        scale: Scale,
        unit: Unit,
    ) -> Result<Usage, SourceError> {
        self.calls.push(UsageCall {
            device_id: channel.device_id.clone(),
            channel_num: channel.channel_num.clone(),
            unit,
            start,
            end,
            scale,
        });

        if let Some(hook) = self.on_fetch.as_mut() {
            hook(channel, unit);
        }

        let samples = self
            .samples
            .get(&(channel.device_id.clone(), channel.channel_num.clone(), unit))
            .cloned()
            .unwrap_or_default();

        Ok(Usage {
            samples,
            first_timestamp: start,
        })
    }
}
