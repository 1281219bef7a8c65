//! Tagged measurement points.
//!
//! A [`PointBuilder`] carries the identity of one channel (device label,
//! channel number, friendly name, tag sets) and turns averaged buckets into
//! [`MetricPoint`]s. Points are encoded as InfluxDB line protocol by
//! [`MetricPoint::to_line_protocol`].

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::rates::{Unit, to_rate};
use crate::resample::Bucket;
use crate::window::{Scale, TimeWindow};

/// Measurement name of every emitted point.
pub const MEASUREMENT: &str = "energy_usage";

/// A single timestamped measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub measurement: &'static str,
    pub tags: BTreeMap<String, String>,
    pub field: &'static str,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricPoint {
    /// Returns the value of tag `key`, if set.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Encodes the point as one line of InfluxDB line protocol with
    /// second-precision timestamp.
    ///
    /// Tags with empty keys or values are omitted (line protocol cannot carry
    /// them).
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::with_capacity(96);
        escape_into(&mut line, self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        line.push(' ');
        escape_into(&mut line, self.field, &[',', '=', ' ']);
        // Display for f64 never uses exponent notation, which line protocol rejects.
        let _ = write!(line, "={} {}", self.value, self.timestamp.timestamp());
        line
    }
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Builds points for one channel of one device.
#[derive(Debug, Clone)]
pub struct PointBuilder<'a> {
    device: &'a str,
    channel: &'a str,
    channel_name: Option<&'a str>,
    global_tags: &'a BTreeMap<String, String>,
    device_tags: Option<&'a BTreeMap<String, String>>,
}

impl<'a> PointBuilder<'a> {
    /// # Arguments
    /// * `device` - Value of the `device` tag (custom id or raw device id)
    /// * `channel` - Raw channel number, including composite ones like "1,2,3"
    pub fn new(device: &'a str, channel: &'a str) -> Self {
        Self {
            device,
            channel,
            channel_name: None,
            global_tags: empty_tags(),
            device_tags: None,
        }
    }

    /// Sets the `channel_name` tag. `None` leaves the tag off entirely.
    pub fn channel_name(mut self, name: Option<&'a str>) -> Self {
        self.channel_name = name;
        self
    }

    pub fn global_tags(mut self, tags: &'a BTreeMap<String, String>) -> Self {
        self.global_tags = tags;
        self
    }

    pub fn device_tags(mut self, tags: Option<&'a BTreeMap<String, String>>) -> Self {
        self.device_tags = tags;
        self
    }

    /// Builds the point for one averaged bucket.
    ///
    /// The timestamp is `first_timestamp` plus the bucket offset in scale
    /// units. Returns `None` when that lies past the window's end.
    pub fn build(
        &self,
        unit: Unit,
        bucket: Bucket,
        first_timestamp: DateTime<Utc>,
        scale: Scale,
        window: &TimeWindow,
    ) -> Option<MetricPoint> {
        let timestamp = first_timestamp + scale.offset(bucket.index);
        if window.is_late(timestamp) {
            return None;
        }

        let mut tags = BTreeMap::new();
        tags.insert("device".to_string(), self.device.to_string());
        tags.insert("channel".to_string(), self.channel.to_string());
        tags.extend(self.global_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(device_tags) = self.device_tags {
            tags.extend(device_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(name) = self.channel_name {
            tags.insert("channel_name".to_string(), name.to_string());
        }

        Some(MetricPoint {
            measurement: MEASUREMENT,
            tags,
            field: unit.field_name(),
            value: to_rate(bucket.average, unit, scale),
            timestamp,
        })
    }
}

fn empty_tags() -> &'static BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    &EMPTY
}
