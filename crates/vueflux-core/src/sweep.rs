//! Per-device sweep: channels × units through the resample/convert/build
//! pipeline into the sink.

use std::collections::HashSet;

use tracing::debug;

use crate::config::{Config, DeviceConfig};
use crate::point::PointBuilder;
use crate::rates::Unit;
use crate::resample::resample;
use crate::scheduler::PipelineError;
use crate::sink::MetricSink;
use crate::source::{Device, MeterSource};
use crate::window::{Scale, TimeWindow};

/// Channel number of the three-phase aggregate.
pub const AGGREGATE_CHANNEL: &str = "1,2,3";

/// Resolves the `channel_name` tag for a channel.
///
/// The aggregate channel is always "All". Other channels are looked up by
/// `channel_num - 1` in the device's configured names; anything that does not
/// resolve yields `None`.
pub fn friendly_channel_name<'a>(
    device: Option<&'a DeviceConfig>,
    channel_num: &str,
) -> Option<&'a str> {
    if channel_num == AGGREGATE_CHANNEL {
        return Some("All");
    }
    let n: usize = channel_num.trim().parse().ok()?;
    // Channel "0" has no slot; it must not wrap around to the last name.
    device?.channel_name(n.checked_sub(1)?)
}

/// Counters for one device sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub channels: usize,
    pub duplicates: usize,
    pub points: usize,
    pub late: usize,
}

impl std::ops::AddAssign for SweepStats {
    fn add_assign(&mut self, other: Self) {
        self.channels += other.channels;
        self.duplicates += other.duplicates;
        self.points += other.points;
        self.late += other.late;
    }
}

/// Settings shared by every device sweep of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct SweepContext<'a> {
    pub config: &'a Config,
    pub window: &'a TimeWindow,
    pub scale: Scale,
    pub step: usize,
    pub bucket: &'a str,
}

/// Sweeps every distinct channel of `device` for every unit.
///
/// Repeated channel numbers within the device are skipped; the first
/// occurrence wins.
pub fn sweep_device<S, K>(
    source: &mut S,
    sink: &mut K,
    device: &Device,
    ctx: &SweepContext<'_>,
) -> Result<SweepStats, PipelineError>
where
    S: MeterSource + ?Sized,
    K: MetricSink + ?Sized,
{
    let mut stats = SweepStats::default();
    let device_config = ctx.config.device(&device.id);
    let label = ctx.config.device_label(&device.id);
    debug!("Collecting metrics for device {}", label);

    let mut seen: HashSet<&str> = HashSet::new();

    for channel in &device.channels {
        if !seen.insert(channel.channel_num.as_str()) {
            stats.duplicates += 1;
            continue;
        }
        stats.channels += 1;

        let channel_name = friendly_channel_name(device_config, &channel.channel_num);
        debug!(
            "Collecting metrics for channel {}",
            channel_name.unwrap_or(&channel.channel_num)
        );

        let builder = PointBuilder::new(&label, &channel.channel_num)
            .channel_name(channel_name)
            .global_tags(&ctx.config.influx.tags)
            .device_tags(device_config.map(|d| &d.tags));

        for unit in Unit::ALL {
            let usage = source.usage(
                channel,
                ctx.window.start(),
                ctx.window.end(),
                ctx.scale,
                unit,
            )?;
            debug!(
                "Got {} {} usage samples for channel {}",
                usage.samples.len(),
                unit,
                channel.channel_num
            );

            for bucket in resample(&usage.samples, ctx.step) {
                match builder.build(unit, bucket, usage.first_timestamp, ctx.scale, ctx.window) {
                    Some(point) => {
                        sink.write(ctx.bucket, point)?;
                        stats.points += 1;
                    }
                    None => stats.late += 1,
                }
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::source::MockSource;
    use chrono::{Duration, TimeZone, Utc};

    fn config(json: &str) -> Config {
        Config::from_json(json).unwrap()
    }

    fn window() -> TimeWindow {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        TimeWindow::initial(end, Duration::seconds(300))
    }

    #[test]
    fn aggregate_channel_is_all() {
        let cfg = config(r#"{"vue": {"devices": {"1": {"channels": ["Kitchen"]}}}}"#);
        assert_eq!(friendly_channel_name(cfg.device("1"), "1,2,3"), Some("All"));
        assert_eq!(friendly_channel_name(None, "1,2,3"), Some("All"));
    }

    #[test]
    fn channel_names_by_index() {
        let cfg = config(r#"{"vue": {"devices": {"1": {"channels": ["Kitchen", null, "Dryer"]}}}}"#);
        let device = cfg.device("1");

        assert_eq!(friendly_channel_name(device, "1"), Some("Kitchen"));
        assert_eq!(friendly_channel_name(device, "2"), None);
        assert_eq!(friendly_channel_name(device, "3"), Some("Dryer"));
        assert_eq!(friendly_channel_name(device, "4"), None);
        assert_eq!(friendly_channel_name(device, "0"), None);
        assert_eq!(friendly_channel_name(device, "Balance"), None);
        assert_eq!(friendly_channel_name(None, "1"), None);
    }

    #[test]
    fn minute_scenario_end_to_end() {
        let cfg = config(
            r#"{
                "vue": {"devices": {"7": {"custom-id": "house", "channels": ["Oven"], "tags": {"site": "home"}}}},
                "influx": {"tags": {"source": "vue"}}
            }"#,
        );
        let w = window();
        let mut source = MockSource::new();
        source.add_device("7", &["1"]);
        source.set_samples(
            "7",
            "1",
            Unit::Energy,
            vec![Some(10.0), None, Some(20.0), Some(30.0), None],
        );
        let mut sink = MemorySink::new();
        let devices = source.devices().unwrap();

        let ctx = SweepContext {
            config: &cfg,
            window: &w,
            scale: Scale::Minute,
            step: 1,
            bucket: "energy",
        };
        let stats = sweep_device(&mut source, &mut sink, &devices[0], &ctx).unwrap();

        assert_eq!(stats.points, 3);
        let values: Vec<f64> = sink.points().iter().map(|(_, p)| p.value).collect();
        assert_eq!(values, vec![600_000.0, 1_200_000.0, 1_800_000.0]);

        let offsets: Vec<i64> = sink
            .points()
            .iter()
            .map(|(_, p)| (p.timestamp - w.start()).num_minutes())
            .collect();
        assert_eq!(offsets, vec![0, 2, 3]);

        let (bucket, first) = &sink.points()[0];
        assert_eq!(bucket, "energy");
        assert_eq!(first.tag("device"), Some("house"));
        assert_eq!(first.tag("channel_name"), Some("Oven"));
        assert_eq!(first.tag("site"), Some("home"));
        assert_eq!(first.tag("source"), Some("vue"));

        // Both units were requested even though charge had no data
        assert_eq!(source.calls().len(), 2);
        assert_eq!(source.calls()[1].unit, Unit::Charge);
    }

    #[test]
    fn duplicate_channels_swept_once() {
        let cfg = Config::default();
        let w = window();
        let mut source = MockSource::new();
        source.add_device("1", &["1,2,3", "1", "1,2,3", "1"]);
        source.set_samples("1", "1,2,3", Unit::Energy, vec![Some(1.0)]);
        let mut sink = MemorySink::new();
        let devices = source.devices().unwrap();

        let ctx = SweepContext {
            config: &cfg,
            window: &w,
            scale: Scale::Minute,
            step: 1,
            bucket: "b",
        };
        let stats = sweep_device(&mut source, &mut sink, &devices[0], &ctx).unwrap();

        assert_eq!(stats.channels, 2);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.points, 1);
        assert_eq!(source.calls().len(), 4);
        assert_eq!(sink.points()[0].1.tag("channel_name"), Some("All"));
    }

    #[test]
    fn late_buckets_are_counted_not_written() {
        let cfg = Config::default();
        let w = window();
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        // Mock usage starts at the window start, so offset 5 lands on its end
        source.set_samples("1", "1", Unit::Energy, vec![Some(1.0); 7]);
        let mut sink = MemorySink::new();
        let devices = source.devices().unwrap();

        let ctx = SweepContext {
            config: &cfg,
            window: &w,
            scale: Scale::Minute,
            step: 1,
            bucket: "b",
        };
        let stats = sweep_device(&mut source, &mut sink, &devices[0], &ctx).unwrap();

        // Offsets 0..=5 are within the window, 6 is past its end
        assert_eq!(stats.points, 6);
        assert_eq!(stats.late, 1);
        assert!(sink.points().iter().all(|(_, p)| p.timestamp <= w.end()));
    }

    #[test]
    fn sink_failure_propagates() {
        let cfg = Config::default();
        let w = window();
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.set_samples("1", "1", Unit::Energy, vec![Some(1.0), Some(2.0)]);
        let mut sink = MemorySink::new().fail_after(1);
        let devices = source.devices().unwrap();

        let ctx = SweepContext {
            config: &cfg,
            window: &w,
            scale: Scale::Minute,
            step: 1,
            bucket: "b",
        };
        let err = sweep_device(&mut source, &mut sink, &devices[0], &ctx).unwrap_err();

        assert!(matches!(err, PipelineError::Sink(_)));
        assert_eq!(sink.points().len(), 1);
    }
}
