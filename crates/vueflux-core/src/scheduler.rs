//! Poll loop.
//!
//! `PollScheduler` owns the current [`TimeWindow`], the meter source and the
//! sink. Each cycle sweeps every polled device, flushes the sink, advances
//! the window by exactly one interval and sleeps until one second past the
//! new window start. A cycle that overruns is followed immediately by the
//! next one; missed cycles are never caught up.
//!
//! Stopping is cooperative: the [`StopSignal`] is checked at the top of each
//! cycle and before each device. A device that is being swept is always
//! finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::sink::{MetricSink, SinkError};
use crate::source::{Device, MeterSource, SourceError, dedup_devices};
use crate::sweep::{SweepContext, SweepStats, sweep_device};
use crate::window::{Scale, TimeWindow};

/// Granularity of the interruptible between-cycle sleep.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Seconds past the window start at which the next cycle begins.
const CYCLE_OFFSET_SECS: i64 = 1;

/// Error type for the poll loop.
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Source(SourceError),
    Sink(SinkError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::Source(e) => write!(f, "{}", e),
            PipelineError::Sink(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(e) => Some(e),
            PipelineError::Source(e) => Some(e),
            PipelineError::Sink(e) => Some(e),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        PipelineError::Source(e)
    }
}

impl From<SinkError> for PipelineError {
    fn from(e: SinkError) -> Self {
        PipelineError::Sink(e)
    }
}

/// Cooperative cancellation token shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests stop. Takes effect at the next check.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every device was swept and the window advanced.
    Completed(SweepStats),
    /// Stop was requested between devices; the window was not advanced.
    Stopped(SweepStats),
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cycles that swept every device.
    pub cycles: u64,
    pub points: u64,
}

/// Owns the poll window and drives the sweep.
pub struct PollScheduler<S, K, C> {
    config: Config,
    source: S,
    sink: K,
    clock: C,
    devices: Vec<Device>,
    bucket: String,
    interval: chrono::Duration,
    scale: Scale,
    step: usize,
    window: TimeWindow,
}

impl<S: MeterSource, K: MetricSink, C: Clock> PollScheduler<S, K, C> {
    /// Validates the config, discovers devices and opens the first window
    /// (one interval ending now).
    pub fn new(config: Config, mut source: S, sink: K, clock: C) -> Result<Self, PipelineError> {
        config.validate()?;
        let bucket = config.influx.require_bucket()?.to_string();

        let devices: Vec<Device> = dedup_devices(source.devices()?)
            .into_iter()
            .filter(|d| config.is_polled(&d.id))
            .collect();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        info!("Collecting metrics for devices: {:?}", ids);

        let interval_error = || {
            ConfigError::Invalid(format!(
                "metrics.interval ({}s) is out of range",
                config.metrics.interval
            ))
        };
        let interval = config
            .metrics
            .interval_duration()
            .ok_or_else(interval_error)?;
        let window =
            TimeWindow::checked_initial(clock.now(), interval).ok_or_else(interval_error)?;
        let scale = config.metrics.scale();
        let step = config.metrics.step();
        if config.metrics.step_truncated() {
            warn!(
                "Resolution {}s is not a whole number of minutes, using {} minute buckets",
                config.metrics.resolution, step
            );
        }
        debug!(
            "Poll interval {}s, resolution {}s ({} scale, step {})",
            config.metrics.interval, config.metrics.resolution, scale, step
        );

        Ok(Self {
            config,
            source,
            sink,
            clock,
            devices,
            bucket,
            interval,
            scale,
            step,
            window,
        })
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Sweeps every device for the current window.
    ///
    /// On completion the window advances by one interval. When stop is
    /// requested between devices the remaining devices are skipped and the
    /// window is left as is.
    pub fn run_cycle(&mut self, stop: &StopSignal) -> Result<CycleOutcome, PipelineError> {
        info!("Collecting metrics for time window {}", self.window);

        let ctx = SweepContext {
            config: &self.config,
            window: &self.window,
            scale: self.scale,
            step: self.step,
            bucket: &self.bucket,
        };

        let mut stats = SweepStats::default();
        let mut stopped = false;
        for device in &self.devices {
            if stop.is_stopped() {
                stopped = true;
                break;
            }
            stats += sweep_device(&mut self.source, &mut self.sink, device, &ctx)?;
        }

        self.sink.flush()?;
        info!(
            "Wrote {} points from {} channels ({} late buckets dropped)",
            stats.points, stats.channels, stats.late
        );

        if stopped {
            info!("Stop requested, skipping remaining devices");
            return Ok(CycleOutcome::Stopped(stats));
        }

        self.window = self.window.next(self.interval);
        Ok(CycleOutcome::Completed(stats))
    }

    /// Runs cycles until stop is requested.
    pub fn run(&mut self, stop: &StopSignal) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        while !stop.is_stopped() {
            match self.run_cycle(stop)? {
                CycleOutcome::Completed(stats) => {
                    summary.cycles += 1;
                    summary.points += stats.points as u64;
                }
                CycleOutcome::Stopped(stats) => {
                    summary.points += stats.points as u64;
                    break;
                }
            }
            self.sleep_until_next_cycle(stop);
        }

        info!(
            "Stopped after {} cycles, {} points written",
            summary.cycles, summary.points
        );
        Ok(summary)
    }

    /// Sleeps until one second past the current window start, waking early on
    /// stop. Returns immediately if that instant has passed.
    fn sleep_until_next_cycle(&self, stop: &StopSignal) {
        let target = self.window.start() + chrono::Duration::seconds(CYCLE_OFFSET_SECS);
        let Ok(mut remaining) = (target - self.clock.now()).to_std() else {
            debug!("Cycle overran, starting next cycle immediately");
            return;
        };

        info!("Sleeping for {:.3} seconds...", remaining.as_secs_f64());
        while remaining > Duration::ZERO && !stop.is_stopped() {
            let slice = remaining.min(SLEEP_SLICE);
            self.clock.sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::rates::Unit;
    use crate::sink::MemorySink;
    use crate::source::MockSource;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn config(interval: u64, resolution: u64) -> Config {
        let mut config = Config::from_json(r#"{"influx": {"bucket": "energy"}}"#).unwrap();
        config.metrics.interval = interval;
        config.metrics.resolution = resolution;
        config
    }

    /// Requests stop once `n` usage calls have been made.
    fn stop_after_fetches(source: &mut MockSource, stop: &StopSignal, n: usize) {
        let stop = stop.clone();
        let count = Arc::new(AtomicUsize::new(0));
        source.on_fetch(move |_, _| {
            if count.fetch_add(1, Ordering::SeqCst) + 1 >= n {
                stop.stop();
            }
        });
    }

    #[test]
    fn invalid_ratio_fails_before_polling() {
        let source = MockSource::new();
        let result = PollScheduler::new(
            config(100, 60),
            source,
            MemorySink::new(),
            MockClock::new(t0()),
        );

        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn missing_bucket_is_config_error() {
        let mut cfg = Config::default();
        cfg.metrics.interval = 60;
        let result = PollScheduler::new(cfg, MockSource::new(), MemorySink::new(), MockClock::new(t0()));

        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::Missing("influx.bucket")))
        ));
    }

    #[test]
    fn partial_minute_resolution_polls_with_truncated_step() {
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.set_samples("1", "1", Unit::Energy, vec![Some(1.0), Some(3.0), Some(5.0)]);
        let mut scheduler =
            PollScheduler::new(config(180, 90), source, MemorySink::new(), MockClock::new(t0()))
                .unwrap();

        scheduler.run_cycle(&StopSignal::new()).unwrap();

        assert_eq!(scheduler.source().calls()[0].scale, Scale::Minute);
        let values: Vec<f64> = scheduler.sink().points().iter().map(|(_, p)| p.value).collect();
        assert_eq!(values, vec![60_000.0, 180_000.0, 300_000.0]);
    }

    #[test]
    fn oversized_interval_is_config_error() {
        let result = PollScheduler::new(
            config(60_000_000_000_000_000, 60),
            MockSource::new(),
            MemorySink::new(),
            MockClock::new(t0()),
        );

        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn initial_window_is_one_interval_ending_now() {
        let scheduler = PollScheduler::new(
            config(300, 60),
            MockSource::new(),
            MemorySink::new(),
            MockClock::new(t0()),
        )
        .unwrap();

        assert_eq!(scheduler.window().end(), t0());
        assert_eq!(
            scheduler.window().start(),
            t0() - chrono::Duration::seconds(300)
        );
    }

    #[test]
    fn devices_filtered_and_deduplicated() {
        let mut cfg = config(60, 60);
        cfg.vue = Config::from_json(r#"{"vue": {"devices": {"1": {}, "3": {}}}}"#)
            .unwrap()
            .vue;

        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.add_device("2", &["1"]);
        source.add_device("1", &["2"]);
        source.add_device("3", &["1"]);

        let scheduler =
            PollScheduler::new(cfg, source, MemorySink::new(), MockClock::new(t0())).unwrap();
        let ids: Vec<&str> = scheduler.devices().iter().map(|d| d.id.as_str()).collect();

        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(scheduler.devices()[0].channels[0].channel_num, "1");
    }

    #[test]
    fn repeated_device_records_emit_one_set_of_points() {
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.add_device("1", &["1"]);
        source.set_samples("1", "1", Unit::Energy, vec![Some(1.0), Some(2.0)]);
        source.set_samples("1", "1", Unit::Charge, vec![Some(0.5)]);
        let mut scheduler =
            PollScheduler::new(config(60, 60), source, MemorySink::new(), MockClock::new(t0()))
                .unwrap();

        let outcome = scheduler.run_cycle(&StopSignal::new()).unwrap();

        let CycleOutcome::Completed(stats) = outcome else {
            panic!("cycle did not complete: {:?}", outcome);
        };
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.points, 3);
        assert_eq!(scheduler.source().calls().len(), 2);
        let points = scheduler.sink().points();
        assert_eq!(points.len(), 3);
        assert_eq!(points.iter().filter(|(_, p)| p.field == "watts").count(), 2);
        assert_eq!(points.iter().filter(|(_, p)| p.field == "amps").count(), 1);
    }

    #[test]
    fn cycle_requests_window_and_advances() {
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        let mut scheduler =
            PollScheduler::new(config(60, 60), source, MemorySink::new(), MockClock::new(t0()))
                .unwrap();
        let first = scheduler.window();

        let outcome = scheduler.run_cycle(&StopSignal::new()).unwrap();

        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        let calls = scheduler.source().calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.start == first.start() && c.end == first.end()));
        assert_eq!(calls[0].scale, Scale::Minute);
        assert_eq!(scheduler.window(), first.next(chrono::Duration::seconds(60)));
        assert_eq!(scheduler.sink().flushes(), 1);
    }

    #[test]
    fn second_scale_for_sub_minute_resolution() {
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.set_samples("1", "1", Unit::Energy, (0..10).map(|i| Some(i as f64)).collect());
        let mut scheduler =
            PollScheduler::new(config(10, 5), source, MemorySink::new(), MockClock::new(t0()))
                .unwrap();

        scheduler.run_cycle(&StopSignal::new()).unwrap();

        assert_eq!(scheduler.source().calls()[0].scale, Scale::Second);
        let points = scheduler.sink().points();
        assert_eq!(points.len(), 2);
        // mean(0..5) = 2 kWh/s, mean(5..10) = 7 kWh/s
        assert_eq!(points[0].1.value, 2.0 * 3_600_000.0);
        assert_eq!(points[1].1.value, 7.0 * 3_600_000.0);
        assert_eq!(
            points[1].1.timestamp - points[0].1.timestamp,
            chrono::Duration::seconds(5)
        );
    }

    #[test]
    fn window_advances_exactly_even_when_cycles_overrun() {
        let clock = MockClock::new(t0());
        let stop = StopSignal::new();
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);

        // Each fetch takes 90s, so every 60s cycle overruns
        let count = Arc::new(AtomicUsize::new(0));
        let hook_clock = clock.clone();
        let hook_stop = stop.clone();
        source.on_fetch(move |_, _| {
            hook_clock.advance(chrono::Duration::seconds(90));
            if count.fetch_add(1, Ordering::SeqCst) + 1 >= 8 {
                hook_stop.stop();
            }
        });

        let mut scheduler =
            PollScheduler::new(config(60, 60), source, MemorySink::new(), clock.clone()).unwrap();
        let first = scheduler.window();

        let summary = scheduler.run(&stop).unwrap();

        assert_eq!(summary.cycles, 4);
        let w = scheduler.window();
        assert_eq!(w.start(), first.start() + chrono::Duration::seconds(60 * 4));
        assert_eq!(w.end(), w.start() + chrono::Duration::seconds(60));
        // No sleeping and no catch-up
        assert_eq!(clock.total_slept(), Duration::ZERO);
        let starts: Vec<_> = scheduler.source().calls().iter().map(|c| c.start).collect();
        for (n, pair) in starts.chunks(2).enumerate() {
            assert_eq!(pair[0], first.start() + chrono::Duration::seconds(60 * n as i64));
        }
    }

    #[test]
    fn sleeps_until_one_second_past_next_start() {
        let clock = MockClock::new(t0());
        let stop = StopSignal::new();
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        stop_after_fetches(&mut source, &stop, 4);

        let mut scheduler =
            PollScheduler::new(config(60, 60), source, MemorySink::new(), clock.clone()).unwrap();
        let summary = scheduler.run(&stop).unwrap();

        // Cycle 1 ends at t0 and sleeps to t0+1s; cycle 2 raises stop, so the
        // following sleep is skipped.
        assert_eq!(summary.cycles, 2);
        assert_eq!(clock.total_slept(), Duration::from_secs(1));
        assert_eq!(scheduler.source().calls()[2].start, t0());
    }

    #[test]
    fn stop_between_devices_skips_the_rest() {
        let stop = StopSignal::new();
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.add_device("2", &["1"]);
        source.set_samples("1", "1", Unit::Energy, vec![Some(1.0)]);
        source.set_samples("2", "1", Unit::Energy, vec![Some(2.0)]);

        // Raised while device 1 is fetching its first unit
        stop_after_fetches(&mut source, &stop, 1);

        let mut scheduler =
            PollScheduler::new(config(60, 60), source, MemorySink::new(), MockClock::new(t0()))
                .unwrap();
        let first = scheduler.window();

        let summary = scheduler.run(&stop).unwrap();

        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.points, 1);
        // Device 1 finished both units, device 2 never fetched
        let calls = scheduler.source().calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.device_id == "1"));
        assert_eq!(scheduler.sink().points().len(), 1);
        assert_eq!(scheduler.sink().points()[0].1.tag("device"), Some("1"));
        assert_eq!(scheduler.sink().flushes(), 1);
        assert_eq!(scheduler.window(), first);
    }

    #[test]
    fn stop_before_start_runs_nothing() {
        let stop = StopSignal::new();
        stop.stop();
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        let mut scheduler =
            PollScheduler::new(config(60, 60), source, MemorySink::new(), MockClock::new(t0()))
                .unwrap();

        let summary = scheduler.run(&stop).unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(scheduler.source().calls().is_empty());
    }

    #[test]
    fn sink_error_ends_the_run() {
        let mut source = MockSource::new();
        source.add_device("1", &["1"]);
        source.set_samples("1", "1", Unit::Energy, vec![Some(1.0)]);
        let mut scheduler = PollScheduler::new(
            config(60, 60),
            source,
            MemorySink::new().fail_after(0),
            MockClock::new(t0()),
        )
        .unwrap();

        let err = scheduler.run(&StopSignal::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Sink(_)));
    }
}
