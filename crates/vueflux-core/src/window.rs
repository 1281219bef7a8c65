//! Poll window and sampling scale.

use chrono::{DateTime, Duration, Utc};

/// Sampling granularity requested from the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scale {
    Second,
    Minute,
}

impl Scale {
    /// Minute scale for resolutions of a minute or more, second scale otherwise.
    pub fn for_resolution(resolution: u64) -> Self {
        if resolution >= 60 {
            Scale::Minute
        } else {
            Scale::Second
        }
    }

    /// Number of raw samples that make up one output bucket.
    pub fn step(self, resolution: u64) -> usize {
        match self {
            Scale::Minute => (resolution / 60) as usize,
            Scale::Second => resolution as usize,
        }
    }

    /// Duration of `n` scale units.
    pub fn offset(self, n: usize) -> Duration {
        match self {
            Scale::Minute => Duration::minutes(n as i64),
            Scale::Second => Duration::seconds(n as i64),
        }
    }
}

impl std::fmt::Display for Scale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scale::Second => f.write_str("second"),
            Scale::Minute => f.write_str("minute"),
        }
    }
}

/// Time range polled in one cycle.
///
/// Always exactly `interval` wide. Only replaced as a whole via [`TimeWindow::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// The first window: one interval of backfill ending at `now`.
    pub fn initial(now: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            start: now - interval,
            end: now,
        }
    }

    /// Like [`TimeWindow::initial`], but `None` when the window or its
    /// successor would leave the representable date range.
    pub fn checked_initial(now: DateTime<Utc>, interval: Duration) -> Option<Self> {
        now.checked_add_signed(interval)?;
        Some(Self {
            start: now.checked_sub_signed(interval)?,
            end: now,
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// The window following this one: starts at this window's end.
    pub fn next(&self, interval: Duration) -> Self {
        Self {
            start: self.end,
            end: self.end + interval,
        }
    }

    /// Whether a bucket timestamp is late, i.e. past the window's end.
    pub fn is_late(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp > self.end
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}
