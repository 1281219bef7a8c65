//! In-memory sink for tests.

use super::{MetricSink, SinkError};
use crate::point::MetricPoint;

/// Collects every written point in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Vec<(String, MetricPoint)>,
    flushes: usize,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write after the first `n` fail with a 503.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Written `(bucket, point)` pairs.
    pub fn points(&self) -> &[(String, MetricPoint)] {
        &self.points
    }

    /// Number of `flush` calls.
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl MetricSink for MemorySink {
    fn write(&mut self, bucket: &str, point: MetricPoint) -> Result<(), SinkError> {
        if self.fail_after.is_some_and(|n| self.points.len() >= n) {
            return Err(SinkError::Status(503, "injected failure".to_string()));
        }
        self.points.push((bucket.to_string(), point));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }
}
