//! Metric sinks.
//!
//! The `MetricSink` trait receives finished points for a named storage
//! bucket. Batching, flushing and retries are the sink's business; the
//! pipeline only calls `write` per point and `flush` at the end of a sweep.

pub mod influx;
pub mod memory;

pub use influx::InfluxSink;
pub use memory::MemorySink;

use crate::point::MetricPoint;

/// Error type for sink writes.
#[derive(Debug)]
pub enum SinkError {
    /// Request could not be sent.
    Http(String),
    /// Server rejected the write.
    Status(u16, String),
}

impl SinkError {
    /// Whether the write may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Http(_) => true,
            SinkError::Status(code, _) => *code == 429 || *code >= 500,
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Http(msg) => write!(f, "write request failed: {}", msg),
            SinkError::Status(code, body) => write!(f, "write rejected with {}: {}", code, body),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Http(e.to_string())
    }
}

/// Destination for measurement points.
pub trait MetricSink {
    /// Accepts one point for `bucket`. May buffer it.
    fn write(&mut self, bucket: &str, point: MetricPoint) -> Result<(), SinkError>;

    /// Delivers everything buffered so far.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
