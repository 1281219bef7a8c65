//! InfluxDB v2 sink.
//!
//! Points are encoded as line protocol and buffered per bucket. A bucket's
//! buffer is sent when it reaches `batch-size` lines, when the flush deadline
//! (`flush-interval` plus up to `jitter-interval` after the first buffered
//! line) has passed at the next write, on `flush()`, and on drop.
//!
//! Failed sends are retried with exponential backoff while the error is
//! retryable; lines of a batch that still fails are dropped and the error is
//! returned to the caller.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::{MetricSink, SinkError};
use crate::config::ClientOptions;
use crate::point::MetricPoint;

/// Delivers one line-protocol body to a bucket.
pub trait WriteTransport {
    fn send(&self, bucket: &str, body: &str) -> Result<(), SinkError>;
}

/// HTTP transport for the InfluxDB v2 `/api/v2/write` endpoint.
pub struct HttpTransport {
    http: reqwest::blocking::Client,
    write_url: String,
    token: Option<String>,
    org: Option<String>,
}

impl HttpTransport {
    /// # Arguments
    /// * `url` - InfluxDB base URL, e.g. "http://localhost:8086"
    /// * `token` - API token sent as `Authorization: Token ...`
    /// * `org` - Organization name or id
    pub fn new(url: &str, token: Option<String>, org: Option<String>) -> Result<Self, SinkError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            write_url: format!("{}/api/v2/write", url.trim_end_matches('/')),
            token,
            org,
        })
    }
}

impl WriteTransport for HttpTransport {
    fn send(&self, bucket: &str, body: &str) -> Result<(), SinkError> {
        let mut query = vec![("bucket", bucket), ("precision", "s")];
        if let Some(org) = &self.org {
            query.push(("org", org.as_str()));
        }

        let mut request = self
            .http
            .post(&self.write_url)
            .query(&query)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.to_string());
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }

        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().unwrap_or_default();
            Err(SinkError::Status(status.as_u16(), body))
        }
    }
}

/// Backoff before retry number `attempt` (zero-based), without jitter.
///
/// `retry-interval * exponential-base ^ attempt`, capped at `max-retry-delay`.
pub fn backoff(options: &ClientOptions, attempt: u32) -> Duration {
    let factor = (options.exponential_base.max(1) as u64).saturating_pow(attempt);
    let ms = options
        .retry_interval
        .saturating_mul(factor)
        .min(options.max_retry_delay);
    Duration::from_millis(ms)
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::random_range(0..=max_ms))
    }
}

/// Batching, retrying InfluxDB writer.
pub struct InfluxSink<T: WriteTransport = HttpTransport> {
    transport: T,
    options: ClientOptions,
    buffers: BTreeMap<String, Vec<String>>,
    deadline: Option<Instant>,
    lines_sent: u64,
}

impl InfluxSink<HttpTransport> {
    /// Creates a sink writing over HTTP.
    pub fn connect(
        url: &str,
        token: Option<String>,
        org: Option<String>,
        options: ClientOptions,
    ) -> Result<Self, SinkError> {
        Ok(Self::with_transport(
            HttpTransport::new(url, token, org)?,
            options,
        ))
    }
}

impl<T: WriteTransport> InfluxSink<T> {
    pub fn with_transport(transport: T, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            buffers: BTreeMap::new(),
            deadline: None,
            lines_sent: 0,
        }
    }

    /// Total lines delivered so far.
    pub fn lines_sent(&self) -> u64 {
        self.lines_sent
    }

    /// Number of lines waiting in buffers.
    pub fn pending(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn flush_bucket(&mut self, bucket: &str) -> Result<(), SinkError> {
        let Some(lines) = self.buffers.remove(bucket) else {
            return Ok(());
        };
        if self.buffers.is_empty() {
            self.deadline = None;
        }
        if lines.is_empty() {
            return Ok(());
        }

        let body = lines.join("\n");
        self.send_with_retry(bucket, &body)?;
        self.lines_sent += lines.len() as u64;
        debug!("Wrote {} lines to bucket {}", lines.len(), bucket);
        Ok(())
    }

    fn send_with_retry(&self, bucket: &str, body: &str) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            match self.transport.send(bucket, body) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.options.max_retries => {
                    let delay = backoff(&self.options, attempt) + jitter(self.options.jitter_interval);
                    warn!(
                        "Write to {} failed ({}), retry {}/{} in {:?}",
                        bucket,
                        e,
                        attempt + 1,
                        self.options.max_retries,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush_all(&mut self) -> Result<(), SinkError> {
        let buckets: Vec<String> = self.buffers.keys().cloned().collect();
        let mut first_error = None;
        for bucket in buckets {
            if let Err(e) = self.flush_bucket(&bucket) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<T: WriteTransport> MetricSink for InfluxSink<T> {
    fn write(&mut self, bucket: &str, point: MetricPoint) -> Result<(), SinkError> {
        if self.deadline.is_none() {
            let wait = Duration::from_millis(self.options.flush_interval)
                + jitter(self.options.jitter_interval);
            self.deadline = Some(Instant::now() + wait);
        }

        let lines = self.buffers.entry(bucket.to_string()).or_default();
        lines.push(point.to_line_protocol());

        if lines.len() >= self.options.batch_size.max(1) {
            self.flush_bucket(bucket)?;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.flush_all()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flush_all()
    }
}

impl<T: WriteTransport> Drop for InfluxSink<T> {
    fn drop(&mut self) {
        if self.pending() > 0
            && let Err(e) = self.flush_all()
        {
            error!("Failed to flush pending points: {}", e);
        }
    }
}
