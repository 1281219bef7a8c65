//! vueflux-core — metering pipeline shared by the vueflux daemon.
//!
//! Provides:
//! - `config` — typed configuration loaded from the JSON config file
//! - `window` — the sliding poll window and sampling scale
//! - `resample` — bucket averaging of raw usage samples
//! - `rates` — energy/charge to watts/amps conversion
//! - `point` — tagged measurement points and line protocol encoding
//! - `sweep` — per-device channel/unit iteration
//! - `scheduler` — the poll loop, window advancement and stop handling
//! - `clock` — wall-clock abstraction (real and mock)
//! - `source` — meter data sources (Emporia Vue API, mock)
//! - `sink` — metric sinks (InfluxDB v2, in-memory)

pub mod clock;
pub mod config;
pub mod point;
pub mod rates;
pub mod resample;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod sweep;
pub mod window;

/// Crate version reported in logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
