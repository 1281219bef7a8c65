//! Conversion of averaged usage quantities into instantaneous rates.
//!
//! The meter reports how much energy (kWh) or charge (Ah) flowed during one
//! scale unit. Multiplying by the number of scale units per hour yields the
//! hourly-equivalent rate; energy additionally goes from kWh to Wh.
//!
//! This module is the single source of truth for those multipliers.

use crate::window::Scale;

/// Measured quantity requested from the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    /// Energy in kilowatt-hours, converted to watts.
    Energy,
    /// Charge in amp-hours, converted to amps.
    Charge,
}

impl Unit {
    /// Every unit swept for each channel, in sweep order.
    pub const ALL: [Unit; 2] = [Unit::Energy, Unit::Charge];

    /// Name of the point field holding the converted rate.
    pub fn field_name(self) -> &'static str {
        match self {
            Unit::Energy => "watts",
            Unit::Charge => "amps",
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Multiplier turning a per-scale-unit average into a rate.
///
/// | unit   | scale  | multiplier |
/// |--------|--------|------------|
/// | energy | minute | 60 000     |
/// | energy | second | 3 600 000  |
/// | charge | minute | 60         |
/// | charge | second | 3 600      |
pub const fn rate_multiplier(unit: Unit, scale: Scale) -> f64 {
    match (unit, scale) {
        (Unit::Energy, Scale::Minute) => 60_000.0,
        (Unit::Energy, Scale::Second) => 3_600_000.0,
        (Unit::Charge, Scale::Minute) => 60.0,
        (Unit::Charge, Scale::Second) => 3_600.0,
    }
}

/// Converts an averaged usage value into watts (energy) or amps (charge).
pub fn to_rate(average: f64, unit: Unit, scale: Scale) -> f64 {
    average * rate_multiplier(unit, scale)
}
