use std::{fmt::Write, time::Duration};

use anyhow::Result;
use enum_map::EnumMap;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{meter::EnergyEstimates, RaplDomain};

/// Printed in place of the power of an unsupported domain.
pub const NOT_AVAILABLE: &str = "n/a";

/// The order of the power columns in the output.
const POWER_COLUMNS: [RaplDomain; 4] = [RaplDomain::Cores, RaplDomain::Gpu, RaplDomain::Package, RaplDomain::Ram];

/// Power consumed during one sampling interval, in Watts.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerBreakdown {
    /// `None` if the domain is not supported.
    pub watts: EnumMap<RaplDomain, Option<f64>>,
    /// The rest of the package: `pkg - cores - gpu`.
    pub other: f64,
    /// `pkg + ram`
    pub total: f64,
}

impl PowerBreakdown {
    /// Power = Energy / Time, where power is measured in Watts, Energy is measured
    /// in Joules, and Time is measured in seconds.
    pub fn from_energy(energy: &EnergyEstimates, interval: Duration) -> PowerBreakdown {
        let secs = interval.as_secs_f64();
        // unsupported domains count as zero in the composite values
        let joules = energy.joules.clone().map(|_, j| j.unwrap_or(0.0));
        let other = joules[RaplDomain::Package] - joules[RaplDomain::Cores] - joules[RaplDomain::Gpu];
        let total = joules[RaplDomain::Package] + joules[RaplDomain::Ram];
        PowerBreakdown {
            watts: energy.joules.clone().map(|_, j| j.map(|j| j / secs)),
            other: other / secs,
            total: total / secs,
        }
    }
}

/// One row of the output.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: OffsetDateTime,
    /// Hardware counters increments during the interval.
    pub counters: Vec<u64>,
    pub power: PowerBreakdown,
}

impl Sample {
    /// The header of the csv output, given the names of the hardware counters.
    pub fn csv_header(counter_names: &[String]) -> String {
        let mut header = String::from("timestamp");
        for name in counter_names {
            header.push(',');
            header.push_str(name);
        }
        for domain in POWER_COLUMNS {
            header.push_str(&format!(",{domain}-power"));
        }
        header.push_str(",other-power,total-power");
        header
    }

    /// Formats the entire row, without the line terminator.
    pub fn csv_row(&self) -> Result<String> {
        let mut row = self.timestamp.format(&Rfc3339)?;
        for c in &self.counters {
            write!(row, ",{c}")?;
        }
        for domain in POWER_COLUMNS {
            match self.power.watts[domain] {
                Some(w) => write!(row, ",{w:.2}")?,
                None => write!(row, ",{NOT_AVAILABLE}")?,
            }
        }
        write!(row, ",{:.2},{:.2}", self.power.other, self.power.total)?;
        Ok(row)
    }
}
