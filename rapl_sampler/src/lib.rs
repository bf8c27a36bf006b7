use std::fmt::Display;

use enum_map::Enum;

pub mod counters;
pub mod domain;
pub mod meter;
pub mod perf_event;
pub mod power_file;
pub mod sample;
pub mod sampler;

pub use counters::{HardwareCounters, HardwareEvent, NoHardwareCounters, PerfHardwareCounters};
pub use domain::{Domain, Optionality, TickCounter};
pub use meter::{EnergyEstimates, EnergyMeter};
pub use power_file::PowerFileReader;
pub use sample::{PowerBreakdown, Sample};
pub use sampler::{SamplerConfig, SamplerState, SamplingController, SamplingReport};

/// The RAPL domains tracked by the [`EnergyMeter`].
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RaplDomain {
    /// entire socket
    Package,
    /// power plane 0: cores
    Cores,
    /// power plane 1: integrated gpu
    Gpu,
    /// DRAM
    Ram,
}

impl RaplDomain {
    /// All the domains, in the order in which the meter opens them.
    pub const ALL: [RaplDomain; 4] = [RaplDomain::Package, RaplDomain::Cores, RaplDomain::Gpu, RaplDomain::Ram];

    /// The name of the domain in the sysfs, as in `events/energy-<name>`.
    pub fn sysfs_name(&self) -> &'static str {
        match self {
            RaplDomain::Package => "pkg",
            RaplDomain::Cores => "cores",
            RaplDomain::Gpu => "gpu",
            RaplDomain::Ram => "ram",
        }
    }

    /// Package and cores are required to produce meaningful power values,
    /// the other domains may not exist on the running CPU.
    pub fn optionality(&self) -> Optionality {
        match self {
            RaplDomain::Package | RaplDomain::Cores => Optionality::Mandatory,
            RaplDomain::Gpu | RaplDomain::Ram => Optionality::Optional,
        }
    }
}

impl Display for RaplDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sysfs_name())
    }
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
pub fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}
