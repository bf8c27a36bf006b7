use anyhow::{anyhow, Context, Result};
use enum_map::EnumMap;
use log::info;

use crate::{domain::Domain, mkstring, power_file::PowerFileReader, Optionality, RaplDomain};

/// Reads the energy consumed by all the RAPL domains.
pub struct EnergyMeter {
    domains: EnumMap<RaplDomain, Domain>,
}

impl EnergyMeter {
    /// Discovers the RAPL PMU and opens one counter per supported domain.
    pub fn open(reader: &PowerFileReader) -> Result<EnergyMeter> {
        let pmu_type: u32 = reader
            .require_value("type")
            .context("Failed to retrieve the type of the RAPL PMU")?;

        let open = |kind: RaplDomain| Domain::open(reader, kind, pmu_type, kind.optionality());
        let package = open(RaplDomain::Package)?;
        let cores = open(RaplDomain::Cores)?;
        let gpu = open(RaplDomain::Gpu)?;
        let ram = open(RaplDomain::Ram)?;

        let meter = EnergyMeter::from_domains(package, cores, gpu, ram)?;
        info!(
            "RAPL domains (pmu type {pmu_type}): {}",
            mkstring(&meter.supported_domains(), ", ")
        );
        Ok(meter)
    }

    /// Assembles a meter from existing domains.
    /// The package and cores domains must be supported.
    pub fn from_domains(package: Domain, cores: Domain, gpu: Domain, ram: Domain) -> Result<EnergyMeter> {
        let domains: EnumMap<RaplDomain, Domain> = EnumMap::from_array([package, cores, gpu, ram]);
        for (kind, domain) in &domains {
            if domain.kind() != kind {
                return Err(anyhow!("domain '{}' given in place of '{kind}'", domain.kind()));
            }
            if !domain.is_supported() && kind.optionality() == Optionality::Mandatory {
                return Err(anyhow!("RAPL domain '{kind}' is mandatory but not supported"));
            }
        }
        Ok(EnergyMeter { domains })
    }

    pub fn domain(&self, kind: RaplDomain) -> &Domain {
        &self.domains[kind]
    }

    /// The domains that have an open counter.
    pub fn supported_domains(&self) -> Vec<RaplDomain> {
        self.domains
            .iter()
            .filter(|(_, d)| d.is_supported())
            .map(|(k, _)| k)
            .collect()
    }

    /// Returns the energy consumed by each domain since the previous call.
    ///
    /// The domains are read back-to-back, one after the other.
    pub fn energy_estimates(&mut self) -> Result<EnergyEstimates> {
        let mut joules = EnumMap::default();
        for (kind, domain) in &mut self.domains {
            joules[kind] = domain.energy_estimate()?;
        }
        Ok(EnergyEstimates { joules })
    }
}

/// The energy consumed by each RAPL domain during an interval, in Joules.
/// `None` means that the domain is not supported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyEstimates {
    pub joules: EnumMap<RaplDomain, Option<f64>>,
}

impl EnergyEstimates {
    pub fn get(&self, kind: RaplDomain) -> Option<f64> {
        self.joules[kind]
    }

    /// Checks that the package energy includes the energy of its sub-domains.
    /// An unsupported gpu counts as zero.
    pub fn check_consistency(&self) -> Result<()> {
        let package = self.get(RaplDomain::Package).context("no estimate for the package domain")?;
        let cores = self.get(RaplDomain::Cores).context("no estimate for the cores domain")?;
        let gpu = self.get(RaplDomain::Gpu).unwrap_or(0.0);
        if package < cores + gpu {
            return Err(anyhow!(
                "inconsistent RAPL measurements: pkg ({package} J) < cores ({cores} J) + gpu ({gpu} J)"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EnergyEstimates, EnergyMeter};
    use crate::{domain::tests::ScriptedCounter, Domain, RaplDomain};

    fn scripted(kind: RaplDomain, values: &[u64]) -> Domain {
        Domain::from_counter(kind, 1.0, Box::new(ScriptedCounter(values.to_vec())))
    }

    #[test]
    fn test_consistent_snapshots() -> anyhow::Result<()> {
        let mut meter = EnergyMeter::from_domains(
            scripted(RaplDomain::Package, &[0, 100, 250]),
            scripted(RaplDomain::Cores, &[0, 60, 120]),
            scripted(RaplDomain::Gpu, &[0, 40, 80]),
            Domain::unsupported(RaplDomain::Ram),
        )?;
        assert_eq!(meter.supported_domains(), vec![RaplDomain::Package, RaplDomain::Cores, RaplDomain::Gpu]);

        meter.energy_estimates()?; // first read, since the counters have been "opened"
        for (pkg, cores, gpu) in [(100.0, 60.0, 40.0), (150.0, 60.0, 40.0)] {
            let e = meter.energy_estimates()?;
            assert_eq!(e.get(RaplDomain::Package), Some(pkg));
            assert_eq!(e.get(RaplDomain::Cores), Some(cores));
            assert_eq!(e.get(RaplDomain::Gpu), Some(gpu));
            assert_eq!(e.get(RaplDomain::Ram), None);
            e.check_consistency()?;
        }
        Ok(())
    }

    #[test]
    fn test_violated_consistency() -> anyhow::Result<()> {
        let mut meter = EnergyMeter::from_domains(
            scripted(RaplDomain::Package, &[0, 100]),
            scripted(RaplDomain::Cores, &[0, 80]),
            scripted(RaplDomain::Gpu, &[0, 30]),
            scripted(RaplDomain::Ram, &[0, 10]),
        )?;
        meter.energy_estimates()?;
        let e = meter.energy_estimates()?;
        let err = e.check_consistency().unwrap_err();
        assert!(format!("{err}").contains("inconsistent"));
        Ok(())
    }

    #[test]
    fn test_unsupported_gpu_counts_as_zero() {
        let mut e = EnergyEstimates::default();
        e.joules[RaplDomain::Package] = Some(10.0);
        e.joules[RaplDomain::Cores] = Some(10.0);
        assert!(e.check_consistency().is_ok());

        e.joules[RaplDomain::Cores] = None;
        assert!(e.check_consistency().is_err());
    }

    #[test]
    fn test_mandatory_domains() {
        let missing_cores = EnergyMeter::from_domains(
            scripted(RaplDomain::Package, &[0]),
            Domain::unsupported(RaplDomain::Cores),
            Domain::unsupported(RaplDomain::Gpu),
            Domain::unsupported(RaplDomain::Ram),
        );
        assert!(missing_cores.is_err());

        let swapped = EnergyMeter::from_domains(
            scripted(RaplDomain::Cores, &[0]),
            scripted(RaplDomain::Package, &[0]),
            Domain::unsupported(RaplDomain::Gpu),
            Domain::unsupported(RaplDomain::Ram),
        );
        assert!(swapped.is_err());
    }
}
