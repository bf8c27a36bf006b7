use anyhow::{anyhow, Context, Result};
use log::{debug, warn};

use crate::{
    perf_event::PerfCounter,
    power_file::{EventCode, EventUnit, PowerFileReader},
    RaplDomain,
};

/// Is a domain required to exist?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optionality {
    Mandatory,
    Optional,
}

/// A monotonic counter of RAPL "ticks".
pub trait TickCounter: Send {
    /// Returns the current, cumulative value of the counter.
    fn read_ticks(&mut self) -> Result<u64>;

    /// The value after which the counter wraps around.
    fn max_ticks(&self) -> u64 {
        u64::MAX
    }
}

/// One RAPL domain, like "pkg" or "cores".
pub struct Domain {
    kind: RaplDomain,
    /// `None` if the domain is not supported by the processor.
    counter: Option<OpenedCounter>,
}

struct OpenedCounter {
    handle: Box<dyn TickCounter>,
    /// How many Joules each tick of the counter represents.
    joules_per_tick: f64,
    /// The counter value seen by the previous call to `energy_estimate`.
    previous_ticks: u64,
}

impl Domain {
    /// Discovers the domain in the sysfs and opens its perf_event counter.
    ///
    /// A missing optional domain gives an unsupported `Domain`, a missing mandatory
    /// domain is an error. Every other problem is an error too, whatever the optionality.
    pub fn open(reader: &PowerFileReader, kind: RaplDomain, pmu_type: u32, optionality: Optionality) -> Result<Domain> {
        let name = kind.sysfs_name();
        let event_path = format!("events/energy-{name}");

        let Some(EventCode(code)) = reader.read_value::<EventCode>(&event_path)? else {
            return match optionality {
                Optionality::Optional => {
                    debug!("optional RAPL domain '{name}' is not supported");
                    Ok(Domain::unsupported(kind))
                }
                Optionality::Mandatory => Err(anyhow!(
                    "failed to open file for non-optional domain '{name}'\n\
                    - Is your kernel version 3.14 or later, as required? Run |uname -r| to see."
                )),
            };
        };

        let joules_per_tick: f64 = reader.require_value(&format!("{event_path}.scale"))?;
        let EventUnit(unit) = reader.require_value::<EventUnit>(&format!("{event_path}.unit"))?;
        if unit != "Joules" {
            return Err(anyhow!("unexpected unit '{unit}' for RAPL domain '{name}', expected 'Joules'"));
        }

        let counter = PerfCounter::open_rapl(pmu_type, code).with_context(|| {
            format!(
                "perf_event_open() failed for RAPL domain '{name}'\n\
                - Did you run as root (e.g. with |sudo|) or set\n  \
                /proc/sys/kernel/perf_event_paranoid to 0, as required?"
            )
        })?;
        debug!("opened RAPL domain '{name}': event=0x{code:x}, scale={joules_per_tick:e} J/tick");

        Ok(Domain::from_counter(kind, joules_per_tick, Box::new(counter)))
    }

    /// Creates a supported domain from an already opened counter.
    pub fn from_counter(kind: RaplDomain, joules_per_tick: f64, handle: Box<dyn TickCounter>) -> Domain {
        Domain {
            kind,
            counter: Some(OpenedCounter {
                handle,
                joules_per_tick,
                previous_ticks: 0,
            }),
        }
    }

    /// Creates a domain that is not supported by the processor.
    pub fn unsupported(kind: RaplDomain) -> Domain {
        Domain { kind, counter: None }
    }

    pub fn kind(&self) -> RaplDomain {
        self.kind
    }

    pub fn is_supported(&self) -> bool {
        self.counter.is_some()
    }

    pub fn joules_per_tick(&self) -> Option<f64> {
        self.counter.as_ref().map(|c| c.joules_per_tick)
    }

    /// Returns the energy consumed since the previous call, in Joules,
    /// or `None` if the domain is unsupported.
    ///
    /// Call this at a regular cadence: the first call returns the energy consumed
    /// since the counter has been opened.
    pub fn energy_estimate(&mut self) -> Result<Option<f64>> {
        let Some(c) = &mut self.counter else {
            return Ok(None);
        };
        let current = c
            .handle
            .read_ticks()
            .with_context(|| format!("failed to read the counter of RAPL domain '{}'", self.kind))?;
        let ticks = if current < c.previous_ticks {
            // one or more overflow have occured, we cannot know how many,
            // so we correct only one. Wrapping from max to 0 counts as one tick.
            warn!("the counter of RAPL domain '{}' has overflowed", self.kind);
            (c.handle.max_ticks() - c.previous_ticks).wrapping_add(current).wrapping_add(1)
        } else {
            current - c.previous_ticks
        };
        c.previous_ticks = current;
        Ok(Some(ticks as f64 * c.joules_per_tick))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, path::Path};

    use super::{Domain, Optionality, TickCounter};
    use crate::{PowerFileReader, RaplDomain};

    /// Returns a programmed sequence of cumulative values, then repeats the last one.
    pub(crate) struct ScriptedCounter(pub Vec<u64>);

    impl TickCounter for ScriptedCounter {
        fn read_ticks(&mut self) -> anyhow::Result<u64> {
            if self.0.len() > 1 {
                Ok(self.0.remove(0))
            } else {
                self.0.first().copied().ok_or_else(|| anyhow::anyhow!("broken counter"))
            }
        }
    }

    fn write_event(base: &Path, name: &str, event: &str, unit: &str) -> anyhow::Result<()> {
        let events = base.join("events");
        fs::create_dir_all(&events)?;
        fs::write(events.join(format!("energy-{name}")), event)?;
        fs::write(events.join(format!("energy-{name}.scale")), "2.3283064365386962890625e-10\n")?;
        fs::write(events.join(format!("energy-{name}.unit")), unit)?;
        Ok(())
    }

    #[test]
    fn test_deltas_are_additive() -> anyhow::Result<()> {
        let raw = vec![100, 350, 350, 1000, 4000];
        let mut domain = Domain::from_counter(RaplDomain::Package, 0.5, Box::new(ScriptedCounter(raw.clone())));

        // the first call gives the energy since the counter has been opened
        assert_eq!(domain.energy_estimate()?, Some(50.0));
        let mut sum = 0.0;
        for _ in 1..raw.len() {
            let joules = domain.energy_estimate()?.unwrap();
            assert!(joules >= 0.0);
            sum += joules;
        }
        assert_eq!(sum, (4000 - 100) as f64 * 0.5);
        Ok(())
    }

    #[test]
    fn test_overflow_is_corrected_once() -> anyhow::Result<()> {
        let mut domain = Domain::from_counter(
            RaplDomain::Cores,
            1.0,
            Box::new(ScriptedCounter(vec![u64::MAX - 10, 5])),
        );
        domain.energy_estimate()?;
        // MAX-10 ..= MAX is 10 ticks, then 0 ..= 5 is 6 more
        assert_eq!(domain.energy_estimate()?, Some(16.0));
        Ok(())
    }

    #[test]
    fn test_overflow_on_narrow_counter() -> anyhow::Result<()> {
        struct Narrow(ScriptedCounter);
        impl TickCounter for Narrow {
            fn read_ticks(&mut self) -> anyhow::Result<u64> {
                self.0.read_ticks()
            }
            fn max_ticks(&self) -> u64 {
                u32::MAX as u64
            }
        }
        let counter = Narrow(ScriptedCounter(vec![u32::MAX as u64 - 1, 0, 3]));
        let mut domain = Domain::from_counter(RaplDomain::Package, 1.0, Box::new(counter));
        domain.energy_estimate()?;
        assert_eq!(domain.energy_estimate()?, Some(2.0));
        assert_eq!(domain.energy_estimate()?, Some(3.0));
        Ok(())
    }

    #[test]
    fn test_unsupported_domain() -> anyhow::Result<()> {
        let mut domain = Domain::unsupported(RaplDomain::Gpu);
        assert!(!domain.is_supported());
        assert_eq!(domain.joules_per_tick(), None);
        assert_eq!(domain.energy_estimate()?, None);
        assert_eq!(domain.energy_estimate()?, None);
        Ok(())
    }

    #[test]
    fn test_read_failure_is_an_error() {
        let mut domain = Domain::from_counter(RaplDomain::Ram, 1.0, Box::new(ScriptedCounter(vec![])));
        assert!(domain.energy_estimate().is_err());
    }

    #[test]
    fn test_open_missing_domains() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("events"))?;
        let reader = PowerFileReader::new(dir.path());

        let gpu = Domain::open(&reader, RaplDomain::Gpu, 33, Optionality::Optional)?;
        assert!(!gpu.is_supported());

        let pkg = Domain::open(&reader, RaplDomain::Package, 33, Optionality::Mandatory);
        let err = pkg.err().expect("a missing mandatory domain should be an error");
        assert!(format!("{err}").contains("'pkg'"));
        Ok(())
    }

    #[test]
    fn test_open_rejects_bad_descriptions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_event(dir.path(), "ram", "event=0x03\n", "Watts\n")?;
        write_event(dir.path(), "gpu", "nonsense\n", "Joules\n")?;
        let reader = PowerFileReader::new(dir.path());

        // both are optional, but they exist: the problem must not be hidden
        let ram = Domain::open(&reader, RaplDomain::Ram, 33, Optionality::Optional);
        assert!(format!("{:#}", ram.err().unwrap()).contains("unexpected unit 'Watts'"));

        let gpu = Domain::open(&reader, RaplDomain::Gpu, 33, Optionality::Optional);
        assert!(format!("{:#}", gpu.err().unwrap()).contains("energy-gpu"));
        Ok(())
    }
}
