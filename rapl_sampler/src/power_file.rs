// See https://github.com/torvalds/linux/commit/4788e5b4b2338f85fa42a712a182d8afd65d7c58
// for an explaination of the RAPL PMU driver and of the files it exposes.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{anyhow, Context, Result};
use regex::Regex;

/// Where the RAPL PMU describes itself.
pub const POWER_EVENT_SOURCE_PATH: &str = "/sys/bus/event_source/devices/power";

/// Reads the files that describe the RAPL PMU, one scalar per file.
#[derive(Debug, Clone)]
pub struct PowerFileReader {
    base: PathBuf,
}

impl Default for PowerFileReader {
    fn default() -> Self {
        PowerFileReader::new(POWER_EVENT_SOURCE_PATH)
    }
}

impl PowerFileReader {
    pub fn new(base: impl Into<PathBuf>) -> PowerFileReader {
        PowerFileReader { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Reads and parses the file `<base>/<relative>`.
    ///
    /// Returns `Ok(None)` if the file does not exist, which means that the
    /// corresponding event (or domain) is not supported by the running CPU.
    /// Any other problem is an error: the file exists, so its content must be valid.
    pub fn read_value<T: PowerFileValue>(&self, relative: &str) -> Result<Option<T>> {
        let path = self.base.join(relative);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
        };
        let value = T::parse_power_file(content.trim())
            .with_context(|| format!("Failed to parse {path:?}: '{}'", content.trim_end()))?;
        Ok(Some(value))
    }

    /// Like [`read_value`](Self::read_value), but the file must exist.
    pub fn require_value<T: PowerFileValue>(&self, relative: &str) -> Result<T> {
        self.read_value(relative)?
            .with_context(|| format!("Missing file {:?}", self.base.join(relative)))
    }
}

/// A scalar that can be parsed from a power file.
pub trait PowerFileValue: Sized {
    fn parse_power_file(content: &str) -> Result<Self>;
}

/// The event code to use as a "config" field for perf_event_open,
/// written as `event=0x02` in the sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCode(pub u64);

impl PowerFileValue for EventCode {
    fn parse_power_file(content: &str) -> Result<Self> {
        static EVENT_REGEX: OnceLock<Regex> = OnceLock::new();
        let re = EVENT_REGEX.get_or_init(|| Regex::new(r"^event=0x([0-9a-fA-F]+)(,|$)").expect("valid regex"));
        let hex = re
            .captures(content)
            .and_then(|c| c.get(1))
            .ok_or_else(|| anyhow!("expected 'event=0x<code>'"))?;
        let code = u64::from_str_radix(hex.as_str(), 16)?; // hexadecimal
        Ok(EventCode(code))
    }
}

/// The unit of an event, written as a single word (should be "Joules").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventUnit(pub String);

impl PowerFileValue for EventUnit {
    fn parse_power_file(content: &str) -> Result<Self> {
        let word = content.split_whitespace().next().ok_or_else(|| anyhow!("empty unit"))?;
        Ok(EventUnit(word.to_owned()))
    }
}

/// The scale to apply in order to get joules (`energy_j = count * scale`).
impl PowerFileValue for f64 {
    fn parse_power_file(content: &str) -> Result<Self> {
        Ok(content.parse()?)
    }
}

/// The type of the PMU, given to perf_event_open.
impl PowerFileValue for u32 {
    fn parse_power_file(content: &str) -> Result<Self> {
        Ok(content.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{EventCode, EventUnit, PowerFileReader};

    #[test]
    fn test_parse_real_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("events"))?;
        fs::write(dir.path().join("type"), "33\n")?;
        fs::write(dir.path().join("events/energy-pkg"), "event=0x02\n")?;
        fs::write(dir.path().join("events/energy-pkg.scale"), "2.3283064365386962890625e-10\n")?;
        fs::write(dir.path().join("events/energy-pkg.unit"), "Joules\n")?;

        let reader = PowerFileReader::new(dir.path());
        assert_eq!(reader.read_value::<u32>("type")?, Some(33));
        assert_eq!(reader.read_value::<EventCode>("events/energy-pkg")?, Some(EventCode(2)));
        assert_eq!(
            reader.read_value::<f64>("events/energy-pkg.scale")?,
            Some(2.3283064365386962890625e-10)
        );
        assert_eq!(
            reader.read_value::<EventUnit>("events/energy-pkg.unit")?,
            Some(EventUnit("Joules".to_owned()))
        );
        Ok(())
    }

    #[test]
    fn test_missing_file_is_unsupported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let reader = PowerFileReader::new(dir.path());
        assert_eq!(reader.read_value::<EventCode>("events/energy-gpu")?, None);
        assert!(reader.require_value::<u32>("type").is_err());
        Ok(())
    }

    #[test]
    fn test_malformed_file_names_the_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("type"), "power\n")?;
        let reader = PowerFileReader::new(dir.path());
        let err = reader.read_value::<u32>("type").unwrap_err();
        assert!(format!("{err:#}").contains("type"), "unexpected error: {err:#}");
        Ok(())
    }

    #[test]
    fn test_event_code_formats() {
        use super::PowerFileValue;
        assert_eq!(EventCode::parse_power_file("event=0x3b").unwrap(), EventCode(0x3b));
        assert_eq!(EventCode::parse_power_file("event=0x01,umask=0x2").unwrap(), EventCode(1));
        assert!(EventCode::parse_power_file("0x02").is_err());
        assert!(EventCode::parse_power_file("event=0xzz").is_err());
        assert!(EventUnit::parse_power_file("").is_err());
    }
}
