use anyhow::{anyhow, Context, Result};
use log::debug;
use perf_event_open_sys as sys;
use std::{
    fs::File,
    io::{self, Read},
    os::fd::FromRawFd,
};

use crate::domain::TickCounter;

/// Maximum value of a perf_event counter, used to correct overflows.
pub(crate) const PERF_MAX_ENERGY: u64 = u64::MAX;

/// Which tasks and cpus a counter observes.
/// Only some combination of (pid, cpu) are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterScope {
    /// `(-1, cpu)`: all processes, one cpu. This is what RAPL PMU events require.
    AllProcesses { cpu: u32 },
    /// `(0, -1)`: the calling thread (and the children it spawns later if `inherit` is set), any cpu.
    CallingThread,
}

impl CounterScope {
    fn pid_and_cpu(&self) -> (i32, i32) {
        match self {
            CounterScope::AllProcesses { cpu } => (-1, *cpu as i32),
            CounterScope::CallingThread => (0, -1),
        }
    }
}

/// An opened perf_event counter.
#[derive(Debug)]
pub struct PerfCounter {
    fd: File,
}

impl PerfCounter {
    /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
    /// with the given attribute.
    pub fn open(attr: &mut sys::bindings::perf_event_attr, scope: CounterScope) -> io::Result<PerfCounter> {
        let (pid, cpu) = scope.pid_and_cpu();
        attr.size = core::mem::size_of::<sys::bindings::perf_event_attr>() as u32;
        debug!("perf_event_open({attr:?}, pid={pid}, cpu={cpu})");

        let result = unsafe { sys::perf_event_open(attr, pid, cpu, -1, 0) };
        if result == -1 {
            Err(io::Error::last_os_error())
        } else {
            // SAFETY: the fd has just been returned by the kernel and nothing else owns it
            let fd = unsafe { File::from_raw_fd(result) };
            Ok(PerfCounter { fd })
        }
    }

    /// Opens a counter for a RAPL energy event, on all processes.
    ///
    /// # Arguments
    /// * `pmu_type` - The type of the RAPL PMU, read from the `type` file of the power event source.
    /// * `code` - The event code of the RAPL domain, read from `events/energy-<domain>`.
    pub fn open_rapl(pmu_type: u32, code: u64) -> io::Result<PerfCounter> {
        let mut attr = sys::bindings::perf_event_attr::default();
        attr.config = code;
        attr.type_ = pmu_type;
        // Measure all processes/threads. The specified CPU doesn't matter.
        PerfCounter::open(&mut attr, CounterScope::AllProcesses { cpu: 0 })
    }

    /// Reads the current value of the counter.
    pub fn read_value(&mut self) -> Result<u64> {
        read_perf_event(&mut self.fd).with_context(|| format!("failed to read perf_event {:?}", self.fd))
    }
}

impl TickCounter for PerfCounter {
    fn read_ticks(&mut self) -> Result<u64> {
        self.read_value()
    }

    fn max_ticks(&self) -> u64 {
        PERF_MAX_ENERGY
    }
}

fn read_perf_event(fd: &mut File) -> Result<u64> {
    let mut buf = [0u8; 8];
    // rewind() is INVALID for perf events, we must read "at the cursor" every time
    let n = fd.read(&mut buf)?;
    if n != buf.len() {
        return Err(anyhow!("short read: got {n} bytes instead of {}", buf.len()));
    }
    Ok(u64::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, Write};

    use super::read_perf_event;

    #[test]
    fn test_read_full_value() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(&123_456u64.to_ne_bytes())?;
        file.rewind()?;
        assert_eq!(read_perf_event(&mut file)?, 123_456);
        Ok(())
    }

    #[test]
    fn test_short_read_is_an_error() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(&[1, 2, 3, 4])?;
        file.rewind()?;
        let err = read_perf_event(&mut file).unwrap_err();
        assert!(format!("{err}").contains("short read: got 4 bytes"), "unexpected error: {err}");
        Ok(())
    }
}
