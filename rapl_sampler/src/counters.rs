use std::fmt::Display;

use anyhow::{Context, Result};
use clap::ValueEnum;
use perf_event_open_sys::bindings as sys;

use crate::perf_event::{CounterScope, PerfCounter};

/// Hardware performance counters polled by the sampler, next to the RAPL domains.
pub trait HardwareCounters: Send {
    /// The names of the counters, used as column names.
    fn names(&self) -> Vec<String>;

    /// Returns the current, cumulative value of each counter, in the order of [`names`](Self::names).
    fn read(&mut self) -> Result<Vec<u64>>;
}

/// Tracks no counter at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardwareCounters;

impl HardwareCounters for NoHardwareCounters {
    fn names(&self) -> Vec<String> {
        Vec::new()
    }

    fn read(&mut self) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }
}

/// Generic hardware events of perf_event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HardwareEvent {
    Instructions,
    CpuCycles,
    CacheReferences,
    CacheMisses,
    BranchInstructions,
    BranchMisses,
}

impl HardwareEvent {
    pub const ALL: [HardwareEvent; 6] = [
        HardwareEvent::Instructions,
        HardwareEvent::CpuCycles,
        HardwareEvent::CacheReferences,
        HardwareEvent::CacheMisses,
        HardwareEvent::BranchInstructions,
        HardwareEvent::BranchMisses,
    ];

    fn config(&self) -> u64 {
        let id = match self {
            HardwareEvent::Instructions => sys::PERF_COUNT_HW_INSTRUCTIONS,
            HardwareEvent::CpuCycles => sys::PERF_COUNT_HW_CPU_CYCLES,
            HardwareEvent::CacheReferences => sys::PERF_COUNT_HW_CACHE_REFERENCES,
            HardwareEvent::CacheMisses => sys::PERF_COUNT_HW_CACHE_MISSES,
            HardwareEvent::BranchInstructions => sys::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            HardwareEvent::BranchMisses => sys::PERF_COUNT_HW_BRANCH_MISSES,
        };
        id as u64
    }
}

impl Display for HardwareEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            HardwareEvent::Instructions => "instructions",
            HardwareEvent::CpuCycles => "cpu-cycles",
            HardwareEvent::CacheReferences => "cache-references",
            HardwareEvent::CacheMisses => "cache-misses",
            HardwareEvent::BranchInstructions => "branch-instructions",
            HardwareEvent::BranchMisses => "branch-misses",
        };
        f.write_str(str)
    }
}

/// Hardware counters based on perf_event.
///
/// The counters observe the thread that opens them, and the tasks it spawns afterwards.
/// They can be read from any thread. Open them with
/// [`SamplingController::start_with`](crate::SamplingController::start_with) so that
/// the sampling thread is not one of these tasks.
pub struct PerfHardwareCounters {
    counters: Vec<(HardwareEvent, PerfCounter)>,
}

impl PerfHardwareCounters {
    pub fn open(events: &[HardwareEvent]) -> Result<PerfHardwareCounters> {
        let mut counters = Vec::with_capacity(events.len());
        for event in events {
            let mut attr = sys::perf_event_attr::default();
            attr.type_ = sys::PERF_TYPE_HARDWARE as u32;
            attr.config = event.config();
            attr.set_inherit(1);
            attr.set_exclude_kernel(1);
            attr.set_exclude_hv(1);
            let counter = PerfCounter::open(&mut attr, CounterScope::CallingThread)
                .with_context(|| format!("Failed to open hardware counter '{event}', is it supported by this CPU?"))?;
            counters.push((*event, counter));
        }
        Ok(PerfHardwareCounters { counters })
    }
}

impl HardwareCounters for PerfHardwareCounters {
    fn names(&self) -> Vec<String> {
        self.counters.iter().map(|(e, _)| e.to_string()).collect()
    }

    fn read(&mut self) -> Result<Vec<u64>> {
        self.counters
            .iter_mut()
            .map(|(event, counter)| counter.read_value().with_context(|| format!("hardware counter '{event}'")))
            .collect()
    }
}
