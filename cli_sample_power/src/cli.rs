use std::{fmt::Display, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use rapl_sampler::HardwareEvent;

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the RAPL PMU and its domains, then exit.
    Info,

    /// Sample the power consumption while running a workload.
    Run {
        /// Time between two samples, in milliseconds.
        #[arg(short, long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: u64,

        /// Stop sampling after this number of samples.
        #[arg(short = 'n', long)]
        samples: Option<usize>,

        /// The hardware counters to record next to the power (default: instructions, cpu-cycles, cache-misses, branch-misses).
        #[arg(short, long, value_delimiter = ',')]
        counters: Vec<HardwareEvent>,

        /// Do not record any hardware counter.
        #[arg(long, conflicts_with = "counters")]
        no_counters: bool,

        /// Sets the csv output file (default: power-<date>.csv).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The built-in workload to run, if no command is given.
        #[arg(short, long, value_enum, default_value_t = WorkloadType::Spin)]
        workload: WorkloadType,

        /// How long the built-in workload runs, in milliseconds.
        #[arg(short, long, default_value_t = 10_000)]
        duration_ms: u64,

        /// Command to run as the workload, after `--`.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum WorkloadType {
    /// CPU-bound arithmetic
    Spin,
    /// Do nothing, to check that the sampling works
    Sleep,
}

impl Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}

pub const DEFAULT_COUNTERS: [HardwareEvent; 4] = [
    HardwareEvent::Instructions,
    HardwareEvent::CpuCycles,
    HardwareEvent::CacheMisses,
    HardwareEvent::BranchMisses,
];
