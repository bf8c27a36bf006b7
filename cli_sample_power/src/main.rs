use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use cli::{Cli, Commands, WorkloadType, DEFAULT_COUNTERS};
use rapl_sampler::{
    mkstring,
    power_file::{EventCode, EventUnit},
    EnergyMeter, HardwareCounters, NoHardwareCounters, PerfHardwareCounters, PowerFileReader, RaplDomain,
    SamplerConfig, SamplingController,
};
use workload::{Outcome, Workload};

mod cli;
mod workload;

fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();
    let reader = PowerFileReader::default();

    // run the command
    match cli.command {
        Commands::Info => print_info(&reader)?,
        Commands::Run {
            interval_ms,
            samples,
            counters,
            no_counters,
            output,
            workload,
            duration_ms,
            command,
        } => {
            // zero is rejected by the argument parser
            let interval = Duration::from_millis(interval_ms);

            let output = match output {
                Some(path) => path,
                None => {
                    let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                    PathBuf::from(format!("power-{now}.csv"))
                }
            };

            let duration = Duration::from_millis(duration_ms);
            let workload = if !command.is_empty() {
                Workload::Command(command)
            } else {
                match workload {
                    WorkloadType::Spin => Workload::Spin(duration),
                    WorkloadType::Sleep => Workload::Sleep(duration),
                }
            };

            let meter = EnergyMeter::open(&reader)?;
            let mut sampler = SamplingController::new(SamplerConfig {
                interval,
                output,
                max_samples: samples,
            });

            // The counters are opened on this thread, which runs the workload,
            // once the sampling thread exists: they do not count the sampling itself.
            sampler.start_with(meter, move || {
                let counters: Box<dyn HardwareCounters> = if no_counters {
                    Box::new(NoHardwareCounters)
                } else {
                    let events = if counters.is_empty() { DEFAULT_COUNTERS.to_vec() } else { counters };
                    info!("Hardware counters: {}", mkstring(&events, ", "));
                    Box::new(PerfHardwareCounters::open(&events)?)
                };
                Ok(counters)
            })?;

            // If the sampler stops by itself, there is no point in continuing the workload.
            let outcome = workload::run_workload(&workload, || sampler.is_finished());

            // Stop the sampler before anything else, even if the workload has failed.
            let report = sampler.stop()?;
            if outcome? == Outcome::Interrupted {
                warn!("The sampler has stopped before the end of the workload.");
            }
            if let Some(report) = report {
                info!("{} samples written to {:?}", report.samples, report.output);
            }
        }
    }

    Ok(())
}

fn print_info(reader: &PowerFileReader) -> anyhow::Result<()> {
    let pmu_type: u32 = reader.require_value("type")?;
    println!("RAPL PMU in {:?}, type {pmu_type}", reader.base());

    println!("\nRAPL domains:");
    for domain in RaplDomain::ALL {
        let event_path = format!("events/energy-{}", domain.sysfs_name());
        match reader.read_value::<EventCode>(&event_path)? {
            Some(EventCode(code)) => {
                let scale: f64 = reader.require_value(&format!("{event_path}.scale"))?;
                let EventUnit(unit) = reader.require_value::<EventUnit>(&format!("{event_path}.unit"))?;
                println!("- {domain}: event=0x{code:02x}, scale={scale:e} {unit}/tick");
            }
            None => println!("- {domain}: not supported ({:?})", domain.optionality()),
        }
    }
    Ok(())
}
