use std::{
    hint::black_box,
    process::Command,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use log::{debug, info};

/// How often the built-in workloads check whether they should stop early.
const CHECK_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    /// CPU-bound pseudo-random arithmetic, for the given duration.
    Spin(Duration),
    /// Sleep for the given duration.
    Sleep(Duration),
    /// Run an external program and wait for it.
    Command(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The built-in workload has been interrupted before its end.
    Interrupted,
}

/// Runs the workload on the calling thread.
///
/// The built-in workloads return early once `interrupted()` returns `true`.
/// External commands always run to completion.
pub fn run_workload(workload: &Workload, interrupted: impl Fn() -> bool) -> anyhow::Result<Outcome> {
    match workload {
        Workload::Spin(duration) => Ok(spin(*duration, interrupted)),
        Workload::Sleep(duration) => {
            let begin = Instant::now();
            while begin.elapsed() < *duration {
                if interrupted() {
                    return Ok(Outcome::Interrupted);
                }
                thread::sleep(CHECK_PERIOD.min(duration.saturating_sub(begin.elapsed())));
            }
            Ok(Outcome::Completed)
        }
        Workload::Command(args) => {
            let (program, args) = args.split_first().ok_or_else(|| anyhow!("empty workload command"))?;
            info!("running workload: {program} {}", args.join(" "));
            let status = Command::new(program)
                .args(args)
                .status()
                .with_context(|| format!("{program} should be executable"))?;
            if !status.success() {
                return Err(anyhow!("workload {program} has failed: {status}"));
            }
            Ok(Outcome::Completed)
        }
    }
}

fn spin(duration: Duration, interrupted: impl Fn() -> bool) -> Outcome {
    let begin = Instant::now();
    let mut last_check = begin;
    let mut state: u32 = 42;
    let mut acc: f64 = 0.0;
    let mut iterations: u64 = 0;
    loop {
        for _ in 0..10_000 {
            // xorshift, for a cheap unpredictable operand
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            acc = black_box((state % 100) as f64 * 34.6 + acc * 0.5);
        }
        iterations += 10_000;

        let now = Instant::now();
        if now.duration_since(begin) >= duration {
            debug!("spin workload: {iterations} iterations, acc={acc}");
            return Outcome::Completed;
        }
        if now.duration_since(last_check) >= CHECK_PERIOD {
            last_check = now;
            if interrupted() {
                return Outcome::Interrupted;
            }
        }
    }
}
