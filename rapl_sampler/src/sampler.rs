use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};
use tokio_timerfd::Interval;

use crate::{
    counters::HardwareCounters,
    meter::EnergyMeter,
    sample::{PowerBreakdown, Sample},
};

// The RAPL MSRs update every ~1 ms, but the measurement period isn't exactly
// 1 ms, which means the sample periods are not exact. "Power Measurement
// Techniques on Standard Compute Nodes: A Quantitative Comparison" by
// Hackenberg et al. suggests that sampling rates above 20 Samples/s are
// unfeasible if the systematic error should be below 5%.
const MIN_ACCURATE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between two samples.
    pub interval: Duration,
    /// The csv file to create (or truncate).
    pub output: PathBuf,
    /// Stop after this number of samples. `None` means "until cancelled".
    pub max_samples: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    CancelRequested,
    Stopped,
}

/// What a finished sampling run has produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingReport {
    pub output: PathBuf,
    /// Number of rows written, excluding the header.
    pub samples: usize,
}

/// Samples the energy consumption in a background thread.
///
/// ## Usage
///
/// ```no_run
/// # use rapl_sampler::*;
/// # use std::time::Duration;
/// # fn main() -> anyhow::Result<()> {
/// let meter = EnergyMeter::open(&PowerFileReader::default())?;
/// let config = SamplerConfig {
///     interval: Duration::from_millis(100),
///     output: "power.csv".into(),
///     max_samples: None,
/// };
/// let mut sampler = SamplingController::new(config);
/// sampler.start(meter, Box::new(NoHardwareCounters))?;
/// // run the workload here
/// let report = sampler.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct SamplingController {
    config: SamplerConfig,
    state: SamplerState,
    cancel: Option<watch::Sender<bool>>,
    thread: Option<JoinHandle<Result<usize>>>,
}

impl SamplingController {
    pub fn new(config: SamplerConfig) -> SamplingController {
        SamplingController {
            config,
            state: SamplerState::Idle,
            cancel: None,
            thread: None,
        }
    }

    /// The current state. A sampling thread that has stopped by itself (sample limit or error)
    /// is reported as [`Stopped`](SamplerState::Stopped) right away, but [`join`](Self::join)
    /// is still needed to get its report or its error.
    pub fn state(&self) -> SamplerState {
        match self.state {
            SamplerState::Running | SamplerState::CancelRequested if self.is_finished() => SamplerState::Stopped,
            state => state,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Creates the output file, writes the csv header and starts the sampling thread,
    /// which takes ownership of the meter and of the counters.
    pub fn start(&mut self, meter: EnergyMeter, counters: Box<dyn HardwareCounters>) -> Result<()> {
        self.start_with(meter, move || Ok(counters))
    }

    /// Like [`start`](Self::start), but calls `open_counters` on the current thread
    /// after the sampling thread has been spawned.
    ///
    /// Counters that follow the calling thread and the tasks it creates afterwards,
    /// like [`PerfHardwareCounters`](crate::PerfHardwareCounters), then do not count
    /// the work of the sampling thread itself.
    pub fn start_with<F>(&mut self, meter: EnergyMeter, open_counters: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn HardwareCounters>>,
    {
        if self.state != SamplerState::Idle {
            bail!("the sampler has already been started");
        }
        let interval = self.config.interval;
        if interval.is_zero() {
            bail!("the sampling interval must not be zero");
        }
        if interval < MIN_ACCURATE_INTERVAL {
            warn!("sample intervals < 50 ms are likely to produce inaccurate estimates");
        }

        let path = &self.config.output;
        let file = File::create(path).with_context(|| format!("Failed to create {path:?}"))?;

        let (tx, rx) = watch::channel(false);
        let (setup_tx, setup_rx) = oneshot::channel::<(Box<dyn HardwareCounters>, BufWriter<File>)>();
        let max_samples = self.config.max_samples;
        let thread = thread::Builder::new()
            .name(String::from("rapl-sampler"))
            .spawn(move || {
                // the sender is dropped without sending if the counters cannot be opened
                let Ok((counters, writer)) = setup_rx.blocking_recv() else {
                    return Ok(0);
                };
                let sampling = SamplingLoop {
                    meter,
                    counters,
                    writer,
                    interval,
                    max_samples,
                    cancel: rx,
                };
                sampling.run()
            })
            .context("Failed to spawn the sampling thread")?;

        let setup = open_counters().and_then(|counters| {
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", Sample::csv_header(&counters.names()))?;
            writer.flush()?;
            Ok((counters, writer))
        });
        let sent = match setup {
            Ok(setup) => setup_tx
                .send(setup)
                .map_err(|_| anyhow!("the sampling thread has terminated before the start")),
            Err(e) => {
                drop(setup_tx);
                Err(e)
            }
        };
        if let Err(e) = sent {
            let _ = thread.join();
            return Err(e);
        }
        debug!("sampling every {interval:?} into {path:?}");

        self.cancel = Some(tx);
        self.thread = Some(thread);
        self.state = SamplerState::Running;
        Ok(())
    }

    /// Asks the sampling thread to stop. Does not wait for it, see [`join`](Self::join).
    ///
    /// Does nothing if the sampler is not running.
    pub fn cancel(&mut self) {
        if self.state == SamplerState::Running {
            if let Some(tx) = &self.cancel {
                tx.send_replace(true);
            }
            self.state = SamplerState::CancelRequested;
        }
    }

    /// Returns `true` if the sampling thread has terminated, or has never been started.
    /// Without cancellation, it terminates when the sample limit is reached or on error.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Waits for the sampling thread to terminate.
    ///
    /// Returns the error that has stopped the sampling, if any,
    /// and `None` if there is nothing to wait for (not started or already joined).
    pub fn join(&mut self) -> Result<Option<SamplingReport>> {
        let Some(thread) = self.thread.take() else {
            return Ok(None);
        };
        let result = thread.join();
        self.cancel = None;
        self.state = SamplerState::Stopped;

        let samples = result.map_err(|_| anyhow!("the sampling thread has panicked"))??;
        Ok(Some(SamplingReport {
            output: self.config.output.clone(),
            samples,
        }))
    }

    /// Cancels the sampling and waits for the thread to terminate.
    pub fn stop(&mut self) -> Result<Option<SamplingReport>> {
        self.cancel();
        self.join()
    }
}

impl Drop for SamplingController {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                error!("the sampler has failed: {e:#}");
            }
        }
    }
}

/// The state of the sampling thread.
struct SamplingLoop {
    meter: EnergyMeter,
    counters: Box<dyn HardwareCounters>,
    writer: BufWriter<File>,
    interval: Duration,
    max_samples: Option<usize>,
    cancel: watch::Receiver<bool>,
}

impl SamplingLoop {
    fn run(mut self) -> Result<usize> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build the runtime of the sampling thread")?;

        let result = rt.block_on(self.sample_until_cancelled());
        let result = result.and_then(|n| {
            self.writer.flush()?;
            Ok(n)
        });
        match &result {
            Ok(n) => info!("sampling stopped after {n} samples"),
            Err(e) => error!("sampling stopped: {e:#}"),
        }
        // the meter (with its counters) and the output file are closed here
        drop(self);
        result
    }

    async fn sample_until_cancelled(&mut self) -> Result<usize> {
        // Underneath, this uses a periodic timer from timerfd, which has a higher resolution than
        // std::time::sleep and tokio::time::sleep. The first tick happens after one interval.
        let mut interval = Interval::new_interval(self.interval)?;

        // forget what has been consumed since the counters have been opened
        self.meter.energy_estimates()?;
        let mut previous_counts = self.counters.read()?;

        let mut n_samples = 0;
        loop {
            if self.max_samples.is_some_and(|max| n_samples >= max) {
                break;
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => break,
                tick = interval.next() => match tick {
                    Some(res) => res.context("periodic timer failed")?,
                    None => break,
                },
            }
            // the cancellation may have arrived right when the timer fired
            if *self.cancel.borrow() {
                break;
            }

            let timestamp = OffsetDateTime::now_utc();
            let counts = self.counters.read()?;
            let counters = counts
                .iter()
                .zip(&previous_counts)
                .map(|(now, prev)| now.wrapping_sub(*prev))
                .collect();
            previous_counts = counts;

            let energy = self.meter.energy_estimates()?;
            energy.check_consistency()?;
            let sample = Sample {
                timestamp,
                counters,
                power: PowerBreakdown::from_energy(&energy, self.interval),
            };

            // format the entire row before writing anything
            let mut row = sample.csv_row()?;
            row.push('\n');
            self.writer.write_all(row.as_bytes())?;
            self.writer.flush()?;
            n_samples += 1;
        }
        Ok(n_samples)
    }
}

/// Completes when the cancellation is requested, or when the requester is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
