//! Repeated multimeter readings reduced to mean and standard error.

use crate::constants::{POLL_INTERVAL_MS, SAMPLES_PER_MEASUREMENT, SAMPLE_INTERVAL_MS};
use crate::instrument::VoltageReader;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

/// Mean and standard error over one sample window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    pub count: usize,
    /// `None` when no reading succeeded
    pub mean: Option<f64>,
    /// Sample standard deviation (n-1) over sqrt(n); `None` below two readings
    pub std_err: Option<f64>,
}

impl MeasurementSummary {
    pub fn from_readings(readings: &[f64]) -> Self {
        let count = readings.len();
        if count == 0 {
            return MeasurementSummary {
                count,
                mean: None,
                std_err: None,
            };
        }

        let n = count as f64;
        let mean = readings.iter().sum::<f64>() / n;
        let std_err = if count > 1 {
            let variance = readings.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            Some(variance.sqrt() / n.sqrt())
        } else {
            None
        };

        MeasurementSummary {
            count,
            mean: Some(mean),
            std_err,
        }
    }
}

/// Result of one measurement window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// At least one reading succeeded
    Complete(MeasurementSummary),
    /// Cancellation was observed before the window finished
    Cancelled,
    /// Every reading failed
    NoData,
}

/// Sleep for `duration` in `poll` sized slices.
///
/// Returns `false` as soon as `cancel` reports true.
pub fn wait_cancellable(duration: Duration, poll: Duration, cancel: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let slice = if poll.is_zero() { deadline - now } else { poll.min(deadline - now) };
        thread::sleep(slice);
    }
}

/// Collects a fixed number of readings with a delay between them
#[derive(Debug, Clone)]
pub struct Aggregator {
    pub samples: usize,
    pub interval: Duration,
    pub poll: Duration,
}

impl Default for Aggregator {
    fn default() -> Self {
        Aggregator {
            samples: SAMPLES_PER_MEASUREMENT,
            interval: Duration::from_millis(SAMPLE_INTERVAL_MS),
            poll: Duration::from_millis(POLL_INTERVAL_MS),
        }
    }
}

impl Aggregator {
    pub fn new(samples: usize, interval: Duration, poll: Duration) -> Self {
        Aggregator {
            samples,
            interval,
            poll,
        }
    }

    /// Take `samples` readings, reporting each good one through `on_reading`.
    ///
    /// Failed readings are dropped. The window yields `NoData` only when none
    /// succeeded.
    pub fn sample(
        &self,
        reader: &mut dyn VoltageReader,
        cancel: &dyn Fn() -> bool,
        on_reading: &mut dyn FnMut(f64),
    ) -> SampleOutcome {
        let mut readings = Vec::with_capacity(self.samples);

        for i in 0..self.samples {
            if cancel() {
                return SampleOutcome::Cancelled;
            }

            match reader.query_voltage() {
                Ok(volts) => {
                    readings.push(volts);
                    on_reading(volts);
                }
                Err(e) => log::warn!("Reading {}/{} failed: {}", i + 1, self.samples, e),
            }

            if i + 1 < self.samples && !wait_cancellable(self.interval, self.poll, cancel) {
                return SampleOutcome::Cancelled;
            }
        }

        if cancel() {
            return SampleOutcome::Cancelled;
        }

        if readings.is_empty() {
            SampleOutcome::NoData
        } else {
            SampleOutcome::Complete(MeasurementSummary::from_readings(&readings))
        }
    }
}
