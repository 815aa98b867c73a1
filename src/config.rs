//! Sweep configuration, loadable from TOML.
//!
//! Every field has a default taken from [`crate::constants`], so a config
//! file only needs to name what differs from the standard fixture.

use crate::binning::BinTable;
use crate::constants::*;
use crate::error::{Result, SweepError};
use crate::instrument::MeterMode;
use crate::measurement::Aggregator;
use crate::types::VoltageStage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which DAC indices the sweep visits, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePlan {
    /// `start..end` stepping by `step`
    Stepped { start: u16, end: u16, step: u16 },
    /// `stages` evenly spaced indices between `low_voltage` and `hv_limit`
    Linear {
        hv_limit: f64,
        low_voltage: f64,
        stages: u16,
    },
    /// The operator sets each listed stage by hand
    Manual { stages: Vec<u8> },
}

impl Default for StagePlan {
    fn default() -> Self {
        StagePlan::Stepped {
            start: 0,
            end: DEFAULT_STAGE_END,
            step: DEFAULT_STAGE_STEP,
        }
    }
}

impl StagePlan {
    /// Expand the plan into DAC indices, clamped to the DAC range
    pub fn stages(&self, volts_per_unit: f64) -> Vec<VoltageStage> {
        let indices: Vec<u16> = match self {
            StagePlan::Stepped { start, end, step } => {
                (*start..*end).step_by((*step).max(1) as usize).collect()
            }
            StagePlan::Linear {
                hv_limit,
                low_voltage,
                stages,
            } => {
                let high = (hv_limit / volts_per_unit).floor().max(0.0) as u16;
                let low = (low_voltage / volts_per_unit).floor().max(0.0) as u16;
                let step = (high.saturating_sub(low) / (*stages).max(1)).max(1);
                (low..high).step_by(step as usize).collect()
            }
            StagePlan::Manual { stages } => stages.iter().map(|&s| s as u16).collect(),
        };

        indices
            .into_iter()
            .filter(|&i| i <= MAX_DAC_INDEX as u16)
            .map(|i| VoltageStage(i as u8))
            .collect()
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, StagePlan::Manual { .. })
    }
}

/// Everything the sequencer needs to know about the fixture and the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub controller_port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub handshake_attempts: u32,
    pub handshake_retry_ms: u64,
    pub ack_attempts: u32,

    /// Serial port name, or a VISA resource string such as `USB0::...::INSTR`
    pub meter_port: String,
    pub meter_baud_rate: u32,
    pub meter_timeout_ms: u64,
    pub meter_mode: MeterMode,
    /// Sent before every reading
    pub meter_setup: Vec<String>,

    pub num_relays: u8,
    pub samples: usize,
    pub sample_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Delay after each channel before the next relay switch
    pub channel_settle_ms: u64,
    /// `None` disables scheduled pauses
    pub pause_interval_secs: Option<u64>,
    pub pause_hold_secs: u64,
    pub shutdown_settle_ms: u64,
    pub shutdown_relay_delay_ms: u64,

    pub volts_per_unit: f64,
    pub pickoff_resistance: f64,
    pub target_resistance: f64,
    pub bin_step: f64,
    pub bin_range: f64,
    pub stages: StagePlan,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            controller_port: String::new(),
            baud_rate: BAUD_RATE,
            timeout_ms: TIMEOUT_MS,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            handshake_retry_ms: HANDSHAKE_RETRY_DELAY_MS,
            ack_attempts: ACK_ATTEMPTS,
            meter_port: String::new(),
            meter_baud_rate: INSTRUMENT_BAUD_RATE,
            meter_timeout_ms: INSTRUMENT_TIMEOUT_MS,
            meter_mode: MeterMode::default(),
            meter_setup: vec![
                "SENS:VOLT:DC:RANG AUTO".to_string(),
                "SENS:VOLT:DC:IMP 10G".to_string(),
            ],
            num_relays: NUM_RELAYS,
            samples: SAMPLES_PER_MEASUREMENT,
            sample_interval_ms: SAMPLE_INTERVAL_MS,
            poll_interval_ms: POLL_INTERVAL_MS,
            channel_settle_ms: 0,
            pause_interval_secs: Some(PAUSE_INTERVAL_SECS),
            pause_hold_secs: PAUSE_HOLD_SECS,
            shutdown_settle_ms: SHUTDOWN_SETTLE_MS,
            shutdown_relay_delay_ms: SHUTDOWN_RELAY_DELAY_MS,
            volts_per_unit: VOLTS_PER_UNIT,
            pickoff_resistance: PICKOFF_RESISTANCE,
            target_resistance: TARGET_RESISTANCE,
            bin_step: BIN_STEP,
            bin_range: BIN_RANGE,
            stages: StagePlan::default(),
        }
    }
}

impl SweepConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SweepConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SweepError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_relays == 0 {
            return Err(SweepError::Config("num_relays must be at least 1".to_string()));
        }
        if self.samples == 0 {
            return Err(SweepError::Config("samples must be at least 1".to_string()));
        }
        if self.handshake_attempts == 0 || self.ack_attempts == 0 {
            return Err(SweepError::Config("retry budgets must be at least 1".to_string()));
        }
        if !(self.pickoff_resistance.is_finite() && self.pickoff_resistance > 0.0) {
            return Err(SweepError::Config(format!(
                "pickoff_resistance must be positive, got {}",
                self.pickoff_resistance
            )));
        }
        if !(self.volts_per_unit.is_finite() && self.volts_per_unit > 0.0) {
            return Err(SweepError::Config(format!(
                "volts_per_unit must be positive, got {}",
                self.volts_per_unit
            )));
        }
        if self.stage_list().is_empty() {
            return Err(SweepError::Config("stage plan yields no stages".to_string()));
        }
        self.bin_table()?;
        Ok(())
    }

    pub fn stage_list(&self) -> Vec<VoltageStage> {
        self.stages.stages(self.volts_per_unit)
    }

    pub fn bin_table(&self) -> Result<BinTable> {
        BinTable::new(self.target_resistance, self.bin_step, self.bin_range)
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(
            self.samples,
            Duration::from_millis(self.sample_interval_ms),
            self.poll_interval(),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
