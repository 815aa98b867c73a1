use crate::error::{Result, SweepError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// DAC index applied to the high-voltage stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VoltageStage(pub u8);

impl VoltageStage {
    pub fn index(self) -> u8 {
        self.0
    }

    /// Physical output voltage for this stage
    pub fn volts(self, volts_per_unit: f64) -> f64 {
        self.0 as f64 * volts_per_unit
    }
}

/// Relay channel, zero based. The controller keeps at most one closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelayChannel(pub u8);

impl RelayChannel {
    pub fn index(self) -> u8 {
        self.0
    }
}

/// A single multimeter sample and where it was taken
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub stage: VoltageStage,
    pub channel: RelayChannel,
    pub volts: f64,
}

/// Current and resistance derived from one averaged measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedPoint {
    pub applied_voltage: f64,
    pub measured_voltage: f64,
    pub current: f64,
    /// `+inf` when no current flows
    pub resistance: f64,
}

impl DerivedPoint {
    /// `current = measured / pickoff`, `resistance = (applied - measured) / current`
    pub fn compute(applied_voltage: f64, measured_voltage: f64, pickoff_resistance: f64) -> Self {
        let current = measured_voltage / pickoff_resistance;
        let resistance = if current == 0.0 {
            f64::INFINITY
        } else {
            (applied_voltage - measured_voltage) / current
        };
        DerivedPoint {
            applied_voltage,
            measured_voltage,
            current,
            resistance,
        }
    }

    pub fn resistance_mohm(&self) -> f64 {
        self.resistance / 1e6
    }
}

/// One recorded measurement row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestRow {
    pub stage: VoltageStage,
    pub channel: RelayChannel,
    pub avg_voltage: f64,
    pub std_err: Option<f64>,
    pub applied_voltage: f64,
    pub resistance: f64,
}

/// Raw operator input from the pre-test form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormInput {
    pub operator: String,
    pub test_number: String,
    pub stand_number: String,
    pub board_number: String,
    pub calibration_channel: String,
    pub calibration_value: String,
    pub temperature: String,
}

/// Validated run metadata written at the top of the export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub operator: String,
    pub test_number: u32,
    pub stand_number: u32,
    pub board_number: u32,
    /// -1 when no calibration resistor is fitted
    pub calibration_channel: i32,
    pub calibration_value_gohm: f64,
    pub temperature_c: f64,
    pub started_at: DateTime<Utc>,
}

impl SessionMetadata {
    /// Validate the pre-test form, stamping the run with the current time
    pub fn from_form(form: &FormInput) -> Result<Self> {
        let operator = form.operator.trim();
        if operator.is_empty() {
            return Err(SweepError::InvalidMetadata {
                field: "operator",
                reason: "name cannot be empty".to_string(),
            });
        }

        Ok(SessionMetadata {
            operator: operator.to_string(),
            test_number: parse_field("test number", &form.test_number)?,
            stand_number: parse_field("stand number", &form.stand_number)?,
            board_number: parse_field("board number", &form.board_number)?,
            calibration_channel: parse_field("calibration channel", &form.calibration_channel)?,
            calibration_value_gohm: parse_field("calibration value", &form.calibration_value)?,
            temperature_c: parse_field("temperature", &form.temperature)?,
            started_at: Utc::now(),
        })
    }

    /// Timestamp-derived identifier used in export file names
    pub fn run_id(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M%S").to_string()
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| SweepError::InvalidMetadata {
        field,
        reason: format!("{:?} is not a valid number", raw),
    })
}

/// Final per-channel result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: RelayChannel,
    pub samples: usize,
    /// `None` when the channel produced no finite resistance
    pub mean_resistance: Option<f64>,
    pub bin: Option<char>,
}

impl ChannelSummary {
    pub fn mean_resistance_mohm(&self) -> Option<f64> {
        self.mean_resistance.map(|r| r / 1e6)
    }
}

/// States of the sweep sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    Idle,
    Connecting,
    SettingVoltage,
    AwaitingVoltageAck,
    AwaitingManualVoltage,
    SelectingChannel,
    AwaitingChannelAck,
    Measuring,
    Recording,
    Paused,
    Finalizing,
    Aborting,
    Stopped,
}

/// Why the sweep entered `Paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    Operator,
    Scheduled,
}

/// Progress events published by the sequencer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SweepEvent {
    StateChanged(SweepState),
    StageStarted {
        stage: VoltageStage,
        applied_voltage: f64,
    },
    ChannelSelected(RelayChannel),
    LiveReading(Reading),
    Measured {
        stage: VoltageStage,
        channel: RelayChannel,
        avg_voltage: f64,
        std_err: Option<f64>,
        applied_voltage: f64,
        current: f64,
        resistance: f64,
    },
    ChannelFailed {
        stage: VoltageStage,
        channel: RelayChannel,
    },
    /// An absorbed fault; the sweep carries on
    Warning(String),
    Paused(PauseReason),
    Resumed,
    /// The export could not be written; the in-memory record is intact
    StorageFailed(String),
    Completed(Vec<ChannelSummary>),
    Aborted,
    /// A fatal fault; the run is over
    Failed(String),
}
