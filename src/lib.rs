//! # Resistor Sweep Library
//!
//! A Rust library for characterizing high-value resistors on a relay-multiplexed
//! high-voltage test fixture. A microcontroller drives the high-voltage DAC and
//! the relay bank over a framed serial link while a digital multimeter measures
//! the voltage across a pickoff resistor.
//!
//! ## Features
//!
//! - Framed order/acknowledgment protocol with bounded handshake and ack waits
//! - SCPI multimeter readings over serial or, with the `visa` feature, VISA,
//!   re-configured before every query
//! - Mean and standard error over repeated readings
//! - Nearest-edge resistance binning around a target value
//! - Sweep state machine with pause/resume, manual-voltage stages and safe abort
//! - CSV export with session metadata and a per-channel summary
//!
//! ## Example
//!
//! ```no_run
//! use resistor_sweep::{spawn_sweep, BinTable, ResultRecorder, Sequencer, SweepConfig, SweepEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SweepConfig::from_file("fixture.toml")?;
//!     let recorder = ResultRecorder::new(config.bin_table()?, None, Some("run.csv".into()));
//!     let handle = spawn_sweep(Sequencer::open(config, recorder)?)?;
//!     for event in handle.events() {
//!         if let SweepEvent::Measured { channel, resistance, .. } = event {
//!             println!("channel {}: {:.1} MOhm", channel.index(), resistance / 1e6);
//!         }
//!     }
//!     let report = handle.join()?;
//!     println!("{} rows recorded", report.rows.len());
//!     Ok(())
//! }
//! ```

pub mod binning;
pub mod config;
pub mod constants;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod protocol;
pub mod recorder;
pub mod sequencer;
pub mod types;

pub use binning::BinTable;
pub use config::{StagePlan, SweepConfig};
pub use error::{Result, SweepError};
pub use instrument::{open_transport, MeterMode, Multimeter, ScpiTransport, SerialScpi, VoltageReader};
#[cfg(feature = "visa")]
pub use instrument::VisaScpi;
pub use measurement::{Aggregator, MeasurementSummary, SampleOutcome};
pub use protocol::{Frame, Order, SerialLink, Transport};
pub use recorder::ResultRecorder;
pub use sequencer::{spawn_sweep, Sequencer, SweepControl, SweepHandle, SweepReport};
pub use types::*;
