//! Multimeter access over a message-based SCPI transport.
//!
//! The meter may silently drop its range and input impedance settings between
//! queries, so [`Multimeter::query_voltage`] re-sends its configuration before
//! every reading.

use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::time::Duration;

/// Anything that yields one DC voltage reading per call
pub trait VoltageReader {
    fn query_voltage(&mut self) -> Result<f64>;
}

/// Line-oriented SCPI transport
pub trait ScpiTransport: Send {
    /// Send a command that produces no reply
    fn write_line(&mut self, command: &str) -> Result<()>;

    /// Send a query and return the trimmed reply line
    fn query(&mut self, command: &str) -> Result<String>;
}

/// Measurement query issued for each reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeterMode {
    /// `MEAS:VOLT:DC?`, the meter configures and triggers itself
    #[default]
    MeasVoltDc,
    /// `READ?`, uses the configuration sent beforehand
    Read,
}

impl MeterMode {
    pub fn query(self) -> &'static str {
        match self {
            MeterMode::MeasVoltDc => "MEAS:VOLT:DC?",
            MeterMode::Read => "READ?",
        }
    }
}

/// Readings at or above this magnitude are the SCPI overload marker (9.9E37)
const OVERLOAD_THRESHOLD: f64 = 9.9e37;

/// SCPI over a serial line, newline terminated
pub struct SerialScpi {
    port: BufReader<Box<dyn SerialPort>>,
    port_name: String,
}

impl SerialScpi {
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| SweepError::Connection(format!("cannot open meter on {}: {}", port_name, e)))?;
        Ok(SerialScpi {
            port: BufReader::new(port),
            port_name: port_name.to_string(),
        })
    }
}

impl ScpiTransport for SerialScpi {
    fn write_line(&mut self, command: &str) -> Result<()> {
        log::debug!("{} <- {}", self.port_name, command);
        let port = self.port.get_mut();
        port.write_all(command.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write_line(command)?;
        let mut line = String::new();
        match self.port.read_line(&mut line) {
            Ok(0) => Err(SweepError::Instrument(format!("no reply to {}", command))),
            Ok(_) => {
                let reply = line.trim().to_string();
                log::debug!("{} -> {}", self.port_name, reply);
                Ok(reply)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                Err(SweepError::Instrument(format!("timed out waiting for reply to {}", command)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<T: ScpiTransport + ?Sized> ScpiTransport for Box<T> {
    fn write_line(&mut self, command: &str) -> Result<()> {
        (**self).write_line(command)
    }

    fn query(&mut self, command: &str) -> Result<String> {
        (**self).query(command)
    }
}

/// SCPI over a VISA session (USBTMC, GPIB, LXI)
///
/// Resource strings look like `USB0::0xF4EC::0x1208::SDM35HBQ7R1883::INSTR`.
#[cfg(feature = "visa")]
pub struct VisaScpi {
    session: BufReader<visa_rs::Instrument>,
    resource: String,
}

#[cfg(feature = "visa")]
impl VisaScpi {
    pub fn open(resource: &str, timeout: Duration) -> Result<Self> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let connection = |e: &dyn std::fmt::Display| {
            SweepError::Connection(format!("cannot open VISA resource {}: {}", resource, e))
        };
        let rm = DefaultRM::new().map_err(|e| connection(&e))?;
        let name = CString::new(resource).map_err(|e| connection(&e))?;
        let session = rm
            .open(&visa_rs::VisaString::from(name), AccessMode::NO_LOCK, timeout)
            .map_err(|e| connection(&e))?;
        log::debug!("VISA resource '{}' opened", resource);

        Ok(VisaScpi {
            session: BufReader::new(session),
            resource: resource.to_string(),
        })
    }
}

#[cfg(feature = "visa")]
impl ScpiTransport for VisaScpi {
    fn write_line(&mut self, command: &str) -> Result<()> {
        log::debug!("{} <- {}", self.resource, command);
        let session = self.session.get_mut();
        session.write_all(command.as_bytes())?;
        session.write_all(b"\n")?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write_line(command)?;
        let mut line = String::new();
        match self.session.read_line(&mut line) {
            Ok(0) => Err(SweepError::Instrument(format!("no reply to {}", command))),
            Ok(_) => {
                let reply = line.trim().to_string();
                log::debug!("{} -> {}", self.resource, reply);
                Ok(reply)
            }
            Err(e) => Err(SweepError::Instrument(format!("VISA read failed for {}: {}", command, e))),
        }
    }
}

/// VISA resource strings are `::`-separated (`USB0::...::INSTR`)
pub fn is_visa_resource(name: &str) -> bool {
    name.contains("::")
}

/// Open the meter transport named by `name`: a VISA resource or a serial port
pub fn open_transport(name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
    if is_visa_resource(name) {
        #[cfg(feature = "visa")]
        {
            return Ok(Box::new(VisaScpi::open(name, timeout)?));
        }
        #[cfg(not(feature = "visa"))]
        {
            return Err(SweepError::Config(format!(
                "{} is a VISA resource but VISA support is not enabled. Rebuild with --features visa",
                name
            )));
        }
    }
    Ok(Box::new(SerialScpi::open(name, baud_rate, timeout)?))
}

/// Digital multimeter measuring the pickoff voltage
pub struct Multimeter<T: ScpiTransport> {
    transport: T,
    mode: MeterMode,
    setup: Vec<String>,
}

impl<T: ScpiTransport> Multimeter<T> {
    pub fn new(transport: T, mode: MeterMode, setup: Vec<String>) -> Self {
        Multimeter {
            transport,
            mode,
            setup,
        }
    }

    /// Query the identification string
    pub fn identify(&mut self) -> Result<String> {
        self.transport.query("*IDN?")
    }

    /// Send range/impedance configuration
    pub fn configure(&mut self) -> Result<()> {
        for command in &self.setup {
            self.transport.write_line(command)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: ScpiTransport> VoltageReader for Multimeter<T> {
    fn query_voltage(&mut self) -> Result<f64> {
        self.configure()
            .map_err(|e| SweepError::Instrument(format!("configuration failed: {}", e)))?;

        let reply = self
            .transport
            .query(self.mode.query())
            .map_err(|e| match e {
                SweepError::Instrument(_) => e,
                other => SweepError::Instrument(other.to_string()),
            })?;

        parse_volts(&reply)
    }
}

/// Parse a decimal reply such as `-1.23456789E-02` into volts
pub fn parse_volts(reply: &str) -> Result<f64> {
    let value: f64 = reply
        .trim()
        .parse()
        .map_err(|_| SweepError::Instrument(format!("non-numeric reply {:?}", reply)))?;

    if !value.is_finite() || value.abs() >= OVERLOAD_THRESHOLD {
        return Err(SweepError::Instrument(format!("overload reply {:?}", reply)));
    }
    Ok(value)
}
