//! Error types for fixture and instrument operations.

use thiserror::Error;

/// Result type alias for sweep operations.
pub type Result<T> = std::result::Result<T, SweepError>;

/// Error types raised while driving the test fixture.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport could not be opened or the handshake failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Byte read from the controller is not a known opcode
    #[error("Protocol error: unknown order byte {byte}")]
    UnknownOrder {
        /// Raw byte received
        byte: u8,
    },

    /// Frame was truncated or otherwise malformed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Controller reported a fault through an ERROR frame
    #[error("Controller fault code {0}")]
    ControllerFault(i16),

    /// No acknowledgment arrived within the retry budget
    #[error("Communication timeout")]
    Timeout,

    /// Multimeter query or reply parsing failed
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Export could not be written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operator-supplied session metadata failed validation
    #[error("Invalid {field}: {reason}")]
    InvalidMetadata {
        /// Form field that failed
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Run was stopped by the operator or a fault
    #[error("Abort requested")]
    AbortRequested,
}

impl SweepError {
    /// Whether the error ends the run instead of being absorbed by a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SweepError::SerialPort(_)
                | SweepError::Connection(_)
                | SweepError::Storage(_)
                | SweepError::Config(_)
                | SweepError::InvalidMetadata { .. }
                | SweepError::AbortRequested
        )
    }
}

impl From<csv::Error> for SweepError {
    fn from(err: csv::Error) -> Self {
        SweepError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for SweepError {
    fn from(err: toml::de::Error) -> Self {
        SweepError::Config(err.to_string())
    }
}
