//! Protocol, timing and fixture constants.
//!
//! This module defines the defaults used throughout the crate, including the
//! controller serial configuration, acknowledgment retry budgets, the DAC to
//! voltage scale and the resistance binning parameters.

/// Baud rate of the high-voltage/relay controller
pub const BAUD_RATE: u32 = 115_200;

/// Per-read timeout on the controller link in milliseconds
pub const TIMEOUT_MS: u64 = 500;

/// Number of HELLO attempts before the handshake gives up
pub const HANDSHAKE_ATTEMPTS: u32 = 5;

/// Delay between HELLO attempts
pub const HANDSHAKE_RETRY_DELAY_MS: u64 = 2000;

/// Number of read attempts while waiting for HV_UPDATED or READY_RELAY
pub const ACK_ATTEMPTS: u32 = 10;

/// Highest usable DAC index
pub const MAX_DAC_INDEX: u8 = 255;

/// Volts produced per DAC unit (2000 V / 255)
pub const VOLTS_PER_UNIT: f64 = 7.843;

/// Default DAC step, roughly 100 V
pub const DEFAULT_STAGE_STEP: u16 = 13;

/// Exclusive upper bound of the default DAC sweep
pub const DEFAULT_STAGE_END: u16 = 256;

/// Number of relay channels on the fixture
pub const NUM_RELAYS: u8 = 8;

/// Reference (pickoff) resistor in ohms
pub const PICKOFF_RESISTANCE: f64 = 1.47e6;

/// Nominal resistance of the devices under test in ohms
pub const TARGET_RESISTANCE: f64 = 5000e6;

/// Spacing between bin edges as a fraction of the target
pub const BIN_STEP: f64 = 0.002;

/// Half-width of the binned region as a fraction of the target
pub const BIN_RANGE: f64 = 0.01;

/// Readings averaged per measurement window
pub const SAMPLES_PER_MEASUREMENT: usize = 10;

/// Delay between multimeter readings
pub const SAMPLE_INTERVAL_MS: u64 = 500;

/// Granularity of every cancellable wait
pub const POLL_INTERVAL_MS: u64 = 100;

/// Elapsed time between automatic pauses
pub const PAUSE_INTERVAL_SECS: u64 = 1000;

/// Time spent with all relays open during an automatic pause
pub const PAUSE_HOLD_SECS: u64 = 30;

/// Settling time after HV_SET(0) during shutdown
pub const SHUTDOWN_SETTLE_MS: u64 = 2000;

/// Delay between OPEN_RELAYS orders during shutdown
pub const SHUTDOWN_RELAY_DELAY_MS: u64 = 100;

/// Multimeter reply timeout in milliseconds
pub const INSTRUMENT_TIMEOUT_MS: u64 = 5000;

/// Baud rate used when the multimeter is reached over a serial line
pub const INSTRUMENT_BAUD_RATE: u32 = 9600;
