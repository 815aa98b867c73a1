//! List Endpoints Example
//!
//! Prints the serial ports on this machine and, optionally, checks that a
//! controller answers the handshake on one of them.
//!
//! Usage:
//!   cargo run --example list_endpoints                 # List ports only
//!   cargo run --example list_endpoints -- /dev/ttyACM0 # Also try a handshake

use log::{error, info};
use resistor_sweep::constants::{BAUD_RATE, HANDSHAKE_ATTEMPTS, HANDSHAKE_RETRY_DELAY_MS, TIMEOUT_MS};
use resistor_sweep::{Result, SerialLink};
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let ports = SerialLink::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        println!("{:<20} {:?}", port.port_name, port.port_type);
    }

    if let Some(port_name) = std::env::args().nth(1) {
        let mut link = SerialLink::open(&port_name, BAUD_RATE, Duration::from_millis(TIMEOUT_MS))?;
        link.set_debug_print(true, true);
        match link.handshake(HANDSHAKE_ATTEMPTS, Duration::from_millis(HANDSHAKE_RETRY_DELAY_MS)) {
            Ok(()) => info!("✓ Controller answered on {}", port_name),
            Err(e) => error!("✗ {}", e),
        }
    }
    Ok(())
}
