//! Framed serial link to the high-voltage/relay controller.
//!
//! Every frame is a single order byte, optionally followed by a payload. The
//! controller answers with order bytes of its own (`HV_UPDATED`,
//! `READY_RELAY`, ...), so all waits are bounded retry loops over a transport
//! with a per-read timeout.

use crate::error::{Result, SweepError};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

/// Byte stream the link runs over. Serial ports and in-memory fakes both qualify.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Orders understood by the controller firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Order {
    Hello = 0,
    Motor = 1,
    Relay = 2,
    AlreadyConnected = 3,
    Error = 4,
    Received = 5,
    Stop = 6,
    HvSet = 7,
    ReadyRelay = 8,
    StartTest = 9,
    PauseTest = 10,
    DataUpdate = 11,
    HvUpdated = 12,
    OpenRelays = 13,
}

impl Order {
    /// Decode a raw opcode byte
    pub fn from_byte(byte: u8) -> Result<Self> {
        let order = match byte {
            0 => Order::Hello,
            1 => Order::Motor,
            2 => Order::Relay,
            3 => Order::AlreadyConnected,
            4 => Order::Error,
            5 => Order::Received,
            6 => Order::Stop,
            7 => Order::HvSet,
            8 => Order::ReadyRelay,
            9 => Order::StartTest,
            10 => Order::PauseTest,
            11 => Order::DataUpdate,
            12 => Order::HvUpdated,
            13 => Order::OpenRelays,
            _ => return Err(SweepError::UnknownOrder { byte }),
        };
        Ok(order)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Number of payload bytes that follow this order on the wire
    pub fn payload_len(self) -> usize {
        match self {
            Order::Motor | Order::Relay | Order::HvSet => 1,
            Order::Error => 2,
            _ => 0,
        }
    }
}

/// One order byte plus an optional unsigned payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub order: Order,
    pub payload: Option<u8>,
}

impl Frame {
    pub fn new(order: Order) -> Self {
        Frame { order, payload: None }
    }

    pub fn with_payload(order: Order, payload: u8) -> Self {
        Frame {
            order,
            payload: Some(payload),
        }
    }

    /// Wire representation, payload little-endian unsigned
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.order.as_byte()];
        if let Some(payload) = self.payload {
            bytes.extend_from_slice(&payload.to_le_bytes());
        }
        bytes
    }

    /// Parse a one- or two-byte frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [] => Err(SweepError::Protocol("empty frame".to_string())),
            [order] => Ok(Frame::new(Order::from_byte(*order)?)),
            [order, payload] => Ok(Frame::with_payload(Order::from_byte(*order)?, *payload)),
            _ => Err(SweepError::Protocol(format!(
                "frame too long: {} bytes",
                bytes.len()
            ))),
        }
    }
}

/// Serial link to the controller
pub struct SerialLink {
    port: Option<Box<dyn Transport>>,
    print_tx: bool,
    print_rx: bool,
}

impl SerialLink {
    /// Open a serial port exclusively. No handshake is performed yet.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port: Box<dyn SerialPort> = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| SweepError::Connection(format!("cannot open {}: {}", port_name, e)))?;
        Ok(Self::from_transport(Box::new(port)))
    }

    /// Wrap an already opened transport
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        SerialLink {
            port: Some(transport),
            print_tx: false,
            print_rx: false,
        }
    }

    /// List available serial ports
    pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
        Ok(serialport::available_ports()?)
    }

    /// Enable/disable logging of raw TX/RX bytes
    pub fn set_debug_print(&mut self, tx: bool, rx: bool) {
        self.print_tx = tx;
        self.print_rx = rx;
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Release the transport. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            log::debug!("Controller link closed");
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.port
            .as_mut()
            .ok_or_else(|| SweepError::Connection("link is closed".to_string()))
    }

    /// Greet the controller until it answers HELLO or ALREADY_CONNECTED.
    ///
    /// Gives up after `attempts` greetings; the transport is closed on failure
    /// so no half-open link is left behind.
    pub fn handshake(&mut self, attempts: u32, retry_delay: Duration) -> Result<()> {
        for attempt in 1..=attempts {
            log::info!("Waiting for controller (attempt {}/{})", attempt, attempts);
            let reply = self
                .send_order(Order::Hello, None)
                .and_then(|_| self.read_bytes(1));

            match reply {
                Ok(bytes) => {
                    if let Some(&byte) = bytes.first() {
                        if byte == Order::Hello.as_byte() || byte == Order::AlreadyConnected.as_byte() {
                            self.send_order(Order::AlreadyConnected, None)?;
                            log::info!("Controller connected");
                            return Ok(());
                        }
                        log::debug!("Ignoring handshake byte {}", byte);
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.close();
                    return Err(SweepError::Connection(e.to_string()));
                }
                Err(e) => log::debug!("Handshake read failed: {}", e),
            }

            if attempt < attempts {
                thread::sleep(retry_delay);
            }
        }

        self.close();
        Err(SweepError::Connection(format!(
            "controller did not answer after {} attempts",
            attempts
        )))
    }

    /// Write an order, followed by its payload byte if given
    pub fn send_order(&mut self, order: Order, payload: Option<u8>) -> Result<()> {
        let frame = Frame { order, payload };
        self.send_frame(&frame)
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        if self.print_tx {
            log::debug!("Sending:  {:?} {:02X?}", frame.order, bytes);
        }
        let port = self.port()?;
        port.write_all(&bytes)?;
        port.flush()?;
        Ok(())
    }

    /// Read up to `n` raw bytes. Returns fewer when the transport times out,
    /// so callers must check the length.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; n];
        let mut filled = 0;
        let port = self.port()?;

        while filled < n {
            match port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(filled);
        if self.print_rx && !buffer.is_empty() {
            log::debug!("Received: {:02X?}", buffer);
        }
        Ok(buffer)
    }

    /// Read and decode a single order byte
    pub fn read_order(&mut self) -> Result<Order> {
        let bytes = self.read_bytes(1)?;
        match bytes.first() {
            Some(&byte) => Order::from_byte(byte),
            None => Err(SweepError::Timeout),
        }
    }

    /// Read an order together with its payload bytes
    pub fn read_frame(&mut self) -> Result<(Order, Vec<u8>)> {
        let order = self.read_order()?;
        let len = order.payload_len();
        let payload = self.read_bytes(len)?;
        if payload.len() != len {
            return Err(SweepError::Protocol(format!(
                "{:?} payload truncated: {} of {} bytes",
                order,
                payload.len(),
                len
            )));
        }
        Ok((order, payload))
    }

    /// Wait for `expected`, skipping other valid orders.
    ///
    /// Each attempt is one transport read. Unknown bytes are logged and
    /// skipped; an ERROR frame ends the wait with the controller's fault code.
    pub fn wait_for(&mut self, expected: Order, attempts: u32) -> Result<()> {
        for _ in 0..attempts {
            match self.read_frame() {
                Ok((order, _)) if order == expected => return Ok(()),
                Ok((Order::Error, payload)) => {
                    let code = i16::from_le_bytes([payload[0], payload[1]]);
                    return Err(SweepError::ControllerFault(code));
                }
                Ok((order, _)) => log::debug!("Skipping {:?} while waiting for {:?}", order, expected),
                Err(SweepError::Timeout) => {}
                Err(e @ SweepError::UnknownOrder { .. }) | Err(e @ SweepError::Protocol(_)) => {
                    log::warn!("{} while waiting for {:?}", e, expected);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SweepError::Timeout)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}
