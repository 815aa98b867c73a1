//! Simulated fixture: a controller that answers orders like the firmware does
//! and a meter that reads the pickoff voltage of whichever relay is closed.

#![allow(dead_code)]

use resistor_sweep::{
    BinTable, Order, ResultRecorder, Result, Sequencer, StagePlan, SweepConfig, SweepError,
    VoltageReader,
};
use std::collections::{HashSet, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PICKOFF: f64 = 1.47e6;
pub const VOLTS_PER_UNIT: f64 = 7.843;

#[derive(Default)]
pub struct ControllerState {
    pub outbound: VecDeque<u8>,
    pub received: Vec<(Order, Option<u8>)>,
    pending: Option<Order>,
    pub hv_index: u8,
    pub closed_relay: Option<u8>,
    pub silent: bool,
    pub skip_relay_ack: HashSet<u8>,
    pub skip_hv_ack: bool,
    /// How long an empty read blocks, like a serial read timeout
    pub read_delay: Duration,
}

impl ControllerState {
    fn handle(&mut self, order: Order, payload: Option<u8>) {
        self.received.push((order, payload));
        if self.silent {
            return;
        }
        match order {
            Order::Hello => self.outbound.push_back(Order::AlreadyConnected.as_byte()),
            Order::HvSet => {
                self.hv_index = payload.unwrap_or(0);
                self.outbound.push_back(Order::Received.as_byte());
                if !self.skip_hv_ack {
                    self.outbound.push_back(Order::HvUpdated.as_byte());
                }
            }
            Order::Relay => {
                let channel = payload.unwrap_or(0);
                self.closed_relay = Some(channel);
                if !self.skip_relay_ack.contains(&channel) {
                    self.outbound.push_back(Order::ReadyRelay.as_byte());
                }
            }
            Order::OpenRelays => {
                self.closed_relay = None;
                self.outbound.push_back(Order::Received.as_byte());
            }
            _ => {}
        }
    }

    /// Orders in the order they arrived, payloads dropped
    pub fn orders(&self) -> Vec<Order> {
        self.received.iter().map(|(o, _)| *o).collect()
    }
}

/// Test-side handle on the simulated controller
#[derive(Clone, Default)]
pub struct FakeController {
    pub state: Arc<Mutex<ControllerState>>,
    pub port_dropped: Arc<AtomicBool>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        let controller = Self::new();
        controller.state.lock().unwrap().silent = true;
        controller
    }

    pub fn port(&self) -> FakePort {
        FakePort {
            state: self.state.clone(),
            dropped: self.port_dropped.clone(),
        }
    }

    pub fn received(&self) -> Vec<(Order, Option<u8>)> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state.lock().unwrap().orders()
    }
}

/// The transport end handed to the link
pub struct FakePort {
    state: Arc<Mutex<ControllerState>>,
    dropped: Arc<AtomicBool>,
}

impl Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.outbound.is_empty() {
            let delay = state.read_delay;
            drop(state);
            std::thread::sleep(delay);
            return Err(io::Error::new(ErrorKind::TimedOut, "timed out"));
        }
        let mut count = 0;
        while count < buf.len() {
            match state.outbound.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        for &byte in buf {
            match state.pending.take() {
                Some(order) => state.handle(order, Some(byte)),
                None => {
                    let order = Order::from_byte(byte)
                        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
                    if order.payload_len() == 1 {
                        state.pending = Some(order);
                    } else {
                        state.handle(order, None);
                    }
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FakePort {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Meter reading `V * Rp / (Rp + R)` for the closed channel
pub struct FakeMeter {
    pub controller: Arc<Mutex<ControllerState>>,
    pub resistances: Vec<f64>,
    pub dead_channels: HashSet<u8>,
}

impl FakeMeter {
    pub fn new(controller: &FakeController, resistances: Vec<f64>) -> Self {
        FakeMeter {
            controller: controller.state.clone(),
            resistances,
            dead_channels: HashSet::new(),
        }
    }
}

impl VoltageReader for FakeMeter {
    fn query_voltage(&mut self) -> Result<f64> {
        let state = self.controller.lock().unwrap();
        let channel = state
            .closed_relay
            .ok_or_else(|| SweepError::Instrument("no relay closed".into()))?;
        if self.dead_channels.contains(&channel) {
            return Err(SweepError::Instrument("timed out".into()));
        }
        let applied = state.hv_index as f64 * VOLTS_PER_UNIT;
        let resistance = self.resistances[channel as usize];
        Ok(applied * PICKOFF / (PICKOFF + resistance))
    }
}

/// Fast timings, 4 stages by 3 channels
pub fn fast_config() -> SweepConfig {
    SweepConfig {
        handshake_attempts: 3,
        handshake_retry_ms: 0,
        ack_attempts: 4,
        num_relays: 3,
        samples: 3,
        sample_interval_ms: 0,
        poll_interval_ms: 1,
        channel_settle_ms: 0,
        pause_interval_secs: None,
        pause_hold_secs: 0,
        shutdown_settle_ms: 0,
        shutdown_relay_delay_ms: 0,
        pickoff_resistance: PICKOFF,
        volts_per_unit: VOLTS_PER_UNIT,
        stages: StagePlan::Stepped {
            start: 0,
            end: 40,
            step: 13,
        },
        ..SweepConfig::default()
    }
}

pub fn sequencer(
    config: SweepConfig,
    controller: &FakeController,
    meter: FakeMeter,
    export: Option<PathBuf>,
) -> Sequencer {
    let link = resistor_sweep::SerialLink::from_transport(Box::new(controller.port()));
    let recorder = ResultRecorder::new(BinTable::default(), None, export);
    Sequencer::new(config, link, Box::new(meter), recorder).unwrap()
}

pub fn slow_sampling(mut config: SweepConfig) -> SweepConfig {
    config.sample_interval_ms = 20;
    config
}

pub fn timeout() -> Duration {
    Duration::from_secs(10)
}
