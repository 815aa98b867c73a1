//! The sweep state machine.
//!
//! For each voltage stage the sequencer sets the high voltage, then walks the
//! relay channels in ascending order: select, wait for `READY_RELAY`, take a
//! measurement window, record. Transient faults (a missed ack, a channel with
//! no readings) are logged and skipped. A stop request is polled at every
//! wait and always ends in the shutdown sequence: `HV_SET(0)`, settle,
//! `OPEN_RELAYS` once per channel.
//!
//! All controller and meter I/O happens on the thread that calls
//! [`Sequencer::run`]; other threads talk to it only through
//! [`SweepControl`] and the event channel.

use crate::config::SweepConfig;
use crate::error::{Result, SweepError};
use crate::instrument::{open_transport, Multimeter, VoltageReader};
use crate::measurement::{wait_cancellable, Aggregator, SampleOutcome};
use crate::protocol::{Order, SerialLink};
use crate::recorder::ResultRecorder;
use crate::types::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct ControlFlags {
    stop: AtomicBool,
    pause: AtomicBool,
    resume: AtomicBool,
    state: Mutex<SweepState>,
}

/// Cloneable handle for stopping, pausing and resuming a running sweep
#[derive(Debug, Clone)]
pub struct SweepControl {
    flags: Arc<ControlFlags>,
}

impl Default for SweepControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepControl {
    pub fn new() -> Self {
        SweepControl {
            flags: Arc::new(ControlFlags {
                stop: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                resume: AtomicBool::new(false),
                state: Mutex::new(SweepState::Idle),
            }),
        }
    }

    /// Current sequencer state
    pub fn state(&self) -> SweepState {
        self.flags
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(SweepState::Stopped)
    }

    fn set_state(&self, state: SweepState) {
        if let Ok(mut current) = self.flags.state.lock() {
            *current = state;
        }
    }

    /// Request an abort. Ignored when nothing is running.
    pub fn stop(&self) {
        match self.state() {
            SweepState::Idle | SweepState::Stopped => log::debug!("Stop ignored, no sweep running"),
            _ => self.flags.stop.store(true, Ordering::SeqCst),
        }
    }

    /// Ask for a pause at the next channel boundary
    pub fn pause(&self) {
        match self.state() {
            SweepState::Idle | SweepState::Stopped | SweepState::Aborting | SweepState::Finalizing => {
                log::debug!("Pause ignored in {:?}", self.state())
            }
            _ => self.flags.pause.store(true, Ordering::SeqCst),
        }
    }

    /// Leave `Paused` or confirm a manually set voltage. Ignored elsewhere.
    pub fn resume(&self) {
        match self.state() {
            SweepState::Paused | SweepState::AwaitingManualVoltage => {
                self.flags.resume.store(true, Ordering::SeqCst)
            }
            other => log::debug!("Resume ignored in {:?}", other),
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    fn take_pause(&self) -> bool {
        self.flags.pause.swap(false, Ordering::SeqCst)
    }

    fn take_resume(&self) -> bool {
        self.flags.resume.swap(false, Ordering::SeqCst)
    }
}

/// Outcome of a finished run
#[derive(Debug, Serialize)]
pub struct SweepReport {
    pub final_state: SweepState,
    /// All stages and channels were visited
    pub completed: bool,
    pub rows: Vec<TestRow>,
    pub failures: Vec<(VoltageStage, RelayChannel)>,
    pub summaries: Vec<ChannelSummary>,
    pub export: Option<PathBuf>,
    pub storage_error: Option<String>,
    /// Kept so the operator can retry a failed export with
    /// [`SweepReport::retry_export`]
    #[serde(skip)]
    pub recorder: ResultRecorder,
}

impl SweepReport {
    /// Write the record again to `destination`.
    ///
    /// A completed run is finalized, so the summary file is written too; an
    /// aborted run gets its partial export only.
    pub fn retry_export(&mut self, destination: PathBuf) -> Result<PathBuf> {
        self.recorder.set_destination(destination.clone());
        if self.completed {
            let channels: Vec<RelayChannel> = self.summaries.iter().map(|s| s.channel).collect();
            self.summaries = self.recorder.finalize(&channels)?;
        } else {
            self.recorder.persist()?;
        }
        self.export = Some(destination.clone());
        self.storage_error = None;
        Ok(destination)
    }
}

/// Drives one sweep over a controller link and a multimeter
pub struct Sequencer {
    config: SweepConfig,
    link: SerialLink,
    meter: Box<dyn VoltageReader + Send>,
    recorder: ResultRecorder,
    aggregator: Aggregator,
    stages: Vec<VoltageStage>,
    channels: Vec<RelayChannel>,
    control: SweepControl,
    subscribers: Vec<Sender<SweepEvent>>,
    state: SweepState,
    last_pause: Instant,
}

impl Sequencer {
    pub fn new(
        config: SweepConfig,
        link: SerialLink,
        meter: Box<dyn VoltageReader + Send>,
        recorder: ResultRecorder,
    ) -> Result<Self> {
        config.validate()?;
        let channels = (0..config.num_relays).map(RelayChannel).collect();
        Ok(Sequencer {
            aggregator: config.aggregator(),
            stages: config.stage_list(),
            channels,
            config,
            link,
            meter,
            recorder,
            control: SweepControl::new(),
            subscribers: Vec::new(),
            state: SweepState::Idle,
            last_pause: Instant::now(),
        })
    }

    /// Open the controller and meter ports named in `config`
    pub fn open(config: SweepConfig, recorder: ResultRecorder) -> Result<Self> {
        let link = SerialLink::open(&config.controller_port, config.baud_rate, config.timeout())?;

        let transport = open_transport(
            &config.meter_port,
            config.meter_baud_rate,
            Duration::from_millis(config.meter_timeout_ms),
        )?;
        let mut meter = Multimeter::new(transport, config.meter_mode, config.meter_setup.clone());
        let idn = meter
            .identify()
            .map_err(|e| SweepError::Connection(format!("meter on {} did not identify: {}", config.meter_port, e)))?;
        log::info!("Connected to meter: {}", idn);

        Self::new(config, link, Box::new(meter), recorder)
    }

    pub fn control(&self) -> SweepControl {
        self.control.clone()
    }

    /// New event stream. Dropped receivers are tolerated.
    pub fn subscribe(&mut self) -> Receiver<SweepEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    fn emit(&self, event: SweepEvent) {
        for subscriber in &self.subscribers {
            let _ = subscriber.send(event.clone());
        }
    }

    fn set_state(&mut self, state: SweepState) {
        if self.state != state {
            log::debug!("{:?} -> {:?}", self.state, state);
            self.state = state;
            self.control.set_state(state);
            self.emit(SweepEvent::StateChanged(state));
        }
    }

    fn warn(&self, message: String) {
        log::warn!("{}", message);
        self.emit(SweepEvent::Warning(message));
    }

    fn check_stop(&self) -> Result<()> {
        if self.control.is_stop_requested() {
            Err(SweepError::AbortRequested)
        } else {
            Ok(())
        }
    }

    /// Run the sweep to completion or abort.
    ///
    /// A failed handshake returns `Err` with the state back at `Idle`. Once
    /// connected, the run always ends in `Stopped` with high voltage off and
    /// the record written; fatal faults after that point are returned as
    /// `Err` once shutdown has happened.
    pub fn run(mut self) -> Result<SweepReport> {
        self.set_state(SweepState::Connecting);
        let retry = Duration::from_millis(self.config.handshake_retry_ms);
        if let Err(e) = self.link.handshake(self.config.handshake_attempts, retry) {
            log::error!("{}", e);
            self.emit(SweepEvent::Failed(e.to_string()));
            self.set_state(SweepState::Idle);
            return Err(e);
        }

        self.last_pause = Instant::now();
        let outcome = self.sweep();

        let (completed, fatal) = match outcome {
            Ok(()) => {
                self.set_state(SweepState::Finalizing);
                self.shutdown();
                (true, None)
            }
            Err(SweepError::AbortRequested) => {
                log::info!("Sweep stopped, shutting down");
                self.set_state(SweepState::Aborting);
                self.shutdown();
                (false, None)
            }
            Err(e) => {
                log::error!("Sweep failed: {}", e);
                self.set_state(SweepState::Aborting);
                self.shutdown();
                (false, Some(e))
            }
        };

        let (export, storage_error) = self.save(completed);
        self.link.close();

        match &fatal {
            Some(e) => self.emit(SweepEvent::Failed(e.to_string())),
            None if completed => self.emit(SweepEvent::Completed(self.recorder.summaries().to_vec())),
            None => self.emit(SweepEvent::Aborted),
        }
        self.set_state(SweepState::Stopped);

        if let Some(e) = fatal {
            return Err(e);
        }

        Ok(SweepReport {
            final_state: self.state,
            completed,
            rows: self.recorder.rows().to_vec(),
            failures: self.recorder.failures().to_vec(),
            summaries: self.recorder.summaries().to_vec(),
            export,
            storage_error,
            recorder: self.recorder,
        })
    }

    fn sweep(&mut self) -> Result<()> {
        let stages = self.stages.clone();
        let channels = self.channels.clone();

        for stage in stages {
            self.check_stop()?;
            self.apply_stage(stage)?;

            for &channel in &channels {
                self.check_stop()?;
                self.pause_if_due()?;
                self.measure_channel(stage, channel)?;

                let settle = Duration::from_millis(self.config.channel_settle_ms);
                let control = self.control.clone();
                if !wait_cancellable(settle, self.config.poll_interval(), &|| control.is_stop_requested()) {
                    return Err(SweepError::AbortRequested);
                }
            }
        }
        Ok(())
    }

    fn apply_stage(&mut self, stage: VoltageStage) -> Result<()> {
        let applied_voltage = stage.volts(self.config.volts_per_unit);

        if self.config.stages.is_manual() {
            self.set_state(SweepState::AwaitingManualVoltage);
            self.emit(SweepEvent::StageStarted { stage, applied_voltage });
            log::info!("Set high voltage to ~{:.2} V and resume", applied_voltage);
            return self.hold(None);
        }

        self.set_state(SweepState::SettingVoltage);
        self.emit(SweepEvent::StageStarted { stage, applied_voltage });
        log::info!("Setting HV to DAC value {} (~{:.2} V)", stage.index(), applied_voltage);
        self.link.send_order(Order::HvSet, Some(stage.index()))?;

        self.set_state(SweepState::AwaitingVoltageAck);
        if !self.await_ack(Order::HvUpdated)? {
            self.warn(format!(
                "No HV_UPDATED for stage {}, continuing",
                stage.index()
            ));
        }
        Ok(())
    }

    fn measure_channel(&mut self, stage: VoltageStage, channel: RelayChannel) -> Result<()> {
        self.set_state(SweepState::SelectingChannel);
        self.link.send_order(Order::Relay, Some(channel.index()))?;
        self.emit(SweepEvent::ChannelSelected(channel));

        self.set_state(SweepState::AwaitingChannelAck);
        if !self.await_ack(Order::ReadyRelay)? {
            self.warn(format!(
                "No READY_RELAY for channel {} at stage {}, skipping",
                channel.index(),
                stage.index()
            ));
            self.recorder.record_failure(stage, channel);
            self.emit(SweepEvent::ChannelFailed { stage, channel });
            return Ok(());
        }

        self.set_state(SweepState::Measuring);
        let control = self.control.clone();
        let subscribers = self.subscribers.clone();
        let outcome = self.aggregator.sample(
            self.meter.as_mut(),
            &|| control.is_stop_requested(),
            &mut |volts| {
                let event = SweepEvent::LiveReading(Reading { stage, channel, volts });
                for subscriber in &subscribers {
                    let _ = subscriber.send(event.clone());
                }
            },
        );

        match outcome {
            SampleOutcome::Cancelled => Err(SweepError::AbortRequested),
            SampleOutcome::NoData => {
                self.warn(format!(
                    "No readings for channel {} at stage {}",
                    channel.index(),
                    stage.index()
                ));
                self.recorder.record_failure(stage, channel);
                self.emit(SweepEvent::ChannelFailed { stage, channel });
                Ok(())
            }
            SampleOutcome::Complete(summary) => {
                self.set_state(SweepState::Recording);
                // Complete windows always carry a mean.
                let avg_voltage = summary.mean.unwrap_or_default();
                let applied_voltage = stage.volts(self.config.volts_per_unit);
                let point = DerivedPoint::compute(applied_voltage, avg_voltage, self.config.pickoff_resistance);

                self.recorder.record(TestRow {
                    stage,
                    channel,
                    avg_voltage,
                    std_err: summary.std_err,
                    applied_voltage,
                    resistance: point.resistance,
                });
                log::info!(
                    "Channel {} at {:.2} V: {:.6} V +- {:?}, {:.1} MOhm",
                    channel.index(),
                    applied_voltage,
                    avg_voltage,
                    summary.std_err,
                    point.resistance_mohm()
                );
                self.emit(SweepEvent::Measured {
                    stage,
                    channel,
                    avg_voltage,
                    std_err: summary.std_err,
                    applied_voltage,
                    current: point.current,
                    resistance: point.resistance,
                });
                self.link.send_order(Order::DataUpdate, None)?;
                Ok(())
            }
        }
    }

    /// Wait for `expected`, one transport read per attempt, checking for stop
    /// in between. `Ok(false)` means the ack never came.
    fn await_ack(&mut self, expected: Order) -> Result<bool> {
        for _ in 0..self.config.ack_attempts {
            self.check_stop()?;
            match self.link.wait_for(expected, 1) {
                Ok(()) => return Ok(true),
                Err(SweepError::Timeout) => {}
                Err(e) if !e.is_fatal() => {
                    self.warn(format!("{} while waiting for {:?}", e, expected));
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Enter `Paused` when the operator asked for it or the schedule is due
    fn pause_if_due(&mut self) -> Result<()> {
        let scheduled = self
            .config
            .pause_interval_secs
            .map_or(false, |secs| self.last_pause.elapsed() >= Duration::from_secs(secs));
        let reason = if self.control.take_pause() {
            PauseReason::Operator
        } else if scheduled {
            PauseReason::Scheduled
        } else {
            return Ok(());
        };

        self.set_state(SweepState::Paused);
        log::info!("Pausing ({:?}), opening all relays", reason);
        self.link.send_order(Order::OpenRelays, None)?;
        self.emit(SweepEvent::Paused(reason));

        let hold = match reason {
            PauseReason::Operator => None,
            PauseReason::Scheduled => Some(Instant::now() + Duration::from_secs(self.config.pause_hold_secs)),
        };
        self.hold(hold)?;

        self.last_pause = Instant::now();
        self.emit(SweepEvent::Resumed);
        Ok(())
    }

    /// Block until resumed, the deadline passes, or stop is requested
    fn hold(&mut self, deadline: Option<Instant>) -> Result<()> {
        let poll = self.config.poll_interval().max(Duration::from_millis(1));
        loop {
            self.check_stop()?;
            if self.control.take_resume() {
                return Ok(());
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(());
            }
            thread::sleep(poll);
        }
    }

    /// HV to zero, settle, then open every relay. Failures are logged only.
    fn shutdown(&mut self) {
        log::info!("Setting HV to 0");
        if let Err(e) = self.link.send_order(Order::HvSet, Some(0)) {
            log::error!("Could not zero high voltage: {}", e);
        }
        thread::sleep(Duration::from_millis(self.config.shutdown_settle_ms));
        if let Err(e) = self.link.wait_for(Order::HvUpdated, 1) {
            log::debug!("No HV_UPDATED during shutdown: {}", e);
        }

        log::info!("Opening all relays");
        for _ in 0..self.channels.len() {
            if let Err(e) = self.link.send_order(Order::OpenRelays, None) {
                log::error!("Could not open relays: {}", e);
                break;
            }
            thread::sleep(Duration::from_millis(self.config.shutdown_relay_delay_ms));
            if let Err(e) = self.link.read_bytes(1) {
                log::debug!("No RECEIVED for OPEN_RELAYS: {}", e);
            }
        }
    }

    /// Write the export: full finalize on completion, partial record otherwise
    fn save(&mut self, completed: bool) -> (Option<PathBuf>, Option<String>) {
        let result = if completed {
            let channels = self.channels.clone();
            self.recorder.finalize(&channels).map(|_| ())
        } else {
            self.recorder.persist().map(|_| ())
        };

        match result {
            Ok(()) => (self.recorder.destination().map(PathBuf::from), None),
            Err(e) => {
                log::error!("{}", e);
                self.emit(SweepEvent::StorageFailed(e.to_string()));
                (None, Some(e.to_string()))
            }
        }
    }
}

/// A sweep running on its own worker thread
pub struct SweepHandle {
    control: SweepControl,
    events: Receiver<SweepEvent>,
    worker: JoinHandle<Result<SweepReport>>,
}

impl SweepHandle {
    pub fn control(&self) -> &SweepControl {
        &self.control
    }

    pub fn events(&self) -> &Receiver<SweepEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and return its report
    pub fn join(self) -> Result<SweepReport> {
        self.worker.join().map_err(|_| {
            SweepError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sweep worker panicked",
            ))
        })?
    }
}

/// Move the sequencer onto a dedicated worker thread.
///
/// The run counts as started once this returns, so a `stop()` on the handle
/// is honoured even before the worker reaches the handshake.
pub fn spawn_sweep(mut sequencer: Sequencer) -> Result<SweepHandle> {
    let events = sequencer.subscribe();
    let control = sequencer.control();
    sequencer.set_state(SweepState::Connecting);
    let worker = thread::Builder::new()
        .name("sweep".to_string())
        .spawn(move || sequencer.run())?;
    Ok(SweepHandle {
        control,
        events,
        worker,
    })
}
