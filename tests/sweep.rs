mod common;

use common::*;
use resistor_sweep::recorder::{summary_path, EXPORT_HEADER};
use resistor_sweep::{
    spawn_sweep, Order, PauseReason, RelayChannel, StagePlan, SweepError, SweepEvent, SweepHandle,
    SweepState, VoltageStage,
};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

const RESISTANCES: [f64; 3] = [5.0e9, 5.01e9, 7.353e9];

/// Default cancellation poll interval; a stop must land within it
const STOP_LATENCY: Duration = Duration::from_millis(500);

/// Drain events, calling `stop()` on the first one matching `trigger`.
/// Returns the events and the time from the stop call to `Aborting`.
fn stop_when(
    handle: &SweepHandle,
    mut trigger: impl FnMut(&SweepEvent) -> bool,
) -> (Vec<SweepEvent>, Duration) {
    let mut events = Vec::new();
    let mut stopped_at = None;
    let mut latency = None;
    for event in handle.events().iter() {
        if stopped_at.is_none() && trigger(&event) {
            handle.control().stop();
            stopped_at = Some(Instant::now());
        }
        if event == SweepEvent::StateChanged(SweepState::Aborting) {
            latency = stopped_at.map(|t: Instant| t.elapsed());
        }
        events.push(event);
    }
    (events, latency.expect("sweep never reached Aborting after stop"))
}

/// Aborting, then HV_SET(0) and one OPEN_RELAYS per channel, then Stopped
fn assert_safe_abort(events: &[SweepEvent], controller: &FakeController) {
    let aborting = events
        .iter()
        .position(|e| *e == SweepEvent::StateChanged(SweepState::Aborting))
        .unwrap();
    let aborted = events.iter().position(|e| *e == SweepEvent::Aborted).unwrap();
    assert!(aborting < aborted);
    assert_eq!(events.last(), Some(&SweepEvent::StateChanged(SweepState::Stopped)));

    let received = controller.received();
    let zero = received
        .iter()
        .rposition(|f| *f == (Order::HvSet, Some(0)))
        .unwrap();
    assert_eq!(received[zero + 1..].to_vec(), vec![(Order::OpenRelays, None); 3]);
}

#[test]
fn full_sweep_records_every_stage_and_channel_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("run.csv");
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let report = sequencer(fast_config(), &controller, meter, Some(export.clone()))
        .run()
        .unwrap();

    assert!(report.completed);
    assert_eq!(report.final_state, SweepState::Stopped);
    assert_eq!(report.rows.len(), 12);
    assert!(report.failures.is_empty());

    let keys: Vec<(VoltageStage, RelayChannel)> =
        report.rows.iter().map(|r| (r.stage, r.channel)).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(keys, sorted);
    assert_eq!(keys[0], (VoltageStage(0), RelayChannel(0)));
    assert_eq!(keys[11], (VoltageStage(39), RelayChannel(2)));

    // Stage 0 carries no current, the rest recover the fitted resistors
    for (summary, expected) in report.summaries.iter().zip(RESISTANCES) {
        assert_eq!(summary.samples, 3);
        let mean = summary.mean_resistance.unwrap();
        assert!((mean - expected).abs() / expected < 1e-9);
    }
    assert_eq!(report.summaries[0].bin, Some('A'));
    assert_eq!(report.summaries[1].bin, Some('C'));
    assert_eq!(report.summaries[2].bin, Some('K'));

    assert_eq!(report.export.as_deref(), Some(export.as_path()));
    assert!(summary_path(&export).exists());
    assert_eq!(
        controller
            .orders()
            .iter()
            .filter(|o| **o == Order::DataUpdate)
            .count(),
        12
    );
    assert!(controller.port_dropped.load(Ordering::SeqCst));
}

#[test]
fn completed_sweep_ends_with_voltage_off_and_relays_open() {
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let dir = tempfile::tempdir().unwrap();
    sequencer(fast_config(), &controller, meter, Some(dir.path().join("a.csv")))
        .run()
        .unwrap();

    let received = controller.received();
    let tail = &received[received.len() - 4..];
    assert_eq!(tail[0], (Order::HvSet, Some(0)));
    assert!(tail[1..].iter().all(|f| *f == (Order::OpenRelays, None)));
}

#[test]
fn exported_rows_recompute_to_recorded_means() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("roundtrip.csv");
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let report = sequencer(fast_config(), &controller, meter, Some(export.clone()))
        .run()
        .unwrap();

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&export)
        .unwrap();
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    let header = records
        .iter()
        .position(|r| r.iter().eq(EXPORT_HEADER.iter().copied()))
        .unwrap();
    let exported = &records[header + 1..];
    assert_eq!(exported.len(), report.rows.len());

    for (record, row) in exported.iter().zip(&report.rows) {
        assert_eq!(record[0].parse::<u8>().unwrap(), row.stage.index());
        assert_eq!(record[1].parse::<u8>().unwrap(), row.channel.index());
        let volts: f64 = record[2].parse().unwrap();
        assert!((volts - row.avg_voltage).abs() < 1e-12);
    }
}

#[test]
fn stop_mid_measurement_aborts_and_keeps_partial_record() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("partial.csv");
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let handle = spawn_sweep(sequencer(
        slow_sampling(fast_config()),
        &controller,
        meter,
        Some(export.clone()),
    ))
    .unwrap();

    let (events, latency) = stop_when(&handle, |e| matches!(e, SweepEvent::Measured { .. }));
    let report = handle.join().unwrap();

    assert!(latency < STOP_LATENCY, "stop took {:?}", latency);
    assert!(!report.completed);
    assert_eq!(report.final_state, SweepState::Stopped);
    assert!(!report.rows.is_empty() && report.rows.len() < 12);
    assert_safe_abort(&events, &controller);

    let text = std::fs::read_to_string(&export).unwrap();
    assert_eq!(text.lines().count(), report.rows.len() + 1);
}

#[test]
fn dead_channel_is_logged_and_sweep_continues() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    let mut meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    meter.dead_channels.insert(1);
    let mut seq = sequencer(fast_config(), &controller, meter, Some(dir.path().join("d.csv")));
    let events = seq.subscribe();
    let report = seq.run().unwrap();

    assert!(report.completed);
    assert_eq!(report.rows.len(), 8);
    assert!(report.rows.iter().all(|r| r.channel != RelayChannel(1)));
    assert_eq!(report.failures.len(), 4);
    assert!(report.failures.iter().all(|(_, c)| *c == RelayChannel(1)));

    let dead = &report.summaries[1];
    assert_eq!(dead.mean_resistance, None);
    assert_eq!(dead.bin, None);
    assert!(report.summaries[2].mean_resistance.is_some());

    let failed = events
        .try_iter()
        .filter(|e| matches!(e, SweepEvent::ChannelFailed { .. }))
        .count();
    assert_eq!(failed, 4);
}

#[test]
fn missing_relay_ack_skips_only_that_channel() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    controller.state.lock().unwrap().skip_relay_ack.insert(2);
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut seq = sequencer(fast_config(), &controller, meter, Some(dir.path().join("r.csv")));
    let events = seq.subscribe();
    let report = seq.run().unwrap();

    assert!(report.completed);
    assert_eq!(report.rows.len(), 8);
    assert!(report.failures.iter().all(|(_, c)| *c == RelayChannel(2)));
    assert!(events
        .try_iter()
        .any(|e| matches!(e, SweepEvent::Warning(ref m) if m.contains("READY_RELAY"))));
}

#[test]
fn missing_voltage_ack_continues_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    controller.state.lock().unwrap().skip_hv_ack = true;
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let report = sequencer(fast_config(), &controller, meter, Some(dir.path().join("h.csv")))
        .run()
        .unwrap();

    assert!(report.completed);
    assert_eq!(report.rows.len(), 12);
}

#[test]
fn silent_controller_fails_handshake_and_closes_transport() {
    let controller = FakeController::silent();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut seq = sequencer(fast_config(), &controller, meter, None);
    let control = seq.control();
    let events = seq.subscribe();

    let err = seq.run().unwrap_err();
    assert!(matches!(err, SweepError::Connection(_)));
    assert_eq!(control.state(), SweepState::Idle);
    assert!(controller.port_dropped.load(Ordering::SeqCst));
    assert_eq!(controller.orders(), vec![Order::Hello; 3]);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, SweepEvent::Failed(_))));
}

#[test]
fn operator_pause_opens_relays_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let handle = spawn_sweep(sequencer(
        slow_sampling(fast_config()),
        &controller,
        meter,
        Some(dir.path().join("p.csv")),
    ))
    .unwrap();

    let mut paused = false;
    let mut pause_requested = false;
    for event in handle.events().iter() {
        match event {
            SweepEvent::Measured { .. } if !pause_requested => {
                handle.control().pause();
                pause_requested = true;
            }
            SweepEvent::Paused(reason) => {
                assert_eq!(reason, PauseReason::Operator);
                assert_eq!(handle.control().state(), SweepState::Paused);
                assert_eq!(controller.orders().last(), Some(&Order::OpenRelays));
                paused = true;
                handle.control().resume();
            }
            _ => {}
        }
    }
    let report = handle.join().unwrap();

    assert!(paused);
    assert!(report.completed);
    assert_eq!(report.rows.len(), 12);
}

#[test]
fn scheduled_pauses_happen_before_channels() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut config = fast_config();
    config.pause_interval_secs = Some(0);
    config.pause_hold_secs = 0;
    let mut seq = sequencer(config, &controller, meter, Some(dir.path().join("s.csv")));
    let events = seq.subscribe();
    let report = seq.run().unwrap();

    assert!(report.completed);
    let pauses = events
        .try_iter()
        .filter(|e| *e == SweepEvent::Paused(PauseReason::Scheduled))
        .count();
    assert_eq!(pauses, 12);
}

#[test]
fn manual_stages_wait_for_operator_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut config = fast_config();
    config.stages = StagePlan::Manual {
        stages: vec![13, 26],
    };
    // The operator, not the controller, sets the voltage here
    controller.state.lock().unwrap().hv_index = 13;
    let handle = spawn_sweep(sequencer(config, &controller, meter, Some(dir.path().join("m.csv")))).unwrap();

    let mut confirmations = 0;
    for event in handle.events().iter() {
        if event == SweepEvent::StateChanged(SweepState::AwaitingManualVoltage) {
            confirmations += 1;
            handle.control().resume();
        }
    }
    let report = handle.join().unwrap();

    assert_eq!(confirmations, 2);
    assert!(report.completed);
    assert_eq!(report.rows.len(), 6);
    let hv_orders: Vec<_> = controller
        .received()
        .into_iter()
        .filter(|(o, _)| *o == Order::HvSet)
        .collect();
    assert_eq!(hv_orders, vec![(Order::HvSet, Some(0))]);
}

#[test]
fn storage_failure_is_reported_without_losing_rows() {
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut seq = sequencer(fast_config(), &controller, meter, None);
    let events = seq.subscribe();
    let mut report = seq.run().unwrap();

    assert!(report.completed);
    assert!(report.storage_error.is_some());
    assert_eq!(report.recorder.rows().len(), 12);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, SweepEvent::StorageFailed(_))));

    let dir = tempfile::tempdir().unwrap();
    let retry = dir.path().join("retry.csv");
    assert_eq!(report.retry_export(retry.clone()).unwrap(), retry);
    assert!(retry.exists());
    assert!(summary_path(&retry).exists());
    assert!(report.recorder.is_finalized());
    assert_eq!(report.storage_error, None);
    assert_eq!(report.export.as_deref(), Some(retry.as_path()));
    assert_eq!(report.summaries[2].bin, Some('K'));
}

#[test]
fn aborted_run_retries_partial_export_only() {
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let handle = spawn_sweep(sequencer(slow_sampling(fast_config()), &controller, meter, None)).unwrap();
    stop_when(&handle, |e| matches!(e, SweepEvent::Measured { .. }));
    let mut report = handle.join().unwrap();
    assert!(report.storage_error.is_some());

    let dir = tempfile::tempdir().unwrap();
    let retry = dir.path().join("partial.csv");
    report.retry_export(retry.clone()).unwrap();
    let text = std::fs::read_to_string(&retry).unwrap();
    assert_eq!(text.lines().count(), report.rows.len() + 1);
    assert!(!summary_path(&retry).exists());
    assert!(!report.recorder.is_finalized());
}

#[test]
fn stop_right_after_spawn_is_never_lost() {
    for _ in 0..20 {
        let controller = FakeController::new();
        let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
        let handle = spawn_sweep(sequencer(fast_config(), &controller, meter, None)).unwrap();
        handle.control().stop();
        let events: Vec<SweepEvent> = handle.events().iter().collect();
        let report = handle.join().unwrap();

        assert!(!report.completed);
        assert!(report.rows.is_empty());
        assert!(events.contains(&SweepEvent::Aborted));
        assert!(controller
            .received()
            .iter()
            .all(|(order, payload)| *order != Order::HvSet || *payload == Some(0)));
    }
}

#[test]
fn stop_while_paused_leaves_the_hold() {
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let handle = spawn_sweep(sequencer(fast_config(), &controller, meter, None)).unwrap();
    let control = handle.control().clone();
    control.pause();

    let (events, latency) = stop_when(&handle, |e| matches!(e, SweepEvent::Paused(_)));
    handle.join().unwrap();

    assert!(latency < STOP_LATENCY, "stop took {:?}", latency);
    assert!(events.contains(&SweepEvent::Paused(PauseReason::Operator)));
    assert!(!events.contains(&SweepEvent::Resumed));
    assert_safe_abort(&events, &controller);
}

#[test]
fn stop_while_awaiting_manual_voltage() {
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut config = fast_config();
    config.stages = StagePlan::Manual {
        stages: vec![13, 26],
    };
    let handle = spawn_sweep(sequencer(config, &controller, meter, None)).unwrap();

    let (events, latency) = stop_when(&handle, |e| {
        *e == SweepEvent::StateChanged(SweepState::AwaitingManualVoltage)
    });
    let report = handle.join().unwrap();

    assert!(latency < STOP_LATENCY, "stop took {:?}", latency);
    assert!(report.rows.is_empty());
    assert_safe_abort(&events, &controller);
}

#[test]
fn stop_during_relay_ack_wait() {
    let controller = FakeController::new();
    {
        let mut state = controller.state.lock().unwrap();
        state.skip_relay_ack.insert(0);
        state.read_delay = Duration::from_millis(10);
    }
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let mut config = fast_config();
    // Unstopped, this wait would last about ten seconds
    config.ack_attempts = 1000;
    let handle = spawn_sweep(sequencer(config, &controller, meter, None)).unwrap();

    let started = Instant::now();
    let (events, latency) = stop_when(&handle, |e| {
        *e == SweepEvent::StateChanged(SweepState::AwaitingChannelAck)
    });
    let report = handle.join().unwrap();

    assert!(latency < STOP_LATENCY, "stop took {:?}", latency);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.rows.is_empty());
    assert!(!events.iter().any(|e| matches!(e, SweepEvent::ChannelFailed { .. })));
    assert_safe_abort(&events, &controller);
}

#[test]
fn report_serializes_for_the_ui() {
    let dir = tempfile::tempdir().unwrap();
    let controller = FakeController::new();
    let meter = FakeMeter::new(&controller, RESISTANCES.to_vec());
    let report = sequencer(fast_config(), &controller, meter, Some(dir.path().join("j.csv")))
        .run()
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["completed"], true);
    assert_eq!(json["rows"].as_array().unwrap().len(), 12);
    assert_eq!(json["summaries"][2]["bin"], "K");
}
