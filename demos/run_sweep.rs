//! Run Sweep Example
//!
//! Runs a full resistor sweep on the fixture:
//! - Controller and meter port selection (or from the config file)
//! - Pre-test form for the session metadata
//! - Live progress while the sweep runs on its worker thread
//! - Operator pause/resume/stop from the keyboard
//!
//! Usage:
//!   cargo run --example run_sweep                    # Defaults, interactive ports
//!   cargo run --example run_sweep -- fixture.toml    # Load a config file
//!
//! While running, type `p` to pause, `r` to resume (or confirm a manual
//! voltage) and `s` to stop, each followed by Enter.
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example run_sweep

use inquire::{Select, Text};
use log::{error, info, warn};
use resistor_sweep::{
    spawn_sweep, FormInput, ResultRecorder, Result, Sequencer, SerialLink, SessionMetadata,
    SweepConfig, SweepError, SweepEvent,
};
use std::io::BufRead;
use std::path::PathBuf;

fn prompt_error(e: inquire::InquireError) -> SweepError {
    SweepError::Config(format!("Prompt cancelled: {}", e))
}

/// Interactive serial port selection using inquire
fn select_port(what: &str) -> Result<String> {
    let ports = SerialLink::list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let port_names: Vec<String> = ports
        .iter()
        .map(|p| format!("{} - {:?}", p.port_name, p.port_type))
        .collect();

    let selection = Select::new(&format!("Select the {} port:", what), port_names)
        .prompt()
        .map_err(prompt_error)?;

    Ok(selection
        .split(" - ")
        .next()
        .unwrap_or(selection.as_str())
        .to_string())
}

/// Ask for the pre-test form until it validates
fn session_metadata() -> Result<SessionMetadata> {
    loop {
        let ask = |label: &str| Text::new(label).prompt().map_err(prompt_error);
        let form = FormInput {
            operator: ask("Operator name:")?,
            test_number: ask("Test number:")?,
            stand_number: ask("Stand number:")?,
            board_number: ask("Board number:")?,
            calibration_channel: Text::new("Calibration channel:")
                .with_default("-1")
                .prompt()
                .map_err(prompt_error)?,
            calibration_value: ask("Calibration value (GOhm):")?,
            temperature: ask("Temperature (C):")?,
        };

        match SessionMetadata::from_form(&form) {
            Ok(meta) => return Ok(meta),
            Err(e) => eprintln!("{}, please try again", e),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => SweepConfig::from_file(path)?,
        None => SweepConfig::default(),
    };
    if config.controller_port.is_empty() {
        config.controller_port = select_port("controller")?;
    }
    if config.meter_port.is_empty() {
        config.meter_port = select_port("multimeter")?;
    }

    let metadata = session_metadata()?;
    let export = Text::new("Export file:")
        .with_default(&format!("sweep_{}.csv", metadata.run_id()))
        .prompt()
        .map_err(prompt_error)?;

    let recorder = ResultRecorder::new(config.bin_table()?, Some(metadata), Some(PathBuf::from(export)));
    let handle = spawn_sweep(Sequencer::open(config, recorder)?)?;

    let control = handle.control().clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
            match line.trim() {
                "p" => control.pause(),
                "r" => control.resume(),
                "s" => control.stop(),
                "" => {}
                other => eprintln!("Unknown command {:?} (p/r/s)", other),
            }
        }
    });

    for event in handle.events() {
        match event {
            SweepEvent::StageStarted { stage, applied_voltage } => {
                info!("=== Stage {} ({:.1} V) ===", stage.index(), applied_voltage)
            }
            SweepEvent::Measured {
                channel,
                avg_voltage,
                std_err,
                resistance,
                ..
            } => println!(
                "  ch{}: {:.6} V (+- {}) -> {:.1} MOhm",
                channel.index(),
                avg_voltage,
                std_err.map_or("n/a".to_string(), |e| format!("{:.2e}", e)),
                resistance / 1e6
            ),
            SweepEvent::StateChanged(resistor_sweep::SweepState::AwaitingManualVoltage) => {
                println!("Set the high voltage by hand, then type `r`")
            }
            SweepEvent::Paused(reason) => println!("Paused ({:?}), relays open", reason),
            SweepEvent::Resumed => println!("Resumed"),
            SweepEvent::Warning(message) => warn!("{}", message),
            SweepEvent::StorageFailed(message) => error!("Export failed: {}", message),
            SweepEvent::Completed(summaries) => {
                println!("\n{:<8} {:>16} {:>4}", "Channel", "Mean (MOhm)", "Bin");
                for s in summaries {
                    println!(
                        "{:<8} {:>16} {:>4}",
                        s.channel.index(),
                        s.mean_resistance_mohm()
                            .map_or("-".to_string(), |r| format!("{:.3}", r)),
                        s.bin.unwrap_or('-')
                    );
                }
            }
            SweepEvent::Aborted => println!("Sweep stopped by operator"),
            SweepEvent::Failed(message) => error!("Sweep failed: {}", message),
            _ => {}
        }
    }

    let report = handle.join()?;
    match (&report.export, &report.storage_error) {
        (Some(path), _) => info!("✓ {} rows saved to {}", report.rows.len(), path.display()),
        (None, Some(e)) => error!("✗ Results not saved: {}", e),
        (None, None) => {}
    }
    Ok(())
}
