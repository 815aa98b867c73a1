//! In-memory test record and its CSV export.
//!
//! The export starts with one `key,value` row per metadata field, followed by
//! the column header and one row per measurement. Per-channel results go to a
//! sibling `<stem>_summary.csv`.

use crate::binning::BinTable;
use crate::error::{Result, SweepError};
use crate::types::{ChannelSummary, RelayChannel, SessionMetadata, TestRow, VoltageStage};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const EXPORT_HEADER: [&str; 4] = [
    "Stage Index",
    "Channel",
    "Measured Voltage (V)",
    "Voltage Std Error (V)",
];

pub const SUMMARY_HEADER: [&str; 4] = ["Channel", "Mean Resistance (MOhm)", "Bin", "Samples"];

/// Accumulates rows during a run and writes them out
#[derive(Debug)]
pub struct ResultRecorder {
    bins: BinTable,
    metadata: Option<SessionMetadata>,
    destination: Option<PathBuf>,
    rows: Vec<TestRow>,
    resistances: BTreeMap<RelayChannel, Vec<f64>>,
    failures: Vec<(VoltageStage, RelayChannel)>,
    summaries: Vec<ChannelSummary>,
    finalized: bool,
}

impl ResultRecorder {
    pub fn new(bins: BinTable, metadata: Option<SessionMetadata>, destination: Option<PathBuf>) -> Self {
        ResultRecorder {
            bins,
            metadata,
            destination,
            rows: Vec::new(),
            resistances: BTreeMap::new(),
            failures: Vec::new(),
            summaries: Vec::new(),
            finalized: false,
        }
    }

    /// Append a measurement row
    pub fn record(&mut self, row: TestRow) {
        self.resistances
            .entry(row.channel)
            .or_default()
            .push(row.resistance);
        self.rows.push(row);
    }

    /// Note a channel that produced no data at a stage
    pub fn record_failure(&mut self, stage: VoltageStage, channel: RelayChannel) {
        self.failures.push((stage, channel));
    }

    pub fn rows(&self) -> &[TestRow] {
        &self.rows
    }

    pub fn failures(&self) -> &[(VoltageStage, RelayChannel)] {
        &self.failures
    }

    pub fn summaries(&self) -> &[ChannelSummary] {
        &self.summaries
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Change the export path, e.g. after a failed write
    pub fn set_destination(&mut self, destination: PathBuf) {
        self.destination = Some(destination);
    }

    /// Mean resistance and bin for each channel.
    ///
    /// Non-finite samples (no current flowing) are left out; a channel with no
    /// finite sample has an undefined mean and no bin.
    pub fn summarize(&self, channels: &[RelayChannel]) -> Vec<ChannelSummary> {
        channels
            .iter()
            .map(|&channel| {
                let finite: Vec<f64> = self
                    .resistances
                    .get(&channel)
                    .map(|samples| samples.iter().copied().filter(|r| r.is_finite()).collect())
                    .unwrap_or_default();

                let mean_resistance = if finite.is_empty() {
                    None
                } else {
                    Some(finite.iter().sum::<f64>() / finite.len() as f64)
                };

                ChannelSummary {
                    channel,
                    samples: finite.len(),
                    mean_resistance,
                    bin: mean_resistance.map(|r| self.bins.bin(r)),
                }
            })
            .collect()
    }

    /// Compute the final summaries and write both exports.
    ///
    /// Only the first successful call writes; later calls return the stored
    /// summaries.
    pub fn finalize(&mut self, channels: &[RelayChannel]) -> Result<Vec<ChannelSummary>> {
        if self.finalized {
            return Ok(self.summaries.clone());
        }

        self.summaries = self.summarize(channels);
        let path = self.persist()?;
        self.write_summary(&summary_path(&path))?;
        self.finalized = true;
        Ok(self.summaries.clone())
    }

    /// Write the measurement export. Zero rows produce a header-only file.
    pub fn persist(&self) -> Result<PathBuf> {
        let path = self.checked_destination()?;
        let file = File::create(&path)
            .map_err(|e| SweepError::Storage(format!("cannot create {}: {}", path.display(), e)))?;

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);

        if let Some(meta) = &self.metadata {
            let fields = [
                ("Operator", meta.operator.clone()),
                ("Test Number", meta.test_number.to_string()),
                ("Stand Number", meta.stand_number.to_string()),
                ("Board Number", meta.board_number.to_string()),
                ("Calibration Channel", meta.calibration_channel.to_string()),
                ("Calibration Value (GOhm)", meta.calibration_value_gohm.to_string()),
                ("Temperature (C)", meta.temperature_c.to_string()),
                ("Run ID", meta.run_id()),
                ("Started", meta.started_at.to_rfc3339()),
            ];
            for (key, value) in fields {
                writer.write_record([key, value.as_str()])?;
            }
        }

        writer.write_record(EXPORT_HEADER)?;
        for row in &self.rows {
            writer.write_record([
                row.stage.index().to_string(),
                row.channel.index().to_string(),
                row.avg_voltage.to_string(),
                row.std_err.map(|e| e.to_string()).unwrap_or_default(),
            ])?;
        }
        writer
            .flush()
            .map_err(|e| SweepError::Storage(format!("cannot write {}: {}", path.display(), e)))?;

        log::info!("Saved {} rows to {}", self.rows.len(), path.display());
        Ok(path)
    }

    fn write_summary(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(SUMMARY_HEADER)?;
        for summary in &self.summaries {
            writer.write_record([
                summary.channel.index().to_string(),
                summary
                    .mean_resistance_mohm()
                    .map(|r| format!("{:.3}", r))
                    .unwrap_or_default(),
                summary.bin.map(String::from).unwrap_or_default(),
                summary.samples.to_string(),
            ])?;
        }
        writer
            .flush()
            .map_err(|e| SweepError::Storage(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn checked_destination(&self) -> Result<PathBuf> {
        match &self.destination {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => Err(SweepError::Storage("no export path selected".to_string())),
        }
    }
}

/// `results.csv` -> `results_summary.csv`
pub fn summary_path(export: &Path) -> PathBuf {
    let stem = export
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    export.with_file_name(format!("{}_summary.csv", stem))
}
