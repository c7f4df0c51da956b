//! Capture and run artifacts.
//!
//! Per capture, two files go into the run's `data/` directory:
//!
//! - `capture_<NNNN>.csv`: `Time,Channel_<n>,...` with one row per sample index.
//!   Time uses `%.9e`, samples `%.6e`. Channels shorter than the longest one
//!   leave their cells blank.
//! - `capture_<NNNN>_metadata.json`: timestamp, auxiliary reading and per-channel
//!   settings, without the samples.
//!
//! Once per run, `README.json` records the configuration and the run result.
//!
//! # Time column
//!
//! All rows share a single time axis taken from the reference channel (see
//! [`reference_channel`]). Channels reporting a different time step are not
//! resampled; [`TimeStepPolicy`] decides whether that is tolerated, reported or
//! refused.

use super::RunLocation;
use crate::capture::{CaptureRecord, ChannelSample};
use crate::config::{Coupling, RunConfig, TimeStepPolicy};
use crate::error::{AppResult, DaqError};
use crate::instrument::AuxiliaryReading;
use crate::outcome::{CaptureWarning, Outcome};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Relative difference above which two time steps count as different.
const TIME_STEP_TOLERANCE: f64 = 1e-9;

/// Channel whose time step defines the time column: the first configured channel
/// that was read successfully.
///
/// Columns are still written in ascending channel number, so the reference is not
/// necessarily the first data column.
pub fn reference_channel(record: &CaptureRecord) -> Option<(u8, &ChannelSample)> {
    record
        .read_order
        .iter()
        .find_map(|number| record.channels.get(number).map(|sample| (*number, sample)))
}

/// Format like C's `%.<precision>e`: at least two exponent digits, explicit sign.
pub fn format_scientific(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let formatted = format!("{:.*e}", precision, value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => formatted,
    }
}

/// Writes capture artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureSerializer {
    policy: TimeStepPolicy,
}

impl CaptureSerializer {
    /// Serializer applying `policy` to time step mismatches.
    pub fn new(policy: TimeStepPolicy) -> Self {
        Self { policy }
    }

    /// Write the waveform table and metadata file for `record`.
    ///
    /// # Errors
    /// - [`DaqError::TimeStepMismatch`] under [`TimeStepPolicy::Reject`]; nothing is written
    /// - [`DaqError::Storage`] / [`DaqError::Csv`] / [`DaqError::Serialization`] on write failure
    pub fn persist(&self, location: &RunLocation, record: &CaptureRecord) -> AppResult<Outcome<()>> {
        let warnings = self.check_time_steps(record)?;

        let csv_path = location.capture_csv_path(record.capture_index);
        write_waveform_table(&csv_path, record)?;

        let metadata_path = location.capture_metadata_path(record.capture_index);
        write_json(&metadata_path, &CaptureMetadata::from_record(record))?;

        tracing::debug!(
            capture = record.capture_index,
            rows = record.max_samples(),
            path = %csv_path.display(),
            "Capture persisted"
        );
        Ok(Outcome::clean(()).with_warnings(warnings))
    }

    fn check_time_steps(&self, record: &CaptureRecord) -> AppResult<Vec<CaptureWarning>> {
        let Some((reference_number, reference)) = reference_channel(record) else {
            return Ok(Vec::new());
        };

        let mut warnings = Vec::new();
        for (number, sample) in &record.channels {
            if !time_steps_differ(sample.time_step, reference.time_step) {
                continue;
            }
            match self.policy {
                TimeStepPolicy::Tolerate => {}
                TimeStepPolicy::Warn => {
                    tracing::warn!(
                        capture = record.capture_index,
                        channel = number,
                        time_step = sample.time_step,
                        reference = reference.time_step,
                        "Channel time step differs from reference, using reference"
                    );
                    warnings.push(CaptureWarning::TimeStepMismatch {
                        capture_index: record.capture_index,
                        channel: *number,
                        time_step: sample.time_step,
                        reference: reference.time_step,
                    });
                }
                TimeStepPolicy::Reject => {
                    return Err(DaqError::TimeStepMismatch(format!(
                        "capture {}: channel {} reports {:e} s, reference channel {} reports {:e} s",
                        record.capture_index,
                        number,
                        sample.time_step,
                        reference_number,
                        reference.time_step
                    )));
                }
            }
        }
        Ok(warnings)
    }
}

fn time_steps_differ(a: f64, b: f64) -> bool {
    (a - b).abs() > TIME_STEP_TOLERANCE * a.abs().max(b.abs())
}

#[cfg(feature = "storage_csv")]
fn write_waveform_table(path: &Path, record: &CaptureRecord) -> AppResult<()> {
    let file = File::create(path).map_err(|e| DaqError::storage(path, e))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = vec!["Time".to_string()];
    header.extend(record.channels.keys().map(|n| format!("Channel_{}", n)));
    writer.write_record(&header)?;

    let time_step = reference_channel(record)
        .map(|(_, sample)| sample.time_step)
        .unwrap_or(0.0);
    for row in 0..record.max_samples() {
        let mut fields = Vec::with_capacity(record.channels.len() + 1);
        fields.push(format_scientific(row as f64 * time_step, 9));
        fields.extend(record.channels.values().map(|sample| {
            sample
                .values
                .get(row)
                .map(|value| format_scientific(*value, 6))
                .unwrap_or_default()
        }));
        writer.write_record(&fields)?;
    }

    writer.flush().map_err(|e| DaqError::storage(path, e))
}

#[cfg(not(feature = "storage_csv"))]
fn write_waveform_table(_path: &Path, _record: &CaptureRecord) -> AppResult<()> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let file = File::create(path).map_err(|e| DaqError::storage(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| DaqError::storage(path, e))
}

/// Contents of `capture_<NNNN>_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// 0-based capture index
    pub capture_index: usize,
    /// Acquisition completion time
    pub timestamp: DateTime<Local>,
    /// Auxiliary reading taken with this capture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<AuxiliaryReading>,
    /// Channel whose time step defines the time column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_reference_channel: Option<u8>,
    /// Per-channel settings keyed `channel_<n>`
    pub channels: BTreeMap<String, ChannelMetadata>,
}

/// Settings of one channel in a capture metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Seconds between samples
    pub time_step: f64,
    /// Vertical scale in V/div
    pub scale: f64,
    /// Input coupling
    pub coupling: Coupling,
    /// Number of samples written
    pub samples: usize,
}

impl CaptureMetadata {
    fn from_record(record: &CaptureRecord) -> Self {
        Self {
            capture_index: record.capture_index,
            timestamp: record.timestamp,
            pressure: record.auxiliary.clone(),
            time_reference_channel: reference_channel(record).map(|(number, _)| number),
            channels: record
                .channels
                .iter()
                .map(|(number, sample)| {
                    (
                        format!("channel_{}", number),
                        ChannelMetadata {
                            time_step: sample.time_step,
                            scale: sample.scale,
                            coupling: sample.coupling,
                            samples: sample.values.len(),
                        },
                    )
                })
                .collect(),
        }
    }
}

// =============================================================================
// README.json
// =============================================================================

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every requested capture was attempted
    Completed,
    /// A fatal error stopped the capture loop
    Aborted,
}

/// Contents of a run's `README.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// How the run ended
    pub status: RunStatus,
    /// When the metadata was written
    pub timestamp: DateTime<Local>,
    /// Configuration the run used
    pub configuration: RunConfig,
    /// Identification string reported by the oscilloscope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_id: Option<String>,
    /// Captures persisted
    pub captures_completed: usize,
    /// Final auxiliary reading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<AuxiliaryReading>,
    /// Non-fatal problems collected during the run
    #[serde(default)]
    pub warnings: Vec<CaptureWarning>,
    /// Fatal error that aborted the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Version of this software
    pub software_version: String,
    /// Host the run executed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl RunMetadata {
    /// Metadata for `configuration` with status `status`, stamped now.
    pub fn new(status: RunStatus, configuration: RunConfig) -> Self {
        Self {
            status,
            timestamp: Local::now(),
            configuration,
            instrument_id: None,
            captures_completed: 0,
            pressure: None,
            warnings: Vec::new(),
            error: None,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
        }
    }

    /// Read a previously written `README.json`.
    pub fn load(path: &Path) -> AppResult<Self> {
        let file = File::open(path).map_err(|e| DaqError::storage(path, e))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Write `README.json` for `location`.
pub fn write_run_metadata(location: &RunLocation, metadata: &RunMetadata) -> AppResult<()> {
    let path = location.readme_path();
    write_json(&path, metadata)?;
    tracing::info!(path = %path.display(), status = ?metadata.status, "Run metadata written");
    Ok(())
}
