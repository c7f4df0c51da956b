//! Device boundaries.
//!
//! The capture pipeline talks to two devices through the traits in this module:
//!
//! - [`InstrumentService`]: the triggered oscilloscope (connect, configure, arm, poll,
//!   read channels, disconnect)
//! - [`AuxiliarySensor`]: the optional pressure gauge (connect, single read, disconnect)
//!
//! Both traits follow the same conventions:
//! - async (`#[async_trait]`) and `Send + Sync`, so one device can be shared through
//!   an `Arc` between the orchestrator and the test that inspects it
//! - `&self` receivers with interior mutability for connection state
//! - `anyhow::Result` errors; the orchestration layer decides which failures are fatal
//!
//! Implementations:
//! - [`scpi::ScpiOscilloscope`]: SCPI over raw TCP
//! - `pressure::SerialPressureGauge`: serial gauge (feature `instrument_serial`)
//! - [`mock`]: simulated devices with fault injection

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod pressure;
pub mod scpi;

use crate::config::{
    AcquisitionSpec, AuxiliarySpec, ChannelSpec, InstrumentSpec, TimebaseSpec, TriggerSpec,
    WaveformPoints,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Samples read back from one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    /// Seconds between consecutive samples
    pub time_step: f64,
    /// Sample values in volts
    pub values: Vec<f64>,
}

/// Acquisition state reported by `:TRIG:STAT?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerStatus {
    /// Acquiring
    Run,
    /// Acquisition complete
    Stop,
    /// Triggered, still filling memory
    Triggered,
    /// Armed, waiting for the trigger condition
    Wait,
    /// Auto-triggering
    Auto,
    /// Anything the driver did not recognise
    Other(String),
}

impl TriggerStatus {
    /// Parse an instrument status word.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_uppercase().as_str() {
            "RUN" => TriggerStatus::Run,
            "STOP" => TriggerStatus::Stop,
            "TD" => TriggerStatus::Triggered,
            "WAIT" => TriggerStatus::Wait,
            "AUTO" => TriggerStatus::Auto,
            _ => TriggerStatus::Other(status.trim().to_string()),
        }
    }

    /// True once the acquisition has finished and data can be read.
    pub fn is_complete(&self) -> bool {
        matches!(self, TriggerStatus::Stop)
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerStatus::Run => f.write_str("RUN"),
            TriggerStatus::Stop => f.write_str("STOP"),
            TriggerStatus::Triggered => f.write_str("TD"),
            TriggerStatus::Wait => f.write_str("WAIT"),
            TriggerStatus::Auto => f.write_str("AUTO"),
            TriggerStatus::Other(other) => f.write_str(other),
        }
    }
}

/// One reading from the auxiliary sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryReading {
    /// When the reading was taken
    pub timestamp: DateTime<Local>,
    /// Reply exactly as the device sent it
    pub reading: String,
    /// Numeric value when the reply could be parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Error code from the gauge when the reading carried a non-zero status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_status: Option<String>,
}

impl AuxiliaryReading {
    /// Build a reading from a raw gauge reply.
    pub fn from_raw(timestamp: DateTime<Local>, raw: &str) -> Self {
        let reading = raw.trim().to_string();
        Self {
            timestamp,
            value: parse_gauge_reply(&reading),
            reading,
            error_status: None,
        }
    }

    /// Status field of the reply when it is not `0`.
    pub fn fault_status(&self) -> Option<&str> {
        gauge_fault_status(&self.reading)
    }

    /// Attach the gauge's error code.
    pub fn with_error_status(mut self, error_status: impl Into<String>) -> Self {
        self.error_status = Some(error_status.into());
        self
    }
}

/// Status field of a `<status>,<value>` reply when it signals a fault.
///
/// Bare numbers and unparseable replies carry no status.
pub fn gauge_fault_status(raw: &str) -> Option<&str> {
    let (status, _) = raw.trim().split_once(',')?;
    let status = status.trim();
    (status != "0").then_some(status)
}

/// Extract the pressure from a `<status>,<value>` gauge reply.
///
/// A bare number is accepted as well. A non-zero status means the gauge has no
/// valid measurement (underrange, sensor off, ...), so no value is returned.
pub fn parse_gauge_reply(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    match raw.split_once(',') {
        Some((status, value)) => {
            if status.trim() != "0" {
                return None;
            }
            value.trim().parse::<f64>().ok()
        }
        None => raw.parse::<f64>().ok(),
    }
}

/// Capability: triggered waveform acquisition.
///
/// # Contract
/// - `connect` must succeed before any other call
/// - configuration calls are idempotent and may be repeated
/// - `configure_trigger` arms a new acquisition every time it is called
/// - `channel_data` returns whatever the instrument holds for the last acquisition
#[async_trait]
pub trait InstrumentService: Send + Sync {
    /// Open the connection and return the instrument identification string.
    async fn connect(&self, instrument: &InstrumentSpec) -> Result<String>;

    /// Apply vertical settings and display state for one channel.
    async fn configure_channel(&self, channel: &ChannelSpec) -> Result<()>;

    /// Apply acquisition memory depth.
    async fn configure_acquisition(&self, acquisition: &AcquisitionSpec) -> Result<()>;

    /// Apply horizontal scale and offset.
    async fn configure_timebase(&self, timebase: &TimebaseSpec) -> Result<()>;

    /// Apply the edge trigger and arm the instrument.
    async fn configure_trigger(&self, trigger: &TriggerSpec) -> Result<()>;

    /// Current acquisition state.
    async fn trigger_status(&self) -> Result<TriggerStatus>;

    /// Read back samples for one channel.
    async fn channel_data(&self, channel: u8, points: WaveformPoints) -> Result<ChannelData>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// Capability: single-shot auxiliary measurement.
///
/// Every failure here is non-fatal to the caller.
#[async_trait]
pub trait AuxiliarySensor: Send + Sync {
    /// Open the connection.
    async fn connect(&self, params: &AuxiliarySpec) -> Result<()>;

    /// Take one reading.
    async fn read(&self) -> Result<AuxiliaryReading>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}
