//! Mock Device Implementations
//!
//! Simulated oscilloscope and pressure gauge for tests and `--mock` runs.
//! All waits use `tokio::time::sleep`.
//!
//! # Available Mocks
//!
//! - `MockOscilloscope`: deterministic sine waveforms, configurable trigger latency,
//!   per-channel sample counts and time steps, fault injection
//! - `MockPressureGauge`: slowly drifting pressure readings, fault injection
//!
//! Both record every call so tests can assert on ordering and counts after the
//! device has been handed to the orchestrator behind an `Arc`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Local;
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use super::{AuxiliaryReading, AuxiliarySensor, ChannelData, InstrumentService, TriggerStatus};
use crate::config::{
    AcquisitionSpec, AuxiliarySpec, ChannelSpec, InstrumentSpec, TimebaseSpec, TriggerSpec,
    WaveformPoints,
};

/// Identification string reported by [`MockOscilloscope`].
pub const MOCK_SCOPE_IDN: &str = "MOCK,Oscilloscope,SIM0001,1.0";

// =============================================================================
// MockOscilloscope
// =============================================================================

/// One recorded call on [`MockOscilloscope`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeCall {
    /// `connect` with the requested address
    Connect(String),
    /// `configure_channel` for a channel number
    ConfigureChannel(u8),
    /// `configure_acquisition`
    ConfigureAcquisition(WaveformPoints),
    /// `configure_timebase` with the applied scale
    ConfigureTimebase(f64),
    /// `configure_trigger` (arm)
    ConfigureTrigger,
    /// `trigger_status` poll
    TriggerStatus,
    /// `channel_data` for a channel number
    ChannelData(u8),
    /// `disconnect`
    Disconnect,
}

#[derive(Debug, Default)]
struct ScopeState {
    connected: bool,
    calls: Vec<ScopeCall>,
    trigger_calls: usize,
    polls_remaining: usize,
}

/// Simulated triggered oscilloscope.
///
/// # Example
///
/// ```rust,ignore
/// let scope = Arc::new(MockOscilloscope::new().with_failing_channel(2));
/// // hand `scope.clone()` to a MeasurementRun, then:
/// assert_eq!(scope.disconnect_count().await, 1);
/// ```
pub struct MockOscilloscope {
    state: Arc<RwLock<ScopeState>>,
    samples: usize,
    time_step: f64,
    polls_until_stop: Option<usize>,
    poll_latency: Duration,
    channel_samples: HashMap<u8, usize>,
    channel_time_steps: HashMap<u8, f64>,
    failing_channels: HashSet<u8>,
    fail_connect: bool,
    fail_trigger_call: Option<usize>,
}

impl Default for MockOscilloscope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOscilloscope {
    /// 1200 samples per channel at 1 µs, acquisition complete on the second poll.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ScopeState::default())),
            samples: 1200,
            time_step: 1e-6,
            polls_until_stop: Some(1),
            poll_latency: Duration::ZERO,
            channel_samples: HashMap::new(),
            channel_time_steps: HashMap::new(),
            failing_channels: HashSet::new(),
            fail_connect: false,
            fail_trigger_call: None,
        }
    }

    /// Samples returned for every channel without an explicit length.
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    /// Sample interval reported for every channel without an explicit one.
    pub fn with_time_step(mut self, time_step: f64) -> Self {
        self.time_step = time_step;
        self
    }

    /// Return `samples` values for `channel`.
    pub fn with_channel_samples(mut self, channel: u8, samples: usize) -> Self {
        self.channel_samples.insert(channel, samples);
        self
    }

    /// Report `time_step` for `channel`.
    pub fn with_channel_time_step(mut self, channel: u8, time_step: f64) -> Self {
        self.channel_time_steps.insert(channel, time_step);
        self
    }

    /// Report `WAIT` this many times after each arm before reporting `STOP`.
    pub fn with_polls_until_stop(mut self, polls: usize) -> Self {
        self.polls_until_stop = Some(polls);
        self
    }

    /// Never complete an acquisition.
    pub fn never_stop(mut self) -> Self {
        self.polls_until_stop = None;
        self
    }

    /// Delay every status poll.
    pub fn with_poll_latency(mut self, latency: Duration) -> Self {
        self.poll_latency = latency;
        self
    }

    /// Reading `channel` always fails.
    pub fn with_failing_channel(mut self, channel: u8) -> Self {
        self.failing_channels.insert(channel);
        self
    }

    /// `connect` always fails.
    pub fn with_failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// The `call`-th `configure_trigger` call (1-based) fails.
    ///
    /// The run configures the trigger once during setup and re-arms it before every
    /// capture, so `call = k + 1` fails the arm of capture `k`.
    pub fn with_failing_trigger_call(mut self, call: usize) -> Self {
        self.fail_trigger_call = Some(call);
        self
    }

    /// Every call received so far, in order.
    pub async fn calls(&self) -> Vec<ScopeCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of `connect` calls.
    pub async fn connect_count(&self) -> usize {
        self.count(|call| matches!(call, ScopeCall::Connect(_))).await
    }

    /// Number of `disconnect` calls.
    pub async fn disconnect_count(&self) -> usize {
        self.count(|call| matches!(call, ScopeCall::Disconnect)).await
    }

    /// Number of `configure_trigger` calls.
    pub async fn trigger_count(&self) -> usize {
        self.count(|call| matches!(call, ScopeCall::ConfigureTrigger)).await
    }

    /// Number of `channel_data` calls for `channel`.
    pub async fn fetch_count(&self, channel: u8) -> usize {
        self.count(|call| *call == ScopeCall::ChannelData(channel))
            .await
    }

    /// Whether the mock currently holds a connection.
    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    async fn count(&self, predicate: impl Fn(&ScopeCall) -> bool) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Record `call`, failing when the mock is not connected.
    async fn record_connected(&self, call: ScopeCall) -> Result<()> {
        let mut state = self.state.write().await;
        state.calls.push(call);
        if !state.connected {
            bail!("Mock oscilloscope is not connected");
        }
        Ok(())
    }

    fn waveform(&self, channel: u8, points: WaveformPoints) -> Vec<f64> {
        let available = self
            .channel_samples
            .get(&channel)
            .copied()
            .unwrap_or(self.samples);
        let count = match points {
            WaveformPoints::Max => available,
            WaveformPoints::Count(n) => available.min(n as usize),
        };
        let amplitude = f64::from(channel);
        let phase = f64::from(channel) * PI / 4.0;
        (0..count)
            .map(|i| amplitude * (2.0 * PI * i as f64 / 100.0 + phase).sin())
            .collect()
    }
}

#[async_trait]
impl InstrumentService for MockOscilloscope {
    async fn connect(&self, instrument: &InstrumentSpec) -> Result<String> {
        let mut state = self.state.write().await;
        state
            .calls
            .push(ScopeCall::Connect(instrument.address.clone()));
        if self.fail_connect {
            bail!("Mock connection refused by {}", instrument.address);
        }
        state.connected = true;
        Ok(MOCK_SCOPE_IDN.to_string())
    }

    async fn configure_channel(&self, channel: &ChannelSpec) -> Result<()> {
        self.record_connected(ScopeCall::ConfigureChannel(channel.number))
            .await
    }

    async fn configure_acquisition(&self, acquisition: &AcquisitionSpec) -> Result<()> {
        self.record_connected(ScopeCall::ConfigureAcquisition(acquisition.points))
            .await
    }

    async fn configure_timebase(&self, timebase: &TimebaseSpec) -> Result<()> {
        self.record_connected(ScopeCall::ConfigureTimebase(timebase.scale))
            .await
    }

    async fn configure_trigger(&self, _trigger: &TriggerSpec) -> Result<()> {
        self.record_connected(ScopeCall::ConfigureTrigger).await?;

        let mut state = self.state.write().await;
        state.trigger_calls += 1;
        if self.fail_trigger_call == Some(state.trigger_calls) {
            bail!("Mock trigger arm failed on call {}", state.trigger_calls);
        }
        state.polls_remaining = self.polls_until_stop.unwrap_or(usize::MAX);
        Ok(())
    }

    async fn trigger_status(&self) -> Result<TriggerStatus> {
        if !self.poll_latency.is_zero() {
            sleep(self.poll_latency).await;
        }
        self.record_connected(ScopeCall::TriggerStatus).await?;

        let mut state = self.state.write().await;
        if self.polls_until_stop.is_some() && state.polls_remaining == 0 {
            return Ok(TriggerStatus::Stop);
        }
        state.polls_remaining = state.polls_remaining.saturating_sub(1);
        Ok(TriggerStatus::Wait)
    }

    async fn channel_data(&self, channel: u8, points: WaveformPoints) -> Result<ChannelData> {
        self.record_connected(ScopeCall::ChannelData(channel))
            .await?;
        if self.failing_channels.contains(&channel) {
            return Err(anyhow!("Mock read timeout on channel {}", channel));
        }
        Ok(ChannelData {
            time_step: self
                .channel_time_steps
                .get(&channel)
                .copied()
                .unwrap_or(self.time_step),
            values: self.waveform(channel, points),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.calls.push(ScopeCall::Disconnect);
        state.connected = false;
        Ok(())
    }
}

// =============================================================================
// MockPressureGauge
// =============================================================================

#[derive(Debug, Default)]
struct GaugeState {
    connected: bool,
    connects: usize,
    disconnects: usize,
    reads: usize,
}

/// Simulated pressure gauge.
///
/// Reports `0,<pressure>` replies like a Pfeiffer single gauge, drifting upward
/// by 1 % per read.
pub struct MockPressureGauge {
    state: Arc<RwLock<GaugeState>>,
    base_pressure: f64,
    fail_connect: bool,
    fail_reads: bool,
    fail_disconnect: bool,
    fault: Option<(String, String)>,
}

impl Default for MockPressureGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPressureGauge {
    /// Gauge starting at 1.0e-3 mbar.
    pub fn new() -> Self {
        Self::with_pressure(1.0e-3)
    }

    /// Gauge starting at `base_pressure` mbar.
    pub fn with_pressure(base_pressure: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(GaugeState::default())),
            base_pressure,
            fail_connect: false,
            fail_reads: false,
            fail_disconnect: false,
            fault: None,
        }
    }

    /// Replies carry `status` instead of `0`, and `ERR` answers `error_code`.
    pub fn with_fault_status(mut self, status: &str, error_code: &str) -> Self {
        self.fault = Some((status.to_string(), error_code.to_string()));
        self
    }

    /// `connect` always fails.
    pub fn with_failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Every `read` fails.
    pub fn with_failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// `disconnect` fails.
    pub fn with_failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    /// Number of `connect` calls.
    pub async fn connect_count(&self) -> usize {
        self.state.read().await.connects
    }

    /// Number of `disconnect` calls.
    pub async fn disconnect_count(&self) -> usize {
        self.state.read().await.disconnects
    }

    /// Number of `read` calls.
    pub async fn read_count(&self) -> usize {
        self.state.read().await.reads
    }
}

#[async_trait]
impl AuxiliarySensor for MockPressureGauge {
    async fn connect(&self, params: &AuxiliarySpec) -> Result<()> {
        let mut state = self.state.write().await;
        state.connects += 1;
        if self.fail_connect {
            bail!("Mock serial port {} unavailable", params.port);
        }
        state.connected = true;
        Ok(())
    }

    async fn read(&self) -> Result<AuxiliaryReading> {
        let mut state = self.state.write().await;
        state.reads += 1;
        if !state.connected {
            bail!("Mock pressure gauge is not connected");
        }
        if self.fail_reads {
            bail!("Mock pressure gauge returned no data");
        }
        let pressure = self.base_pressure * (1.0 + 0.01 * (state.reads - 1) as f64);
        let status = self.fault.as_ref().map_or("0", |(status, _)| status.as_str());
        let reading =
            AuxiliaryReading::from_raw(Local::now(), &format!("{},{:.4E}", status, pressure));
        let faulted = reading.fault_status().is_some();
        match &self.fault {
            Some((_, error_code)) if faulted => Ok(reading.with_error_status(error_code.as_str())),
            _ => Ok(reading),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.disconnects += 1;
        state.connected = false;
        if self.fail_disconnect {
            bail!("Mock serial port close failed");
        }
        Ok(())
    }
}
