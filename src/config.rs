//! Run configuration.
//!
//! Configuration is loaded with Figment from:
//! 1. a TOML or YAML file (chosen by extension)
//! 2. environment variables prefixed with `SCOPE_DAQ_`, nested with `__`
//!    (e.g. `SCOPE_DAQ_MEASUREMENT__CAPTURE_COUNT=20`)
//!
//! Every block rejects unknown keys, so a misspelled field fails at load time
//! instead of silently falling back to a default deep inside a run. Key aliases
//! accept the names used by the older YAML measurement files (`oscilloscope`,
//! `ip_address`, `captures`, `interval`, `timebase_runs`), and a `save_path`
//! inside the oscilloscope block is moved to `storage.base_path`.
//!
//! # Example
//!
//! ```toml
//! [instrument]
//! address = "192.168.1.101"
//!
//! [storage]
//! base_path = "measurements"
//!
//! [[channels]]
//! number = 1
//! scale = 0.5
//! coupling = "DC"
//!
//! [timebase]
//! scale = 1e-3
//!
//! [trigger]
//! source = 1
//! level = 0.25
//! mode = "SING"
//!
//! [measurement]
//! capture_count = 10
//! interval_seconds = 2.0
//!
//! [auxiliary]
//! port = "/dev/ttyUSB0"
//!
//! [[sweep]]
//! scale = 1e-4
//! description = "fast edge"
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    value::{Dict, Tag, Value},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest analog channel number on the supported oscilloscopes.
pub const MAX_CHANNEL: u8 = 4;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SCOPE_DAQ_";

// =============================================================================
// RunConfig
// =============================================================================

/// Complete, validated configuration for one measurement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Oscilloscope connection
    #[serde(alias = "oscilloscope")]
    pub instrument: InstrumentSpec,

    /// Where run directories are created
    #[serde(default)]
    pub storage: StorageSpec,

    /// Channel setup, applied in order
    pub channels: Vec<ChannelSpec>,

    /// Acquisition memory depth
    #[serde(default)]
    pub acquisition: AcquisitionSpec,

    /// Horizontal setup
    pub timebase: TimebaseSpec,

    /// Edge trigger setup
    pub trigger: TriggerSpec,

    /// Capture count and pacing
    pub measurement: MeasurementSpec,

    /// Optional pressure gauge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<AuxiliarySpec>,

    /// Polling, timeout and alignment behaviour
    #[serde(default)]
    pub capture: CaptureSettings,
}

/// Oscilloscope connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentSpec {
    /// Host name or IP address, optionally with `:port`
    #[serde(alias = "ip_address")]
    pub address: String,

    /// TCP port override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Output location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSpec {
    /// Root directory; runs go to `<base_path>/<YYYY-MM-DD>/run_<NNN>`
    #[serde(default = "default_base_path", alias = "save_path")]
    pub base_path: PathBuf,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

/// One analog channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSpec {
    /// Channel number (1-based)
    pub number: u8,
    /// Vertical scale in V/div
    pub scale: f64,
    /// Input coupling
    #[serde(default)]
    pub coupling: Coupling,
    /// Whether the channel is shown and captured
    #[serde(default = "default_true")]
    pub display: bool,
}

/// Channel input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coupling {
    /// AC coupled
    #[serde(alias = "ac")]
    Ac,
    /// DC coupled
    #[default]
    #[serde(alias = "dc")]
    Dc,
    /// Input grounded
    #[serde(alias = "gnd")]
    Gnd,
}

impl Coupling {
    /// SCPI mnemonic.
    pub fn as_scpi(self) -> &'static str {
        match self {
            Coupling::Ac => "AC",
            Coupling::Dc => "DC",
            Coupling::Gnd => "GND",
        }
    }
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scpi())
    }
}

/// Acquisition setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionSpec {
    /// Number of points to acquire and read back per channel
    #[serde(default)]
    pub points: WaveformPoints,
}

/// Requested number of waveform points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "PointsRepr", into = "PointsRepr")]
pub enum WaveformPoints {
    /// Whatever the instrument holds
    #[default]
    Max,
    /// An explicit point count
    Count(u32),
}

impl WaveformPoints {
    /// SCPI argument for `:WAV:POIN`.
    pub fn as_scpi(self) -> String {
        match self {
            WaveformPoints::Max => "MAX".to_string(),
            WaveformPoints::Count(n) => n.to_string(),
        }
    }
}

impl fmt::Display for WaveformPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveformPoints::Max => f.write_str("max"),
            WaveformPoints::Count(n) => write!(f, "{n}"),
        }
    }
}

impl std::str::FromStr for WaveformPoints {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WaveformPoints::try_from(PointsRepr::Text(s.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PointsRepr {
    Count(u32),
    Text(String),
}

impl TryFrom<PointsRepr> for WaveformPoints {
    type Error = String;

    fn try_from(repr: PointsRepr) -> Result<Self, Self::Error> {
        match repr {
            PointsRepr::Count(0) => Err("points must be positive".to_string()),
            PointsRepr::Count(n) => Ok(WaveformPoints::Count(n)),
            PointsRepr::Text(text) if text.eq_ignore_ascii_case("max") => {
                Ok(WaveformPoints::Max)
            }
            PointsRepr::Text(text) => match text.trim().parse::<u32>() {
                Ok(n) if n > 0 => Ok(WaveformPoints::Count(n)),
                _ => Err(format!("points must be \"max\" or a positive integer, got '{text}'")),
            },
        }
    }
}

impl From<WaveformPoints> for PointsRepr {
    fn from(points: WaveformPoints) -> Self {
        match points {
            WaveformPoints::Max => PointsRepr::Text("max".to_string()),
            WaveformPoints::Count(n) => PointsRepr::Count(n),
        }
    }
}

/// Horizontal setup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimebaseSpec {
    /// Seconds per division
    pub scale: f64,
    /// Horizontal offset in seconds
    #[serde(default)]
    pub offset: f64,
}

/// Edge trigger setup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerSpec {
    /// Source channel number
    pub source: u8,
    /// Trigger level in volts
    pub level: f64,
    /// Sweep mode
    #[serde(default)]
    pub mode: TriggerMode,
}

/// Trigger sweep mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Free running
    #[serde(rename = "AUTO", alias = "auto")]
    Auto,
    /// Acquire on every trigger event
    #[serde(rename = "NORM", alias = "normal", alias = "NORMAL")]
    Normal,
    /// Acquire once, then stop
    #[default]
    #[serde(rename = "SING", alias = "single", alias = "SINGLE")]
    Single,
}

impl TriggerMode {
    /// SCPI mnemonic for `:TRIG:SWE`.
    pub fn as_scpi(self) -> &'static str {
        match self {
            TriggerMode::Auto => "AUTO",
            TriggerMode::Normal => "NORM",
            TriggerMode::Single => "SING",
        }
    }
}

/// Capture count and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementSpec {
    /// Number of trigger/capture cycles
    #[serde(alias = "captures")]
    pub capture_count: usize,

    /// Pause between captures in seconds
    #[serde(alias = "interval")]
    pub interval_seconds: f64,

    /// Free text describing the run (set per sweep entry)
    #[serde(
        default,
        alias = "timebase_description",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
}

impl MeasurementSpec {
    /// Pause between captures.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] when `interval_seconds` is negative, NaN or too
    /// large for a [`Duration`].
    pub fn interval(&self) -> AppResult<Duration> {
        if self.interval_seconds < 0.0 {
            return Err(DaqError::Configuration(format!(
                "measurement interval must be a non-negative number of seconds, got {}",
                self.interval_seconds
            )));
        }
        Duration::try_from_secs_f64(self.interval_seconds).map_err(|e| {
            DaqError::Configuration(format!(
                "measurement interval {} s cannot be used: {e}",
                self.interval_seconds
            ))
        })
    }
}

/// Serial connection parameters for the pressure gauge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuxiliarySpec {
    /// Serial device path
    #[serde(default = "default_serial_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate", alias = "baudrate")]
    pub baud_rate: u32,
}

impl Default for AuxiliarySpec {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// Timing and alignment behaviour of the capture loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureSettings {
    /// Delay between trigger status polls
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Give up waiting for a trigger after this long; unbounded when absent
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub trigger_timeout: Option<Duration>,

    /// Pause between sweep entries
    #[serde(with = "humantime_serde", default = "default_settle_interval")]
    pub settle_interval: Duration,

    /// What to do when channels report different time steps
    #[serde(default)]
    pub time_step_policy: TimeStepPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            trigger_timeout: None,
            settle_interval: default_settle_interval(),
            time_step_policy: TimeStepPolicy::default(),
        }
    }
}

/// Handling of channels whose sample interval differs from the reference channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeStepPolicy {
    /// Write the capture using the reference time step, say nothing
    #[default]
    Tolerate,
    /// Write the capture and record a warning
    Warn,
    /// Refuse to write the capture (fatal)
    Reject,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("measurements")
}

fn default_true() -> bool {
    true
}

fn default_serial_port() -> String {
    "/dev/ttyS0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_settle_interval() -> Duration {
    Duration::from_secs(5)
}

impl RunConfig {
    /// Check the invariants a run depends on.
    ///
    /// Called before any device is touched.
    pub fn validate(&self) -> AppResult<()> {
        if self.instrument.address.trim().is_empty() {
            return Err(DaqError::Configuration(
                "instrument address must not be empty".to_string(),
            ));
        }

        if !self.channels.iter().any(|ch| ch.display) {
            return Err(DaqError::Configuration(
                "at least one channel must have display = true".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !(1..=MAX_CHANNEL).contains(&channel.number) {
                return Err(DaqError::Configuration(format!(
                    "channel number {} out of range 1..={}",
                    channel.number, MAX_CHANNEL
                )));
            }
            if !seen.insert(channel.number) {
                return Err(DaqError::Configuration(format!(
                    "channel {} configured more than once",
                    channel.number
                )));
            }
            if !(channel.scale.is_finite() && channel.scale > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "channel {} scale must be positive, got {}",
                    channel.number, channel.scale
                )));
            }
        }

        if !(1..=MAX_CHANNEL).contains(&self.trigger.source) {
            return Err(DaqError::Configuration(format!(
                "trigger source {} out of range 1..={}",
                self.trigger.source, MAX_CHANNEL
            )));
        }
        if self.channel(self.trigger.source).is_none() {
            return Err(DaqError::Configuration(format!(
                "trigger source channel {} is not configured",
                self.trigger.source
            )));
        }
        if !self.trigger.level.is_finite() {
            return Err(DaqError::Configuration(
                "trigger level must be finite".to_string(),
            ));
        }

        if !(self.timebase.scale.is_finite() && self.timebase.scale > 0.0) {
            return Err(DaqError::Configuration(format!(
                "timebase scale must be positive, got {}",
                self.timebase.scale
            )));
        }
        if !self.timebase.offset.is_finite() {
            return Err(DaqError::Configuration(
                "timebase offset must be finite".to_string(),
            ));
        }

        self.measurement.interval()?;

        if self.capture.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "capture.poll_interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Channels that are captured, in configuration order.
    pub fn displayed_channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(|ch| ch.display)
    }

    /// Look up the configuration of one channel.
    pub fn channel(&self, number: u8) -> Option<&ChannelSpec> {
        self.channels.iter().find(|ch| ch.number == number)
    }

    /// Derive the configuration for one sweep entry.
    pub fn with_override(&self, entry: &SweepEntry) -> RunConfig {
        let mut config = self.clone();
        config.timebase.scale = entry.scale;
        if let Some(description) = &entry.description {
            config.measurement.description = Some(description.clone());
        }
        config
    }
}

// =============================================================================
// Sweep plan
// =============================================================================

/// One variant of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepEntry {
    /// Timebase scale in seconds per division
    pub scale: f64,
    /// Free text copied into the run's measurement description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Ordered list of sweep entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SweepPlan(pub Vec<SweepEntry>);

impl SweepPlan {
    /// Entries in execution order.
    pub fn entries(&self) -> &[SweepEntry] {
        &self.0
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there is nothing to sweep.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check every entry can be applied to a run.
    pub fn validate(&self) -> AppResult<()> {
        for (index, entry) in self.0.iter().enumerate() {
            if !(entry.scale.is_finite() && entry.scale > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "sweep entry {} has invalid timebase scale {}",
                    index + 1,
                    entry.scale
                )));
            }
        }
        Ok(())
    }
}

impl From<Vec<SweepEntry>> for SweepPlan {
    fn from(entries: Vec<SweepEntry>) -> Self {
        Self(entries)
    }
}

// =============================================================================
// Loading
// =============================================================================

/// A configuration file: the base run plus an optional sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    /// Base run configuration
    pub run: RunConfig,
    /// Sweep entries (empty when the file has none)
    pub sweep: SweepPlan,
}

impl ConfigDocument {
    /// Load a configuration file merged with `SCOPE_DAQ_` environment overrides.
    ///
    /// Files ending in `.yaml`/`.yml` are read as YAML, anything else as TOML.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract from an already assembled figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let mut dict: Dict = figment.extract()?;
        let sweep_value = take_sweep(&mut dict)?;
        lift_legacy_save_path(&mut dict);

        let run: RunConfig = Figment::from(Serialized::defaults(dict)).extract()?;
        let sweep = match sweep_value {
            Some(value) => value.deserialize::<SweepPlan>()?,
            None => SweepPlan::default(),
        };
        sweep.validate()?;

        Ok(Self { run, sweep })
    }
}

fn take_sweep(dict: &mut Dict) -> AppResult<Option<Value>> {
    match (dict.remove("sweep"), dict.remove("timebase_runs")) {
        (Some(_), Some(_)) => Err(DaqError::Configuration(
            "use either 'sweep' or 'timebase_runs', not both".to_string(),
        )),
        (sweep, legacy) => Ok(sweep.or(legacy)),
    }
}

/// Older files keep `save_path` inside the oscilloscope block.
/// An explicit `storage.base_path` wins.
fn lift_legacy_save_path(dict: &mut Dict) {
    let save_path = ["instrument", "oscilloscope"]
        .iter()
        .find_map(|key| match dict.get_mut(*key) {
            Some(Value::Dict(_, block)) => block.remove("save_path"),
            _ => None,
        });
    let Some(save_path) = save_path else {
        return;
    };

    let storage = dict
        .entry("storage".to_string())
        .or_insert_with(|| Value::Dict(Tag::Default, Dict::new()));
    if let Value::Dict(_, block) = storage {
        if !block.contains_key("base_path") && !block.contains_key("save_path") {
            block.insert("base_path".to_string(), save_path);
        }
    }
}
