//! CLI Entry Point for scope-daq
//!
//! Subcommands:
//! - `run`: one measurement run from a configuration file
//! - `sweep`: one run per entry of the file's `sweep` list
//! - `probe`: connect to an oscilloscope and read one channel
//! - `validate`: load and validate a configuration, print it as JSON
//!
//! # Usage
//!
//! ```bash
//! scope-daq run --config measurement.toml
//! scope-daq sweep --config timebase_sweep.yaml --log-format json
//! scope-daq run --config measurement.toml --mock
//! scope-daq probe --address 192.168.1.101 --channel 2
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scope_daq::config::{ConfigDocument, InstrumentSpec, RunConfig, WaveformPoints};
use scope_daq::instrument::mock::{MockOscilloscope, MockPressureGauge};
use scope_daq::instrument::scpi::ScpiOscilloscope;
use scope_daq::instrument::{AuxiliarySensor, InstrumentService};
use scope_daq::logging::{self, OutputFormat, TracingConfig};
use scope_daq::outcome::CaptureWarning;
use scope_daq::run::MeasurementRun;
use scope_daq::sweep::SweepRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scope-daq")]
#[command(about = "Triggered oscilloscope captures with auxiliary pressure readings", long_about = None)]
struct Cli {
    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one measurement
    Run {
        /// Configuration file (.toml, .yaml or .yml)
        #[arg(long, short)]
        config: PathBuf,

        /// Use simulated devices instead of hardware
        #[arg(long)]
        mock: bool,
    },

    /// Run one measurement per sweep entry
    Sweep {
        /// Configuration file with a `sweep` (or `timebase_runs`) list
        #[arg(long, short)]
        config: PathBuf,

        /// Use simulated devices instead of hardware
        #[arg(long)]
        mock: bool,
    },

    /// Connect to an oscilloscope and read one channel
    Probe {
        /// Host or IP address, optionally with :port
        #[arg(long)]
        address: String,

        /// Channel to read
        #[arg(long, default_value_t = 1)]
        channel: u8,

        /// Points to read: "max" or a count
        #[arg(long, default_value = "max")]
        points: WaveformPoints,
    },

    /// Load and validate a configuration file
    Validate {
        /// Configuration file (.toml, .yaml or .yml)
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let tracing_config = TracingConfig::from_level_name(&cli.log_level)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run { config, mock } => {
            let document = load(&config)?;
            let (instrument, auxiliary) = devices(&document.run, mock);
            let mut run = MeasurementRun::new(instrument, auxiliary);

            let outcome = run.run(&document.run).await?;
            println!("Run written to {}", outcome.value.path().display());
            report_warnings(&outcome.warnings);
        }
        Commands::Sweep { config, mock } => {
            let document = load(&config)?;
            let (instrument, auxiliary) = devices(&document.run, mock);
            let mut sweep = SweepRunner::new(MeasurementRun::new(instrument, auxiliary));

            let outcome = sweep.run_sweep(&document.run, &document.sweep).await?;
            for location in &outcome.value {
                println!("Run written to {}", location.path().display());
            }
            report_warnings(&outcome.warnings);
        }
        Commands::Probe {
            address,
            channel,
            points,
        } => {
            probe(&address, channel, points).await?;
        }
        Commands::Validate { config } => {
            let document = load(&config)?;
            document.run.validate()?;
            let resolved = serde_json::json!({
                "run": document.run,
                "sweep": document.sweep,
            });
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<ConfigDocument> {
    ConfigDocument::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Build device handles for a run.
fn devices(
    config: &RunConfig,
    mock: bool,
) -> (
    Arc<dyn InstrumentService>,
    Option<Arc<dyn AuxiliarySensor>>,
) {
    if mock {
        tracing::info!("Using simulated devices");
        let scope = MockOscilloscope::new().with_poll_latency(Duration::from_millis(20));
        let gauge = config
            .auxiliary
            .as_ref()
            .map(|_| Arc::new(MockPressureGauge::new()) as Arc<dyn AuxiliarySensor>);
        return (Arc::new(scope), gauge);
    }

    (Arc::new(ScpiOscilloscope::new()), serial_gauge(config))
}

#[cfg(feature = "instrument_serial")]
fn serial_gauge(config: &RunConfig) -> Option<Arc<dyn AuxiliarySensor>> {
    use scope_daq::instrument::pressure::SerialPressureGauge;

    config
        .auxiliary
        .as_ref()
        .map(|_| Arc::new(SerialPressureGauge::new()) as Arc<dyn AuxiliarySensor>)
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_gauge(config: &RunConfig) -> Option<Arc<dyn AuxiliarySensor>> {
    if config.auxiliary.is_some() {
        tracing::warn!(
            "Auxiliary sensor configured but scope-daq was built without the instrument_serial feature"
        );
    }
    None
}

async fn probe(address: &str, channel: u8, points: WaveformPoints) -> Result<()> {
    let scope = ScpiOscilloscope::new();
    let spec = InstrumentSpec {
        address: address.to_string(),
        port: None,
    };

    let identity = scope.connect(&spec).await?;
    println!("Connected: {}", identity);

    let result = scope.channel_data(channel, points).await;
    scope.disconnect().await?;
    let data = result?;

    println!(
        "Channel {}: {} samples, time step {:e} s",
        channel,
        data.values.len(),
        data.time_step
    );
    if let (Some(min), Some(max)) = (
        data.values.iter().copied().reduce(f64::min),
        data.values.iter().copied().reduce(f64::max),
    ) {
        println!("Range: {:e} V .. {:e} V", min, max);
    }
    Ok(())
}

fn report_warnings(warnings: &[CaptureWarning]) {
    if warnings.is_empty() {
        return;
    }
    println!("{} warning(s):", warnings.len());
    for warning in warnings {
        println!("  - {}", warning);
    }
}
