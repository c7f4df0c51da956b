//! Measurement run orchestration.
//!
//! A run moves through these states, strictly in order:
//!
//! ```text
//! Idle -> FoldersAllocated -> Connected -> Configured -> Capturing(0..N-1)
//!      -> Finalizing -> Disconnected
//! ```
//!
//! The configuration is validated before anything touches the disk or a device.
//! Once a device has connected it is always disconnected again, whether the run
//! completes or a fatal error escapes the capture loop. The oscilloscope goes first,
//! then the auxiliary sensor.
//!
//! # Error precedence
//!
//! If the run fails and teardown fails too, the run error is returned and the
//! teardown error is logged. If only teardown fails, its error is returned.

use crate::capture::CaptureController;
use crate::config::RunConfig;
use crate::error::{AppResult, DaqError};
use crate::instrument::{AuxiliarySensor, InstrumentService};
use crate::outcome::{CaptureWarning, Outcome};
use crate::storage::{
    write_run_metadata, CaptureSerializer, RunDirectoryAllocator, RunLocation, RunMetadata,
    RunStatus,
};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing started
    Idle,
    /// Run directory created
    FoldersAllocated,
    /// Oscilloscope (and auxiliary sensor, if any) connected
    Connected,
    /// Channels, acquisition, timebase and trigger applied
    Configured,
    /// Running the capture with this index
    Capturing(usize),
    /// Writing run metadata
    Finalizing,
    /// Devices released
    Disconnected,
}

/// Bookkeeping shared between the run body and teardown.
#[derive(Debug, Default)]
struct RunProgress {
    instrument_id: Option<String>,
    scope_connected: bool,
    auxiliary_connected: bool,
    captures_completed: usize,
    warnings: Vec<CaptureWarning>,
    metadata_written: bool,
}

/// Drives one measurement run at a time against a pair of owned device handles.
pub struct MeasurementRun {
    instrument: Arc<dyn InstrumentService>,
    auxiliary: Option<Arc<dyn AuxiliarySensor>>,
    state: RunState,
}

impl MeasurementRun {
    /// Orchestrator for `instrument` and an optional auxiliary sensor.
    ///
    /// The sensor is only used when the run configuration has an `auxiliary` block.
    pub fn new(
        instrument: Arc<dyn InstrumentService>,
        auxiliary: Option<Arc<dyn AuxiliarySensor>>,
    ) -> Self {
        Self {
            instrument,
            auxiliary,
            state: RunState::Idle,
        }
    }

    /// State reached by the most recent run.
    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "Run state change");
        self.state = next;
    }

    /// Execute a complete run and return its directory.
    ///
    /// Warnings collected along the way (skipped channels, missing auxiliary
    /// readings) are returned with the location and recorded in `README.json`.
    ///
    /// # Errors
    /// - [`DaqError::Configuration`] when `config` is invalid; no device is contacted
    /// - [`DaqError::Storage`] when the run directory cannot be created or written
    /// - [`DaqError::Connection`] when the oscilloscope cannot be reached
    /// - any fatal capture error ([`DaqError::Instrument`], [`DaqError::TriggerTimeout`], ...)
    #[instrument(name = "measurement_run", skip_all, fields(run = tracing::field::Empty))]
    pub async fn run(&mut self, config: &RunConfig) -> AppResult<Outcome<RunLocation>> {
        self.state = RunState::Idle;
        config.validate()?;

        let location = RunDirectoryAllocator::new(&config.storage.base_path).allocate_today()?;
        tracing::Span::current().record("run", location.name().as_str());
        self.transition(RunState::FoldersAllocated);
        info!(path = %location.path().display(), captures = config.measurement.capture_count, "Run started");

        let mut progress = RunProgress::default();
        let result = self.execute(config, &location, &mut progress).await;

        if let Err(err) = &result {
            error!(error = %err, captures_completed = progress.captures_completed, "Run aborted");
            if !progress.metadata_written {
                write_aborted_metadata(config, &location, &progress, err);
            }
        }

        let teardown = self.disconnect_all(&mut progress).await;
        self.transition(RunState::Disconnected);

        match (result, teardown) {
            (Err(err), Err(teardown_err)) => {
                error!(error = %teardown_err, "Teardown failed after run error");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(teardown_err)) => Err(teardown_err),
            (Ok(()), Ok(())) => {
                info!(
                    captures = progress.captures_completed,
                    warnings = progress.warnings.len(),
                    "Run completed"
                );
                Ok(Outcome::clean(location).with_warnings(progress.warnings))
            }
        }
    }

    async fn execute(
        &mut self,
        config: &RunConfig,
        location: &RunLocation,
        progress: &mut RunProgress,
    ) -> AppResult<()> {
        let instrument = Arc::clone(&self.instrument);
        let auxiliary = self.auxiliary.clone();

        let instrument_id = instrument
            .connect(&config.instrument)
            .await
            .map_err(|e| DaqError::connection("oscilloscope", &e))?;
        info!(device = %instrument_id, "Oscilloscope connected");
        progress.scope_connected = true;
        progress.instrument_id = Some(instrument_id);

        match (&auxiliary, &config.auxiliary) {
            (Some(sensor), Some(params)) => match sensor.connect(params).await {
                Ok(()) => progress.auxiliary_connected = true,
                Err(e) => {
                    warn!(
                        device = "auxiliary",
                        port = %params.port,
                        error = %format!("{e:#}"),
                        "Auxiliary sensor unavailable, continuing without it"
                    );
                    progress.warnings.push(CaptureWarning::AuxiliaryConnectFailed {
                        message: format!("{e:#}"),
                    });
                }
            },
            (None, Some(_)) => {
                warn!(device = "auxiliary", "Auxiliary sensor configured but no driver supplied");
            }
            _ => {}
        }
        self.transition(RunState::Connected);

        configure_instrument(instrument.as_ref(), config).await?;
        self.transition(RunState::Configured);

        let connected_auxiliary = auxiliary
            .as_deref()
            .filter(|_| progress.auxiliary_connected);
        let controller = CaptureController::new(instrument.as_ref(), connected_auxiliary);
        let serializer = CaptureSerializer::new(config.capture.time_step_policy);
        let capture_count = config.measurement.capture_count;

        for index in 0..capture_count {
            self.transition(RunState::Capturing(index));

            let (record, capture_warnings) = controller.run_capture(index, config).await?.into_parts();
            progress.warnings.extend(capture_warnings);

            let persisted = serializer.persist(location, &record)?;
            progress.warnings.extend(persisted.warnings);
            progress.captures_completed += 1;

            if index + 1 < capture_count {
                sleep(config.measurement.interval()?).await;
            }
        }

        self.transition(RunState::Finalizing);
        let mut metadata = RunMetadata::new(RunStatus::Completed, config.clone());
        if let Some(sensor) = connected_auxiliary {
            match sensor.read().await {
                Ok(reading) => metadata.pressure = Some(reading),
                Err(e) => {
                    warn!(
                        device = "auxiliary",
                        error = %format!("{e:#}"),
                        "Final auxiliary read failed"
                    );
                    progress.warnings.push(CaptureWarning::AuxiliaryReadFailed {
                        capture_index: None,
                        message: format!("{e:#}"),
                    });
                }
            }
        }
        metadata.instrument_id = progress.instrument_id.clone();
        metadata.captures_completed = progress.captures_completed;
        metadata.warnings = progress.warnings.clone();

        write_run_metadata(location, &metadata)?;
        progress.metadata_written = true;
        Ok(())
    }

    /// Release every device that connected. Auxiliary failures become warnings.
    async fn disconnect_all(&mut self, progress: &mut RunProgress) -> AppResult<()> {
        let mut result = Ok(());

        if progress.scope_connected {
            progress.scope_connected = false;
            match self.instrument.disconnect().await {
                Ok(()) => info!("Oscilloscope disconnected"),
                Err(e) => {
                    result = Err(DaqError::Instrument(format!(
                        "oscilloscope disconnect failed: {e:#}"
                    )));
                }
            }
        }

        if progress.auxiliary_connected {
            progress.auxiliary_connected = false;
            if let Some(sensor) = &self.auxiliary {
                if let Err(e) = sensor.disconnect().await {
                    warn!(
                        device = "auxiliary",
                        error = %format!("{e:#}"),
                        "Auxiliary disconnect failed"
                    );
                    progress
                        .warnings
                        .push(CaptureWarning::AuxiliaryDisconnectFailed {
                            message: format!("{e:#}"),
                        });
                }
            }
        }

        result
    }
}

/// Apply channel, acquisition, timebase and trigger settings, in that order.
async fn configure_instrument(instrument: &dyn InstrumentService, config: &RunConfig) -> AppResult<()> {
    let failed = |what: String| move |e: anyhow::Error| DaqError::Instrument(format!("{what}: {e:#}"));

    for channel in &config.channels {
        instrument
            .configure_channel(channel)
            .await
            .map_err(failed(format!("configuring channel {}", channel.number)))?;
    }
    instrument
        .configure_acquisition(&config.acquisition)
        .await
        .map_err(failed("configuring acquisition".to_string()))?;
    instrument
        .configure_timebase(&config.timebase)
        .await
        .map_err(failed("configuring timebase".to_string()))?;
    instrument
        .configure_trigger(&config.trigger)
        .await
        .map_err(failed("configuring trigger".to_string()))?;

    debug!(
        channels = config.channels.len(),
        points = %config.acquisition.points,
        timebase = config.timebase.scale,
        "Instrument configured"
    );
    Ok(())
}

/// Best effort: a run that failed still gets a README describing how far it got.
fn write_aborted_metadata(
    config: &RunConfig,
    location: &RunLocation,
    progress: &RunProgress,
    err: &DaqError,
) {
    let mut metadata = RunMetadata::new(RunStatus::Aborted, config.clone());
    metadata.instrument_id = progress.instrument_id.clone();
    metadata.captures_completed = progress.captures_completed;
    metadata.warnings = progress.warnings.clone();
    metadata.error = Some(err.to_string());

    if let Err(write_err) = write_run_metadata(location, &metadata) {
        warn!(error = %write_err, "Could not write metadata for aborted run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::instrument::mock::{MockOscilloscope, ScopeCall};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_in(tmp: &TempDir) -> RunConfig {
        let mut config = sample_config();
        config.storage.base_path = tmp.path().to_path_buf();
        config.capture.poll_interval = Duration::from_millis(1);
        config
    }

    #[tokio::test]
    async fn configuration_precedes_first_arm() {
        let tmp = TempDir::new().unwrap();
        let scope = Arc::new(MockOscilloscope::new().with_samples(3));
        let mut run = MeasurementRun::new(scope.clone(), None);

        let mut config = config_in(&tmp);
        config.measurement.capture_count = 1;
        run.run(&config).await.unwrap();

        let calls = scope.calls().await;
        let setup: Vec<&ScopeCall> = calls
            .iter()
            .filter(|call| !matches!(call, ScopeCall::TriggerStatus))
            .take(6)
            .collect();
        assert!(matches!(setup[0], ScopeCall::Connect(_)));
        assert_eq!(*setup[1], ScopeCall::ConfigureChannel(1));
        assert_eq!(*setup[2], ScopeCall::ConfigureChannel(2));
        assert!(matches!(setup[3], ScopeCall::ConfigureAcquisition(_)));
        assert_eq!(*setup[4], ScopeCall::ConfigureTimebase(1e-3));
        assert_eq!(*setup[5], ScopeCall::ConfigureTrigger);
        assert_eq!(calls.last(), Some(&ScopeCall::Disconnect));
        assert_eq!(run.state(), RunState::Disconnected);
    }

    #[tokio::test]
    async fn trigger_is_rearmed_for_every_capture() {
        let tmp = TempDir::new().unwrap();
        let scope = Arc::new(MockOscilloscope::new().with_samples(3));
        let mut run = MeasurementRun::new(scope.clone(), None);

        run.run(&config_in(&tmp)).await.unwrap();
        // One during configuration plus one per capture
        assert_eq!(scope.trigger_count().await, 4);
    }

    #[tokio::test]
    async fn invalid_config_stays_idle() {
        let tmp = TempDir::new().unwrap();
        let scope = Arc::new(MockOscilloscope::new());
        let mut run = MeasurementRun::new(scope.clone(), None);

        let mut config = config_in(&tmp);
        config.channels.clear();
        let err = run.run(&config).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(run.state(), RunState::Idle);
        assert!(scope.calls().await.is_empty());
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn scope_connect_failure_aborts_without_disconnect() {
        let tmp = TempDir::new().unwrap();
        let scope = Arc::new(MockOscilloscope::new().with_failing_connect());
        let mut run = MeasurementRun::new(scope.clone(), None);

        let err = run.run(&config_in(&tmp)).await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
        assert_eq!(scope.disconnect_count().await, 0);
    }

    #[tokio::test]
    async fn zero_captures_still_writes_metadata() {
        let tmp = TempDir::new().unwrap();
        let scope = Arc::new(MockOscilloscope::new());
        let mut run = MeasurementRun::new(scope.clone(), None);

        let mut config = config_in(&tmp);
        config.measurement.capture_count = 0;
        let location = run.run(&config).await.unwrap().value;

        let metadata = RunMetadata::load(&location.readme_path()).unwrap();
        assert_eq!(metadata.status, RunStatus::Completed);
        assert_eq!(metadata.captures_completed, 0);
        assert_eq!(metadata.instrument_id.as_deref(), Some(crate::instrument::mock::MOCK_SCOPE_IDN));
    }
}
