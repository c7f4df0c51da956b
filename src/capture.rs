//! Capture cycle.
//!
//! One capture is: arm the trigger, poll until the acquisition has stopped, read
//! every displayed channel, take one auxiliary reading, and return the result as a
//! [`CaptureRecord`].
//!
//! Only arming and status polling can fail a capture. Channel and auxiliary read
//! failures leave the affected data out of the record and are reported as
//! [`CaptureWarning`]s.

use crate::config::{CaptureSettings, ChannelSpec, Coupling, RunConfig};
use crate::error::{AppResult, DaqError};
use crate::instrument::{AuxiliaryReading, AuxiliarySensor, InstrumentService};
use crate::outcome::{CaptureWarning, Outcome};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Samples and settings of one channel within a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSample {
    /// Seconds between samples as reported by the instrument
    pub time_step: f64,
    /// Sample values
    pub values: Vec<f64>,
    /// Vertical scale the channel was configured with
    pub scale: f64,
    /// Coupling the channel was configured with
    pub coupling: Coupling,
}

/// Data gathered by one trigger-to-readout cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    /// 0-based position of the capture within its run
    pub capture_index: usize,
    /// When the acquisition completed
    pub timestamp: DateTime<Local>,
    /// Channels that were read successfully, keyed by channel number
    pub channels: BTreeMap<u8, ChannelSample>,
    /// Channel numbers in the order they were read (configuration order)
    pub read_order: Vec<u8>,
    /// Auxiliary reading taken after the channels, if any
    pub auxiliary: Option<AuxiliaryReading>,
}

impl CaptureRecord {
    /// An empty record.
    pub fn new(capture_index: usize, timestamp: DateTime<Local>) -> Self {
        Self {
            capture_index,
            timestamp,
            channels: BTreeMap::new(),
            read_order: Vec::new(),
            auxiliary: None,
        }
    }

    /// Add a channel read with the settings of `spec`.
    pub fn insert_channel(&mut self, spec: &ChannelSpec, time_step: f64, values: Vec<f64>) {
        if !self.read_order.contains(&spec.number) {
            self.read_order.push(spec.number);
        }
        self.channels.insert(
            spec.number,
            ChannelSample {
                time_step,
                values,
                scale: spec.scale,
                coupling: spec.coupling,
            },
        );
    }

    /// Length of the longest channel.
    pub fn max_samples(&self) -> usize {
        self.channels
            .values()
            .map(|sample| sample.values.len())
            .max()
            .unwrap_or(0)
    }
}

/// Runs capture cycles against borrowed devices.
pub struct CaptureController<'a> {
    instrument: &'a dyn InstrumentService,
    auxiliary: Option<&'a dyn AuxiliarySensor>,
}

impl<'a> CaptureController<'a> {
    /// Create a controller. `auxiliary` is `None` when no sensor is connected.
    pub fn new(
        instrument: &'a dyn InstrumentService,
        auxiliary: Option<&'a dyn AuxiliarySensor>,
    ) -> Self {
        Self {
            instrument,
            auxiliary,
        }
    }

    /// Perform capture `capture_index` with the settings of `config`.
    ///
    /// # Errors
    /// - [`DaqError::Instrument`] when arming or status polling fails
    /// - [`DaqError::TriggerTimeout`] when `capture.trigger_timeout` is set and elapses
    #[instrument(name = "capture", skip_all, fields(capture = capture_index))]
    pub async fn run_capture(
        &self,
        capture_index: usize,
        config: &RunConfig,
    ) -> AppResult<Outcome<CaptureRecord>> {
        self.instrument
            .configure_trigger(&config.trigger)
            .await
            .map_err(|e| {
                DaqError::Instrument(format!(
                    "capture {capture_index}: failed to arm trigger: {e:#}"
                ))
            })?;
        debug!("Trigger armed");

        self.wait_for_acquisition(capture_index, &config.capture)
            .await?;

        let mut record = CaptureRecord::new(capture_index, Local::now());
        let mut warnings = Vec::new();

        for channel in config.displayed_channels() {
            match self
                .instrument
                .channel_data(channel.number, config.acquisition.points)
                .await
            {
                Ok(data) => {
                    debug!(
                        channel = channel.number,
                        samples = data.values.len(),
                        "Channel read"
                    );
                    record.insert_channel(channel, data.time_step, data.values);
                }
                Err(e) => {
                    let err = DaqError::TransientCapture {
                        device: format!("channel {}", channel.number),
                        message: format!("{e:#}"),
                    };
                    warn!(
                        capture = capture_index,
                        channel = channel.number,
                        error = %err,
                        "Channel fetch failed, omitting it from the capture"
                    );
                    warnings.push(CaptureWarning::ChannelFetchFailed {
                        capture_index,
                        channel: channel.number,
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        if let Some(auxiliary) = self.auxiliary {
            match auxiliary.read().await {
                Ok(reading) => record.auxiliary = Some(reading),
                Err(e) => {
                    warn!(
                        capture = capture_index,
                        device = "auxiliary",
                        error = %format!("{e:#}"),
                        "Auxiliary read failed, capture continues without it"
                    );
                    warnings.push(CaptureWarning::AuxiliaryReadFailed {
                        capture_index: Some(capture_index),
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        info!(
            channels = record.channels.len(),
            degraded = !warnings.is_empty(),
            "Capture complete"
        );
        Ok(Outcome::clean(record).with_warnings(warnings))
    }

    /// Poll the trigger status until the acquisition has stopped.
    async fn wait_for_acquisition(
        &self,
        capture_index: usize,
        settings: &CaptureSettings,
    ) -> AppResult<()> {
        let started = Instant::now();
        loop {
            let status = self.instrument.trigger_status().await.map_err(|e| {
                DaqError::Instrument(format!(
                    "capture {capture_index}: trigger status query failed: {e:#}"
                ))
            })?;
            if status.is_complete() {
                debug!(waited = ?started.elapsed(), "Acquisition complete");
                return Ok(());
            }

            if let Some(limit) = settings.trigger_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(DaqError::TriggerTimeout {
                        capture_index,
                        waited,
                    });
                }
            }

            debug!(%status, "Waiting for trigger");
            sleep(settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::AuxiliarySpec;
    use crate::instrument::mock::{MockOscilloscope, MockPressureGauge, ScopeCall};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn fast_config() -> RunConfig {
        let mut config = sample_config();
        config.capture.poll_interval = Duration::from_millis(1);
        config
    }

    async fn connected(scope: MockOscilloscope) -> MockOscilloscope {
        scope.connect(&fast_config().instrument).await.unwrap();
        scope
    }

    #[tokio::test]
    async fn captures_all_displayed_channels() {
        let scope = connected(MockOscilloscope::new().with_samples(10).with_polls_until_stop(3)).await;
        let controller = CaptureController::new(&scope, None);

        let outcome = controller.run_capture(0, &fast_config()).await.unwrap();
        assert!(!outcome.is_degraded());

        let record = outcome.value;
        assert_eq!(record.capture_index, 0);
        assert_eq!(record.channels.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(record.channels[&2].coupling, Coupling::Ac);
        assert_eq!(record.channels[&2].scale, 1.0);
        assert_eq!(record.max_samples(), 10);
        assert!(record.auxiliary.is_none());

        let polls = scope
            .calls()
            .await
            .into_iter()
            .filter(|call| *call == ScopeCall::TriggerStatus)
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn read_order_follows_configuration() {
        let mut config = fast_config();
        config.channels.reverse();
        config.trigger.source = 2;
        let scope = connected(MockOscilloscope::new().with_samples(2)).await;

        let record = CaptureController::new(&scope, None)
            .run_capture(0, &config)
            .await
            .unwrap()
            .value;
        assert_eq!(record.read_order, vec![2, 1]);
        assert_eq!(record.channels.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn hidden_channels_are_not_fetched() {
        let mut config = fast_config();
        config.channels[1].display = false;
        let scope = connected(MockOscilloscope::new().with_samples(4)).await;

        let record = CaptureController::new(&scope, None)
            .run_capture(1, &config)
            .await
            .unwrap()
            .value;
        assert_eq!(record.channels.len(), 1);
        assert_eq!(scope.fetch_count(2).await, 0);
    }

    #[tokio::test]
    async fn channel_failure_degrades_capture() {
        let scope = connected(MockOscilloscope::new().with_samples(4).with_failing_channel(2)).await;

        let outcome = CaptureController::new(&scope, None)
            .run_capture(0, &fast_config())
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert!(matches!(
            outcome.warnings.as_slice(),
            [CaptureWarning::ChannelFetchFailed { channel: 2, .. }]
        ));
        assert!(outcome.value.channels.contains_key(&1));
        assert!(!outcome.value.channels.contains_key(&2));
    }

    #[tokio::test]
    #[traced_test]
    async fn channel_failure_is_logged_with_context() {
        let scope = connected(MockOscilloscope::new().with_samples(4).with_failing_channel(1)).await;

        CaptureController::new(&scope, None)
            .run_capture(5, &fast_config())
            .await
            .unwrap();

        assert!(logs_contain("Channel fetch failed"));
        assert!(logs_contain("channel=1"));
        assert!(logs_contain("Mock read timeout on channel 1"));
    }

    #[tokio::test]
    async fn auxiliary_reading_is_attached() {
        let scope = connected(MockOscilloscope::new().with_samples(2)).await;
        let gauge = MockPressureGauge::with_pressure(5.0e-4);
        gauge.connect(&AuxiliarySpec::default()).await.unwrap();

        let record = CaptureController::new(&scope, Some(&gauge))
            .run_capture(0, &fast_config())
            .await
            .unwrap()
            .value;
        assert_eq!(record.auxiliary.and_then(|r| r.value), Some(5.0e-4));
    }

    #[tokio::test]
    async fn auxiliary_failure_degrades_capture() {
        let scope = connected(MockOscilloscope::new().with_samples(2)).await;
        let gauge = MockPressureGauge::new().with_failing_reads();
        gauge.connect(&AuxiliarySpec::default()).await.unwrap();

        let outcome = CaptureController::new(&scope, Some(&gauge))
            .run_capture(3, &fast_config())
            .await
            .unwrap();
        assert!(outcome.value.auxiliary.is_none());
        assert_eq!(outcome.value.channels.len(), 2);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [CaptureWarning::AuxiliaryReadFailed {
                capture_index: Some(3),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn arm_failure_is_fatal() {
        let scope = connected(MockOscilloscope::new().with_failing_trigger_call(1)).await;

        let err = CaptureController::new(&scope, None)
            .run_capture(0, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Instrument(_)));
        assert!(err.is_fatal());
        assert_eq!(scope.fetch_count(1).await, 0);
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let mut config = fast_config();
        config.capture.trigger_timeout = Some(Duration::from_millis(20));
        let scope = connected(MockOscilloscope::new().never_stop()).await;

        let err = CaptureController::new(&scope, None)
            .run_capture(2, &config)
            .await
            .unwrap_err();
        match err {
            DaqError::TriggerTimeout {
                capture_index,
                waited,
            } => {
                assert_eq!(capture_index, 2);
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
