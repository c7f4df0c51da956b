//! Timebase sweeps.
//!
//! A sweep repeats a full measurement run once per [`SweepEntry`](crate::config::SweepEntry),
//! each with the entry's timebase scale (and description) applied to the base
//! configuration. Every entry gets its own run directory. Entries run one after
//! another with `capture.settle_interval` in between; the first failing entry
//! stops the sweep.

use crate::config::{RunConfig, SweepPlan};
use crate::error::{AppResult, DaqError};
use crate::outcome::Outcome;
use crate::run::MeasurementRun;
use crate::storage::RunLocation;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};

/// Runs a [`SweepPlan`] through one [`MeasurementRun`].
pub struct SweepRunner {
    run: MeasurementRun,
}

impl SweepRunner {
    /// Sweep runner reusing `run` for every entry.
    pub fn new(run: MeasurementRun) -> Self {
        Self { run }
    }

    /// Give back the orchestrator.
    pub fn into_inner(self) -> MeasurementRun {
        self.run
    }

    /// Run every entry of `plan` against `base`.
    ///
    /// Returns the run directories in plan order, with the warnings of all runs.
    ///
    /// # Errors
    /// - [`DaqError::Configuration`] when `plan` is empty or has an invalid entry
    /// - the first error of any entry's run; later entries do not run
    pub async fn run_sweep(
        &mut self,
        base: &RunConfig,
        plan: &SweepPlan,
    ) -> AppResult<Outcome<Vec<RunLocation>>> {
        if plan.is_empty() {
            return Err(DaqError::Configuration(
                "sweep plan has no entries".to_string(),
            ));
        }
        plan.validate()?;

        let total = plan.len();
        let settle = base.capture.settle_interval;
        let mut outcome = Outcome::clean(Vec::with_capacity(total));

        for (position, entry) in plan.entries().iter().enumerate() {
            let config = base.with_override(entry);
            let span = info_span!("sweep_entry", entry = position + 1, total, scale = entry.scale);

            info!(
                parent: &span,
                description = entry.description.as_deref().unwrap_or(""),
                "Starting sweep entry"
            );
            let (location, warnings) = match self.run.run(&config).instrument(span.clone()).await {
                Ok(result) => result.into_parts(),
                Err(err) => {
                    error!(parent: &span, error = %err, "Sweep entry failed, remaining entries skipped");
                    return Err(err);
                }
            };
            outcome.value.push(location);
            outcome.warnings.extend(warnings);

            if position + 1 < total {
                info!(settle = ?settle, "Settling before next sweep entry");
                sleep(settle).await;
            }
        }

        info!(runs = outcome.value.len(), "Sweep complete");
        Ok(outcome)
    }
}
