//! Degraded results.
//!
//! Operations in the capture pipeline have three possible endings:
//!
//! - `Ok(Outcome)` with no warnings: everything worked.
//! - `Ok(Outcome)` with warnings: the operation completed but something was skipped
//!   (a channel, a pressure reading). The warnings say what.
//! - `Err(DaqError)`: a fatal failure.
//!
//! Keeping warnings as values lets callers and tests assert on them instead of on
//! log text. Every warning is also logged where it is raised.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A non-fatal problem recorded while producing a value.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureWarning {
    /// A displayed channel could not be read; it is missing from the capture.
    #[error("capture {capture_index}: channel {channel} fetch failed: {message}")]
    ChannelFetchFailed {
        capture_index: usize,
        channel: u8,
        message: String,
    },

    /// The auxiliary sensor did not deliver a reading.
    #[error("auxiliary read failed{}: {message}", capture_suffix(.capture_index))]
    AuxiliaryReadFailed {
        capture_index: Option<usize>,
        message: String,
    },

    /// The auxiliary sensor could not be connected; the run proceeds without it.
    #[error("auxiliary connect failed: {message}")]
    AuxiliaryConnectFailed { message: String },

    /// The auxiliary sensor did not disconnect cleanly.
    #[error("auxiliary disconnect failed: {message}")]
    AuxiliaryDisconnectFailed { message: String },

    /// Channels in one capture report different sample intervals.
    #[error(
        "capture {capture_index}: channel {channel} time step {time_step:e} differs from reference {reference:e}"
    )]
    TimeStepMismatch {
        capture_index: usize,
        channel: u8,
        time_step: f64,
        reference: f64,
    },
}

fn capture_suffix(capture_index: &Option<usize>) -> String {
    capture_index
        .map(|index| format!(" for capture {index}"))
        .unwrap_or_default()
}

/// A value plus the warnings collected while producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    /// The produced value.
    pub value: T,
    /// Non-fatal problems, in the order they occurred.
    pub warnings: Vec<CaptureWarning>,
}

impl<T> Outcome<T> {
    /// An outcome with no warnings.
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    /// Add a warning.
    pub fn with_warning(mut self, warning: CaptureWarning) -> Self {
        self.warnings.push(warning);
        self
    }

    /// Add several warnings.
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = CaptureWarning>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// True when at least one warning was recorded.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Transform the value, keeping the warnings.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }

    /// Split into value and warnings.
    pub fn into_parts(self) -> (T, Vec<CaptureWarning>) {
        (self.value, self.warnings)
    }
}
