//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole capture
//! pipeline. Using the `thiserror` crate, it provides a centralized and consistent way
//! to classify the failures that can occur while running a measurement.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`Config`**: the run configuration is invalid or could not be
//!   loaded. Always fatal: the run never starts, or a sweep aborts.
//! - **`Connection`**: a device could not be reached. Fatal for the oscilloscope; the
//!   orchestrator downgrades it to a warning for the auxiliary sensor.
//! - **`Instrument`** / **`TriggerTimeout`**: the oscilloscope failed after connecting
//!   (arming, status polling, configuration). Fatal.
//! - **`TransientCapture`**: a single channel or sensor fetch failed. Never propagated out
//!   of a capture cycle; it is turned into a [`CaptureWarning`](crate::outcome::CaptureWarning).
//! - **`Storage`**, **`Serialization`**, **`Csv`**: run artifacts could not be
//!   created or written. Fatal.
//!
//! Device drivers themselves return `anyhow::Result`; the orchestration layer decides
//! which `DaqError` kind a driver failure maps to.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the capture pipeline can report.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Connection to {device} failed: {message}")]
    Connection { device: String, message: String },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Trigger did not complete for capture {capture_index} after {waited:?}")]
    TriggerTimeout {
        capture_index: usize,
        waited: Duration,
    },

    #[error("Transient capture error on {device}: {message}")]
    TransientCapture { device: String, message: String },

    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Channel time steps differ: {0}")]
    TimeStepMismatch(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Builds a `Storage` error for `path`.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaqError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Builds a `Connection` error from a driver failure.
    pub fn connection(device: impl Into<String>, err: &anyhow::Error) -> Self {
        DaqError::Connection {
            device: device.into(),
            message: format!("{err:#}"),
        }
    }

    /// Whether this error must abort the current run.
    ///
    /// Only `TransientCapture` is recoverable; callers that receive it degrade the
    /// capture instead of stopping.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DaqError::TransientCapture { .. })
    }

    /// Whether this error stems from invalid or unreadable configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DaqError::Configuration(_) | DaqError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Connection {
            device: "oscilloscope".into(),
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Connection to oscilloscope failed: connection refused"
        );
    }

    #[test]
    fn transient_errors_are_not_fatal() {
        let err = DaqError::TransientCapture {
            device: "channel 2".into(),
            message: "timeout".into(),
        };
        assert!(!err.is_fatal());
        assert!(DaqError::Instrument("arm failed".into()).is_fatal());
        assert!(DaqError::Configuration("no channels".into()).is_fatal());
    }

    #[test]
    fn storage_error_names_the_path() {
        let err = DaqError::storage(
            "/readonly/2024-01-01",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("/readonly/2024-01-01"));
        assert!(!err.is_configuration());
    }
}
