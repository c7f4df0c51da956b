//! # Scope DAQ Core Library
//!
//! This crate automates repeated triggered captures from a waveform oscilloscope,
//! optionally paired with readings from a pressure gauge, and persists each capture
//! plus run metadata to a dated directory tree. The `scope-daq` binary (`main.rs`)
//! is a thin CLI over this library.
//!
//! ## Crate Structure
//!
//! - **`config`**: `RunConfig` and its sub-specs, sweep plans, and the Figment loader
//!   (TOML/YAML + `SCOPE_DAQ_` environment overrides).
//! - **`error`**: the `DaqError` enum shared by every layer.
//! - **`outcome`**: `Outcome<T>` and `CaptureWarning`, the degraded-result model used
//!   wherever a failure is tolerated.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`instrument`**: the `InstrumentService` and `AuxiliarySensor` traits with the SCPI
//!   oscilloscope driver, the serial pressure gauge driver and mock devices.
//! - **`storage`**: run directory allocation and capture/run artifact writers.
//! - **`capture`**: one arm/poll/read cycle producing a `CaptureRecord`.
//! - **`run`**: the `MeasurementRun` orchestrator.
//! - **`sweep`**: `SweepRunner`, one run per timebase entry.

pub mod capture;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod outcome;
pub mod run;
pub mod storage;
pub mod sweep;

pub use error::{AppResult, DaqError};
pub use outcome::{CaptureWarning, Outcome};
