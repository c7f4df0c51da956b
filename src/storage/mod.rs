//! On-disk layout of runs.
//!
//! ```text
//! <base>/<YYYY-MM-DD>/run_<NNN>/
//!     README.json
//!     data/capture_<NNNN>_metadata.json
//!     data/capture_<NNNN>.csv
//! ```
//!
//! Writes are plain file writes. An interrupted write leaves a partial file; nothing
//! here tries to detect or repair that.

pub mod capture_writer;
pub mod run_directory;

pub use capture_writer::{
    write_run_metadata, CaptureMetadata, CaptureSerializer, RunMetadata, RunStatus,
};
pub use run_directory::{RunDirectoryAllocator, RunLocation};
