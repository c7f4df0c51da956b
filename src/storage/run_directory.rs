//! Run directory allocation.
//!
//! Runs live at `<base>/<YYYY-MM-DD>/run_<NNN>/` with a `data/` subdirectory for
//! capture files. The next run index is always derived from what is on disk, so
//! numbering continues across process restarts.

use crate::error::{AppResult, DaqError};
use chrono::{Local, NaiveDate};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const RUN_PREFIX: &str = "run_";
const DATA_DIR: &str = "data";
const README_FILE: &str = "README.json";

/// Directory owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLocation {
    path: PathBuf,
    date: NaiveDate,
    run_index: u32,
}

impl RunLocation {
    /// Root directory of the run.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Date folder the run belongs to.
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// 1-based index within the date folder.
    pub fn run_index(&self) -> u32 {
        self.run_index
    }

    /// Directory name, e.g. `run_003`.
    pub fn name(&self) -> String {
        run_dir_name(self.run_index)
    }

    /// Directory holding capture files.
    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    /// Run metadata file.
    pub fn readme_path(&self) -> PathBuf {
        self.path.join(README_FILE)
    }

    /// Waveform table for a capture.
    pub fn capture_csv_path(&self, capture_index: usize) -> PathBuf {
        self.data_dir()
            .join(format!("capture_{:04}.csv", capture_index))
    }

    /// Metadata file for a capture.
    pub fn capture_metadata_path(&self, capture_index: usize) -> PathBuf {
        self.data_dir()
            .join(format!("capture_{:04}_metadata.json", capture_index))
    }
}

/// Allocates run directories below a base path.
#[derive(Debug, Clone)]
pub struct RunDirectoryAllocator {
    base_path: PathBuf,
}

impl RunDirectoryAllocator {
    /// Allocator rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Root all runs are created under.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Allocate the next run for today's local date.
    pub fn allocate_today(&self) -> AppResult<RunLocation> {
        self.allocate(Local::now().date_naive())
    }

    /// Create the next `run_<NNN>` directory (and its `data/` folder) for `date`.
    ///
    /// The index is one past the highest existing run in the date folder, or 1 when
    /// there is none. Every call re-scans the folder.
    pub fn allocate(&self, date: NaiveDate) -> AppResult<RunLocation> {
        let date_dir = self.base_path.join(date.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&date_dir).map_err(|e| DaqError::storage(&date_dir, e))?;

        let run_index = next_run_index(&date_dir)?;
        let path = date_dir.join(run_dir_name(run_index));

        // create_dir (not create_dir_all) so an existing directory is never reused
        fs::create_dir(&path).map_err(|e| DaqError::storage(&path, e))?;
        let data_dir = path.join(DATA_DIR);
        fs::create_dir(&data_dir).map_err(|e| DaqError::storage(&data_dir, e))?;

        tracing::info!(path = %path.display(), run_index, "Run directory allocated");
        Ok(RunLocation {
            path,
            date,
            run_index,
        })
    }
}

fn run_dir_name(run_index: u32) -> String {
    format!("{}{:03}", RUN_PREFIX, run_index)
}

/// Parse the index out of a `run_<digits>` directory name.
fn parse_run_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(RUN_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn next_run_index(date_dir: &Path) -> AppResult<u32> {
    let entries = fs::read_dir(date_dir).map_err(|e| DaqError::storage(date_dir, e))?;

    let mut highest = 0;
    for entry in entries {
        let entry = entry.map_err(|e| DaqError::storage(date_dir, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| DaqError::storage(entry.path(), e))?
            .is_dir();
        if !is_dir {
            continue;
        }
        if let Some(index) = entry.file_name().to_str().and_then(parse_run_index) {
            highest = highest.max(index);
        }
    }
    highest.checked_add(1).ok_or_else(|| {
        DaqError::storage(
            date_dir,
            io::Error::other(format!(
                "run index space exhausted after {RUN_PREFIX}{highest}"
            )),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn first_run_of_the_day_is_001() {
        let tmp = TempDir::new().unwrap();
        let location = RunDirectoryAllocator::new(tmp.path()).allocate(date()).unwrap();

        assert_eq!(location.run_index(), 1);
        assert_eq!(location.path(), tmp.path().join("2024-03-15").join("run_001"));
        assert!(location.data_dir().is_dir());
    }

    #[test]
    fn continues_after_existing_runs() {
        let tmp = TempDir::new().unwrap();
        let day = tmp.path().join("2024-03-15");
        fs::create_dir_all(day.join("run_001")).unwrap();
        fs::create_dir_all(day.join("run_002")).unwrap();

        let location = RunDirectoryAllocator::new(tmp.path()).allocate(date()).unwrap();
        assert_eq!(location.name(), "run_003");
    }

    #[test]
    fn reallocation_never_reuses_a_run() {
        let tmp = TempDir::new().unwrap();
        let allocator = RunDirectoryAllocator::new(tmp.path());
        let first = allocator.allocate(date()).unwrap();
        let second = allocator.allocate(date()).unwrap();
        assert_eq!(first.run_index() + 1, second.run_index());
    }

    #[test]
    fn ignores_foreign_entries_and_follows_gaps() {
        let tmp = TempDir::new().unwrap();
        let day = tmp.path().join("2024-03-15");
        fs::create_dir_all(day.join("run_007")).unwrap();
        fs::create_dir_all(day.join("run_abc")).unwrap();
        fs::create_dir_all(day.join("notes")).unwrap();
        fs::write(day.join("run_900"), b"not a directory").unwrap();

        let location = RunDirectoryAllocator::new(tmp.path()).allocate(date()).unwrap();
        assert_eq!(location.run_index(), 8);
    }

    #[test]
    fn dates_are_numbered_independently() {
        let tmp = TempDir::new().unwrap();
        let allocator = RunDirectoryAllocator::new(tmp.path());
        allocator.allocate(date()).unwrap();
        let next_day = allocator.allocate(date().succ_opt().unwrap()).unwrap();
        assert_eq!(next_day.run_index(), 1);
    }

    #[test]
    fn unwritable_base_is_a_storage_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"file where a directory should be").unwrap();

        let err = RunDirectoryAllocator::new(&blocker).allocate(date()).unwrap_err();
        assert!(matches!(err, DaqError::Storage { .. }));
    }

    #[test]
    fn exhausted_run_index_is_a_storage_error() {
        let tmp = TempDir::new().unwrap();
        let day = tmp.path().join("2024-03-15");
        fs::create_dir_all(day.join(format!("run_{}", u32::MAX))).unwrap();

        let err = RunDirectoryAllocator::new(tmp.path()).allocate(date()).unwrap_err();
        assert!(matches!(err, DaqError::Storage { .. }));
        assert!(err.to_string().contains("exhausted"));
        assert_eq!(fs::read_dir(&day).unwrap().count(), 1);
    }

    #[test]
    fn capture_paths_are_zero_padded() {
        let tmp = TempDir::new().unwrap();
        let location = RunDirectoryAllocator::new(tmp.path()).allocate(date()).unwrap();
        assert!(location
            .capture_csv_path(7)
            .ends_with("run_001/data/capture_0007.csv"));
        assert!(location
            .capture_metadata_path(12)
            .ends_with("data/capture_0012_metadata.json"));
        assert!(location.readme_path().ends_with("run_001/README.json"));
    }

    #[test]
    fn run_index_parsing() {
        assert_eq!(parse_run_index("run_001"), Some(1));
        assert_eq!(parse_run_index("run_1234"), Some(1234));
        assert_eq!(parse_run_index("run_"), None);
        assert_eq!(parse_run_index("run_+1"), None);
        assert_eq!(parse_run_index("capture_001"), None);
    }
}
