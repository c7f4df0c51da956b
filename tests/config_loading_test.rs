//! Integration tests for configuration file loading
//!
//! Every load merges `SCOPE_DAQ_*` environment variables, so tests run serially
//! while one of them sets an override.

use scope_daq::config::{
    ConfigDocument, Coupling, TimeStepPolicy, TriggerMode, WaveformPoints,
};
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn write(tmp: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = tmp.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

const MINIMAL_TOML: &str = r#"
[instrument]
address = "192.168.1.101:5025"

[storage]
base_path = "/data/scope"

[[channels]]
number = 1
scale = 0.5

[[channels]]
number = 2
scale = 2.0
coupling = "AC"
display = false

[timebase]
scale = 1e-3

[trigger]
source = 1
level = 0.25

[measurement]
capture_count = 10
interval_seconds = 1.5
"#;

#[test]
#[serial]
fn test_toml_defaults_are_filled_in() {
    let tmp = TempDir::new().unwrap();
    let path = write(&tmp, "measurement.toml", MINIMAL_TOML);

    let doc = ConfigDocument::load_from(&path).unwrap();
    let run = &doc.run;
    assert_eq!(run.instrument.address, "192.168.1.101:5025");
    assert_eq!(run.instrument.port, None);
    assert_eq!(run.storage.base_path, PathBuf::from("/data/scope"));

    assert_eq!(run.channels.len(), 2);
    assert_eq!(run.channels[0].coupling, Coupling::Dc);
    assert!(run.channels[0].display);
    assert_eq!(run.channels[1].coupling, Coupling::Ac);
    assert!(!run.channels[1].display);

    assert_eq!(run.acquisition.points, WaveformPoints::Max);
    assert_eq!(run.timebase.offset, 0.0);
    assert_eq!(run.trigger.source, 1);
    assert_eq!(run.trigger.mode, TriggerMode::Single);
    assert_eq!(run.measurement.capture_count, 10);
    assert_eq!(run.measurement.interval().unwrap(), Duration::from_millis(1500));
    assert!(run.measurement.description.is_none());
    assert!(run.auxiliary.is_none());

    assert_eq!(run.capture.poll_interval, Duration::from_millis(100));
    assert_eq!(run.capture.settle_interval, Duration::from_secs(5));
    assert_eq!(run.capture.trigger_timeout, None);
    assert_eq!(run.capture.time_step_policy, TimeStepPolicy::Tolerate);

    assert!(doc.sweep.is_empty());
    run.validate().unwrap();
}

#[test]
#[serial]
fn test_legacy_yaml_keys_are_accepted() {
    let tmp = TempDir::new().unwrap();
    let path = write(
        &tmp,
        "timebase_sweep.yaml",
        r#"
oscilloscope:
  ip_address: 192.168.1.101
  save_path: /data/legacy
channels:
  - number: 1
    scale: 0.1
    coupling: DC
    display: true
  - number: 2
    scale: 0.5
    coupling: AC
    display: true
timebase:
  scale: 0.0001
trigger:
  source: 2
  level: 0.05
  mode: NORM
measurement:
  captures: 20
  interval: 2
  timebase_description: coarse
auxiliary:
  port: /dev/ttyUSB0
  baudrate: 19200
timebase_runs:
  - scale: 0.00001
    description: 10 us/div
  - scale: 0.000001
    description: 1 us/div
"#,
    );

    let doc = ConfigDocument::load_from(&path).unwrap();
    let run = &doc.run;
    assert_eq!(run.instrument.address, "192.168.1.101");
    assert_eq!(run.storage.base_path, PathBuf::from("/data/legacy"));
    assert_eq!(run.trigger.mode, TriggerMode::Normal);
    assert_eq!(run.measurement.capture_count, 20);
    assert_eq!(run.measurement.interval_seconds, 2.0);
    assert_eq!(run.measurement.description.as_deref(), Some("coarse"));

    let aux = run.auxiliary.as_ref().unwrap();
    assert_eq!(aux.port, "/dev/ttyUSB0");
    assert_eq!(aux.baud_rate, 19200);

    assert_eq!(doc.sweep.len(), 2);
    assert_eq!(doc.sweep.entries()[0].scale, 1e-5);
    assert_eq!(
        doc.sweep.entries()[1].description.as_deref(),
        Some("1 us/div")
    );
}

#[test]
#[serial]
fn test_explicit_storage_wins_over_legacy_save_path() {
    let tmp = TempDir::new().unwrap();
    let contents = MINIMAL_TOML.replace(
        "address = \"192.168.1.101:5025\"",
        "address = \"192.168.1.101:5025\"\nsave_path = \"/data/ignored\"",
    );
    let path = write(&tmp, "both.toml", &contents);

    let doc = ConfigDocument::load_from(&path).unwrap();
    assert_eq!(doc.run.storage.base_path, PathBuf::from("/data/scope"));
}

#[test]
#[serial]
fn test_unknown_key_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let contents = MINIMAL_TOML.replace("level = 0.25", "level = 0.25\nslope = \"rising\"");
    let path = write(&tmp, "typo.toml", &contents);

    let err = ConfigDocument::load_from(&path).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("slope"));
}

#[test]
#[serial]
fn test_missing_file_is_a_configuration_error() {
    let tmp = TempDir::new().unwrap();
    let err = ConfigDocument::load_from(tmp.path().join("absent.toml")).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
#[serial]
fn test_sweep_and_timebase_runs_together_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let contents = format!(
        "{MINIMAL_TOML}\n[[sweep]]\nscale = 1e-4\n\n[[timebase_runs]]\nscale = 1e-5\n"
    );
    let path = write(&tmp, "ambiguous.toml", &contents);

    let err = ConfigDocument::load_from(&path).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
#[serial]
fn test_sweep_entry_with_non_positive_scale_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let contents = format!("{MINIMAL_TOML}\n[[sweep]]\nscale = 0.0\n");
    let path = write(&tmp, "zero.toml", &contents);

    assert!(ConfigDocument::load_from(&path).is_err());
}

#[test]
#[serial]
fn test_environment_overrides_file_values() {
    let tmp = TempDir::new().unwrap();
    let path = write(&tmp, "env.toml", MINIMAL_TOML);

    std::env::set_var("SCOPE_DAQ_TRIGGER__LEVEL", "0.75");
    let result = ConfigDocument::load_from(&path);
    std::env::remove_var("SCOPE_DAQ_TRIGGER__LEVEL");

    let doc = result.unwrap();
    assert_eq!(doc.run.trigger.level, 0.75);
    assert_eq!(doc.run.trigger.source, 1);
}
