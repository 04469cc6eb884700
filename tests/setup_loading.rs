//! Loading setup files from disk.

use nicos::logging::OutputFormat;
use nicos::{DeviceConfig, Registry, Setup, SetupError};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_setup(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/demo.toml")
}

#[test]
fn test_demo_setup_loads() {
    let setup = Setup::load_from(demo_path()).unwrap();
    assert_eq!(setup.devices.len(), 10);
    assert_eq!(setup.logging.format, OutputFormat::Compact);
    assert!(matches!(
        setup.device("sample_table"),
        Some(DeviceConfig::Locked { .. })
    ));

    let registry = Registry::from_setup(&setup).unwrap();
    assert_eq!(registry.len(), 10);
    assert!(registry.get("sample_table").unwrap().is_moveable());
    assert!(!registry.get("shutter_lamp").unwrap().is_moveable());
}

#[test]
fn test_missing_file() {
    let err = Setup::load_from("/nonexistent/setup.toml").unwrap_err();
    assert!(matches!(err, SetupError::NotFound(_)));
}

#[test]
fn test_durations_and_errors_from_file() {
    let file = write_setup(
        r#"
[retry]
max_attempts = 4
backoff = "1s 500ms"

[[devices]]
type = "virtual_motor"
name = "m"
limits = [-1.5, 1.5]
user_limits = [-1, 1]
timeout = "10s"
errors = { fail_starts = 1, stuck = true }
"#,
    );
    let setup = Setup::load_from(file.path()).unwrap();
    assert_eq!(setup.retry.max_attempts, 4);
    assert_eq!(setup.retry.backoff, Duration::from_millis(1500));
    match &setup.devices[0] {
        DeviceConfig::VirtualMotor {
            user_limits,
            timeout,
            errors,
            ..
        } => {
            assert_eq!(*user_limits, Some((-1.0, 1.0)));
            assert_eq!(*timeout, Some(Duration::from_secs(10)));
            assert_eq!(errors.fail_starts, 1);
            assert!(errors.stuck);
        }
        other => panic!("unexpected device {:?}", other),
    }
}

#[test]
fn test_malformed_setup_rejected() {
    let file = write_setup(
        r#"
[[devices]]
type = "virtual_motor"
name = "m"
"#,
    );
    // limits are mandatory for motors
    assert!(matches!(
        Setup::load_from(file.path()),
        Err(SetupError::Load(_))
    ));

    let file = write_setup("[retry]\nmax_attempts = 0\n");
    assert!(matches!(
        Setup::load_from(file.path()),
        Err(SetupError::Invalid { .. })
    ));
}

#[test]
fn test_invalid_device_parameters_fail_in_registry() {
    let file = write_setup(
        r#"
[[devices]]
type = "virtual_motor"
name = "m"
limits = [0, 10]
user_limits = [-5, 5]
"#,
    );
    let setup = Setup::load_from(file.path()).unwrap();
    let err = Registry::from_setup(&setup).err().unwrap();
    assert_eq!(err.device(), "m");
}

#[test]
fn test_environment_overrides_file() {
    let file = write_setup("[logging]\nlevel = \"warn\"\n");
    std::env::set_var("NICOS_LOGGING__LEVEL", "debug");
    let setup = Setup::load_from(file.path());
    std::env::remove_var("NICOS_LOGGING__LEVEL");
    assert_eq!(setup.unwrap().logging.level, "debug");
}
