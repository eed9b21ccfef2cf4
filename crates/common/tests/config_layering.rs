//! Integration tests for layered configuration loading

use std::io::Write;

use common::config::{
    load_config_with_options, BackendKind, BenchConfig, ConfigValidation, LoadOptions,
};
use common::error::{BenchError, BenchFailure, ConfigurationError, EXIT_FAILURE};
use serial_test::serial;

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn load(file: &tempfile::NamedTempFile) -> Result<BenchConfig, ConfigurationError> {
    load_config_with_options(LoadOptions {
        config_path: Some(file.path().to_path_buf()),
        require_file: true,
        ..LoadOptions::default()
    })
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = toml_file("backend = \"cuda\"\ndevice_ordinal = 1\n\n[generator]\nlow = -1.0\nhigh = 1.0\n");

    std::env::set_var("GPU_BENCH_DEVICE_ORDINAL", "3");
    std::env::set_var("GPU_BENCH_VERIFY__ENABLED", "true");
    let config = load(&file);
    std::env::remove_var("GPU_BENCH_DEVICE_ORDINAL");
    std::env::remove_var("GPU_BENCH_VERIFY__ENABLED");

    let config = config.unwrap();
    assert_eq!(config.backend, BackendKind::Cuda);
    assert_eq!(config.device_ordinal, 3);
    assert!(config.verify.enabled);
    assert_eq!(config.generator.low, -1.0);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_empty_generator_range_is_rejected() {
    let file = toml_file("[generator]\nlow = 2.0\nhigh = 2.0\n");
    let config = load(&file).unwrap();

    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigurationError::InvalidValue { ref key, .. } if key == "generator"));
    assert_eq!(err.exit_code(), EXIT_FAILURE);

    let wrapped = BenchError::from(err);
    assert_eq!(wrapped.exit_code(), EXIT_FAILURE);
}

#[test]
#[serial]
fn test_malformed_file_is_a_parse_error() {
    let file = toml_file("backend = [1, 2\n");
    assert!(matches!(load(&file), Err(ConfigurationError::ParseError { .. })));
}
