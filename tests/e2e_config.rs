//! E2E tests for persistent configuration
//!
//! Tests config round-trip through disk, defaults for missing or corrupt
//! files, and the settings handed to the session and export server.

use nirstream::config::AppConfig;
use nirstream::export::{Encoding, OutputShape};

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let config = AppConfig {
        sampling_rate: 25,
        export_ports: vec![9898],
        export_secret: "lab-secret".to_string(),
        encoding: Encoding::Delimited,
        parallel_calculation: true,
        ..AppConfig::default()
    };
    config.save(&path).unwrap();

    let loaded = AppConfig::load_from(&path);
    assert_eq!(loaded.sampling_rate, 25);
    assert_eq!(loaded.export_ports, vec![9898]);
    assert_eq!(loaded.export_secret, "lab-secret");
    assert_eq!(loaded.encoding, Encoding::Delimited);
    assert!(loaded.session_options().parallel_calculation);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = AppConfig::load_from(&dir.path().join("absent.json"));
    assert_eq!(loaded.sampling_rate, nirstream::DEFAULT_SAMPLING_RATE);
    assert_eq!(loaded.output_shape, OutputShape::Batch);
}

#[test]
fn test_corrupt_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let loaded = AppConfig::load_from(&path);
    assert_eq!(loaded.export_ports, vec![9797, 9898, 8080, 9090, 2424, 2525]);
}

#[test]
fn test_export_settings_json_contract() {
    let json = serde_json::json!({
        "output_shape": "single-point",
        "encoding": "json",
        "tick_interval_ms": 20
    });
    let config: AppConfig = serde_json::from_value(json).unwrap();
    let export = config.export_config();
    assert_eq!(export.output_shape, OutputShape::SinglePoint);
    assert_eq!(export.tick_interval_ms, 20);
    assert_eq!(export.secret, "beastspectrum-export-stream+");
}
