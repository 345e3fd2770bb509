use peristaltic_core::config::{ConfigError, DeviceConfig, PumpConfig};
use peristaltic_core::pump::Direction;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn sample_config() -> DeviceConfig {
    let mut config = DeviceConfig::for_port("/dev/ttyACM0");
    config.pump_count = 3;
    config.transport.finish_timeout_ms = 30_000;
    config.set_pump(
        1,
        PumpConfig {
            ul_per_rev: 42.5,
            gear_ratio: 3.0,
            microsteps: 8,
            direction_default: Direction::CounterClockwise,
            direction_inverse: true,
            variable_microstepping: false,
            ..Default::default()
        },
    );
    config
}

#[test]
fn test_toml_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("HiPeristaltic.toml");
    let config = sample_config();

    config.save(&path).unwrap();
    let loaded = DeviceConfig::load(&path).unwrap();

    assert_eq!(loaded, config);
}

#[test]
fn test_json_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("HiPeristaltic.json");
    let config = sample_config();

    config.save(&path).unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.trim_start().starts_with('{'));
    assert!(content.contains("\"calibration_uL_per_Rev\": 42.5"));

    assert_eq!(DeviceConfig::load(&path).unwrap(), config);
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        DeviceConfig::load(dir.path().join("absent.toml")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_malformed_json_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ \"pump_count\": ").unwrap();
    assert!(matches!(DeviceConfig::load(&path), Err(ConfigError::Json(_))));
}

#[test]
fn test_saved_file_keeps_pump_sections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pumps.toml");
    sample_config().save(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("[pumps.pump1]"));
    assert!(content.contains("calibration_uL_per_Rev = 42.5"));
    assert!(content.contains("direction_default = \"ccw\""));
}
