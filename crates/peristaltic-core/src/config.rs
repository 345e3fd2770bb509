//! Device configuration
//!
//! The configuration document describes the serial link and the calibration
//! of every pump channel. It is stored as TOML (or JSON when the file name
//! ends in `.json`) using the key names of the controller's existing config
//! files, for example:
//!
//! ```toml
//! pump_count = 4
//!
//! [device]
//! serial_port = "/dev/ttyACM0"
//! serial_baudrate = 115200
//!
//! [pumps.pump0]
//! calibration_uL_per_Rev = 60.0
//! gear_ratio = 1.0
//! motor_base_spr = 200
//! motor_usteps = 1
//! direction_default = "cw"
//! direction_inverse = false
//! max_rpm = 100.0
//! motor_var_ustep_support = true
//! motor_max_ustep_exp = 8
//! motor_min_ustep_exp = 0
//! ```
//!
//! Missing sections and keys fall back to defaults.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::motor::{Drivetrain, MicrostepRange, DEFAULT_BASE_STEPS_PER_REV, MAX_MICROSTEP_EXPONENT};
use crate::protocol::{
    TransportConfig, CHANNEL_COUNT, DEFAULT_BAUD_RATE, DEFAULT_CHECKSUM_BACKOFF_FACTOR,
    DEFAULT_CONNECT_DELAY_MS, DEFAULT_INTER_BYTE_TIMEOUT_MS, DEFAULT_TIMEOUT_MS,
};
use crate::pump::{Calibration, Direction, DEFAULT_MAX_RPM, DEFAULT_UL_PER_REV};

/// Errors reading or writing a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Could not encode TOML config: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub serial_port: String,
    pub serial_baudrate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            serial_baudrate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Link timing; a timeout of 0 waits forever
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub inter_byte_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub checksum_backoff_factor: u32,
    /// Pause after opening the port, or the boot-signal timeout with `wait_for_boot`
    pub connect_delay_ms: u64,
    /// Wait for the controller's boot signal instead of a fixed delay
    pub wait_for_boot: bool,
    /// Limit on waits for a finite run to complete
    pub finish_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            inter_byte_timeout_ms: DEFAULT_INTER_BYTE_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            checksum_backoff_factor: DEFAULT_CHECKSUM_BACKOFF_FACTOR,
            connect_delay_ms: DEFAULT_CONNECT_DELAY_MS,
            wait_for_boot: false,
            finish_timeout_ms: 0,
        }
    }
}

fn optional_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TransportSettings {
    /// Transport configuration for these settings
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            inter_byte_timeout: Duration::from_millis(self.inter_byte_timeout_ms),
            response_timeout: optional_ms(self.response_timeout_ms),
            checksum_backoff_factor: self.checksum_backoff_factor,
            ..Default::default()
        }
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn finish_timeout(&self) -> Option<Duration> {
        optional_ms(self.finish_timeout_ms)
    }
}

/// Calibration of one pump channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    #[serde(rename = "calibration_uL_per_Rev")]
    pub ul_per_rev: f64,
    pub gear_ratio: f64,
    #[serde(rename = "motor_base_spr")]
    pub base_steps_per_rev: u32,
    /// Fixed microstep count, used when variable microstepping is off
    #[serde(rename = "motor_usteps")]
    pub microsteps: u32,
    pub direction_default: Direction,
    pub direction_inverse: bool,
    pub max_rpm: f64,
    #[serde(rename = "motor_var_ustep_support")]
    pub variable_microstepping: bool,
    #[serde(rename = "motor_max_ustep_exp")]
    pub max_microstep_exp: u8,
    #[serde(rename = "motor_min_ustep_exp")]
    pub min_microstep_exp: u8,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            ul_per_rev: DEFAULT_UL_PER_REV,
            gear_ratio: 1.0,
            base_steps_per_rev: DEFAULT_BASE_STEPS_PER_REV,
            microsteps: 1,
            direction_default: Direction::Clockwise,
            direction_inverse: false,
            max_rpm: DEFAULT_MAX_RPM,
            variable_microstepping: true,
            max_microstep_exp: MAX_MICROSTEP_EXPONENT,
            min_microstep_exp: 0,
        }
    }
}

impl PumpConfig {
    /// Calibration to hand to a pump
    pub fn calibration(&self) -> Calibration {
        Calibration {
            ul_per_rev: self.ul_per_rev,
            drivetrain: Drivetrain::new(self.base_steps_per_rev, self.gear_ratio),
            max_rpm: self.max_rpm,
            direction_default: self.direction_default,
            direction_inverse: self.direction_inverse,
            microstep_range: MicrostepRange::new(self.min_microstep_exp, self.max_microstep_exp),
            microsteps: self.microsteps,
            variable_microstepping: self.variable_microstepping,
        }
    }

    /// Config entry describing a pump's calibration
    pub fn from_calibration(calibration: &Calibration) -> Self {
        Self {
            ul_per_rev: calibration.ul_per_rev,
            gear_ratio: calibration.drivetrain.gear_ratio,
            base_steps_per_rev: calibration.drivetrain.base_steps_per_rev,
            microsteps: calibration.microsteps,
            direction_default: calibration.direction_default,
            direction_inverse: calibration.direction_inverse,
            max_rpm: calibration.max_rpm,
            variable_microstepping: calibration.variable_microstepping,
            max_microstep_exp: calibration.microstep_range.max_exp,
            min_microstep_exp: calibration.microstep_range.min_exp,
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub pump_count: usize,
    pub device: SerialSettings,
    pub transport: TransportSettings,
    /// Keyed `pump0`, `pump1`, ...
    pub pumps: BTreeMap<String, PumpConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let pumps = (0..CHANNEL_COUNT)
            .map(|i| (Self::pump_key(i), PumpConfig::default()))
            .collect();
        Self {
            pump_count: CHANNEL_COUNT,
            device: SerialSettings::default(),
            transport: TransportSettings::default(),
            pumps,
        }
    }
}

impl DeviceConfig {
    /// Default configuration for a port
    pub fn for_port(serial_port: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.device.serial_port = serial_port.into();
        config
    }

    fn pump_key(channel: usize) -> String {
        format!("pump{}", channel)
    }

    /// Configuration of a channel, defaults when it has no entry
    pub fn pump(&self, channel: usize) -> PumpConfig {
        self.pumps
            .get(&Self::pump_key(channel))
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the configuration of a channel
    pub fn set_pump(&mut self, channel: usize, pump: PumpConfig) {
        self.pumps.insert(Self::pump_key(channel), pump);
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Encode as a TOML document
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load a configuration file, JSON if the extension is `.json`, TOML otherwise
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save to a file, JSON if the extension is `.json`, TOML otherwise
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            self.to_toml_string()?
        };
        fs::write(path, content)?;
        tracing::info!("Saved config to {}", path.display());
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_original_keys() {
        let content = r#"
pump_count = 2

[device]
serial_port = "COM13"
serial_baudrate = 115200

[pumps.pump0]
calibration_uL_per_Rev = 45.5
gear_ratio = 2
motor_base_spr = 400
motor_usteps = 16
direction_default = "CCW"
direction_inverse = true
max_rpm = 150.0
motor_var_ustep_support = false
motor_max_ustep_exp = 5
motor_min_ustep_exp = 1
motor_dir_inverse = true
"#;
        let config = DeviceConfig::from_toml_str(content).unwrap();
        assert_eq!(config.pump_count, 2);
        assert_eq!(config.device.serial_port, "COM13");

        let pump = config.pump(0);
        assert_eq!(pump.ul_per_rev, 45.5);
        assert_eq!(pump.gear_ratio, 2.0);
        assert_eq!(pump.base_steps_per_rev, 400);
        assert_eq!(pump.microsteps, 16);
        assert_eq!(pump.direction_default, Direction::CounterClockwise);
        assert!(pump.direction_inverse);
        assert!(!pump.variable_microstepping);
        assert_eq!(pump.min_microstep_exp, 1);

        // not listed, so defaults
        assert_eq!(config.pump(1), PumpConfig::default());
        assert_eq!(config.transport, TransportSettings::default());
    }

    #[test]
    fn test_unknown_direction_rejected() {
        let content = r#"
[pumps.pump0]
direction_default = "up"
"#;
        assert!(matches!(
            DeviceConfig::from_toml_str(content),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_calibration_conversion() {
        let pump = PumpConfig {
            ul_per_rev: 30.0,
            gear_ratio: 3.0,
            min_microstep_exp: 2,
            ..Default::default()
        };
        let calibration = pump.calibration();
        assert_eq!(calibration.drivetrain.steps_per_rev(1), 600.0);
        assert_eq!(calibration.microstep_range, MicrostepRange::new(2, 8));
        assert_eq!(PumpConfig::from_calibration(&calibration), pump);
    }

    #[test]
    fn test_transport_settings() {
        let settings = TransportSettings {
            response_timeout_ms: 0,
            finish_timeout_ms: 1500,
            ..Default::default()
        };
        let transport = settings.transport_config();
        assert_eq!(transport.response_timeout, None);
        assert_eq!(transport.inter_byte_timeout, Duration::from_millis(500));
        assert_eq!(settings.finish_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(settings.connect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = DeviceConfig::for_port("/dev/ttyACM0");
        config.set_pump(
            2,
            PumpConfig {
                direction_default: Direction::CounterClockwise,
                ..Default::default()
            },
        );
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("calibration_uL_per_Rev"));
        assert!(text.contains("direction_default = \"ccw\""));
        assert_eq!(DeviceConfig::from_toml_str(&text).unwrap(), config);
    }
}
