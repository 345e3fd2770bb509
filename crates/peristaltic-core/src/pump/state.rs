//! Pump state and calibration types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::motor::{microsteps, Drivetrain, MicrostepRange};

/// Default calibration, 1 rpm is 1 uL/s
pub const DEFAULT_UL_PER_REV: f64 = 60.0;

/// Default speed limit of a pump head
pub const DEFAULT_MAX_RPM: f64 = 100.0;

/// Rotation sense of the pump head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    #[default]
    Clockwise,
    CounterClockwise,
}

impl Direction {
    /// Register value, before any inversion
    pub fn as_bool(self) -> bool {
        matches!(self, Direction::Clockwise)
    }

    pub fn from_bool(value: bool) -> Self {
        if value {
            Direction::Clockwise
        } else {
            Direction::CounterClockwise
        }
    }

    /// Parse an optional user string, falling back to `default` when empty
    pub fn parse_or(value: &str, default: Direction) -> Result<Self, ParseDirectionError> {
        if value.trim().is_empty() {
            Ok(default)
        } else {
            value.parse()
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Clockwise => write!(f, "cw"),
            Direction::CounterClockwise => write!(f, "ccw"),
        }
    }
}

/// Unrecognized direction string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown direction '{0}'")]
pub struct ParseDirectionError(pub String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cw" | "clockwise" => Ok(Direction::Clockwise),
            "ccw" | "counterclockwise" | "counter-clockwise" | "anticlockwise"
            | "anti-clockwise" | "acw" => Ok(Direction::CounterClockwise),
            _ => Err(ParseDirectionError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = ParseDirectionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Direction> for String {
    fn from(direction: Direction) -> Self {
        direction.to_string()
    }
}

/// Per-channel calibration, taken from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Volume per pump-head revolution
    pub ul_per_rev: f64,
    pub drivetrain: Drivetrain,
    /// Configured speed limit, exclusive
    pub max_rpm: f64,
    /// Direction used when a request gives none
    pub direction_default: Direction,
    /// Swap the direction pin for this channel
    pub direction_inverse: bool,
    /// Exponents the optimizer may pick from
    pub microstep_range: MicrostepRange,
    /// Fixed microstep count when the exponent cannot be changed
    pub microsteps: u32,
    /// Allow variable microstepping if the controller supports it
    pub variable_microstepping: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            ul_per_rev: DEFAULT_UL_PER_REV,
            drivetrain: Drivetrain::default(),
            max_rpm: DEFAULT_MAX_RPM,
            direction_default: Direction::Clockwise,
            direction_inverse: false,
            microstep_range: MicrostepRange::default(),
            microsteps: 1,
            variable_microstepping: true,
        }
    }
}

/// Controller registers mirrored on the host
///
/// Step counters are not mirrored; they change while running and are always
/// read from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpState {
    pub running: bool,
    pub enabled: bool,
    /// Logical direction, inversion is applied on the wire
    pub direction: Direction,
    pub step_interval: u32,
    pub finite_mode: bool,
    pub microstep_exponent: u8,
    /// Effective microstep count used for steps-per-revolution
    pub microsteps: u32,
    /// Controller supports variable microstepping and configuration allows it
    pub variable_microstepping: bool,
}

impl Default for PumpState {
    fn default() -> Self {
        Self {
            running: false,
            enabled: false,
            direction: Direction::Clockwise,
            step_interval: 2000,
            finite_mode: false,
            microstep_exponent: 0,
            microsteps: 1,
            variable_microstepping: false,
        }
    }
}

impl PumpState {
    pub(crate) fn set_exponent(&mut self, exponent: u8) {
        self.microstep_exponent = exponent;
        self.microsteps = microsteps(exponent);
    }

    /// Lifecycle phase given the controller's remaining step count
    pub fn phase(&self, steps_remaining: u32) -> PumpPhase {
        match (self.running, self.finite_mode) {
            (true, true) => PumpPhase::RunningFinite,
            (true, false) => PumpPhase::RunningContinuous,
            (false, true) if steps_remaining > 0 => PumpPhase::PausedFinite,
            (false, _) => PumpPhase::Idle,
        }
    }
}

/// Lifecycle phase of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PumpPhase {
    Idle,
    RunningContinuous,
    RunningFinite,
    /// Finite run stopped with steps left
    PausedFinite,
}

/// Snapshot of one channel, with fresh step counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpStatus {
    pub channel: usize,
    pub phase: PumpPhase,
    pub state: PumpState,
    pub steps_remaining: u32,
    pub target_steps: u32,
    pub rpm: f64,
    pub flow_rate_ul_per_sec: f64,
    pub remaining_volume_ul: f64,
    pub target_volume_ul: f64,
}
