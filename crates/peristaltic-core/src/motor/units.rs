//! Unit Conversion Functions
//!
//! Converts between engineering units and the controller's integer step timing:
//! - Speed: RPM ↔ step interval (MCU timer ticks between steps)
//! - Distance: revolutions ↔ steps
//! - Volume: µL ↔ revolutions, flow rate (µL/s) ↔ RPM

/// Shortest step interval the firmware can drive, in microseconds
pub const MIN_STEP_INTERVAL_US: u32 = 24;

/// Longest step interval in ticks (absolute max is `u32::MAX`)
pub const MAX_STEP_INTERVAL: u32 = u32::MAX - 1024;

/// Largest step count a finite run may request
pub const MAX_STEPS: u32 = u32::MAX - 2;

/// Microseconds per minute
pub const MINUTE_US: f64 = 60_000_000.0;

/// Full steps per revolution of a typical stepper motor
pub const DEFAULT_BASE_STEPS_PER_REV: u32 = 200;

/// Upper bound on microstep exponents the firmware accepts
pub const MAX_MICROSTEP_EXPONENT: u8 = 8;

/// Motor and gearbox geometry of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drivetrain {
    /// Full steps per motor revolution
    pub base_steps_per_rev: u32,
    /// Motor revolutions per pump-head revolution
    pub gear_ratio: f64,
}

impl Default for Drivetrain {
    fn default() -> Self {
        Self {
            base_steps_per_rev: DEFAULT_BASE_STEPS_PER_REV,
            gear_ratio: 1.0,
        }
    }
}

impl Drivetrain {
    pub fn new(base_steps_per_rev: u32, gear_ratio: f64) -> Self {
        Self {
            base_steps_per_rev,
            gear_ratio,
        }
    }

    /// Steps per pump-head revolution at the given microstep count
    pub fn steps_per_rev(&self, microsteps: u32) -> f64 {
        self.base_steps_per_rev as f64 * microsteps as f64 * self.gear_ratio
    }

    /// Steps per pump-head revolution at microstep exponent `exponent` (2^exponent microsteps)
    pub fn steps_per_rev_exp(&self, exponent: u8) -> f64 {
        self.base_steps_per_rev as f64 * 2f64.powi(exponent as i32) * self.gear_ratio
    }
}

/// Microstep count for an exponent, saturating at `u32::MAX`
pub fn microsteps(exponent: u8) -> u32 {
    1u32.checked_shl(exponent as u32).unwrap_or(u32::MAX)
}

/// Step timing of one controller, fixed once its tick divider is known
///
/// The controller counts time in ticks of `1 / sub_us_divider` µs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTiming {
    sub_us_divider: f64,
}

impl Default for StepTiming {
    fn default() -> Self {
        Self::new(1)
    }
}

impl StepTiming {
    pub fn new(sub_us_divider: u32) -> Self {
        Self {
            sub_us_divider: sub_us_divider.max(1) as f64,
        }
    }

    /// Ticks per microsecond
    pub fn sub_us_divider(&self) -> f64 {
        self.sub_us_divider
    }

    /// Minutes to ticks conversion factor
    pub fn ticks_per_minute(&self) -> f64 {
        self.sub_us_divider * MINUTE_US
    }

    /// Shortest allowed step interval in ticks
    pub fn min_step_interval(&self) -> u64 {
        (MIN_STEP_INTERVAL_US as f64 * self.sub_us_divider).round() as u64
    }

    /// Longest allowed step interval in ticks
    pub fn max_step_interval(&self) -> u64 {
        MAX_STEP_INTERVAL as u64
    }

    /// Whether `interval` can be written to the controller
    pub fn interval_in_range(&self, interval: u64) -> bool {
        interval >= self.min_step_interval() && interval <= self.max_step_interval()
    }

    /// Step interval for `rpm` at `spr` steps per revolution
    ///
    /// Computed in u64 so that out-of-range results are still comparable against
    /// the bounds. Non-finite or negative results saturate.
    pub fn rpm_to_step_interval(&self, rpm: f64, spr: f64) -> u64 {
        (self.ticks_per_minute() / (rpm * spr)).round() as u64
    }

    /// RPM achieved by `interval` at `spr` steps per revolution
    pub fn step_interval_to_rpm(&self, interval: u64, spr: f64) -> f64 {
        self.ticks_per_minute() / (interval as f64 * spr)
    }

    /// Real time between steps
    pub fn interval_to_seconds(&self, interval: u64) -> f64 {
        interval as f64 / (self.sub_us_divider * 1_000_000.0)
    }
}

/// Steps needed for `revolutions` at `spr` steps per revolution
pub fn revolutions_to_steps(revolutions: f64, spr: f64) -> u64 {
    (revolutions * spr).round() as u64
}

/// Revolutions covered by `steps`
pub fn steps_to_revolutions(steps: u64, spr: f64) -> f64 {
    steps as f64 / spr
}

/// Flow rate in µL/s for a pump-head speed
pub fn rpm_to_flow_rate(rpm: f64, ul_per_rev: f64) -> f64 {
    (rpm / 60.0) * ul_per_rev
}

/// Pump-head speed for a flow rate in µL/s
pub fn flow_rate_to_rpm(flow_rate_ul_per_sec: f64, ul_per_rev: f64) -> f64 {
    (flow_rate_ul_per_sec / ul_per_rev) * 60.0
}

/// Revolutions to move `volume_ul`
pub fn volume_to_revolutions(volume_ul: f64, ul_per_rev: f64) -> f64 {
    volume_ul / ul_per_rev
}

/// Volume moved by `revolutions`
pub fn revolutions_to_volume(revolutions: f64, ul_per_rev: f64) -> f64 {
    revolutions * ul_per_rev
}
