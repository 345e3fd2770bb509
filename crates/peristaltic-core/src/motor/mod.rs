//! Motor math
//!
//! Pure conversions between engineering units and step timing, and the
//! microstep exponent search used for channels with variable microstepping.

pub mod optimizer;
pub mod units;

pub use optimizer::{optimize_continuous, optimize_finite, MicrostepChoice, MicrostepRange};
pub use units::{
    microsteps, Drivetrain, StepTiming, DEFAULT_BASE_STEPS_PER_REV, MAX_MICROSTEP_EXPONENT,
    MAX_STEPS, MAX_STEP_INTERVAL, MIN_STEP_INTERVAL_US,
};
