//! Pump errors

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors returned by pump operations
///
/// Range and feasibility errors are raised before anything is written to the
/// controller.
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("Channel {0} does not exist")]
    InvalidChannel(usize),

    #[error("RPM {rpm} out of range [{min}, {max})")]
    RpmOutOfRange { rpm: f64, min: f64, max: f64 },

    #[error("Volume {volume_ul} uL out of range ({min_ul}, {max_ul})")]
    VolumeOutOfRange {
        volume_ul: f64,
        min_ul: f64,
        max_ul: f64,
    },

    #[error("{revolutions} revolutions exceed the maximum of {max}")]
    RevolutionsOutOfRange { revolutions: f64, max: f64 },

    #[error("Duration must be positive")]
    DurationOutOfRange,

    #[error("Step interval {interval} out of range [{min}, {max}]")]
    StepIntervalOutOfRange { interval: u64, min: u64, max: u64 },

    #[error("Step count {steps} exceeds the maximum of {max}")]
    StepCountOutOfRange { steps: u64, max: u64 },

    #[error("No microstep setting reaches {rpm} RPM")]
    Infeasible { rpm: f64 },

    #[error("Channel {0} is already running")]
    AlreadyRunning(usize),

    #[error("Calibration {0} uL/rev must be finite and positive")]
    CalibrationOutOfRange(f64),

    #[error("Channel {0} does not support variable microstepping")]
    MicrostepUnsupported(usize),

    #[error("Channel {0} did not finish in time")]
    FinishTimeout(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
