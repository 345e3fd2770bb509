//! Pump channels
//!
//! Each channel of the controller is driven by a [`Pump`], which keeps a
//! mirror of the channel's registers and exposes volume, duration and
//! continuous pumping in engineering units.

mod channel;
mod error;
mod state;

pub use channel::Pump;
pub use error::PumpError;
pub use state::{
    Calibration, Direction, ParseDirectionError, PumpPhase, PumpState, PumpStatus,
    DEFAULT_MAX_RPM, DEFAULT_UL_PER_REV,
};
