//! # Peristaltic Core Library
//!
//! Host-side driver for multi-channel peristaltic pump controllers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The fixed 6-byte serial frame protocol and the controller's command table
//! - A shared transport with one request in flight and asynchronous signals
//! - Unit conversion between flow rate, RPM, volume and step timing
//! - Microstep selection for channels with variable microstepping
//! - Per-channel pumps: volume, duration and continuous pumping
//! - TOML/JSON configuration and a service-level error mapping
//! - A simulated controller for tests and demos
//!
//! ## Example
//!
//! ```rust,ignore
//! use peristaltic_core::prelude::*;
//!
//! let config = DeviceConfig::load("HiPeristaltic.toml")?;
//! let mut controller = Controller::new(config);
//! controller.connect().await?;
//!
//! // 60 uL at 12 uL/s, wait until done
//! let pump = controller.pump(0)?;
//! pump.pump_volume(60.0, 12.0, Some(Direction::Clockwise), true).await?;
//! ```

pub mod config;
pub mod controller;
pub mod facade;
pub mod motor;
pub mod protocol;
pub mod pump;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DeviceConfig, PumpConfig, TransportSettings};
    pub use crate::controller::{ConnectionState, Controller, ControllerError};
    pub use crate::facade::{PumpService, ServiceError};
    pub use crate::motor::{MicrostepRange, StepTiming};
    pub use crate::protocol::{ProtocolError, Transport, TransportConfig};
    pub use crate::pump::{Calibration, Direction, Pump, PumpError, PumpPhase, PumpStatus};
    pub use crate::sim::{SimConfig, SimulatedDevice};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
