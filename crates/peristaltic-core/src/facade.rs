//! Service boundary
//!
//! [`PumpService`] exposes the operations a lab-automation service offers
//! (start, stop, resume, calibrate) with 1-based pump indices, and maps pump
//! failures onto the error categories reported to service clients.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::controller::{Controller, ControllerError};
use crate::motor::units::revolutions_to_volume;
use crate::pump::{Direction, Pump, PumpError};

/// Errors reported to service clients
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Pump index {0} is out of range")]
    PumpIndexOutOfRange(usize),

    #[error("Flow rate {0} uL/s is negative, too small or above the maximum")]
    FlowRateOutOfRange(f64),

    #[error("Target volume {0} uL is negative, too small or above the maximum")]
    TargetVolumeOutOfRange(f64),

    #[error("Pump was interrupted after {pumped_ul} uL ({remaining_ul} uL left)")]
    PumpInterrupted { pumped_ul: f64, remaining_ul: f64 },

    #[error("Invalid direction '{0}'")]
    InvalidDirection(String),

    #[error("Target of {0} revolutions is negative or above the maximum")]
    TargetRevolutionsOutOfRange(f64),

    #[error("RPM {0} is negative, too small or above the maximum")]
    RpmOutOfRange(f64),

    #[error("Calibration {0} uL/rev is out of range")]
    CalibrationParameterOutOfRange(f64),

    #[error("Not connected to pump controller")]
    NotConnected,

    #[error("Pump controller error: {0}")]
    Device(#[source] PumpError),
}

impl ServiceError {
    /// Map a pump error from a flow-rate/volume request
    fn from_flow_request(e: PumpError, flow_rate: f64, volume_ul: f64) -> Self {
        match e {
            PumpError::RpmOutOfRange { .. }
            | PumpError::StepIntervalOutOfRange { .. }
            | PumpError::Infeasible { .. } => ServiceError::FlowRateOutOfRange(flow_rate),
            PumpError::VolumeOutOfRange { .. }
            | PumpError::RevolutionsOutOfRange { .. }
            | PumpError::StepCountOutOfRange { .. } => {
                ServiceError::TargetVolumeOutOfRange(volume_ul)
            }
            other => other.into(),
        }
    }

    /// Map a pump error from an rpm/revolutions request
    fn from_rpm_request(e: PumpError, rpm: f64, revolutions: f64) -> Self {
        match e {
            PumpError::RpmOutOfRange { .. }
            | PumpError::StepIntervalOutOfRange { .. }
            | PumpError::Infeasible { .. } => ServiceError::RpmOutOfRange(rpm),
            PumpError::VolumeOutOfRange { .. }
            | PumpError::RevolutionsOutOfRange { .. }
            | PumpError::StepCountOutOfRange { .. } => {
                ServiceError::TargetRevolutionsOutOfRange(revolutions)
            }
            other => other.into(),
        }
    }
}

impl From<PumpError> for ServiceError {
    fn from(e: PumpError) -> Self {
        match e {
            PumpError::CalibrationOutOfRange(value) => {
                ServiceError::CalibrationParameterOutOfRange(value)
            }
            other => ServiceError::Device(other),
        }
    }
}

/// Service operations over a connected controller
pub struct PumpService {
    controller: Controller,
}

impl PumpService {
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    pub fn into_inner(self) -> Controller {
        self.controller
    }

    /// Pump with 1-based `index`
    fn pump(&self, index: usize) -> Result<&Arc<Pump>, ServiceError> {
        if index == 0 {
            return Err(ServiceError::PumpIndexOutOfRange(index));
        }
        self.controller.pump(index - 1).map_err(|e| match e {
            ControllerError::NotConnected => ServiceError::NotConnected,
            _ => ServiceError::PumpIndexOutOfRange(index),
        })
    }

    fn direction(pump: &Pump, direction: &str) -> Result<Direction, ServiceError> {
        Direction::parse_or(direction, pump.calibration().direction_default)
            .map_err(|e| ServiceError::InvalidDirection(e.0))
    }

    /// Fail with `PumpInterrupted` if a finished wait left volume behind
    async fn check_completed(pump: &Pump, requested_ul: f64) -> Result<(), ServiceError> {
        let remaining_ul = pump.remaining_volume_ul().await?;
        if remaining_ul > 0.0 {
            warn!("Pump {} interrupted with {} uL left", pump.channel(), remaining_ul);
            return Err(ServiceError::PumpInterrupted {
                pumped_ul: requested_ul - remaining_ul,
                remaining_ul,
            });
        }
        Ok(())
    }

    /// Pump `volume_ul` and wait for completion; returns the pumped volume
    pub async fn start_pump(
        &self,
        index: usize,
        volume_ul: f64,
        flow_rate: f64,
        direction: &str,
    ) -> Result<f64, ServiceError> {
        let pump = self.pump(index)?;
        let direction = Self::direction(pump, direction)?;
        pump.pump_volume(volume_ul, flow_rate, Some(direction), true)
            .await
            .map_err(|e| ServiceError::from_flow_request(e, flow_rate, volume_ul))?;
        Self::check_completed(pump, volume_ul).await?;
        Ok(volume_ul)
    }

    /// Run until stopped
    pub async fn start_pump_continuous(
        &self,
        index: usize,
        flow_rate: f64,
        direction: &str,
    ) -> Result<(), ServiceError> {
        let pump = self.pump(index)?;
        let direction = Self::direction(pump, direction)?;
        pump.pump_continuous(flow_rate, Some(direction))
            .await
            .map_err(|e| ServiceError::from_flow_request(e, flow_rate, 0.0))
    }

    /// Turn the pump head `revolutions` times at `rpm` and wait for completion
    pub async fn start_pump_calibration(
        &self,
        index: usize,
        revolutions: f64,
        rpm: f64,
        direction: &str,
    ) -> Result<(), ServiceError> {
        let pump = self.pump(index)?;
        let direction = Self::direction(pump, direction)?;
        let volume_ul = revolutions_to_volume(revolutions, pump.calibration().ul_per_rev);
        pump.pump_volume_rpm(volume_ul, rpm, Some(direction), true)
            .await
            .map_err(|e| ServiceError::from_rpm_request(e, rpm, revolutions))?;
        Self::check_completed(pump, volume_ul).await
    }

    /// Stop the pump; returns the volume left of a finite run
    pub async fn stop_pump(&self, index: usize) -> Result<f64, ServiceError> {
        let pump = self.pump(index)?;
        Ok(pump.pump_stop().await?)
    }

    /// Resume a stopped run and wait for it; returns the volume pumped after resuming
    pub async fn resume_pump(&self, index: usize) -> Result<f64, ServiceError> {
        let pump = self.pump(index)?;
        let remaining_ul = pump.pump_resume(true).await?;
        Self::check_completed(pump, remaining_ul).await?;
        Ok(remaining_ul)
    }

    /// Set the volume per revolution of a pump
    pub fn set_pump_calibration(&self, index: usize, ul_per_rev: f64) -> Result<(), ServiceError> {
        let pump = self.pump(index)?;
        Ok(pump.set_calibration_ul_per_rev(ul_per_rev)?)
    }
}
