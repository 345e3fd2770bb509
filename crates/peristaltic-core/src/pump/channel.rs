//! One pump channel
//!
//! A `Pump` owns the host-side mirror of its channel's registers and turns
//! volume/flow-rate requests into register writes. Multi-write operations are
//! serialized per pump; waiting for a finite run to complete happens outside
//! that lock so a stop from another task can release the waiter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::PumpError;
use super::state::{Calibration, Direction, PumpState, PumpStatus};
use crate::motor::units::{
    flow_rate_to_rpm, revolutions_to_steps, rpm_to_flow_rate, steps_to_revolutions,
    volume_to_revolutions,
};
use crate::motor::{optimize_continuous, optimize_finite, StepTiming, MAX_STEPS};
use crate::protocol::{Access, CommandEntry, Parameter, Transport, CHANNEL_COUNT, COMMAND_TABLE};

struct PumpInner {
    state: PumpState,
    calibration: Calibration,
}

/// Register values for a run, validated before anything is written
#[derive(Debug, Clone, Copy)]
struct RunPlan {
    exponent: Option<u8>,
    steps_per_rev: f64,
    step_interval: u32,
    steps: Option<u32>,
}

/// A single pump channel of the controller
pub struct Pump {
    channel: usize,
    transport: Arc<Transport>,
    timing: StepTiming,
    inner: Mutex<PumpInner>,
    /// Serializes multi-write operations on this channel
    op_lock: tokio::sync::Mutex<()>,
    /// `true` while the channel is stopped
    finished: watch::Sender<bool>,
    finish_timeout: Option<Duration>,
}

impl Pump {
    /// Create the pump for `channel`. The mirror starts at defaults until `refresh`.
    pub fn new(
        channel: usize,
        transport: Arc<Transport>,
        timing: StepTiming,
        calibration: Calibration,
        finish_timeout: Option<Duration>,
    ) -> Result<Arc<Self>, PumpError> {
        if channel >= CHANNEL_COUNT {
            return Err(PumpError::InvalidChannel(channel));
        }
        let (finished, _) = watch::channel(true);
        Ok(Arc::new(Self {
            channel,
            transport,
            timing,
            inner: Mutex::new(PumpInner {
                state: PumpState::default(),
                calibration,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            finished,
            finish_timeout,
        }))
    }

    /// Route this channel's finished signal to the pump
    pub(crate) fn route_finished(self: &Arc<Self>) {
        let pump = Arc::downgrade(self);
        self.transport.route_finished(
            self.channel,
            Arc::new(move || {
                if let Some(pump) = pump.upgrade() {
                    pump.on_finished();
                }
            }),
        );
    }

    /// Called from the receiver thread when the controller reports the run is done
    fn on_finished(&self) {
        self.inner().state.running = false;
        self.finished.send_replace(true);
        debug!("Pump {} finished", self.channel);
    }

    fn inner(&self) -> MutexGuard<'_, PumpInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn timing(&self) -> StepTiming {
        self.timing
    }

    /// Current calibration
    pub fn calibration(&self) -> Calibration {
        self.inner().calibration.clone()
    }

    /// Mirrored register state
    pub fn state(&self) -> PumpState {
        self.inner().state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner().state.running
    }

    /// Change the volume per revolution
    pub fn set_calibration_ul_per_rev(&self, ul_per_rev: f64) -> Result<(), PumpError> {
        if !ul_per_rev.is_finite() || ul_per_rev <= 0.0 {
            return Err(PumpError::CalibrationOutOfRange(ul_per_rev));
        }
        self.inner().calibration.ul_per_rev = ul_per_rev;
        info!("Pump {} calibration set to {} uL/rev", self.channel, ul_per_rev);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Limits and reporting
    // ------------------------------------------------------------------

    /// Steps per revolution at the current microstep setting
    pub fn steps_per_rev(&self) -> f64 {
        let inner = self.inner();
        inner
            .calibration
            .drivetrain
            .steps_per_rev(inner.state.microsteps)
    }

    /// Steps per revolution at the coarsest (`finest == false`) or finest usable setting
    fn limit_steps_per_rev(inner: &PumpInner, finest: bool) -> f64 {
        let drivetrain = &inner.calibration.drivetrain;
        if inner.state.variable_microstepping {
            let range = inner.calibration.microstep_range;
            drivetrain.steps_per_rev_exp(if finest { range.max_exp } else { range.min_exp })
        } else {
            drivetrain.steps_per_rev(inner.state.microsteps)
        }
    }

    /// Fastest speed, limited by configuration and the shortest step interval
    pub fn max_rpm(&self) -> f64 {
        let inner = self.inner();
        let spr = Self::limit_steps_per_rev(&inner, false);
        let hardware = self
            .timing
            .step_interval_to_rpm(self.timing.min_step_interval(), spr);
        inner.calibration.max_rpm.min(hardware)
    }

    /// Slowest speed the longest step interval allows
    pub fn min_rpm(&self) -> f64 {
        let inner = self.inner();
        let spr = Self::limit_steps_per_rev(&inner, true);
        self.timing
            .step_interval_to_rpm(self.timing.max_step_interval(), spr)
    }

    pub fn max_flow_rate_ul_per_sec(&self) -> f64 {
        rpm_to_flow_rate(self.max_rpm(), self.ul_per_rev())
    }

    pub fn min_flow_rate_ul_per_sec(&self) -> f64 {
        rpm_to_flow_rate(self.min_rpm(), self.ul_per_rev())
    }

    /// Largest volume a single finite run can move
    pub fn max_volume_ul(&self) -> f64 {
        let inner = self.inner();
        let spr = Self::limit_steps_per_rev(&inner, false);
        (MAX_STEPS as f64 / spr) * inner.calibration.ul_per_rev
    }

    /// Volume of one step at the finest setting
    pub fn min_volume_ul(&self) -> f64 {
        let inner = self.inner();
        let spr = Self::limit_steps_per_rev(&inner, true);
        inner.calibration.ul_per_rev / spr
    }

    fn ul_per_rev(&self) -> f64 {
        self.inner().calibration.ul_per_rev
    }

    /// Speed set by the mirrored step interval
    pub fn rpm(&self) -> f64 {
        let inner = self.inner();
        let spr = inner
            .calibration
            .drivetrain
            .steps_per_rev(inner.state.microsteps);
        self.timing
            .step_interval_to_rpm(inner.state.step_interval as u64, spr)
    }

    pub fn flow_rate_ul_per_sec(&self) -> f64 {
        rpm_to_flow_rate(self.rpm(), self.ul_per_rev())
    }

    /// Volume left in the current finite run, zero in continuous mode
    pub async fn remaining_volume_ul(&self) -> Result<f64, PumpError> {
        if !self.inner().state.finite_mode {
            return Ok(0.0);
        }
        let steps = self.read(Parameter::Steps).await?;
        Ok(self.steps_to_volume(steps))
    }

    /// Volume the current finite run started with, zero in continuous mode
    pub async fn target_volume_ul(&self) -> Result<f64, PumpError> {
        if !self.inner().state.finite_mode {
            return Ok(0.0);
        }
        let steps = self.read(Parameter::TargetSteps).await?;
        Ok(self.steps_to_volume(steps))
    }

    /// Time until the current finite run completes at the set speed
    pub async fn remaining_time(&self) -> Result<Option<Duration>, PumpError> {
        if !self.inner().state.finite_mode {
            return Ok(None);
        }
        let remaining = self.remaining_volume_ul().await?;
        let flow_rate = self.flow_rate_ul_per_sec();
        Ok(Duration::try_from_secs_f64(remaining / flow_rate).ok())
    }

    fn steps_to_volume(&self, steps: u32) -> f64 {
        let inner = self.inner();
        let spr = inner
            .calibration
            .drivetrain
            .steps_per_rev(inner.state.microsteps);
        steps_to_revolutions(steps as u64, spr) * inner.calibration.ul_per_rev
    }

    /// Snapshot with fresh step counters
    pub async fn status(&self) -> Result<PumpStatus, PumpError> {
        let steps_remaining = self.read(Parameter::Steps).await?;
        let target_steps = self.read(Parameter::TargetSteps).await?;
        let state = self.state();
        let (remaining_volume_ul, target_volume_ul) = if state.finite_mode {
            (
                self.steps_to_volume(steps_remaining),
                self.steps_to_volume(target_steps),
            )
        } else {
            (0.0, 0.0)
        };

        Ok(PumpStatus {
            channel: self.channel,
            phase: state.phase(steps_remaining),
            state,
            steps_remaining,
            target_steps,
            rpm: self.rpm(),
            flow_rate_ul_per_sec: self.flow_rate_ul_per_sec(),
            remaining_volume_ul,
            target_volume_ul,
        })
    }

    /// Read every mirrored register back from the controller, then apply the
    /// configured microstepping limits
    pub async fn refresh(&self) -> Result<PumpState, PumpError> {
        let _op = self.op_lock.lock().await;

        let var_support = self.read(Parameter::VarMicrostepSupport).await? != 0;
        let running = self.read(Parameter::Running).await? != 0;
        let enabled = self.read(Parameter::Enabled).await? != 0;
        let direction = self.read(Parameter::Direction).await? != 0;
        let step_interval = self.read(Parameter::StepInterval).await?;
        let finite_mode = self.read(Parameter::FiniteMode).await? != 0;
        let exponent = self.read(Parameter::MicrostepExponent).await?;

        let state = {
            let mut inner = self.inner();
            let inverse = inner.calibration.direction_inverse;
            let allowed = inner.calibration.variable_microstepping;
            let fixed = inner.calibration.microsteps;

            let state = &mut inner.state;
            state.running = running;
            state.enabled = enabled;
            state.direction = Direction::from_bool(direction != inverse);
            state.step_interval = step_interval;
            state.finite_mode = finite_mode;
            state.set_exponent(u8::try_from(exponent).unwrap_or(u8::MAX));

            state.variable_microstepping = var_support && allowed;
            if !state.variable_microstepping {
                state.microsteps = fixed;
            }
            state.clone()
        };
        self.finished.send_replace(!state.running);

        debug!("Pump {} state: {:?}", self.channel, state);
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Pumping
    // ------------------------------------------------------------------

    /// Pump `volume_ul` at `flow_rate_ul_per_sec`
    pub async fn pump_volume(
        &self,
        volume_ul: f64,
        flow_rate_ul_per_sec: f64,
        direction: Option<Direction>,
        blocking: bool,
    ) -> Result<(), PumpError> {
        let rpm = flow_rate_to_rpm(flow_rate_ul_per_sec, self.ul_per_rev());
        self.pump_volume_rpm(volume_ul, rpm, direction, blocking).await
    }

    /// Pump `volume_ul` at `rpm`, optionally waiting until the run completes
    pub async fn pump_volume_rpm(
        &self,
        volume_ul: f64,
        rpm: f64,
        direction: Option<Direction>,
        blocking: bool,
    ) -> Result<(), PumpError> {
        {
            let _op = self.op_lock.lock().await;

            if !(volume_ul > 0.0) {
                return Err(PumpError::VolumeOutOfRange {
                    volume_ul,
                    min_ul: 0.0,
                    max_ul: self.max_volume_ul(),
                });
            }
            let revolutions = volume_to_revolutions(volume_ul, self.ul_per_rev());
            let max_revolutions = MAX_STEPS as f64 / self.steps_per_rev();
            if revolutions >= max_revolutions {
                return Err(PumpError::RevolutionsOutOfRange {
                    revolutions,
                    max: max_revolutions,
                });
            }
            self.validate_rpm(rpm)?;
            self.ensure_stopped()?;

            let plan = self.plan(rpm, Some(revolutions))?;
            let direction = self.resolve_direction(direction);
            info!(
                "Pump {} pumping {} uL at {} rpm ({:?})",
                self.channel, volume_ul, rpm, direction
            );
            self.start(plan, direction, true).await?;
        }

        if blocking {
            self.wait_finished().await?;
        }
        Ok(())
    }

    /// Pump for `duration` at `flow_rate_ul_per_sec`
    pub async fn pump_duration(
        &self,
        duration: Duration,
        flow_rate_ul_per_sec: f64,
        direction: Option<Direction>,
        blocking: bool,
    ) -> Result<(), PumpError> {
        if duration.is_zero() {
            return Err(PumpError::DurationOutOfRange);
        }
        let volume_ul = flow_rate_ul_per_sec * duration.as_secs_f64();
        self.pump_volume(volume_ul, flow_rate_ul_per_sec, direction, blocking)
            .await
    }

    /// Pump for `duration` at `rpm`
    pub async fn pump_duration_rpm(
        &self,
        duration: Duration,
        rpm: f64,
        direction: Option<Direction>,
        blocking: bool,
    ) -> Result<(), PumpError> {
        if duration.is_zero() {
            return Err(PumpError::DurationOutOfRange);
        }
        let volume_ul = rpm_to_flow_rate(rpm, self.ul_per_rev()) * duration.as_secs_f64();
        self.pump_volume_rpm(volume_ul, rpm, direction, blocking)
            .await
    }

    /// Run continuously at `flow_rate_ul_per_sec` until stopped
    pub async fn pump_continuous(
        &self,
        flow_rate_ul_per_sec: f64,
        direction: Option<Direction>,
    ) -> Result<(), PumpError> {
        let rpm = flow_rate_to_rpm(flow_rate_ul_per_sec, self.ul_per_rev());
        self.pump_continuous_rpm(rpm, direction).await
    }

    /// Run continuously at `rpm` until stopped
    pub async fn pump_continuous_rpm(
        &self,
        rpm: f64,
        direction: Option<Direction>,
    ) -> Result<(), PumpError> {
        let _op = self.op_lock.lock().await;

        self.validate_rpm(rpm)?;
        self.ensure_stopped()?;

        let plan = self.plan(rpm, None)?;
        let direction = self.resolve_direction(direction);
        info!(
            "Pump {} running continuously at {} rpm ({:?})",
            self.channel, rpm, direction
        );
        self.start(plan, direction, false).await
    }

    /// Stop the channel and return the volume left in a finite run
    ///
    /// Stopping a stopped channel writes nothing.
    pub async fn pump_stop(&self) -> Result<f64, PumpError> {
        {
            let _op = self.op_lock.lock().await;
            self.set_running(false).await?;
        }
        self.remaining_volume_ul().await
    }

    /// Resume a stopped finite run and return the volume it had left
    ///
    /// Only waits for completion when `blocking` and the channel is in finite mode.
    pub async fn pump_resume(&self, blocking: bool) -> Result<f64, PumpError> {
        let (remaining, finite) = {
            let _op = self.op_lock.lock().await;
            let remaining = self.remaining_volume_ul().await?;
            self.set_running(true).await?;
            (remaining, self.inner().state.finite_mode)
        };

        if blocking && finite {
            self.wait_finished().await?;
        }
        Ok(remaining)
    }

    /// Change the flow rate, also while running
    pub async fn set_flow_rate_ul_per_sec(&self, flow_rate_ul_per_sec: f64) -> Result<(), PumpError> {
        let rpm = flow_rate_to_rpm(flow_rate_ul_per_sec, self.ul_per_rev());
        self.set_rpm(rpm).await
    }

    /// Change the speed, also while running
    ///
    /// A finite run keeps its remaining and target revolutions even when the
    /// microstep setting changes. Nothing is written unless the new speed is
    /// reachable.
    pub async fn set_rpm(&self, rpm: f64) -> Result<(), PumpError> {
        let _op = self.op_lock.lock().await;

        let max_rpm = self.inner().calibration.max_rpm;
        if !(rpm > 0.0) || rpm >= max_rpm {
            return Err(PumpError::RpmOutOfRange {
                rpm,
                min: 0.0,
                max: max_rpm,
            });
        }

        let (was_running, finite) = {
            let inner = self.inner();
            (inner.state.running, inner.state.finite_mode)
        };
        let old_spr = self.steps_per_rev();

        if finite {
            let target_steps = self.read(Parameter::TargetSteps).await?;
            let target_revs = steps_to_revolutions(target_steps as u64, old_spr);
            let plan = self.plan(rpm, Some(target_revs))?;

            if was_running {
                self.set_running(false).await?;
            }
            let steps = self.read(Parameter::Steps).await?;
            let revs = steps_to_revolutions(steps as u64, old_spr);
            let new_steps = self.checked_steps(revs, plan.steps_per_rev)?;
            let new_target = plan.steps.unwrap_or(target_steps);

            if let Some(exponent) = plan.exponent {
                self.set_exponent(exponent).await?;
            }
            self.set_step_interval(plan.step_interval).await?;
            // setting steps also resets the target on the controller
            self.write(Parameter::Steps, new_steps).await?;
            self.write(Parameter::TargetSteps, new_target).await?;
            debug!(
                "Pump {} steps {} -> {}, target {} -> {}",
                self.channel, steps, new_steps, target_steps, new_target
            );
        } else {
            let plan = self.plan(rpm, None)?;
            if was_running {
                self.set_running(false).await?;
            }
            if let Some(exponent) = plan.exponent {
                self.set_exponent(exponent).await?;
            }
            self.set_step_interval(plan.step_interval).await?;
        }

        if was_running {
            self.set_running(true).await?;
        }
        info!("Pump {} speed changed to {} rpm", self.channel, rpm);
        Ok(())
    }

    /// Enable or disable the motor driver; disabling also stops the channel
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), PumpError> {
        let _op = self.op_lock.lock().await;
        self.set_enabled_register(enabled).await?;
        if !enabled {
            self.set_running(false).await?;
        }
        Ok(())
    }

    /// Wait until the channel reports it stopped
    pub async fn wait_finished(&self) -> Result<(), PumpError> {
        let mut finished = self.finished.subscribe();
        let wait = finished.wait_for(|stopped| *stopped);
        let result = match self.finish_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => return Err(PumpError::FinishTimeout(self.channel)),
            },
            None => wait.await.map(|_| ()),
        };
        result.map_err(|_| crate::protocol::ProtocolError::ConnectionClosed.into())
    }

    // ------------------------------------------------------------------
    // Validation and planning
    // ------------------------------------------------------------------

    fn validate_rpm(&self, rpm: f64) -> Result<(), PumpError> {
        let configured = self.inner().calibration.max_rpm;
        let max = self.max_rpm();
        let min = self.min_rpm();
        if !(rpm > 0.0) || rpm >= configured || rpm > max || rpm < min {
            return Err(PumpError::RpmOutOfRange { rpm, min, max });
        }
        Ok(())
    }

    fn ensure_stopped(&self) -> Result<(), PumpError> {
        if self.is_running() {
            return Err(PumpError::AlreadyRunning(self.channel));
        }
        Ok(())
    }

    fn resolve_direction(&self, direction: Option<Direction>) -> Direction {
        direction.unwrap_or_else(|| self.inner().calibration.direction_default)
    }

    /// Work out exponent, interval and step count for a run without touching the controller
    fn plan(&self, rpm: f64, revolutions: Option<f64>) -> Result<RunPlan, PumpError> {
        let (calibration, state) = {
            let inner = self.inner();
            (inner.calibration.clone(), inner.state.clone())
        };

        let (exponent, spr) = if state.variable_microstepping {
            let choice = match revolutions {
                Some(revs) => optimize_finite(
                    &self.timing,
                    &calibration.drivetrain,
                    calibration.microstep_range,
                    rpm,
                    revs,
                ),
                None => optimize_continuous(
                    &self.timing,
                    &calibration.drivetrain,
                    calibration.microstep_range,
                    rpm,
                ),
            }
            .ok_or(PumpError::Infeasible { rpm })?;
            debug!(
                "Pump {} microstep exponent {} (error {} rpm)",
                self.channel, choice.exponent, choice.error
            );
            (Some(choice.exponent), choice.steps_per_rev)
        } else {
            (
                None,
                calibration.drivetrain.steps_per_rev(state.microsteps),
            )
        };

        let interval = self.timing.rpm_to_step_interval(rpm, spr);
        if !self.timing.interval_in_range(interval) {
            return Err(PumpError::StepIntervalOutOfRange {
                interval,
                min: self.timing.min_step_interval(),
                max: self.timing.max_step_interval(),
            });
        }

        let steps = match revolutions {
            Some(revs) => Some(self.checked_steps(revs, spr)?),
            None => None,
        };

        Ok(RunPlan {
            exponent,
            steps_per_rev: spr,
            step_interval: interval as u32,
            steps,
        })
    }

    fn checked_steps(&self, revolutions: f64, spr: f64) -> Result<u32, PumpError> {
        let steps = revolutions_to_steps(revolutions, spr);
        if steps > MAX_STEPS as u64 {
            return Err(PumpError::StepCountOutOfRange {
                steps,
                max: MAX_STEPS as u64,
            });
        }
        Ok(steps as u32)
    }

    /// Write a validated run; mode and direction go out before the run flag
    async fn start(&self, plan: RunPlan, direction: Direction, finite: bool) -> Result<(), PumpError> {
        if let Some(exponent) = plan.exponent {
            self.set_exponent(exponent).await?;
        }
        self.set_running(false).await?;
        self.set_enabled_register(true).await?;
        self.set_direction(direction).await?;
        self.set_finite_mode(finite).await?;
        self.set_step_interval(plan.step_interval).await?;
        // continuous runs only need a nonzero counter
        self.write(Parameter::Steps, plan.steps.unwrap_or(1)).await?;
        self.set_running(true).await
    }

    // ------------------------------------------------------------------
    // Register access
    // ------------------------------------------------------------------

    fn command(&self, parameter: Parameter, access: Access) -> Result<CommandEntry, PumpError> {
        COMMAND_TABLE
            .channel_command(self.channel, parameter, access)
            .ok_or(PumpError::InvalidChannel(self.channel))
    }

    async fn read(&self, parameter: Parameter) -> Result<u32, PumpError> {
        let command = self.command(parameter, Access::Get)?;
        Ok(self.transport.get(command).await?)
    }

    async fn write(&self, parameter: Parameter, value: u32) -> Result<(), PumpError> {
        let command = self.command(parameter, Access::Set)?;
        Ok(self.transport.set(command, value).await?)
    }

    async fn set_running(&self, running: bool) -> Result<(), PumpError> {
        if self.inner().state.running == running {
            return Ok(());
        }
        // mirror first so a finished signal racing the ack is not overwritten;
        // waiters are released on stop even before the controller acks
        self.inner().state.running = running;
        self.finished.send_replace(!running);
        if let Err(e) = self.write(Parameter::Running, running as u32).await {
            self.inner().state.running = !running;
            self.finished.send_replace(running);
            return Err(e);
        }
        Ok(())
    }

    async fn set_enabled_register(&self, enabled: bool) -> Result<(), PumpError> {
        if self.inner().state.enabled == enabled {
            return Ok(());
        }
        self.write(Parameter::Enabled, enabled as u32).await?;
        self.inner().state.enabled = enabled;
        Ok(())
    }

    async fn set_direction(&self, direction: Direction) -> Result<(), PumpError> {
        let (current, inverse) = {
            let inner = self.inner();
            (inner.state.direction, inner.calibration.direction_inverse)
        };
        if current == direction {
            return Ok(());
        }
        let wire = direction.as_bool() != inverse;
        self.write(Parameter::Direction, wire as u32).await?;
        self.inner().state.direction = direction;
        Ok(())
    }

    async fn set_finite_mode(&self, finite: bool) -> Result<(), PumpError> {
        if self.inner().state.finite_mode == finite {
            return Ok(());
        }
        self.write(Parameter::FiniteMode, finite as u32).await?;
        self.inner().state.finite_mode = finite;
        Ok(())
    }

    async fn set_step_interval(&self, interval: u32) -> Result<(), PumpError> {
        if self.inner().state.step_interval == interval {
            return Ok(());
        }
        self.write(Parameter::StepInterval, interval).await?;
        self.inner().state.step_interval = interval;
        Ok(())
    }

    async fn set_exponent(&self, exponent: u8) -> Result<(), PumpError> {
        let (supported, current) = {
            let inner = self.inner();
            (
                inner.state.variable_microstepping,
                inner.state.microstep_exponent,
            )
        };
        if !supported {
            warn!("Pump {} cannot change microstepping", self.channel);
            return Err(PumpError::MicrostepUnsupported(self.channel));
        }
        if current == exponent {
            return Ok(());
        }
        self.write(Parameter::MicrostepExponent, exponent as u32)
            .await?;
        self.inner().state.set_exponent(exponent);
        Ok(())
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("Pump")
            .field("channel", &self.channel)
            .field("state", &inner.state)
            .field("calibration", &inner.calibration)
            .finish()
    }
}
