//! Microstep optimizer
//!
//! Picks the microstep exponent whose achievable speed is closest to the
//! requested one. Step intervals shrink and step counts grow as the exponent
//! rises, which lets the search skip or stop early.

use super::units::{revolutions_to_steps, Drivetrain, StepTiming, MAX_STEPS};

/// Inclusive range of microstep exponents a channel supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrostepRange {
    pub min_exp: u8,
    pub max_exp: u8,
}

impl Default for MicrostepRange {
    fn default() -> Self {
        Self {
            min_exp: 0,
            max_exp: super::units::MAX_MICROSTEP_EXPONENT,
        }
    }
}

impl MicrostepRange {
    pub fn new(min_exp: u8, max_exp: u8) -> Self {
        Self { min_exp, max_exp }
    }

    pub fn contains(&self, exponent: u8) -> bool {
        (self.min_exp..=self.max_exp).contains(&exponent)
    }
}

/// Result of a successful search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicrostepChoice {
    pub exponent: u8,
    /// Steps per pump-head revolution at `exponent`
    pub steps_per_rev: f64,
    pub step_interval: u32,
    /// Step count for finite runs
    pub steps: Option<u32>,
    pub achieved_rpm: f64,
    /// `|requested - achieved|` in RPM
    pub error: f64,
}

/// Best exponent for running continuously at `rpm`
pub fn optimize_continuous(
    timing: &StepTiming,
    drivetrain: &Drivetrain,
    range: MicrostepRange,
    rpm: f64,
) -> Option<MicrostepChoice> {
    search(timing, drivetrain, range, rpm, None)
}

/// Best exponent for moving `revolutions` at `rpm`
pub fn optimize_finite(
    timing: &StepTiming,
    drivetrain: &Drivetrain,
    range: MicrostepRange,
    rpm: f64,
    revolutions: f64,
) -> Option<MicrostepChoice> {
    search(timing, drivetrain, range, rpm, Some(revolutions))
}

fn search(
    timing: &StepTiming,
    drivetrain: &Drivetrain,
    range: MicrostepRange,
    rpm: f64,
    revolutions: Option<f64>,
) -> Option<MicrostepChoice> {
    let mut best: Option<MicrostepChoice> = None;

    for exponent in range.min_exp..=range.max_exp {
        let spr = drivetrain.steps_per_rev_exp(exponent);
        let interval = timing.rpm_to_step_interval(rpm, spr);
        if interval > timing.max_step_interval() {
            continue;
        }
        if interval < timing.min_step_interval() {
            break;
        }

        let steps = match revolutions {
            Some(revs) => {
                let steps = revolutions_to_steps(revs, spr);
                if steps > MAX_STEPS as u64 {
                    break;
                }
                Some(steps as u32)
            }
            None => None,
        };

        let achieved_rpm = timing.step_interval_to_rpm(interval, spr);
        let error = (rpm - achieved_rpm).abs();
        // strict improvement keeps the lowest exponent on ties
        if best.map_or(true, |b| error < b.error) {
            best = Some(MicrostepChoice {
                exponent,
                steps_per_rev: spr,
                step_interval: interval as u32,
                steps,
                achieved_rpm,
                error,
            });
        }
    }

    best
}
