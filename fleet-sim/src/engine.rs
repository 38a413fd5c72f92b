//! Movement engine: drives a scooter from its position to a destination,
//! one step per tick, discharging the battery as it goes.
//!
//! Movement happens in three ordered phases:
//! 1. diagonal, both axes step together while both still differ;
//! 2. latitude only, once longitude has converged;
//! 3. longitude only, once latitude has converged.
//!
//! Axis directions are fixed when a phase is entered. A step never overshoots:
//! when an axis is within one step of its target it snaps onto it, so an
//! arrived scooter sits exactly on the destination.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::position::Position;

pub const DEFAULT_STEP: f64 = 0.0001;
pub const DEFAULT_DISCHARGE_PER_STEP: f64 = 0.1;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(450);

/// Relative slack used for float comparisons against the step size.
const STEP_SLACK: f64 = 1e-9;

/// Per-trip motion parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionProfile {
    /// Distance covered on each axis per tick, in degrees.
    pub step: f64,
    /// Battery percent consumed per tick.
    pub discharge_per_step: f64,
    /// Wall-clock pacing between ticks. Zero collapses the trip to no delay.
    pub tick_interval: Duration,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP,
            discharge_per_step: DEFAULT_DISCHARGE_PER_STEP,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl MotionProfile {
    /// Profile without pacing, for tests and batch replays.
    pub fn instant(step: f64, discharge_per_step: f64) -> Self {
        Self {
            step,
            discharge_per_step,
            tick_interval: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(SimError::InvalidParameter(format!(
                "step must be a positive number, got {}",
                self.step
            )));
        }
        if !self.discharge_per_step.is_finite() || self.discharge_per_step <= 0.0 {
            return Err(SimError::InvalidParameter(format!(
                "discharge per step must be a positive number, got {}",
                self.discharge_per_step
            )));
        }
        Ok(())
    }
}

/// Serialized form of a [`MotionProfile`], as found in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConf {
    pub step: f64,
    pub discharge_per_step: f64,
    pub tick_interval_ms: u64,
}

impl Default for MotionConf {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP,
            discharge_per_step: DEFAULT_DISCHARGE_PER_STEP,
            tick_interval_ms: DEFAULT_TICK_INTERVAL.as_millis() as u64,
        }
    }
}

impl MotionConf {
    pub fn profile(&self) -> MotionProfile {
        MotionProfile {
            step: self.step,
            discharge_per_step: self.discharge_per_step,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
        }
    }
}

/// Why a simulation stopped producing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Arrived,
    Discharged,
}

/// One tick of movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// 1-based tick number within this simulation.
    pub tick: u64,
    pub position: Position,
    /// Remaining battery percent, never negative.
    pub battery: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Diagonal,
    Latitude,
    Longitude,
}

/// Finite, non-restartable sequence of [`Sample`]s toward a destination.
///
/// A fresh `Simulation` is needed for every trip or redirect.
#[derive(Debug, Clone)]
pub struct Simulation {
    position: Position,
    destination: Position,
    battery_start: f64,
    battery: f64,
    profile: MotionProfile,
    phase: Phase,
    direction: (f64, f64),
    tick: u64,
    outcome: Option<Outcome>,
}

impl Simulation {
    pub fn new(
        start: Position,
        destination: Position,
        battery_start: f64,
        profile: MotionProfile,
    ) -> Result<Self, SimError> {
        profile.validate()?;
        if !start.is_finite() || !destination.is_finite() {
            return Err(SimError::InvalidParameter(
                "positions must be finite".to_string(),
            ));
        }
        if !battery_start.is_finite() {
            return Err(SimError::InvalidParameter(format!(
                "battery must be finite, got {battery_start}"
            )));
        }

        let mut sim = Self {
            position: start,
            destination,
            battery_start,
            battery: battery_start.max(0.0),
            profile,
            phase: Phase::Diagonal,
            direction: (0.0, 0.0),
            tick: 0,
            outcome: None,
        };
        sim.direction = sim.axis_directions();
        sim.settle();
        Ok(sim)
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn destination(&self) -> Position {
        self.destination
    }

    pub fn battery(&self) -> f64 {
        self.battery
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn profile(&self) -> &MotionProfile {
        &self.profile
    }

    /// `Some` as soon as the last sample has been produced.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    fn lat_converged(&self) -> bool {
        (self.destination.latitude - self.position.latitude).abs() <= self.profile.step * STEP_SLACK
    }

    fn lon_converged(&self) -> bool {
        (self.destination.longitude - self.position.longitude).abs()
            <= self.profile.step * STEP_SLACK
    }

    fn axis_directions(&self) -> (f64, f64) {
        (
            direction(self.destination.latitude - self.position.latitude),
            direction(self.destination.longitude - self.position.longitude),
        )
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.direction = self.axis_directions();
    }

    /// Records the outcome once a halting condition holds. Arrival wins over
    /// discharge when both happen on the same tick.
    fn settle(&mut self) {
        if self.lat_converged() && self.lon_converged() {
            self.outcome = Some(Outcome::Arrived);
        } else if self.battery <= 0.0 {
            self.outcome = Some(Outcome::Discharged);
        }
    }

    /// Moves one tick within the current phase. Only called while not arrived.
    fn step_phase(&mut self) {
        let step = self.profile.step;
        loop {
            match self.phase {
                Phase::Diagonal if !self.lat_converged() && !self.lon_converged() => {
                    self.position.latitude = advance(
                        self.position.latitude,
                        self.destination.latitude,
                        self.direction.0,
                        step,
                    );
                    self.position.longitude = advance(
                        self.position.longitude,
                        self.destination.longitude,
                        self.direction.1,
                        step,
                    );
                    return;
                }
                Phase::Diagonal => self.enter(Phase::Latitude),
                Phase::Latitude if !self.lat_converged() => {
                    self.position.latitude = advance(
                        self.position.latitude,
                        self.destination.latitude,
                        self.direction.0,
                        step,
                    );
                    return;
                }
                Phase::Latitude => self.enter(Phase::Longitude),
                Phase::Longitude => {
                    self.position.longitude = advance(
                        self.position.longitude,
                        self.destination.longitude,
                        self.direction.1,
                        step,
                    );
                    return;
                }
            }
        }
    }
}

impl Iterator for Simulation {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.outcome.is_some() {
            return None;
        }

        self.step_phase();
        self.tick = self.tick.saturating_add(1);
        // Computed from the start value so repeated subtraction does not drift.
        let drained = self.profile.discharge_per_step * self.tick as f64;
        self.battery = (self.battery_start - drained).max(0.0);
        self.settle();

        Some(Sample {
            tick: self.tick,
            position: self.position,
            battery: self.battery,
        })
    }
}

fn direction(delta: f64) -> f64 {
    if delta > 0.0 {
        1.0
    } else if delta < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn advance(current: f64, target: f64, direction: f64, step: f64) -> f64 {
    if (target - current).abs() <= step * (1.0 + STEP_SLACK) {
        target
    } else {
        current + direction * step
    }
}
