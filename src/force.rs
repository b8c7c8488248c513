//! Force selection after contact.
//!
//! [`ForceRamp`] covers the settling period between contact and grasp,
//! [`HoldingScheduler`] the sustained hold afterwards. All forces are percent
//! of the configured maximum current.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::ForceConfig;

/// Exponential decay from the moving force toward the grasp force.
#[derive(Debug, Clone, Copy)]
pub struct ForceRamp {
    start: f32,
    target: f32,
    time_constant: Duration,
    stable_factor: f32,
}

impl ForceRamp {
    pub fn new(config: &ForceConfig) -> Self {
        Self {
            start: config.moving_force,
            target: config.grasping_force,
            time_constant: config.ramp_time_constant(),
            stable_factor: config.stable_ramp_factor.max(1.0),
        }
    }

    /// Force after `elapsed` since contact. A stabilized grasp decays faster.
    pub fn force_at(&self, elapsed: Duration, stabilized: bool) -> f32 {
        let mut tau = self.time_constant.as_secs_f32();
        if stabilized {
            tau /= self.stable_factor;
        }
        if tau <= f32::EPSILON {
            return self.target;
        }
        let decay = (-elapsed.as_secs_f32() / tau).exp();
        self.target + (self.start - self.target) * decay
    }
}

/// Holding level requested by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldLevel {
    Low,
    Mid,
}

/// Picks and smooths the holding force while a grasp is held.
#[derive(Debug, Clone)]
pub struct HoldingScheduler {
    config: ForceConfig,
    level: HoldLevel,
    force: f32,
    last_position: Option<f32>,
}

impl HoldingScheduler {
    pub fn new(config: ForceConfig) -> Self {
        Self {
            config,
            level: HoldLevel::Low,
            force: config.grasping_force,
            last_position: None,
        }
    }

    /// Start a new hold from `force` at `position`.
    pub fn begin(&mut self, force: f32, position: f32) {
        self.level = HoldLevel::Low;
        self.force = force;
        self.last_position = Some(position);
    }

    pub fn level(&self) -> HoldLevel {
        self.level
    }

    pub fn force(&self) -> f32 {
        self.force
    }

    /// Unsmoothed force for the current level and temperature.
    pub fn target(&self, temperature: i32) -> f32 {
        let low = self.config.grasping_force;
        if temperature > self.config.temperature_critical {
            low * (1.0 - self.config.critical_reduction)
        } else if temperature > self.config.temperature_warning {
            low
        } else {
            match self.level {
                HoldLevel::Low => low,
                HoldLevel::Mid => self.config.holding_mid_force,
            }
        }
    }

    /// Advance one holding cycle and return the force to command.
    pub fn update(&mut self, position: f32, temperature: i32) -> f32 {
        if let Some(last) = self.last_position {
            let delta = (position - last).abs();
            if delta > self.config.slip_threshold && self.level == HoldLevel::Low {
                warn!(delta, position, "slip detected, raising holding force");
                self.level = HoldLevel::Mid;
            }
        }
        self.last_position = Some(position);

        let target = self.target(temperature);
        if target < self.config.grasping_force && self.force >= self.config.grasping_force {
            info!(temperature, target, "critical temperature, holding force reduced");
        }
        self.force += (target - self.force) * self.config.smoothing;
        self.force
    }
}
