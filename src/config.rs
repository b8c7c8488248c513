//! Immutable configuration snapshot.
//!
//! Built once at startup (usually parsed from JSON by the caller), validated,
//! then shared as `Arc<GripperConfig>`. Components copy the section they need;
//! none of them mutate it. Every field has a default, so a partial document
//! only overrides what it names.
//!
//! Force and torque values are percentages of [`MotionConfig::max_current`].
//! Positions are percentages of the calibrated travel, 0 = closed, 100 = open.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::RegisterTable;
use crate::GripperError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GripperConfig {
    pub bus: BusConfig,
    pub registers: RegisterTable,
    pub motion: MotionConfig,
    pub detector: DetectorConfig,
    pub grasp: GraspConfig,
    pub force: ForceConfig,
    pub hybrid: HybridConfig,
    pub recovery: RecoveryConfig,
}

impl GripperConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, GripperError> {
        let config: GripperConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control core cannot operate with.
    pub fn validate(&self) -> Result<(), GripperError> {
        fn check(ok: bool, msg: &str) -> Result<(), GripperError> {
            if ok {
                Ok(())
            } else {
                Err(GripperError::Config(msg.to_string()))
            }
        }

        check(self.bus.device_id <= 0xFC, "bus.device_id must be a unicast id (0..=252)")?;
        check(self.bus.baud_rate > 0, "bus.baud_rate must be positive")?;
        check(self.bus.response_timeout_ms > 0, "bus.response_timeout_ms must be positive")?;
        check(self.motion.span_ticks != 0, "motion.span_ticks must be nonzero")?;
        check(self.motion.max_current > 0, "motion.max_current must be positive")?;
        check(self.detector.stall_tolerance > 0.0, "detector.stall_tolerance must be positive")?;
        check(
            self.detector.wrap_tolerance > 0.0
                && self.detector.wrap_tolerance <= self.detector.stall_tolerance,
            "detector.wrap_tolerance must be positive and no larger than stall_tolerance",
        )?;
        check(
            self.detector.consecutive_samples >= 1,
            "detector.consecutive_samples must be at least 1",
        )?;
        check(
            self.grasp.position_change_threshold > 0.0,
            "grasp.position_change_threshold must be positive",
        )?;
        check(
            self.force.smoothing > 0.0 && self.force.smoothing <= 1.0,
            "force.smoothing must be in (0, 1]",
        )?;
        check(
            (0.0..1.0).contains(&self.force.critical_reduction),
            "force.critical_reduction must be in [0, 1)",
        )?;
        check(
            self.force.temperature_critical >= self.force.temperature_warning,
            "force.temperature_critical must not be below temperature_warning",
        )?;
        check(
            self.hybrid.upper_gate > 0.0 && self.hybrid.upper_gate <= 100.0,
            "hybrid.upper_gate must be in (0, 100]",
        )?;
        check(self.hybrid.current_window >= 1, "hybrid.current_window must be at least 1")?;
        check(self.hybrid.pinch_range > 0.0, "hybrid.pinch_range must be positive")?;
        check(
            self.hybrid.light_touch_torque <= self.hybrid.max_hold_torque,
            "hybrid.light_touch_torque must not exceed max_hold_torque",
        )?;
        check(self.recovery.max_attempts >= 1, "recovery.max_attempts must be at least 1")?;
        check(
            self.recovery.voltage_min < self.recovery.voltage_max,
            "recovery.voltage_min must be below voltage_max",
        )?;
        for (name, factor) in [
            ("recovery.overload_current_factor", self.recovery.overload_current_factor),
            ("recovery.thermal_current_factor", self.recovery.thermal_current_factor),
        ] {
            check(factor > 0.0 && factor <= 1.0, &format!("{name} must be in (0, 1]"))?;
        }
        Ok(())
    }
}

/// Serial link and transaction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub device_id: u8,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    /// Retries after the first attempt, on timeout or checksum failure.
    pub max_retries: u32,
    /// Wait after a persistent register write before restoring the power stage.
    pub settle_delay_ms: u64,
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            baud_rate: 57_600,
            response_timeout_ms: 100,
            max_retries: 3,
            settle_delay_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Raw ticks between the closed hard stop (0%) and fully open (100%).
    /// Negative when the servo counts down while opening.
    pub span_ticks: i32,
    /// Goal current written for 100% force.
    pub max_current: u16,
    /// Operating mode written at initialization (current-based position).
    pub operating_mode: u8,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            span_ticks: 1800,
            max_current: 1750,
            operating_mode: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// A 3-sample window whose range is below this is stagnant.
    pub stall_tolerance: f32,
    /// Stagnation tolerance near a zero target, on the order of one encoder tick.
    pub wrap_tolerance: f32,
    /// Stagnant windows in a row required before contact is reported.
    pub consecutive_samples: u32,
    /// Minimum gap between command and position to count as closing or opening.
    pub direction_hysteresis: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stall_tolerance: 2.0,
            wrap_tolerance: 0.06,
            consecutive_samples: 3,
            direction_hysteresis: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraspConfig {
    pub position_change_threshold: f32,
    /// Distance to the commanded position counted as arrived.
    pub convergence_tolerance: f32,
    /// Per-cycle motion smaller than this leaves the last known direction unchanged.
    pub direction_epsilon: f32,
    pub settle_delay_ms: u64,
}

impl GraspConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for GraspConfig {
    fn default() -> Self {
        Self {
            position_change_threshold: 5.0,
            convergence_tolerance: 2.0,
            direction_epsilon: 0.1,
            settle_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceConfig {
    pub idle_force: f32,
    pub moving_force: f32,
    /// Deployment specific grasp force, also the `low` holding level.
    pub grasping_force: f32,
    /// Holding level used once slip has been detected.
    pub holding_mid_force: f32,
    /// Time constant of the settling decay from moving to grasping force.
    pub ramp_time_constant_ms: u64,
    /// Speed-up of the settling decay once the position window is stable.
    pub stable_ramp_factor: f32,
    /// Window range below which the grasp counts as stabilized.
    pub stable_range: f32,
    /// Per-cycle position change while holding that counts as slip.
    pub slip_threshold: f32,
    pub temperature_warning: i32,
    pub temperature_critical: i32,
    /// Fraction removed from the `low` level above the critical temperature.
    pub critical_reduction: f32,
    /// Fraction of the remaining gap closed per cycle while holding.
    pub smoothing: f32,
}

impl ForceConfig {
    pub fn ramp_time_constant(&self) -> Duration {
        Duration::from_millis(self.ramp_time_constant_ms)
    }
}

impl Default for ForceConfig {
    fn default() -> Self {
        Self {
            idle_force: 10.0,
            moving_force: 60.0,
            grasping_force: 30.0,
            holding_mid_force: 45.0,
            ramp_time_constant_ms: 150,
            stable_ramp_factor: 3.0,
            stable_range: 0.5,
            slip_threshold: 1.5,
            temperature_warning: 60,
            temperature_critical: 70,
            critical_reduction: 0.3,
            smoothing: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Absolute present-current reading that indicates mechanical resistance.
    pub current_threshold: i32,
    /// Samples in the rolling current average.
    pub current_window: usize,
    /// Torque mode is only entered below this opening percentage.
    pub upper_gate: f32,
    /// Position at or below which a closing command is pushing on the hard stop.
    pub closed_epsilon: f32,
    /// Opening margin over the entry position that counts as an explicit open.
    pub hysteresis: f32,
    pub pulse_ms: u64,
    pub cooldown_ms: u64,
    /// Hold torque when the command sits exactly at the entry position.
    pub light_touch_torque: f32,
    pub max_hold_torque: f32,
    /// Command travel past the entry position that reaches `max_hold_torque`.
    pub pinch_range: f32,
    pub backoff_torque: f32,
}

impl HybridConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            current_threshold: 400,
            current_window: 5,
            upper_gate: 65.0,
            closed_epsilon: 1.0,
            hysteresis: 2.0,
            pulse_ms: 500,
            cooldown_ms: 500,
            light_touch_torque: 20.0,
            max_hold_torque: 60.0,
            pinch_range: 20.0,
            backoff_torque: 12.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery attempts per fault kind before it becomes a standing condition.
    pub max_attempts: u32,
    pub thermal_cooldown_ms: u64,
    /// Temperature (°C) below which an overheated servo may be re-enabled.
    pub safe_temperature: i32,
    pub voltage_min: f32,
    pub voltage_max: f32,
    pub overload_current_factor: f32,
    pub thermal_current_factor: f32,
}

impl RecoveryConfig {
    pub fn thermal_cooldown(&self) -> Duration {
        Duration::from_millis(self.thermal_cooldown_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            thermal_cooldown_ms: 30_000,
            safe_temperature: 55,
            voltage_min: 3.7,
            voltage_max: 6.0,
            overload_current_factor: 0.7,
            thermal_current_factor: 0.5,
        }
    }
}
