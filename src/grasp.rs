//! IDLE / MOVING / CONTACT / GRASPING sequencing of target position and force.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::config::{DetectorConfig, ForceConfig, GraspConfig};
use crate::detector::ContactDetector;
use crate::force::{ForceRamp, HoldingScheduler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraspState {
    #[default]
    Idle,
    Moving,
    Contact,
    Grasping,
}

/// Target position and force (both percent) for the next write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraspCommand {
    pub position: f32,
    pub force: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Opening,
    Closing,
}

#[derive(Debug, Clone)]
pub struct GraspStateMachine {
    config: GraspConfig,
    forces: ForceConfig,
    state: GraspState,
    detector: ContactDetector,
    ramp: ForceRamp,
    holding: HoldingScheduler,
    hold_position: Option<f32>,
    contact: Option<(f32, Instant)>,
    setpoint: Option<f32>,
    last_position: Option<f32>,
    direction: Option<Direction>,
    last_force: f32,
}

impl GraspStateMachine {
    pub fn new(config: GraspConfig, detector: DetectorConfig, forces: ForceConfig) -> Self {
        Self {
            config,
            forces,
            state: GraspState::Idle,
            detector: ContactDetector::new(detector),
            ramp: ForceRamp::new(&forces),
            holding: HoldingScheduler::new(forces),
            hold_position: None,
            contact: None,
            setpoint: None,
            last_position: None,
            direction: None,
            last_force: forces.idle_force,
        }
    }

    pub fn state(&self) -> GraspState {
        self.state
    }

    /// Commanded position latched when the grasp was established.
    pub fn setpoint(&self) -> Option<f32> {
        self.setpoint
    }

    pub fn contact_position(&self) -> Option<f32> {
        self.contact.map(|(position, _)| position)
    }

    pub fn detector(&self) -> &ContactDetector {
        &self.detector
    }

    /// Drop any grasp and hold wherever the fingers are.
    pub fn reset(&mut self, position: f32) {
        self.enter_idle(position);
    }

    /// Advance one cycle with the latest command and reading.
    pub fn update(
        &mut self,
        commanded: f32,
        position: f32,
        temperature: i32,
        now: Instant,
    ) -> GraspCommand {
        self.track_direction(position);
        let threshold = self.config.position_change_threshold;
        let contact = self
            .detector
            .update(commanded, position, self.state == GraspState::Moving);

        match self.state {
            GraspState::Idle => {
                if (commanded - position).abs() > threshold {
                    self.enter_moving(commanded, position);
                }
            }
            GraspState::Moving => {
                if contact.is_some() {
                    info!(position, commanded, "contact detected");
                    self.contact = Some((position, now));
                    self.state = GraspState::Contact;
                } else if (commanded - position).abs() <= self.config.convergence_tolerance
                    && self.direction == Some(Direction::Opening)
                {
                    self.enter_idle(position);
                }
            }
            GraspState::Contact => {
                let (contact_position, since) = self.contact.unwrap_or((position, now));
                if commanded > contact_position + threshold {
                    self.enter_moving(commanded, position);
                } else if now.duration_since(since) >= self.config.settle_delay() {
                    info!(setpoint = commanded, position, "grasp established");
                    self.setpoint = Some(commanded);
                    self.holding.begin(self.last_force, position);
                    self.state = GraspState::Grasping;
                }
            }
            GraspState::Grasping => {
                let setpoint = self.setpoint.unwrap_or(commanded);
                if commanded > setpoint + threshold {
                    self.enter_moving(commanded, position);
                }
            }
        }

        let command = match self.state {
            GraspState::Idle => GraspCommand {
                position: *self.hold_position.get_or_insert(position),
                force: self.forces.idle_force,
            },
            GraspState::Moving => GraspCommand {
                position: commanded,
                force: self.forces.moving_force,
            },
            GraspState::Contact => {
                let (contact_position, since) = self.contact.unwrap_or((position, now));
                let stabilized = self
                    .detector
                    .window_range()
                    .is_some_and(|range| range < self.forces.stable_range);
                GraspCommand {
                    position: contact_position,
                    force: self.ramp.force_at(now.duration_since(since), stabilized),
                }
            }
            GraspState::Grasping => GraspCommand {
                position: self.setpoint.unwrap_or(commanded),
                force: self.holding.update(position, temperature),
            },
        };
        self.last_force = command.force;
        command
    }

    fn track_direction(&mut self, position: f32) {
        if let Some(last) = self.last_position {
            let delta = position - last;
            if delta > self.config.direction_epsilon {
                self.direction = Some(Direction::Opening);
            } else if delta < -self.config.direction_epsilon {
                self.direction = Some(Direction::Closing);
            }
        }
        self.last_position = Some(position);
    }

    fn enter_moving(&mut self, commanded: f32, position: f32) {
        info!(from = ?self.state, commanded, position, "moving");
        self.state = GraspState::Moving;
        self.contact = None;
        self.setpoint = None;
        self.hold_position = None;
        self.detector.reset();
    }

    fn enter_idle(&mut self, position: f32) {
        if self.state != GraspState::Idle {
            info!(from = ?self.state, position, "idle");
        }
        self.state = GraspState::Idle;
        self.contact = None;
        self.setpoint = None;
        self.hold_position = Some(position);
        self.detector.reset();
    }
}
