//! POSITION / TORQUE / BACKOFF_TORQUE safety layer.
//!
//! Independent of the grasp state machine. When current spikes show the
//! fingers are pushing against something, the engine stops following position
//! commands and holds with a bounded torque instead: a short proportional
//! pulse, then a much lower backoff hold. Only an explicit opening command
//! brings it back to position control.
//!
//! While in `BackoffTorque` every non-opening command is dropped without any
//! register write. Together with the mode-switch cooldown this is what keeps a
//! continuous command stream from pumping between modes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::HybridConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    #[default]
    Position,
    Torque,
    BackoffTorque,
}

/// What to write to the servo this cycle. Positions and currents are percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Actuation {
    /// Follow `position` with `current` as the current limit.
    Position { position: f32, current: f32 },
    /// Hold against resistance at `position` with a fixed torque.
    Hold { position: f32, current: f32 },
}

impl Actuation {
    pub fn position(&self) -> f32 {
        match *self {
            Actuation::Position { position, .. } | Actuation::Hold { position, .. } => position,
        }
    }

    pub fn current(&self) -> f32 {
        match *self {
            Actuation::Position { current, .. } | Actuation::Hold { current, .. } => current,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HybridController {
    config: HybridConfig,
    mode: ControlMode,
    entered: Option<Instant>,
    left_torque: Option<Instant>,
    entry_position: f32,
    hold_torque: f32,
    currents: VecDeque<i32>,
}

impl HybridController {
    pub fn new(config: HybridConfig) -> Self {
        Self {
            config,
            mode: ControlMode::Position,
            entered: None,
            left_torque: None,
            entry_position: 0.0,
            hold_torque: 0.0,
            currents: VecDeque::with_capacity(config.current_window),
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    /// Commanded position recorded when torque mode was entered.
    pub fn entry_position(&self) -> Option<f32> {
        (self.mode != ControlMode::Position).then_some(self.entry_position)
    }

    /// Return to position control without cooldown, e.g. for an emergency open.
    pub fn reset(&mut self) {
        self.mode = ControlMode::Position;
        self.entered = None;
        self.currents.clear();
    }

    /// Decide the writes for one command.
    ///
    /// `position` and `current` come from the latest sensor snapshot. `None`
    /// means nothing should be written this cycle.
    pub fn step(
        &mut self,
        commanded: f32,
        effort: f32,
        position: f32,
        current: i32,
        now: Instant,
    ) -> Option<Actuation> {
        self.push_current(current);
        let follow = Actuation::Position {
            position: commanded,
            current: effort,
        };

        match self.mode {
            ControlMode::Position => {
                let closing = commanded < position;
                let resisted = self.resistance(current);
                let at_hard_stop = position <= self.config.closed_epsilon;
                let cooled = self
                    .left_torque
                    .map_or(true, |left| now.duration_since(left) >= self.config.cooldown());

                if closing
                    && (resisted || at_hard_stop)
                    && position < self.config.upper_gate
                    && cooled
                {
                    self.mode = ControlMode::Torque;
                    self.entered = Some(now);
                    self.entry_position = commanded;
                    self.hold_torque = self.proportional_torque(commanded);
                    info!(
                        entry = commanded,
                        position,
                        current,
                        torque = self.hold_torque,
                        "resistance, switching to torque hold"
                    );
                    return Some(self.hold());
                }
                Some(follow)
            }
            ControlMode::Torque => {
                if self.is_explicit_open(commanded) {
                    self.leave_torque(commanded, now);
                    return Some(follow);
                }
                let entered = self.entered.unwrap_or(now);
                if now.duration_since(entered) >= self.config.pulse() {
                    self.mode = ControlMode::BackoffTorque;
                    self.entered = Some(now);
                    self.hold_torque = self.config.backoff_torque;
                    info!(torque = self.hold_torque, "torque pulse over, backing off");
                    return Some(self.hold());
                }
                let torque = self.proportional_torque(commanded);
                if (torque - self.hold_torque).abs() > f32::EPSILON {
                    self.hold_torque = torque;
                    return Some(self.hold());
                }
                None
            }
            ControlMode::BackoffTorque => {
                if self.is_explicit_open(commanded) {
                    self.leave_torque(commanded, now);
                    return Some(follow);
                }
                None
            }
        }
    }

    fn hold(&self) -> Actuation {
        Actuation::Hold {
            position: self.entry_position,
            current: self.hold_torque,
        }
    }

    fn is_explicit_open(&self, commanded: f32) -> bool {
        commanded > self.entry_position + self.config.hysteresis
    }

    fn leave_torque(&mut self, commanded: f32, now: Instant) {
        info!(from = ?self.mode, commanded, "explicit open, back to position control");
        self.mode = ControlMode::Position;
        self.entered = None;
        self.left_torque = Some(now);
    }

    /// Light-touch baseline, scaling up as the command pinches past the entry position.
    fn proportional_torque(&self, commanded: f32) -> f32 {
        let pinch = (self.entry_position - commanded).max(0.0);
        let fraction = (pinch / self.config.pinch_range).min(1.0);
        let c = &self.config;
        c.light_touch_torque + (c.max_hold_torque - c.light_touch_torque) * fraction
    }

    fn push_current(&mut self, current: i32) {
        if self.currents.len() == self.config.current_window {
            self.currents.pop_front();
        }
        self.currents.push_back(current.abs());
    }

    /// Instantaneous or window-averaged current above the threshold.
    fn resistance(&self, current: i32) -> bool {
        let threshold = self.config.current_threshold;
        if current.abs() > threshold {
            return true;
        }
        if self.currents.is_empty() {
            return false;
        }
        let average = self.currents.iter().map(|&c| c as i64).sum::<i64>() / self.currents.len() as i64;
        if average > threshold as i64 {
            debug!(average, threshold, "averaged current over threshold");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HIGH: i32 = 600;
    const LOW: i32 = 50;

    fn controller() -> HybridController {
        HybridController::new(HybridConfig::default())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn follows_position_without_resistance() {
        let mut hc = controller();
        let act = hc.step(20.0, 60.0, 40.0, LOW, Instant::now());
        assert_eq!(act, Some(Actuation::Position { position: 20.0, current: 60.0 }));
        assert_eq!(hc.mode(), ControlMode::Position);
    }

    #[test]
    fn high_current_while_closing_enters_torque() {
        let config = HybridConfig::default();
        let mut hc = controller();
        let act = hc.step(20.0, 60.0, 40.0, HIGH, Instant::now());
        assert_eq!(hc.mode(), ControlMode::Torque);
        assert_eq!(hc.entry_position(), Some(20.0));
        assert_eq!(
            act,
            Some(Actuation::Hold { position: 20.0, current: config.light_touch_torque })
        );
    }

    #[test]
    fn upper_gate_blocks_torque() {
        let mut hc = controller();
        hc.step(60.0, 60.0, 70.0, HIGH, Instant::now());
        assert_eq!(hc.mode(), ControlMode::Position);
    }

    #[test]
    fn opening_with_high_current_stays_in_position() {
        let mut hc = controller();
        hc.step(60.0, 60.0, 40.0, HIGH, Instant::now());
        assert_eq!(hc.mode(), ControlMode::Position);
    }

    #[test]
    fn hard_stop_enters_torque_without_current() {
        let mut hc = controller();
        hc.step(0.0, 60.0, 0.5, LOW, Instant::now());
        assert_eq!(hc.mode(), ControlMode::Torque);
    }

    #[test]
    fn averaged_current_triggers() {
        let mut hc = controller();
        let now = Instant::now();
        // opening, so no trigger while the window fills
        for _ in 0..4 {
            hc.step(50.0, 60.0, 40.0, 900, now);
        }
        assert_eq!(hc.mode(), ControlMode::Position);
        // instantaneous reading is low, the average is not
        hc.step(20.0, 60.0, 40.0, LOW, now);
        assert_eq!(hc.mode(), ControlMode::Torque);
    }

    #[test]
    fn pinching_past_entry_scales_torque() {
        let config = HybridConfig::default();
        let mut hc = controller();
        let now = Instant::now();
        hc.step(30.0, 60.0, 40.0, HIGH, now);

        let act = hc.step(20.0, 60.0, 35.0, HIGH, now + ms(10)).unwrap();
        let expected = config.light_touch_torque
            + (config.max_hold_torque - config.light_touch_torque) * 10.0 / config.pinch_range;
        assert_eq!(act, Actuation::Hold { position: 30.0, current: expected });

        let act = hc.step(-50.0, 60.0, 35.0, HIGH, now + ms(20)).unwrap();
        assert_eq!(act.current(), config.max_hold_torque);

        // unchanged command, unchanged torque: nothing to write
        assert_eq!(hc.step(-50.0, 60.0, 35.0, HIGH, now + ms(30)), None);
    }

    #[test]
    fn pulse_then_backoff_then_ignores_closing() {
        let config = HybridConfig::default();
        let mut hc = controller();
        let start = Instant::now();
        hc.step(20.0, 60.0, 40.0, HIGH, start);
        assert_eq!(hc.mode(), ControlMode::Torque);

        assert_eq!(hc.step(20.0, 60.0, 35.0, HIGH, start + ms(499)), None);
        assert_eq!(hc.mode(), ControlMode::Torque);

        let act = hc.step(20.0, 60.0, 35.0, HIGH, start + ms(500));
        assert_eq!(hc.mode(), ControlMode::BackoffTorque);
        assert_eq!(
            act,
            Some(Actuation::Hold { position: 20.0, current: config.backoff_torque })
        );

        for (i, commanded) in [10.0, 20.0, 21.0, 0.0].into_iter().enumerate() {
            let t = start + ms(510 + i as u64 * 10);
            assert_eq!(hc.step(commanded, 60.0, 35.0, HIGH, t), None);
            assert_eq!(hc.mode(), ControlMode::BackoffTorque);
        }
    }

    #[test]
    fn explicit_open_leaves_backoff_immediately() {
        let mut hc = controller();
        let start = Instant::now();
        hc.step(20.0, 60.0, 40.0, HIGH, start);
        hc.step(20.0, 60.0, 35.0, HIGH, start + ms(600));
        assert_eq!(hc.mode(), ControlMode::BackoffTorque);

        let act = hc.step(50.0, 60.0, 35.0, HIGH, start + ms(610));
        assert_eq!(hc.mode(), ControlMode::Position);
        assert_eq!(act, Some(Actuation::Position { position: 50.0, current: 60.0 }));
    }

    #[test]
    fn explicit_open_leaves_torque_immediately() {
        let mut hc = controller();
        let start = Instant::now();
        hc.step(20.0, 60.0, 40.0, HIGH, start);
        let act = hc.step(22.5, 60.0, 35.0, HIGH, start + ms(10));
        assert_eq!(hc.mode(), ControlMode::Position);
        assert_eq!(act, Some(Actuation::Position { position: 22.5, current: 60.0 }));
    }

    #[test]
    fn cooldown_blocks_reentry() {
        let mut hc = controller();
        let start = Instant::now();
        hc.step(20.0, 60.0, 40.0, HIGH, start);
        hc.step(50.0, 60.0, 35.0, HIGH, start + ms(10));
        assert_eq!(hc.mode(), ControlMode::Position);

        hc.step(20.0, 60.0, 40.0, HIGH, start + ms(200));
        assert_eq!(hc.mode(), ControlMode::Position);

        hc.step(20.0, 60.0, 40.0, HIGH, start + ms(510));
        assert_eq!(hc.mode(), ControlMode::Torque);
    }
}
