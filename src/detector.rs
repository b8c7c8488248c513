//! Contact detection from position stagnation.
//!
//! There is no force sensor: resistance is inferred when the fingers stop
//! progressing toward a more closed command for several cycles in a row.

use std::collections::VecDeque;

use tracing::debug;

use crate::config::DetectorConfig;

const WINDOW: usize = 3;

/// Why contact was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactKind {
    /// Stalled while closing on an object.
    Stall,
    /// Stalled at the closed end with a zero target (fingers overlapping).
    ZeroWrap,
}

#[derive(Debug, Clone)]
pub struct ContactDetector {
    config: DetectorConfig,
    history: VecDeque<f32>,
    consecutive: u32,
}

impl ContactDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            history: VecDeque::with_capacity(WINDOW),
            consecutive: 0,
        }
    }

    /// Record a position sample (percent).
    pub fn observe(&mut self, position: f32) {
        if self.history.len() == WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(position);
    }

    /// `max - min` of the sample window, once it is full.
    pub fn window_range(&self) -> Option<f32> {
        if self.history.len() < WINDOW {
            return None;
        }
        let (min, max) = self
            .history
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &p| (lo.min(p), hi.max(p)));
        Some(max - min)
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Clear the stagnation counter; the sample window is kept.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Observe `position` and decide whether the fingers have met resistance.
    ///
    /// `moving` is whether the owning grasp state machine is in `Moving`;
    /// outside of it the counter is held at zero.
    pub fn update(&mut self, commanded: f32, position: f32, moving: bool) -> Option<ContactKind> {
        self.observe(position);
        if !moving {
            self.consecutive = 0;
            return None;
        }
        let Some(range) = self.window_range() else {
            return None;
        };

        let hysteresis = self.config.direction_hysteresis;
        let zero_wrap = commanded.abs() <= 1.0 && position <= 1.0;
        let closing = commanded < position - hysteresis;

        let (stalled, kind) = if zero_wrap {
            (range < self.config.wrap_tolerance, ContactKind::ZeroWrap)
        } else if closing {
            (range < self.config.stall_tolerance, ContactKind::Stall)
        } else {
            (false, ContactKind::Stall)
        };

        if !stalled {
            self.consecutive = 0;
            return None;
        }

        self.consecutive += 1;
        if self.consecutive >= self.config.consecutive_samples {
            debug!(?kind, position, commanded, range, "contact detected");
            Some(kind)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ContactDetector {
        ContactDetector::new(DetectorConfig::default())
    }

    #[test]
    fn stagnant_closing_reports_on_third_window() {
        let mut detector = detector();
        // fill the window
        assert_eq!(detector.update(0.0, 5.0, true), None);
        assert_eq!(detector.update(0.0, 4.2, true), None);

        // every full window below is a permutation of [5.0, 4.2, 3.8]
        assert_eq!(detector.update(0.0, 3.8, true), None);
        assert_eq!(detector.consecutive(), 1);
        assert_eq!(detector.update(0.0, 5.0, true), None);
        assert_eq!(detector.consecutive(), 2);
        assert_eq!(detector.update(0.0, 4.2, true), Some(ContactKind::Stall));
    }

    #[test]
    fn window_range_of_reference_history() {
        let mut detector = detector();
        for p in [5.0, 4.2, 3.8] {
            detector.observe(p);
        }
        let range = detector.window_range().unwrap();
        assert!((range - 1.2).abs() < 1e-5);
    }

    #[test]
    fn progress_resets_counter() {
        let mut detector = detector();
        for p in [30.0, 30.2, 30.1, 30.0] {
            detector.update(0.0, p, true);
        }
        assert_eq!(detector.consecutive(), 2);
        // a large step breaks stagnation
        assert_eq!(detector.update(0.0, 20.0, true), None);
        assert_eq!(detector.consecutive(), 0);
    }

    #[test]
    fn opening_never_reports_contact() {
        let mut detector = detector();
        for _ in 0..10 {
            assert_eq!(detector.update(80.0, 40.0, true), None);
        }
        assert_eq!(detector.consecutive(), 0);
    }

    #[test]
    fn within_hysteresis_is_not_closing() {
        let mut detector = detector();
        for _ in 0..10 {
            assert_eq!(detector.update(39.8, 40.0, true), None);
        }
    }

    #[test]
    fn not_moving_holds_counter_at_zero() {
        let mut detector = detector();
        for p in [30.0, 30.0, 30.0] {
            detector.update(0.0, p, true);
        }
        assert_eq!(detector.consecutive(), 1);
        assert_eq!(detector.update(0.0, 30.0, false), None);
        assert_eq!(detector.consecutive(), 0);
    }

    #[test]
    fn zero_target_uses_tight_tolerance() {
        let mut detector = detector();
        // still creeping into the overlap: stagnant by the general rule, not the tight one
        for p in [1.0, 0.9, 0.8, 0.7, 0.6, 0.5] {
            assert_eq!(detector.update(0.0, p, true), None);
        }
        // settled to within a tick
        assert_eq!(detector.update(0.0, -0.2, true), None);
        assert_eq!(detector.update(0.0, -0.2, true), None);
        assert_eq!(detector.update(0.0, -0.2, true), None);
        assert_eq!(detector.update(0.0, -0.21, true), None);
        assert_eq!(detector.update(0.0, -0.2, true), Some(ContactKind::ZeroWrap));
    }
}
