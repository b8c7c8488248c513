//! Zero reference and raw tick ↔ percent conversion.
//!
//! The zero offset is the raw position recorded with the fingers driven onto
//! the closed hard stop. Normal operation only reads it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::GripperError;

/// Raw position of the closed hard stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZeroReference {
    pub offset: i32,
}

impl ZeroReference {
    pub fn new(offset: i32) -> Self {
        Self { offset }
    }
}

/// Logical 0 (closed) to 100 (open) scale over raw encoder ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionScale {
    pub zero: ZeroReference,
    /// Ticks from closed to fully open, negative for reversed mounting.
    pub span_ticks: i32,
}

impl PositionScale {
    pub fn new(zero: ZeroReference, span_ticks: i32) -> Self {
        Self { zero, span_ticks }
    }

    /// Not clamped: finger overlap can read slightly below 0.
    pub fn to_percent(&self, raw: i32) -> f32 {
        (raw - self.zero.offset) as f32 * 100.0 / self.span_ticks as f32
    }

    /// Goal ticks for a commanded percentage, clamped to the calibrated travel.
    pub fn to_raw(&self, percent: f32) -> i32 {
        let percent = percent.clamp(0.0, 100.0);
        self.zero.offset + (percent * self.span_ticks as f32 / 100.0).round() as i32
    }
}

/// Zero offsets per device, persisted as JSON.
///
/// Read once at startup and written once after a calibration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationStore {
    pub devices: BTreeMap<String, ZeroReference>,
}

impl CalibrationStore {
    pub fn load(path: &Path) -> Result<Self, GripperError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Like [`load`](Self::load), but a missing file yields an empty store.
    pub fn load_or_default(path: &Path) -> Result<Self, GripperError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), GripperError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self, device: &str) -> Option<ZeroReference> {
        self.devices.get(device).copied()
    }

    pub fn set(&mut self, device: impl Into<String>, zero: ZeroReference) {
        self.devices.insert(device.into(), zero);
    }
}
