//! # servo-gripper
//!
//! `servo-gripper` drives a single-servo parallel gripper over a half-duplex
//! serial bus (TTL/RS-485, Dynamixel 2.0 style framing).
//!
//! On top of plain position control it adds:
//! - contact detection from position stagnation while closing
//! - a grasp state machine with a force ramp and a slip/temperature-aware hold
//! - a torque hold that takes over when current spikes against the hard stop
//! - bounded, per-fault recovery of hardware errors
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use servo_gripper::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GripperError> {
//!     // configuration, defaults suit an X-series servo
//!     let config = Arc::new(GripperConfig::default());
//!
//!     // zero offset recorded by an earlier calibration run
//!     let store = CalibrationStore::load_or_default("calibration.json".as_ref())?;
//!     let zero = store.get("left").unwrap_or_default();
//!
//!     // open the serial port and bring the servo up
//!     let mut gripper = Gripper::from_path("/dev/ttyUSB0", config, zero)?;
//!     gripper.initialize().await?;
//!
//!     // close on whatever is between the fingers
//!     for _ in 0..200 {
//!         let report = gripper.cycle(Target::new(0.0, 60.0)).await?;
//!         if report.grasp == GraspState::Grasping {
//!             break;
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//!
//!     // and let go
//!     gripper.emergency_open().await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod calibration;
pub mod config;
pub mod detector;
pub mod error;
pub mod force;
pub mod grasp;
pub mod gripper;
pub mod hybrid;
pub mod protocol;
pub mod recovery;
pub mod sensor;
pub mod transport;

pub use bus::{Register, RegisterBus, RegisterTable, Width};
pub use calibration::{CalibrationStore, PositionScale, ZeroReference};
pub use config::GripperConfig;
pub use error::{CommError, DeviceStatusError, GripperError};
pub use grasp::GraspState;
pub use gripper::{CycleReport, Gripper, GripperState, Target};
pub use hybrid::{Actuation, ControlMode};
pub use recovery::{FaultKind, HardwareFaults, RecoveryOutcome};
pub use sensor::SensorSnapshot;
pub use transport::Transport;
