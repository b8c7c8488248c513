use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_serial::SerialStream;
use tracing::{error, info, warn};

use crate::bus::RegisterBus;
use crate::calibration::{PositionScale, ZeroReference};
use crate::config::GripperConfig;
use crate::grasp::{GraspCommand, GraspState, GraspStateMachine};
use crate::hybrid::{Actuation, ControlMode, HybridController};
use crate::recovery::{BusPort, HardwareFaults, RecoveryManager, RecoveryOutcome, RecoveryReport};
use crate::sensor::SensorSnapshot;
use crate::transport::Transport;
use crate::GripperError;

/// Desired position and effort, both percent, as delivered by the command relay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// 0 closed, 100 open.
    pub position: f32,
    /// Upper bound on the commanded current.
    pub effort: f32,
}

impl Target {
    pub fn new(position: f32, effort: f32) -> Self {
        Self { position, effort }
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new(100.0, 100.0)
    }
}

/// Published after every cycle for the state relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GripperState {
    pub position: f32,
    pub effort: f32,
    pub temperature: i32,
    pub moving: bool,
    pub grasp: GraspState,
    pub mode: ControlMode,
    pub faults: HardwareFaults,
    /// Power stage held off by a standing fault until [`Gripper::reset_faults`].
    pub halted: bool,
}

/// Outcome of one [`Gripper::cycle`].
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub grasp: GraspState,
    pub mode: ControlMode,
    /// Writes decided by the control-mode engine, if any were needed.
    pub actuation: Option<Actuation>,
    pub recovery: RecoveryReport,
    pub halted: bool,
}

/// One gripper actuator: owns the bus, both state machines and the recovery manager.
///
/// All methods run on the control task. Other tasks observe the gripper only
/// through [`subscribe`](Self::subscribe).
pub struct Gripper<S> {
    bus: RegisterBus<S>,
    config: Arc<GripperConfig>,
    scale: PositionScale,
    grasp: GraspStateMachine,
    hybrid: HybridController,
    recovery: RecoveryManager,
    snapshot: Option<SensorSnapshot>,
    plan: Option<GraspCommand>,
    last_written: Option<(i32, u16)>,
    halted: bool,
    state_tx: watch::Sender<GripperState>,
}

impl Gripper<SerialStream> {
    /// Open the serial port named by `path` with the bus settings from `config`.
    pub fn from_path(
        path: impl Into<String>,
        config: Arc<GripperConfig>,
        zero: ZeroReference,
    ) -> Result<Self, GripperError> {
        let transport = Transport::open(
            path,
            config.bus.baud_rate,
            config.bus.response_timeout(),
            config.bus.max_retries,
        )?;
        Self::new(transport, config, zero)
    }
}

impl<S> Gripper<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        transport: Transport<S>,
        config: Arc<GripperConfig>,
        zero: ZeroReference,
    ) -> Result<Self, GripperError> {
        config.validate()?;
        let bus = RegisterBus::new(
            transport,
            config.bus.device_id,
            &config.registers,
            config.bus.settle_delay(),
        );
        let (state_tx, _) = watch::channel(GripperState::default());
        Ok(Self {
            bus,
            scale: PositionScale::new(zero, config.motion.span_ticks),
            grasp: GraspStateMachine::new(config.grasp, config.detector, config.force),
            hybrid: HybridController::new(config.hybrid),
            recovery: RecoveryManager::new(config.recovery),
            snapshot: None,
            plan: None,
            last_written: None,
            halted: false,
            state_tx,
            config,
        })
    }

    /// Ping the servo, set the operating mode and enable the power stage.
    pub async fn initialize(&mut self) -> Result<&mut Self, GripperError> {
        let registers = self.config.registers;
        self.bus.ping().await?;
        self.bus.set_torque(false).await?;
        self.bus
            .write_register(&registers.operating_mode, self.config.motion.operating_mode as u64)
            .await?;
        self.bus.set_torque(true).await?;

        let snapshot = SensorSnapshot::read(&mut self.bus, &registers).await?;
        let position = self.scale.to_percent(snapshot.position);
        self.grasp.reset(position);
        self.hybrid.reset();
        self.snapshot = Some(snapshot);
        self.plan = None;
        self.last_written = None;
        info!(id = self.bus.id(), position, "gripper initialized");
        self.publish(&snapshot, position);
        Ok(self)
    }

    /// Run one control cycle for `target`.
    ///
    /// The control-mode engine judges `target` against the previous snapshot
    /// and decides the writes; in position mode those follow the grasp plan
    /// made last cycle. Then a fresh snapshot is read and fed to the grasp
    /// state machine and the recovery manager, in that order.
    pub async fn cycle(&mut self, target: Target) -> Result<CycleReport, GripperError> {
        let commanded = target.position.clamp(0.0, 100.0);
        let mut actuation = None;
        if !self.halted {
            if let (Some(plan), Some(snapshot)) = (self.plan, self.snapshot) {
                let effort = plan.force.min(target.effort.max(0.0));
                let position = self.scale.to_percent(snapshot.position);
                let was_holding = self.hybrid.mode() != ControlMode::Position;
                actuation = self
                    .hybrid
                    .step(commanded, effort, position, snapshot.current, Instant::now())
                    .map(|actuation| match actuation {
                        // leaving a torque hold is an explicit open, the plan still targets the grasp
                        Actuation::Position { .. } if was_holding => actuation,
                        Actuation::Position { current, .. } => Actuation::Position {
                            position: plan.position,
                            current,
                        },
                        hold => hold,
                    });
                if let Some(actuation) = actuation {
                    self.apply(actuation).await?;
                }
            }
        }

        let registers = self.config.registers;
        let snapshot = SensorSnapshot::read(&mut self.bus, &registers).await?;
        let position = self.scale.to_percent(snapshot.position);
        self.plan = Some(
            self.grasp
                .update(commanded, position, snapshot.temperature, snapshot.t),
        );
        self.snapshot = Some(snapshot);

        let mut port = BusPort {
            bus: &mut self.bus,
            registers: &registers,
        };
        let recovery = self
            .recovery
            .inspect(&mut port, snapshot.error_bits, snapshot.t)
            .await;
        if recovery
            .outcomes
            .iter()
            .any(|(_, outcome)| *outcome == RecoveryOutcome::Recovered)
        {
            // the clear rebooted the servo, goal registers are back to defaults
            self.last_written = None;
        }
        let standing = self.recovery.standing();
        if !standing.is_empty() && !self.halted {
            error!(faults = ?standing, "standing hardware fault, control halted");
            self.halted = true;
            self.last_written = None;
        }

        self.publish(&snapshot, position);
        Ok(CycleReport {
            grasp: self.grasp.state(),
            mode: self.hybrid.mode(),
            actuation,
            recovery,
            halted: self.halted,
        })
    }

    /// Cycle every `period` on the latest target until the command sender is dropped.
    ///
    /// Bus and device errors only fail the cycle they happen in.
    pub async fn run(
        &mut self,
        mut commands: watch::Receiver<Target>,
        period: Duration,
    ) -> Result<(), GripperError> {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if commands.has_changed().is_err() {
                info!("command source closed, control loop stopping");
                return Ok(());
            }
            let target = *commands.borrow_and_update();
            match self.cycle(target).await {
                Ok(_) => {}
                Err(
                    err @ (GripperError::Comm(_)
                    | GripperError::DeviceStatus(_)
                    | GripperError::UnexpectedResponse(_)),
                ) => {
                    warn!(error = %err, "control cycle failed");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop both state machines and drive straight to fully open.
    pub async fn emergency_open(&mut self) -> Result<&mut Self, GripperError> {
        if self.halted {
            return Err(GripperError::HardwareFault(self.recovery.standing()));
        }
        warn!("emergency open");
        let position = self
            .snapshot
            .map(|s| self.scale.to_percent(s.position))
            .unwrap_or(100.0);
        self.grasp.reset(position);
        self.hybrid.reset();
        self.plan = None;
        self.bus.set_torque(true).await?;
        self.apply(Actuation::Position {
            position: 100.0,
            current: self.config.force.moving_force,
        })
        .await?;
        Ok(self)
    }

    /// Disable the power stage.
    pub async fn disable(&mut self) -> Result<&mut Self, GripperError> {
        self.bus.set_torque(false).await?;
        self.last_written = None;
        Ok(self)
    }

    /// External reset after a standing fault: forget recovery records and resume control.
    pub async fn reset_faults(&mut self) -> Result<&mut Self, GripperError> {
        info!(faults = ?self.recovery.standing(), "fault reset requested");
        self.recovery.reset();
        self.halted = false;
        self.last_written = None;
        self.hybrid.reset();
        self.plan = None;
        self.bus.set_torque(true).await?;
        Ok(self)
    }

    /// Take the present raw position as the new closed reference.
    ///
    /// The caller is expected to have driven the fingers onto the closed hard
    /// stop first, and to persist the result in its calibration store.
    pub async fn record_zero(&mut self) -> Result<ZeroReference, GripperError> {
        let raw = self.bus.read_signed(&self.config.registers.present_position).await?;
        let zero = ZeroReference::new(raw as i32);
        info!(offset = zero.offset, "zero reference recorded");
        self.scale.zero = zero;
        self.last_written = None;
        Ok(zero)
    }

    pub fn subscribe(&self) -> watch::Receiver<GripperState> {
        self.state_tx.subscribe()
    }

    pub fn zero_reference(&self) -> ZeroReference {
        self.scale.zero
    }

    pub fn snapshot(&self) -> Option<&SensorSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn grasp_state(&self) -> GraspState {
        self.grasp.state()
    }

    pub fn control_mode(&self) -> ControlMode {
        self.hybrid.mode()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    async fn apply(&mut self, actuation: Actuation) -> Result<(), GripperError> {
        let registers = self.config.registers;
        let goal_position = self.scale.to_raw(actuation.position());
        let goal_current = (actuation.current().clamp(0.0, 100.0) / 100.0
            * self.config.motion.max_current as f32)
            .round() as u16;
        if self.last_written == Some((goal_position, goal_current)) {
            return Ok(());
        }

        self.bus
            .bulk_write(&[
                (
                    registers.goal_current.address,
                    registers.goal_current.width.to_le_bytes(goal_current as u64),
                ),
                (
                    registers.goal_position.address,
                    registers
                        .goal_position
                        .width
                        .to_le_bytes(goal_position as u32 as u64),
                ),
            ])
            .await?;
        self.last_written = Some((goal_position, goal_current));
        Ok(())
    }

    fn publish(&self, snapshot: &SensorSnapshot, position: f32) {
        let effort =
            snapshot.current.unsigned_abs() as f32 * 100.0 / self.config.motion.max_current as f32;
        self.state_tx.send_replace(GripperState {
            position,
            effort,
            temperature: snapshot.temperature,
            moving: self.grasp.state() == GraspState::Moving,
            grasp: self.grasp.state(),
            mode: self.hybrid.mode(),
            faults: snapshot.faults(),
            halted: self.halted,
        });
    }
}
