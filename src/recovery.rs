//! Hardware fault classification and bounded recovery.
//!
//! Each fault kind owns an attempt counter. Once it reaches the configured cap
//! (or the procedure escalates), the fault becomes a standing condition: the
//! power stage is left disabled and nothing is retried until an external
//! reset, or until a zero read of the error register shows it is gone.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bus::{RegisterBus, RegisterTable};
use crate::config::RecoveryConfig;
use crate::GripperError;

bitflags! {
    /// Hardware-error register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct HardwareFaults: u8 {
        const INPUT_VOLTAGE    = 0x01;
        const OVERHEATING      = 0x04;
        const ENCODER          = 0x08;
        const ELECTRICAL_SHOCK = 0x10;
        const OVERLOAD         = 0x20;
    }
}

impl Default for HardwareFaults {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    InputVoltage,
    Overheating,
    Encoder,
    ElectricalShock,
    Overload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::InputVoltage,
        FaultKind::Overheating,
        FaultKind::Encoder,
        FaultKind::ElectricalShock,
        FaultKind::Overload,
    ];

    pub fn flag(self) -> HardwareFaults {
        match self {
            FaultKind::InputVoltage => HardwareFaults::INPUT_VOLTAGE,
            FaultKind::Overheating => HardwareFaults::OVERHEATING,
            FaultKind::Encoder => HardwareFaults::ENCODER,
            FaultKind::ElectricalShock => HardwareFaults::ELECTRICAL_SHOCK,
            FaultKind::Overload => HardwareFaults::OVERLOAD,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            FaultKind::InputVoltage | FaultKind::Overload => Severity::Warning,
            FaultKind::Overheating | FaultKind::Encoder | FaultKind::ElectricalShock => {
                Severity::Critical
            }
        }
    }

    /// Faults that get exactly one clear attempt before escalating.
    fn single_attempt(self) -> bool {
        matches!(self, FaultKind::Encoder | FaultKind::ElectricalShock)
    }
}

impl HardwareFaults {
    pub fn kinds(self) -> impl Iterator<Item = FaultKind> {
        FaultKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.flag()))
    }
}

/// Bookkeeping for one fault kind while it is present.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub code: u8,
    pub severity: Severity,
    pub attempts: u32,
    pub last_seen: Instant,
    /// No more automatic recovery until an external reset.
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Procedure ran and the bit read back clear.
    Recovered,
    /// Procedure ran but the bit is still set; attempts remain.
    Failed,
    /// Attempts exhausted or the procedure escalated; external intervention required.
    Standing,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub outcomes: Vec<(FaultKind, RecoveryOutcome)>,
}

impl RecoveryReport {
    pub fn standing(&self) -> HardwareFaults {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == RecoveryOutcome::Standing)
            .fold(HardwareFaults::empty(), |acc, (kind, _)| acc | kind.flag())
    }

    pub fn outcome(&self, kind: FaultKind) -> Option<RecoveryOutcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, outcome)| *outcome)
    }
}

/// The device operations recovery procedures are built from.
#[allow(async_fn_in_trait)]
pub trait RecoveryPort {
    async fn set_torque(&mut self, enabled: bool) -> Result<(), GripperError>;
    /// Clear latched error bits (a device reboot).
    async fn clear_errors(&mut self) -> Result<(), GripperError>;
    async fn read_error_bits(&mut self) -> Result<u8, GripperError>;
    async fn read_voltage(&mut self) -> Result<f32, GripperError>;
    async fn read_temperature(&mut self) -> Result<i32, GripperError>;
    async fn read_current_limit(&mut self) -> Result<u16, GripperError>;
    async fn write_current_limit(&mut self, limit: u16) -> Result<(), GripperError>;
}

/// [`RecoveryPort`] over a live register bus.
pub struct BusPort<'a, S> {
    pub bus: &'a mut RegisterBus<S>,
    pub registers: &'a RegisterTable,
}

impl<S> RecoveryPort for BusPort<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn set_torque(&mut self, enabled: bool) -> Result<(), GripperError> {
        self.bus.set_torque(enabled).await
    }

    async fn clear_errors(&mut self) -> Result<(), GripperError> {
        self.bus.reboot().await
    }

    async fn read_error_bits(&mut self) -> Result<u8, GripperError> {
        Ok(self.bus.read_register(&self.registers.hardware_error).await? as u8)
    }

    async fn read_voltage(&mut self) -> Result<f32, GripperError> {
        Ok(self.bus.read_register(&self.registers.present_voltage).await? as f32 / 10.0)
    }

    async fn read_temperature(&mut self) -> Result<i32, GripperError> {
        Ok(self.bus.read_signed(&self.registers.present_temperature).await? as i32)
    }

    async fn read_current_limit(&mut self) -> Result<u16, GripperError> {
        Ok(self.bus.read_register(&self.registers.current_limit).await? as u16)
    }

    async fn write_current_limit(&mut self, limit: u16) -> Result<(), GripperError> {
        self.bus
            .write_register(&self.registers.current_limit, limit as u64)
            .await
    }
}

/// What a single procedure run concluded.
enum Procedure {
    Verified,
    StillSet,
    Escalate,
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    config: RecoveryConfig,
    records: BTreeMap<FaultKind, ErrorRecord>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
        }
    }

    pub fn record(&self, kind: FaultKind) -> Option<&ErrorRecord> {
        self.records.get(&kind)
    }

    /// Faults currently past their recovery budget.
    pub fn standing(&self) -> HardwareFaults {
        self.records
            .iter()
            .filter(|(_, record)| record.terminal)
            .fold(HardwareFaults::empty(), |acc, (kind, _)| acc | kind.flag())
    }

    /// External reset: forget all records and their attempt counters.
    pub fn reset(&mut self) {
        if !self.records.is_empty() {
            info!(faults = ?self.standing(), "recovery records reset");
        }
        self.records.clear();
    }

    /// Classify `error_bits` and run at most one recovery attempt per present fault.
    pub async fn inspect<P: RecoveryPort>(
        &mut self,
        port: &mut P,
        error_bits: u8,
        now: Instant,
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        if error_bits == 0 {
            if !self.records.is_empty() {
                info!("hardware error register reads clear");
                self.records.clear();
            }
            return report;
        }

        let faults = HardwareFaults::from_bits_retain(error_bits);
        let unknown = faults.bits() & !HardwareFaults::all().bits();
        if unknown != 0 {
            warn!(bits = unknown, "undocumented hardware error bits ignored");
        }

        for kind in faults.kinds() {
            let record = self.records.entry(kind).or_insert_with(|| {
                warn!(?kind, severity = ?kind.severity(), "hardware fault detected");
                ErrorRecord {
                    code: kind.flag().bits(),
                    severity: kind.severity(),
                    attempts: 0,
                    last_seen: now,
                    terminal: false,
                }
            });
            record.last_seen = now;
            if record.terminal {
                report.outcomes.push((kind, RecoveryOutcome::Standing));
                continue;
            }
            record.attempts += 1;
            let attempts = record.attempts;

            let procedure = match self.run(kind, port).await {
                Ok(procedure) => procedure,
                Err(err) => {
                    warn!(?kind, error = %err, "recovery procedure interrupted");
                    if let Err(err) = port.set_torque(false).await {
                        error!(error = %err, "could not disable power stage");
                    }
                    Procedure::StillSet
                }
            };

            let outcome = match procedure {
                Procedure::Verified => {
                    info!(?kind, attempts, "recovered");
                    self.records.remove(&kind);
                    RecoveryOutcome::Recovered
                }
                Procedure::StillSet
                    if attempts < self.config.max_attempts && !kind.single_attempt() =>
                {
                    warn!(?kind, attempts, "recovery attempt failed");
                    RecoveryOutcome::Failed
                }
                Procedure::StillSet | Procedure::Escalate => {
                    error!(?kind, attempts, "recovery exhausted, power stage left disabled");
                    if let Some(record) = self.records.get_mut(&kind) {
                        record.terminal = true;
                    }
                    if let Err(err) = port.set_torque(false).await {
                        error!(error = %err, "could not disable power stage");
                    }
                    RecoveryOutcome::Standing
                }
            };
            report.outcomes.push((kind, outcome));
        }
        report
    }

    async fn run<P: RecoveryPort>(&self, kind: FaultKind, port: &mut P) -> Result<Procedure, GripperError> {
        let config = &self.config;
        match kind {
            FaultKind::Overload => {
                port.set_torque(false).await?;
                port.clear_errors().await?;
                let limit = port.read_current_limit().await?;
                let reduced = (limit as f32 * config.overload_current_factor).round() as u16;
                info!(limit, reduced, "overload, reducing current limit");
                port.write_current_limit(reduced).await?;
                port.set_torque(true).await?;
                verify(port, kind).await
            }
            FaultKind::InputVoltage => {
                let voltage = port.read_voltage().await?;
                if (config.voltage_min..=config.voltage_max).contains(&voltage) {
                    port.clear_errors().await?;
                    port.set_torque(true).await?;
                    verify(port, kind).await
                } else {
                    error!(voltage, "input voltage out of range");
                    port.set_torque(false).await?;
                    Ok(Procedure::Escalate)
                }
            }
            FaultKind::Overheating => {
                port.set_torque(false).await?;
                info!(cooldown = ?config.thermal_cooldown(), "overheated, cooling down");
                tokio::time::sleep(config.thermal_cooldown()).await;
                let temperature = port.read_temperature().await?;
                if temperature >= config.safe_temperature {
                    error!(temperature, "still too hot after cooldown");
                    return Ok(Procedure::Escalate);
                }
                port.clear_errors().await?;
                let limit = port.read_current_limit().await?;
                let reduced = (limit as f32 * config.thermal_current_factor).round() as u16;
                port.write_current_limit(reduced).await?;
                port.set_torque(true).await?;
                verify(port, kind).await
            }
            FaultKind::Encoder | FaultKind::ElectricalShock => {
                port.clear_errors().await?;
                port.set_torque(true).await?;
                match verify(port, kind).await? {
                    Procedure::Verified => Ok(Procedure::Verified),
                    _ => Ok(Procedure::Escalate),
                }
            }
        }
    }
}

async fn verify<P: RecoveryPort>(port: &mut P, kind: FaultKind) -> Result<Procedure, GripperError> {
    let bits = HardwareFaults::from_bits_retain(port.read_error_bits().await?);
    if bits.contains(kind.flag()) {
        Ok(Procedure::StillSet)
    } else {
        Ok(Procedure::Verified)
    }
}
