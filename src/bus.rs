//! Typed register access on top of the [`Transport`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::protocol::{Frame, Instruction, StatusPacket};
use crate::transport::Transport;
use crate::GripperError;

/// Ping response: model number (2 bytes) and firmware version.
const PING_PARAMS: usize = 3;

/// Byte width of a register.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Width {
    Byte = 1,
    Word = 2,
    DWord = 4,
}

impl Width {
    pub fn len(self) -> usize {
        self as usize
    }

    /// Little-endian encoding of the low `len()` bytes of `value`.
    pub fn to_le_bytes(self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.len()].to_vec()
    }

    pub fn from_le_bytes(self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf[..self.len()].copy_from_slice(&bytes[..self.len()]);
        u64::from_le_bytes(buf)
    }

    /// Interpret a raw register value as two's complement of this width.
    pub fn sign_extend(self, raw: u64) -> i64 {
        match self {
            Width::Byte => raw as u8 as i8 as i64,
            Width::Word => raw as u16 as i16 as i64,
            Width::DWord => raw as u32 as i32 as i64,
        }
    }
}

/// Whether a register may be written while the power stage is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Stored across power cycles; only writable with the power stage disabled.
    Persistent,
    Volatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub address: u16,
    pub width: Width,
    pub persistence: Persistence,
}

impl Register {
    pub const fn persistent(address: u16, width: Width) -> Self {
        Self {
            address,
            width,
            persistence: Persistence::Persistent,
        }
    }

    pub const fn volatile(address: u16, width: Width) -> Self {
        Self {
            address,
            width,
            persistence: Persistence::Volatile,
        }
    }
}

/// The registers the control core touches.
///
/// Defaults follow the common X-series control table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTable {
    pub operating_mode: Register,
    pub current_limit: Register,
    pub torque_enable: Register,
    pub hardware_error: Register,
    pub goal_current: Register,
    pub goal_position: Register,
    pub present_current: Register,
    pub present_position: Register,
    pub present_voltage: Register,
    pub present_temperature: Register,
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self {
            operating_mode: Register::persistent(11, Width::Byte),
            current_limit: Register::persistent(38, Width::Word),
            torque_enable: Register::volatile(64, Width::Byte),
            hardware_error: Register::volatile(70, Width::Byte),
            goal_current: Register::volatile(102, Width::Word),
            goal_position: Register::volatile(116, Width::DWord),
            present_current: Register::volatile(126, Width::Word),
            present_position: Register::volatile(132, Width::DWord),
            present_voltage: Register::volatile(144, Width::Word),
            present_temperature: Register::volatile(146, Width::Byte),
        }
    }
}

/// Register level client for one device on the bus.
pub struct RegisterBus<S> {
    transport: Transport<S>,
    id: u8,
    torque_enable: Register,
    settle_delay: Duration,
}

impl<S> RegisterBus<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        transport: Transport<S>,
        id: u8,
        registers: &RegisterTable,
        settle_delay: Duration,
    ) -> Self {
        Self {
            transport,
            id,
            torque_enable: registers.torque_enable,
            settle_delay,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Unicast request whose response must carry exactly `params` parameter bytes.
    async fn request(
        &mut self,
        instruction: Instruction,
        payload: Vec<u8>,
        params: usize,
    ) -> Result<StatusPacket, GripperError> {
        let frame = Frame::new(self.id, instruction, payload);
        let status = self.transport.transact(&frame).await?.ok_or_else(|| {
            GripperError::UnexpectedResponse("no response from a unicast request".into())
        })?;
        if status.params.len() != params {
            return Err(GripperError::UnexpectedResponse(format!(
                "{instruction:?} answered with {} parameter bytes, expected {params}",
                status.params.len()
            )));
        }
        Ok(status)
    }

    /// Check that the device answers. The response carries model and firmware numbers.
    pub async fn ping(&mut self) -> Result<(), GripperError> {
        self.request(Instruction::Ping, Vec::new(), PING_PARAMS).await?;
        Ok(())
    }

    /// Reboot the device, which also clears latched hardware-error bits and
    /// disables the power stage. Waits the settle delay before returning.
    pub async fn reboot(&mut self) -> Result<(), GripperError> {
        self.request(Instruction::Reboot, Vec::new(), 0).await?;
        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }

    /// Read `width` bytes at `address`, little-endian.
    pub async fn read(&mut self, address: u16, width: Width) -> Result<u64, GripperError> {
        let mut payload = address.to_le_bytes().to_vec();
        payload.extend_from_slice(&(width.len() as u16).to_le_bytes());
        let status = self.request(Instruction::Read, payload, width.len()).await?;
        Ok(width.from_le_bytes(&status.params))
    }

    /// Write `value` as `width` bytes at `address`, with no power-stage handling.
    pub async fn write(&mut self, address: u16, width: Width, value: u64) -> Result<(), GripperError> {
        let mut payload = address.to_le_bytes().to_vec();
        payload.extend(width.to_le_bytes(value));
        self.request(Instruction::Write, payload, 0).await?;
        Ok(())
    }

    /// Read several registers in one transaction; values come back in request order.
    pub async fn bulk_read(&mut self, registers: &[(u16, Width)]) -> Result<Vec<u64>, GripperError> {
        let mut payload = Vec::with_capacity(registers.len() * 4);
        for (address, width) in registers {
            payload.extend_from_slice(&address.to_le_bytes());
            payload.extend_from_slice(&(width.len() as u16).to_le_bytes());
        }
        let expected = registers.iter().map(|(_, width)| width.len()).sum();
        let status = self.request(Instruction::BulkRead, payload, expected).await?;

        let mut offset = 0;
        let values = registers
            .iter()
            .map(|(_, width)| {
                let value = width.from_le_bytes(&status.params[offset..]);
                offset += width.len();
                value
            })
            .collect();
        Ok(values)
    }

    /// Write several registers in one transaction.
    pub async fn bulk_write(&mut self, writes: &[(u16, Vec<u8>)]) -> Result<(), GripperError> {
        let mut payload = Vec::new();
        for (address, data) in writes {
            payload.extend_from_slice(&address.to_le_bytes());
            payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
            payload.extend_from_slice(data);
        }
        self.request(Instruction::BulkWrite, payload, 0).await?;
        Ok(())
    }

    /// Unsigned read of a register from the table.
    pub async fn read_register(&mut self, register: &Register) -> Result<u64, GripperError> {
        self.read(register.address, register.width).await
    }

    /// Read a register and sign-extend it from its width.
    pub async fn read_signed(&mut self, register: &Register) -> Result<i64, GripperError> {
        let raw = self.read_register(register).await?;
        Ok(register.width.sign_extend(raw))
    }

    /// Write a register, disabling the power stage around persistent writes.
    ///
    /// After a persistent write the bus waits the settle delay, then restores
    /// the power stage to whatever state it was in before.
    pub async fn write_register(&mut self, register: &Register, value: u64) -> Result<(), GripperError> {
        if register.persistence == Persistence::Volatile {
            return self.write(register.address, register.width, value).await;
        }

        let was_enabled = self.torque_enabled().await?;
        if was_enabled {
            self.set_torque(false).await?;
        }
        debug!(address = register.address, value, "writing persistent register");
        let result = self.write(register.address, register.width, value).await;
        tokio::time::sleep(self.settle_delay).await;
        if was_enabled {
            self.set_torque(true).await?;
        }
        result
    }

    /// Whether the power stage is currently enabled.
    pub async fn torque_enabled(&mut self) -> Result<bool, GripperError> {
        let torque_enable = self.torque_enable;
        Ok(self.read_register(&torque_enable).await? != 0)
    }

    /// Enable or disable the power stage.
    pub async fn set_torque(&mut self, enabled: bool) -> Result<(), GripperError> {
        let torque_enable = self.torque_enable;
        self.write(torque_enable.address, torque_enable.width, enabled as u64)
            .await
    }
}
