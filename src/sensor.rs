use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::bus::{RegisterBus, RegisterTable};
use crate::recovery::HardwareFaults;
use crate::GripperError;

/// One read-out of the servo, taken once per control cycle.
///
/// Never mutated after construction; a newer snapshot replaces it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    /// Raw encoder ticks.
    pub position: i32,
    /// Raw present current, signed.
    pub current: i32,
    /// °C
    pub temperature: i32,
    /// V
    pub voltage: f32,
    /// Hardware-error register.
    pub error_bits: u8,
    pub t: Instant,
}

impl SensorSnapshot {
    /// Read all fields in a single bulk transaction.
    pub async fn read<S>(bus: &mut RegisterBus<S>, registers: &RegisterTable) -> Result<Self, GripperError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let layout = [
            registers.present_position,
            registers.present_current,
            registers.present_temperature,
            registers.present_voltage,
            registers.hardware_error,
        ];
        let request: Vec<_> = layout.iter().map(|r| (r.address, r.width)).collect();
        let values = bus.bulk_read(&request).await?;
        let t = Instant::now();

        let signed = |i: usize| layout[i].width.sign_extend(values[i]);
        Ok(Self {
            position: signed(0) as i32,
            current: signed(1) as i32,
            temperature: signed(2) as i32,
            // 0.1 V per unit
            voltage: values[3] as f32 / 10.0,
            error_bits: values[4] as u8,
            t,
        })
    }

    pub fn faults(&self) -> HardwareFaults {
        HardwareFaults::from_bits_truncate(self.error_bits)
    }
}
