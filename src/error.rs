use thiserror::Error;

use crate::recovery::HardwareFaults;

/// Transport level failure of a single request/response transaction.
///
/// These are local to one transaction: the transport retries them up to the
/// configured bound before surfacing, and the next transaction may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// Marker, length, instruction or address did not match what a valid frame requires.
    #[error("framing error: {0}")]
    Framing(String),
    /// The transmitted checksum disagrees with the one computed over the frame body.
    #[error("checksum mismatch, computed {computed:#06x}, received {received:#06x}")]
    Checksum { computed: u16, received: u16 },
    /// No complete response arrived within the response timeout.
    #[error("timed out waiting for response")]
    Timeout,
}

/// Error reported by the device itself in the status byte of a response.
///
/// Never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceStatusError {
    #[error("device failed to process the instruction")]
    ResultFail,
    #[error("undefined instruction, or instruction sent without reboot")]
    Instruction,
    #[error("device reported a checksum mismatch")]
    Crc,
    #[error("data out of range")]
    DataRange,
    #[error("data length shorter than the register")]
    DataLength,
    #[error("data exceeds the register limit")]
    DataLimit,
    #[error("access denied, read-only register or write while torque is enabled")]
    Access,
    #[error("unknown device status {0:#04x}")]
    Unknown(u8),
}

impl DeviceStatusError {
    /// Map the low 7 bits of a status byte; `None` when the device reported success.
    pub fn from_status(status: u8) -> Option<Self> {
        match status & 0x7F {
            0x00 => None,
            0x01 => Some(Self::ResultFail),
            0x02 => Some(Self::Instruction),
            0x03 => Some(Self::Crc),
            0x04 => Some(Self::DataRange),
            0x05 => Some(Self::DataLength),
            0x06 => Some(Self::DataLimit),
            0x07 => Some(Self::Access),
            other => Some(Self::Unknown(other)),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::ResultFail => 0x01,
            Self::Instruction => 0x02,
            Self::Crc => 0x03,
            Self::DataRange => 0x04,
            Self::DataLength => 0x05,
            Self::DataLimit => 0x06,
            Self::Access => 0x07,
            Self::Unknown(code) => *code,
        }
    }
}

#[derive(Debug, Error)]
pub enum GripperError {
    /// Reading or writing the link or the calibration file failed.
    #[error("std io error, serial comm error")]
    IOError(#[from] std::io::Error),
    /// The serial port could not be opened or configured.
    #[error("serial port error")]
    SerialError(#[from] tokio_serial::Error),
    /// A transaction failed after its retries.
    #[error("bus communication error: {0}")]
    Comm(#[from] CommError),
    /// The device refused the instruction.
    #[error("device status error: {0}")]
    DeviceStatus(#[from] DeviceStatusError),
    /// Control is halted until `reset_faults`.
    #[error("standing hardware fault {0:?}, external reset required")]
    HardwareFault(HardwareFaults),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The calibration file is not valid JSON.
    #[error("calibration store error")]
    Store(#[from] serde_json::Error),
    /// A well-formed response that does not fit the request, e.g. the wrong parameter count.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl GripperError {
    /// Whether the transport may retry the transaction that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GripperError::Comm(_))
    }
}
