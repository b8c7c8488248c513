//! Wire frames of the servo bus.
//!
//! ```text
//! [FF FF FD 00][address][length lo, hi][instruction][payload ..][crc lo, hi]
//! ```
//!
//! `length` counts instruction + payload + checksum, i.e. `payload.len() + 3`.
//! The checksum covers everything after the marker up to the checksum itself.
//! Response frames use the [`Instruction::Status`] code and carry the device
//! status byte as the first payload byte.

use num::FromPrimitive;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::{CommError, DeviceStatusError};

/// Frame start marker.
pub const MARKER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];
/// Marker, address and length.
pub const HEADER_LEN: usize = 7;
/// Smallest valid frame: header, instruction, checksum.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 3;
/// Upper bound on the declared length accepted from the wire.
pub const MAX_LENGTH: usize = 1024;
/// Largest payload that fits under [`MAX_LENGTH`].
pub const MAX_PAYLOAD: usize = MAX_LENGTH - 3;
/// Requests to this address are executed by every device and never answered.
pub const BROADCAST_ADDRESS: u8 = 0xFE;
/// Highest unicast device address.
pub const MAX_DEVICE_ADDRESS: u8 = 0xFC;

/// Bit 7 of the status byte: a hardware-error bit is latched on the device.
const ALERT_FLAG: u8 = 0x80;

#[repr(u8)]
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    Reboot = 0x08,
    /// Response to any instruction.
    Status = 0x55,
    BulkRead = 0x92,
    BulkWrite = 0x93,
}

/// Reflected CRC-16 (feedback `0xA001`, initial value 0) over `bytes`.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub instruction: Instruction,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame; nothing is validated until [`encode`](Self::encode).
    pub fn new(address: u8, instruction: Instruction, payload: Vec<u8>) -> Self {
        Self {
            address,
            instruction,
            payload,
        }
    }

    /// Serialize, recomputing length and checksum.
    pub fn encode(&self) -> Result<Vec<u8>, CommError> {
        encode(self.address, self.instruction, &self.payload)
    }

    /// Whether the device will answer this frame.
    pub fn expects_response(&self) -> bool {
        self.address != BROADCAST_ADDRESS
    }

    /// Interpret a response frame, surfacing a nonzero device status.
    pub fn into_status(self) -> Result<StatusPacket, crate::GripperError> {
        if self.instruction != Instruction::Status {
            return Err(crate::GripperError::UnexpectedResponse(format!(
                "expected status frame, got {:?}",
                self.instruction
            )));
        }
        let Some((&status, params)) = self.payload.split_first() else {
            return Err(CommError::Framing("status frame without status byte".into()).into());
        };
        if let Some(err) = DeviceStatusError::from_status(status) {
            return Err(err.into());
        }
        Ok(StatusPacket {
            address: self.address,
            alert: status & ALERT_FLAG != 0,
            params: params.to_vec(),
        })
    }
}

/// A successful device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub address: u8,
    /// The device has a latched hardware error; read the error register for details.
    pub alert: bool,
    pub params: Vec<u8>,
}

/// Build a status response. Used by devices and simulators, not by the host.
pub fn status_frame(address: u8, status: u8, params: &[u8]) -> Result<Vec<u8>, CommError> {
    let mut payload = Vec::with_capacity(params.len() + 1);
    payload.push(status);
    payload.extend_from_slice(params);
    encode(address, Instruction::Status, &payload)
}

/// Serialize one frame. Payloads longer than [`MAX_PAYLOAD`] are refused.
pub fn encode(address: u8, instruction: Instruction, payload: &[u8]) -> Result<Vec<u8>, CommError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CommError::Framing(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD}",
            payload.len()
        )));
    }
    let length = (payload.len() + 3) as u16;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + 3);
    bytes.extend_from_slice(&MARKER);
    bytes.push(address);
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.push(instruction as u8);
    bytes.extend_from_slice(payload);
    let crc = checksum(&bytes[MARKER.len()..]);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

/// Decode exactly one frame occupying all of `bytes`.
///
/// The checksum is verified before any header field is trusted, so a corrupted
/// length or address is reported as a checksum error.
pub fn decode(bytes: &[u8]) -> Result<Frame, CommError> {
    if bytes.len() < MARKER.len() || bytes[..MARKER.len()] != MARKER {
        return Err(CommError::Framing("missing frame marker".into()));
    }
    if bytes.len() < MIN_FRAME_LEN {
        return Err(CommError::Framing(format!(
            "frame of {} bytes is shorter than the minimum {MIN_FRAME_LEN}",
            bytes.len()
        )));
    }

    let body_end = bytes.len() - 2;
    let computed = checksum(&bytes[MARKER.len()..body_end]);
    let received = u16::from_le_bytes([bytes[body_end], bytes[body_end + 1]]);
    if computed != received {
        return Err(CommError::Checksum { computed, received });
    }

    let length = u16::from_le_bytes([bytes[5], bytes[6]]) as usize;
    if HEADER_LEN + length != bytes.len() {
        return Err(CommError::Framing(format!(
            "declared length {length} disagrees with {} received bytes",
            bytes.len()
        )));
    }

    let instruction = Instruction::from_u8(bytes[7]).ok_or_else(|| {
        CommError::Framing(format!("unknown instruction {:#04x}", bytes[7]))
    })?;

    Ok(Frame {
        address: bytes[4],
        instruction,
        payload: bytes[HEADER_LEN + 1..body_end].to_vec(),
    })
}

/// [`decode`], additionally requiring the frame to come from `expected`.
pub fn decode_from(bytes: &[u8], expected: u8) -> Result<Frame, CommError> {
    let frame = decode(bytes)?;
    if frame.address != expected {
        return Err(CommError::Framing(format!(
            "response from address {:#04x}, expected {expected:#04x}",
            frame.address
        )));
    }
    Ok(frame)
}

/// Offset of the first complete marker in `bytes`.
pub fn find_marker(bytes: &[u8]) -> Option<usize> {
    bytes.windows(MARKER.len()).position(|w| w == MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn checksum_matches_reference_frame() {
        // ping to id 1
        let bytes = encode(0x01, Instruction::Ping, &[]).unwrap();
        assert_eq!(
            &bytes[..8],
            &[0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01]
        );
        assert_eq!(checksum(&bytes[4..8]), u16::from_le_bytes([bytes[8], bytes[9]]));
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn checksum_is_reflected_crc16() {
        // CRC-16/ARC check value
        assert_eq!(checksum(b"123456789"), 0xBB3D);
    }

    #[test]
    fn length_counts_instruction_payload_and_checksum() {
        let bytes = encode(0x03, Instruction::Write, &[0x40, 0x00, 0x01]).unwrap();
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 6);
        assert_eq!(bytes.len(), HEADER_LEN + 6);
    }

    #[test]
    fn oversized_payload_is_refused() {
        assert!(encode(0x01, Instruction::Write, &vec![0; MAX_PAYLOAD]).is_ok());
        assert!(matches!(
            encode(0x01, Instruction::Write, &vec![0; MAX_PAYLOAD + 1]),
            Err(CommError::Framing(_))
        ));
        let frame = Frame::new(0x01, Instruction::BulkWrite, vec![0; 70_000]);
        assert!(frame.encode().is_err());
    }

    #[test]
    fn rejects_wrong_marker() {
        let mut bytes = encode(0x01, Instruction::Ping, &[]).unwrap();
        bytes[2] = 0x00;
        assert!(matches!(decode(&bytes), Err(CommError::Framing(_))));
    }

    #[test]
    fn rejects_truncated_frame() {
        let bytes = encode(0x01, Instruction::Ping, &[]).unwrap();
        assert!(matches!(decode(&bytes[..8]), Err(CommError::Framing(_))));
    }

    #[test]
    fn rejects_unknown_instruction_with_valid_checksum() {
        let mut bytes = encode(0x01, Instruction::Ping, &[]).unwrap();
        bytes[7] = 0x7E;
        let crc = checksum(&bytes[4..8]);
        bytes[8..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(CommError::Framing(_))));
    }

    #[test]
    fn decode_from_checks_address() {
        let bytes = status_frame(0x02, 0, &[1, 2]).unwrap();
        assert!(decode_from(&bytes, 0x02).is_ok());
        assert!(matches!(decode_from(&bytes, 0x01), Err(CommError::Framing(_))));
    }

    #[test]
    fn status_frame_surfaces_device_error() {
        let frame = decode(&status_frame(0x01, 0x07, &[]).unwrap()).unwrap();
        match frame.into_status() {
            Err(crate::GripperError::DeviceStatus(DeviceStatusError::Access)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn alert_bit_is_not_an_error() {
        let frame = decode(&status_frame(0x01, 0x80, &[0x20]).unwrap()).unwrap();
        let status = frame.into_status().unwrap();
        assert!(status.alert);
        assert_eq!(status.params, vec![0x20]);
    }

    #[test]
    fn finds_marker_after_garbage() {
        let mut bytes = vec![0x00, 0xFF, 0x13];
        bytes.extend(encode(0x01, Instruction::Ping, &[]).unwrap());
        assert_eq!(find_marker(&bytes), Some(3));
        assert_eq!(find_marker(&[0xFF, 0xFF, 0xFD]), None);
    }

    fn instruction() -> impl Strategy<Value = Instruction> {
        prop_oneof![
            Just(Instruction::Ping),
            Just(Instruction::Read),
            Just(Instruction::Write),
            Just(Instruction::Reboot),
            Just(Instruction::Status),
            Just(Instruction::BulkRead),
            Just(Instruction::BulkWrite),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            address in 0u8..=0xFE,
            instruction in instruction(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let frame = decode(&encode(address, instruction, &payload).unwrap()).unwrap();
            prop_assert_eq!(frame.address, address);
            prop_assert_eq!(frame.instruction, instruction);
            prop_assert_eq!(frame.payload, payload);
        }

        #[test]
        fn single_bit_flip_is_never_accepted(
            address in 0u8..=0xFC,
            instruction in instruction(),
            payload in proptest::collection::vec(any::<u8>(), 0..32),
            bit in any::<prop::sample::Index>(),
        ) {
            let mut bytes = encode(address, instruction, &payload).unwrap();
            let bit = bit.index(bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            let result = decode(&bytes);
            if bit / 8 < MARKER.len() {
                prop_assert!(matches!(result, Err(CommError::Framing(_))));
            } else {
                prop_assert!(matches!(result, Err(CommError::Checksum { .. })), "{:?}", result);
            }
        }
    }
}
