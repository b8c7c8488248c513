#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use servo_gripper::protocol::{self, Frame, Instruction, HEADER_LEN, MARKER};
use servo_gripper::{GripperConfig, RegisterBus, RegisterTable, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const ID: u8 = 1;
/// Timeout used by test transports; long enough for the simulator on a paused clock.
pub const TIMEOUT: Duration = Duration::from_millis(50);

/// Addresses below this are persistent and refuse writes while torque is on.
const EEPROM_END: u16 = 64;

/// Register memory and fault injection for one simulated servo.
pub struct ServoModel {
    pub memory: [u8; 256],
    pub table: RegisterTable,
    /// Swallow this many upcoming requests without answering.
    pub drop_responses: usize,
    /// Flip a checksum bit in this many upcoming responses.
    pub corrupt_responses: usize,
    /// Whether a reboot clears the hardware-error register.
    pub clear_on_reboot: bool,
    pub reboots: usize,
    /// Raw position of an object between the fingers.
    pub object_at: Option<i32>,
    /// Every accepted single or bulk write, as (address, bytes).
    pub writes: Vec<(u16, Vec<u8>)>,
    pub requests: Vec<Instruction>,
}

impl ServoModel {
    fn new() -> Self {
        let mut model = Self {
            memory: [0; 256],
            table: RegisterTable::default(),
            drop_responses: 0,
            corrupt_responses: 0,
            clear_on_reboot: true,
            reboots: 0,
            object_at: None,
            writes: Vec::new(),
            requests: Vec::new(),
        };
        let t = model.table;
        model.set(t.current_limit.address, 2, 1750);
        model.set(t.present_voltage.address, 2, 120);
        model.set(t.present_temperature.address, 1, 35);
        model.set(t.present_position.address, 4, 1800);
        model.set(t.goal_position.address, 4, 1800);
        model
    }

    pub fn set(&mut self, address: u16, len: usize, value: u32) {
        let start = address as usize;
        self.memory[start..start + len].copy_from_slice(&value.to_le_bytes()[..len]);
    }

    pub fn get(&self, address: u16, len: usize) -> u32 {
        let start = address as usize;
        let mut bytes = [0u8; 4];
        bytes[..len].copy_from_slice(&self.memory[start..start + len]);
        u32::from_le_bytes(bytes)
    }

    pub fn torque(&self) -> bool {
        self.get(self.table.torque_enable.address, 1) != 0
    }

    pub fn position(&self) -> i32 {
        self.get(self.table.present_position.address, 4) as i32
    }

    pub fn set_position(&mut self, raw: i32) {
        let t = self.table;
        self.set(t.present_position.address, 4, raw as u32);
        self.set(t.goal_position.address, 4, raw as u32);
    }

    pub fn set_error_bits(&mut self, bits: u8) {
        let address = self.table.hardware_error.address;
        self.set(address, 1, bits as u32);
    }

    /// Writes that touched `address`.
    pub fn writes_to(&self, address: u16) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, data)| {
                let mut bytes = [0u8; 4];
                bytes[..data.len()].copy_from_slice(data);
                u32::from_le_bytes(bytes)
            })
            .collect()
    }

    fn alert(&self) -> u8 {
        if self.get(self.table.hardware_error.address, 1) != 0 {
            0x80
        } else {
            0
        }
    }

    fn write(&mut self, address: u16, data: &[u8]) -> u8 {
        if address < EEPROM_END && self.torque() {
            // access error
            return 0x07;
        }
        let start = address as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
        self.writes.push((address, data.to_vec()));
        0
    }

    /// Move instantly to the goal, stopping against the object if there is one.
    fn settle(&mut self) {
        let t = self.table;
        if !self.torque() {
            self.set(t.present_current.address, 2, 0);
            return;
        }
        let goal = self.get(t.goal_position.address, 4) as i32;
        let goal_current = self.get(t.goal_current.address, 2);
        match self.object_at {
            Some(object) if goal < object && self.position() >= object => {
                self.set(t.present_position.address, 4, object as u32);
                self.set(t.present_current.address, 2, goal_current.min(800));
            }
            _ => {
                self.set(t.present_position.address, 4, goal as u32);
                self.set(t.present_current.address, 2, 30);
            }
        }
    }

    fn handle(&mut self, frame: &Frame) -> (u8, Vec<u8>) {
        self.requests.push(frame.instruction);
        let p = &frame.payload;
        let word = |i: usize| u16::from_le_bytes([p[i], p[i + 1]]);
        let (status, params) = match frame.instruction {
            Instruction::Ping => (0, vec![0x06, 0x04, 0x26]),
            Instruction::Read => {
                let (address, len) = (word(0) as usize, word(2) as usize);
                (0, self.memory[address..address + len].to_vec())
            }
            Instruction::Write => {
                let status = self.write(word(0), &p[2..]);
                (status, Vec::new())
            }
            Instruction::Reboot => {
                self.reboots += 1;
                let t = self.table;
                self.set(t.torque_enable.address, 1, 0);
                if self.clear_on_reboot {
                    self.set(t.hardware_error.address, 1, 0);
                }
                (0, Vec::new())
            }
            Instruction::BulkRead => {
                let mut out = Vec::new();
                for entry in p.chunks(4) {
                    let address = u16::from_le_bytes([entry[0], entry[1]]) as usize;
                    let len = u16::from_le_bytes([entry[2], entry[3]]) as usize;
                    out.extend_from_slice(&self.memory[address..address + len]);
                }
                (0, out)
            }
            Instruction::BulkWrite => {
                let mut status = 0;
                let mut i = 0;
                while i + 4 <= p.len() {
                    let address = word(i);
                    let len = word(i + 2) as usize;
                    let data = p[i + 4..i + 4 + len].to_vec();
                    status |= self.write(address, &data);
                    i += 4 + len;
                }
                (status, Vec::new())
            }
            Instruction::Status => (0x02, Vec::new()),
        };
        self.settle();
        (status | self.alert(), params)
    }
}

pub type Servo = Arc<Mutex<ServoModel>>;

/// Spawn a simulated servo and return the host end of the link.
pub fn spawn_servo() -> (DuplexStream, Servo) {
    let (host, mut device) = tokio::io::duplex(1024);
    let servo = Arc::new(Mutex::new(ServoModel::new()));
    let model = servo.clone();
    tokio::spawn(async move {
        let mut rx = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = match device.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            rx.extend_from_slice(&chunk[..n]);
            while let Some(start) = protocol::find_marker(&rx) {
                rx.drain(..start);
                if rx.len() < HEADER_LEN {
                    break;
                }
                let total = HEADER_LEN + u16::from_le_bytes([rx[5], rx[6]]) as usize;
                if rx.len() < total {
                    break;
                }
                let bytes: Vec<u8> = rx.drain(..total).collect();
                let Ok(frame) = protocol::decode(&bytes) else {
                    continue;
                };
                if frame.address != ID && frame.address != protocol::BROADCAST_ADDRESS {
                    continue;
                }
                let response = {
                    let mut m = model.lock().unwrap();
                    let (status, params) = m.handle(&frame);
                    if frame.address == protocol::BROADCAST_ADDRESS {
                        None
                    } else if m.drop_responses > 0 {
                        m.drop_responses -= 1;
                        None
                    } else {
                        let Ok(mut response) = protocol::status_frame(ID, status, &params) else {
                            continue;
                        };
                        if m.corrupt_responses > 0 {
                            m.corrupt_responses -= 1;
                            let last = response.len() - 1;
                            response[last] ^= 0x01;
                        }
                        Some(response)
                    }
                };
                if let Some(response) = response {
                    if device.write_all(&response).await.is_err() {
                        return;
                    }
                }
            }
            if protocol::find_marker(&rx).is_none() && rx.len() > MARKER.len() {
                let keep = rx.len() - (MARKER.len() - 1);
                rx.drain(..keep);
            }
        }
    });
    (host, servo)
}

pub fn transport(stream: DuplexStream) -> Transport<DuplexStream> {
    Transport::new(stream, TIMEOUT, 3)
}

pub fn bus() -> (RegisterBus<DuplexStream>, Servo) {
    let (stream, servo) = spawn_servo();
    let bus = RegisterBus::new(
        transport(stream),
        ID,
        &RegisterTable::default(),
        Duration::from_millis(20),
    );
    (bus, servo)
}

pub fn config() -> GripperConfig {
    let mut config = GripperConfig::default();
    config.bus.response_timeout_ms = TIMEOUT.as_millis() as u64;
    config
}
