//! Packet encoding
//!
//! Request packet format:
//! - 1 byte: sentinel (0xD5)
//! - 1 byte: length of everything between the length byte and the CRC
//! - 1 byte: target
//! - 1 byte: command
//! - N bytes: payload (little-endian values)
//! - 1 byte: CRC-8 of target, command and payload

use byteorder::{ByteOrder, LittleEndian};

use super::{crc::Crc8, ProtocolError, Target, MAX_PAYLOAD_LEN, SENTINEL};

/// Bytes in front of the payload: sentinel, length, target, command
const HEADER_LEN: usize = 4;

/// Bounded builder for one request packet.
///
/// Every appended byte is folded into the running CRC as it is written.
/// Appends past [`MAX_PAYLOAD_LEN`] are not written; the overflow is
/// remembered and reported by [`PacketBuilder::build`].
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    data: Vec<u8>,
    crc: Crc8,
    overflow: usize,
}

impl PacketBuilder {
    /// Start a packet addressed to `target` carrying `command`
    pub fn new(target: Target, command: u8) -> Self {
        Self::raw(target.byte(), command)
    }

    /// Start a packet from raw target and command bytes
    pub fn raw(target: u8, command: u8) -> Self {
        let mut data = Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD_LEN + 1);
        data.push(SENTINEL);
        data.push(0); // length, filled in by build()
        let mut builder = Self {
            data,
            crc: Crc8::new(),
            overflow: 0,
        };
        builder.push(target);
        builder.push(command);
        builder
    }

    fn push(&mut self, b: u8) {
        self.data.push(b);
        self.crc.update(b);
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.overflow > 0 || self.payload_len() + bytes.len() > MAX_PAYLOAD_LEN {
            self.overflow += bytes.len();
            return;
        }
        for &b in bytes {
            self.push(b);
        }
    }

    /// Append an 8-bit value
    pub fn add8(mut self, value: u8) -> Self {
        self.append(&[value]);
        self
    }

    /// Append a 16-bit value (little-endian)
    pub fn add16(mut self, value: u16) -> Self {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.append(&buf);
        self
    }

    /// Append a 32-bit value (little-endian)
    pub fn add32(mut self, value: u32) -> Self {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.append(&buf);
        self
    }

    /// Append a signed 32-bit value (little-endian, two's complement)
    pub fn add_i32(mut self, value: i32) -> Self {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.append(&buf);
        self
    }

    /// Append raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.append(data);
        self
    }

    /// Target byte of the packet under construction
    pub fn target(&self) -> u8 {
        self.data[2]
    }

    /// Command byte of the packet under construction
    pub fn command(&self) -> u8 {
        self.data[3]
    }

    /// Payload written so far (after target and command)
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    /// Number of payload bytes written so far (after target and command)
    pub fn payload_len(&self) -> usize {
        self.data.len() - HEADER_LEN
    }

    /// Finish the packet: fill in the length and append the CRC
    pub fn build(self) -> Result<Vec<u8>, ProtocolError> {
        if self.overflow > 0 {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.payload_len() + self.overflow,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let mut data = self.data;
        // length does not count the sentinel or itself
        data[1] = (data.len() - 2) as u8;
        data.push(self.crc.value());
        Ok(data)
    }
}
