//! Response payloads
//!
//! The protocol is not self-describing: the caller knows which fields to
//! expect for the command it sent and reads them in order.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Status byte at the start of every response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseCode {
    GenericError = 0,
    Ok = 1,
    BufferOverflow = 2,
    CrcMismatch = 3,
    QueryOverflow = 4,
    Unsupported = 5,
}

impl ResponseCode {
    /// Decode a status byte
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(ResponseCode::GenericError),
            1 => Ok(ResponseCode::Ok),
            2 => Ok(ResponseCode::BufferOverflow),
            3 => Ok(ResponseCode::CrcMismatch),
            4 => Ok(ResponseCode::QueryOverflow),
            5 => Ok(ResponseCode::Unsupported),
            other => Err(ProtocolError::UnknownResponseCode(other)),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResponseCode::GenericError => "generic error",
            ResponseCode::Ok => "OK",
            ResponseCode::BufferOverflow => "buffer full",
            ResponseCode::CrcMismatch => "CRC mismatch",
            ResponseCode::QueryOverflow => "query overflow",
            ResponseCode::Unsupported => "unsupported command",
        };
        f.write_str(text)
    }
}

/// A validated response payload with a read cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Vec<u8>,
    cursor: usize,
}

impl Response {
    /// Wrap a decoded payload. The status byte must be present.
    pub fn new(payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyResponse);
        }
        Ok(Self { payload, cursor: 1 })
    }

    /// Build a response from a status and the data bytes that follow it
    pub fn with_data(code: ResponseCode, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(code as u8);
        payload.extend_from_slice(data);
        Self { payload, cursor: 1 }
    }

    /// Response status
    pub fn code(&self) -> Result<ResponseCode, ProtocolError> {
        ResponseCode::from_byte(self.payload[0])
    }

    /// Whether the status is OK
    pub fn is_ok(&self) -> bool {
        self.payload[0] == ResponseCode::Ok as u8
    }

    /// Raw payload including the status byte
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Unread bytes
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        let available = self.remaining();
        if n > available {
            return Err(ProtocolError::ResponseTooShort {
                needed: n,
                available,
            });
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.payload[start..self.cursor])
    }

    /// Next 8-bit value
    pub fn get8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Next 16-bit value
    pub fn get16(&mut self) -> Result<u16, ProtocolError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    /// Next 32-bit value
    pub fn get32(&mut self) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Next signed 32-bit value
    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let mut r = Response::new(vec![1, 0x07, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert!(r.is_ok());
        assert_eq!(r.code().unwrap(), ResponseCode::Ok);
        assert_eq!(r.get8().unwrap(), 7);
        assert_eq!(r.get16().unwrap(), 0x1234);
        assert_eq!(r.get32().unwrap(), 0x1234_5678);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_signed_read() {
        let mut r = Response::with_data(ResponseCode::Ok, &(-1234i32).to_le_bytes());
        assert_eq!(r.get_i32().unwrap(), -1234);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut r = Response::new(vec![1, 0xAA]).unwrap();
        match r.get16() {
            Err(ProtocolError::ResponseTooShort { needed, available }) => {
                assert_eq!(needed, 2);
                assert_eq!(available, 1);
            }
            other => panic!("expected ResponseTooShort, got {:?}", other),
        }
        // cursor did not move on failure
        assert_eq!(r.get8().unwrap(), 0xAA);
        assert!(r.get8().is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            Response::new(Vec::new()),
            Err(ProtocolError::EmptyResponse)
        ));
    }

    #[test]
    fn test_unknown_code() {
        let r = Response::new(vec![0x42]).unwrap();
        assert!(!r.is_ok());
        assert!(matches!(
            r.code(),
            Err(ProtocolError::UnknownResponseCode(0x42))
        ));
    }
}
