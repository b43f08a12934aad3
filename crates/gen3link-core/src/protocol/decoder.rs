//! Packet decoding
//!
//! A byte-driven state machine that finds packet boundaries in the incoming
//! stream and validates each packet's CRC. It never blocks: the caller
//! feeds whatever bytes the channel produced and checks the status.

use tracing::trace;

use super::{crc::Crc8, ProtocolError, SENTINEL};

/// Decoder position within a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Discarding bytes until a sentinel
    AwaitSentinel,
    /// Next byte is the payload length
    AwaitLength,
    /// Collecting payload bytes
    AwaitPayload,
    /// Next byte is the CRC trailer
    AwaitCrc,
}

/// Outcome of feeding a byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    /// More bytes are needed
    Pending,
    /// A packet with a valid CRC was received
    Complete(Vec<u8>),
}

/// Incremental packet decoder
#[derive(Debug)]
pub struct PacketDecoder {
    state: DecoderState,
    expected_len: usize,
    payload: Vec<u8>,
    crc: Crc8,
    discarded: u64,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    /// Create a decoder waiting for a sentinel
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitSentinel,
            expected_len: 0,
            payload: Vec::new(),
            crc: Crc8::new(),
            discarded: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Bytes skipped while hunting for a sentinel since creation
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop any partial packet and wait for the next sentinel
    pub fn reset(&mut self) {
        self.state = DecoderState::AwaitSentinel;
        self.expected_len = 0;
        self.payload.clear();
        self.crc.reset();
    }

    /// Process one byte.
    ///
    /// A CRC mismatch discards the packet and leaves the decoder waiting for
    /// the next sentinel.
    pub fn feed(&mut self, byte: u8) -> Result<DecodeStatus, ProtocolError> {
        match self.state {
            DecoderState::AwaitSentinel => {
                if byte == SENTINEL {
                    self.state = DecoderState::AwaitLength;
                } else {
                    self.discarded += 1;
                    trace!("decoder: discarding noise byte {:#04x}", byte);
                }
            }
            DecoderState::AwaitLength => {
                self.expected_len = byte as usize;
                self.payload = Vec::with_capacity(self.expected_len);
                self.crc.reset();
                self.state = if self.expected_len == 0 {
                    DecoderState::AwaitCrc
                } else {
                    DecoderState::AwaitPayload
                };
            }
            DecoderState::AwaitPayload => {
                self.payload.push(byte);
                self.crc.update(byte);
                if self.payload.len() >= self.expected_len {
                    self.state = DecoderState::AwaitCrc;
                }
            }
            DecoderState::AwaitCrc => {
                let expected = self.crc.value();
                if byte != expected {
                    self.reset();
                    return Err(ProtocolError::CrcMismatch {
                        expected,
                        actual: byte,
                    });
                }
                let payload = std::mem::take(&mut self.payload);
                self.reset();
                return Ok(DecodeStatus::Complete(payload));
            }
        }
        Ok(DecodeStatus::Pending)
    }

    /// Process bytes until a packet completes or fails.
    ///
    /// Returns the number of bytes consumed along with the status, so bytes
    /// after a completed packet can be fed again later. On error the bytes
    /// up to and including the bad CRC are consumed; the rest of `data` has
    /// not been looked at.
    pub fn feed_slice(&mut self, data: &[u8]) -> (usize, Result<DecodeStatus, ProtocolError>) {
        for (i, &byte) in data.iter().enumerate() {
            match self.feed(byte) {
                Ok(DecodeStatus::Pending) => continue,
                other => return (i + 1, other),
            }
        }
        (data.len(), Ok(DecodeStatus::Pending))
    }
}
