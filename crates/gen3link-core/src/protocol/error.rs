//! Protocol errors

use thiserror::Error;

use super::ResponseCode;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Timed out waiting for a response")]
    Timeout,

    #[error("Transaction cancelled")]
    Cancelled,

    #[error("Channel closed by the remote end")]
    Disconnected,

    #[error("Not connected to a machine")]
    NotConnected,

    #[error("CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch { expected: u8, actual: u8 },

    #[error("Machine command buffer is full")]
    BufferOverflow,

    #[error("Machine reported a CRC mismatch on the request")]
    DeviceCrcMismatch,

    #[error("Machine returned {0}")]
    Device(ResponseCode),

    #[error("Unknown response code {0:#04x}")]
    UnknownResponseCode(u8),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Response too short: needed {needed} more bytes, {available} available")]
    ResponseTooShort { needed: usize, available: usize },

    #[error("Empty response payload")]
    EmptyResponse,

    #[error("Machine reported no firmware version")]
    NullVersion,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether resending the whole request may succeed.
    ///
    /// Line corruption and a full command queue are transient; everything
    /// else ends the transaction for good.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::CrcMismatch { .. }
                | ProtocolError::BufferOverflow
                | ProtocolError::DeviceCrcMismatch
        )
    }

    /// Whether the session is unusable after this error.
    ///
    /// Transport failures leave the machine in an unknown state, so the
    /// cached position must be dropped and the link re-initialized.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_)
                | ProtocolError::Timeout
                | ProtocolError::Disconnected
                | ProtocolError::NotConnected
                | ProtocolError::Io(_)
        )
    }
}
