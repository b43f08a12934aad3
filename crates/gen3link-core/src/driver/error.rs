//! Driver errors

use thiserror::Error;

use super::Version;
use crate::protocol::ProtocolError;

/// Errors returned by [`MotionDriver`](super::MotionDriver) operations
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Firmware {found} is older than the minimum supported version {minimum}")]
    FirmwareTooOld { found: Version, minimum: Version },

    #[error("Machine not initialized")]
    NotInitialized,

    #[error("{0} is not supported by this firmware")]
    Unsupported(&'static str),

    #[error("Tool {index} does not exist (machine has {count})")]
    InvalidTool { index: u8, count: u8 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DriverError {
    /// Whether repeating the operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the machine must be re-initialized before further use
    pub fn is_transport_failure(&self) -> bool {
        match self {
            DriverError::Protocol(e) => e.is_transport_failure(),
            _ => false,
        }
    }
}
