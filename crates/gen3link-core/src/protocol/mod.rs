//! Gen3 packet protocol
//!
//! Binary request/response protocol spoken by third-generation RepRap
//! electronics: framed packets with a length byte and a CRC-8 trailer,
//! addressed to either the three-axis stage or the toolhead.

pub mod commands;
mod connection;
pub mod crc;
pub mod decoder;
mod error;
pub mod estimation;
mod packet;
mod response;
pub mod serial;
pub mod stream;
pub mod transaction;

pub use commands::{StageCommand, Target, ToolCommand};
pub use connection::{connect, drain_banner, ConnectionConfig};
pub use decoder::{DecodeStatus, PacketDecoder};
pub use error::ProtocolError;
pub use estimation::EstimatingTransactor;
pub use packet::PacketBuilder;
pub use response::{Response, ResponseCode};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use stream::{share, Channel, SerialChannel, SharedChannel};
pub use transaction::{SerialTransactor, TransactionStats, Transactor};

/// First byte of every packet
pub const SENTINEL: u8 = 0xD5;

/// Largest payload after target and command that fits the length byte
pub const MAX_PAYLOAD_LEN: usize = 253;

/// Default baud rate of the machine link
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Longest single blocking read, so cancellation is noticed promptly
pub const POLL_INTERVAL_MS: u64 = 20;

/// Version number this host reports in GET_VERSION
pub const HOST_VERSION: u16 = 100;
