//! Connection setup
//!
//! Opens the machine's serial link and brings it to a state where the
//! first packet can be sent.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{
    serial::{clear_buffers, configure_port, open_port, pulse_reset},
    stream::{share, Channel, SerialChannel, SharedChannel},
    ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, POLL_INTERVAL_MS,
};

/// How long the line must stay silent before the boot banner counts as done
const BANNER_QUIET_MS: u64 = 100;

/// Upper bound on time spent draining a chatty board
const BANNER_MAX_MS: u64 = 2000;

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    /// Resends of a retryable request before giving up
    pub max_retries: u32,
    /// Pause between resends
    pub retry_delay_ms: u64,
    /// Time the board needs to come out of reset after the port opens
    pub startup_delay_ms: u64,
    /// Pulse RTS after opening, for boards that do not reset on open
    pub reset_on_connect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 8,
            retry_delay_ms: 25,
            startup_delay_ms: 2000,
            reset_on_connect: false,
        }
    }
}

impl ConnectionConfig {
    /// Config for the given port with every other setting at its default
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause between resends
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Open and prepare the serial link described by `config`.
///
/// Opening the port resets most boards, so this waits out the startup
/// delay and discards whatever the firmware prints while booting.
pub fn connect(config: &ConnectionConfig) -> Result<SharedChannel, ProtocolError> {
    if config.port_name.is_empty() {
        return Err(ProtocolError::PortNotFound(String::new()));
    }

    let mut port = open_port(&config.port_name, config.baud_rate)?;
    configure_port(port.as_mut())?;
    clear_buffers(port.as_mut())?;
    if config.reset_on_connect {
        debug!("connect: pulsing reset on {}", config.port_name);
        pulse_reset(port.as_mut())?;
    }

    debug!(
        "connect: waiting {}ms for {} to boot",
        config.startup_delay_ms, config.port_name
    );
    std::thread::sleep(Duration::from_millis(config.startup_delay_ms));

    let mut channel = SerialChannel::new(port);
    let banner = drain_banner(&mut channel, Duration::from_millis(BANNER_QUIET_MS))?;
    if !banner.is_empty() {
        info!(
            "{}: boot banner {:?}",
            config.port_name,
            String::from_utf8_lossy(&banner).trim()
        );
    }

    info!("connected to {} at {} baud", config.port_name, config.baud_rate);
    Ok(share(channel))
}

/// Read and return everything the board sends until the line has been
/// quiet for `quiet`
pub fn drain_banner(channel: &mut dyn Channel, quiet: Duration) -> Result<Vec<u8>, ProtocolError> {
    channel.set_timeout(Duration::from_millis(POLL_INTERVAL_MS))?;

    let started = Instant::now();
    let mut last_data = started;
    let mut banner = Vec::new();
    let mut buf = [0u8; 64];

    while last_data.elapsed() < quiet && started.elapsed() < Duration::from_millis(BANNER_MAX_MS)
    {
        match channel.read(&mut buf) {
            Ok(0) => return Err(ProtocolError::Disconnected),
            Ok(n) => {
                banner.extend_from_slice(&buf[..n]);
                last_data = Instant::now();
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(banner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::io::Write;

    struct BootingBoard {
        pending: VecDeque<u8>,
    }

    impl Read for BootingBoard {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(2));
                    Err(io::ErrorKind::TimedOut.into())
                }
            }
        }
    }

    impl Write for BootingBoard {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for BootingBoard {
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn clear_input_buffer(&mut self) -> io::Result<()> {
            self.pending.clear();
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(self.pending.len() as u32)
        }
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.timeout_ms, 2000);
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.retry_delay(), Duration::from_millis(25));
        assert!(!config.reset_on_connect);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"port_name": "/dev/ttyUSB0", "max_retries": 3}"#).unwrap();
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_drain_banner_collects_boot_text() {
        let mut board = BootingBoard {
            pending: b"R3G Master v1.3\r\n".iter().copied().collect(),
        };
        let banner = drain_banner(&mut board, Duration::from_millis(20)).unwrap();
        assert_eq!(banner, b"R3G Master v1.3\r\n".to_vec());
        assert!(board.pending.is_empty());
    }

    #[test]
    fn test_connect_requires_port_name() {
        let err = connect(&ConnectionConfig::default()).err().unwrap();
        assert!(matches!(err, ProtocolError::PortNotFound(_)));
    }
}
