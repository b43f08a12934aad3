//! Byte channels
//!
//! The transaction engine talks to the machine through a [`Channel`]. The
//! serial port is the production implementation; tests and the simulator
//! provide their own.

use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Abstraction over a bidirectional byte stream to the machine
pub trait Channel: Read + Write + Send {
    /// Set the timeout of a single blocking read
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drop any bytes received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Get number of bytes available to read
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

/// The single link to the machine, locked for the duration of each
/// request/response exchange
pub type SharedChannel = Arc<Mutex<Box<dyn Channel>>>;

/// Wrap a channel for sharing between the build task and interactive use
pub fn share<C: Channel + 'static>(channel: C) -> SharedChannel {
    Arc::new(Mutex::new(Box::new(channel)))
}

/// Serial port wrapper implementing Channel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }
}
