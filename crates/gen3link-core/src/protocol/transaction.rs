//! Request/response transactions
//!
//! One transaction sends one packet and waits for exactly one reply. The
//! protocol has no sequence numbers, so the channel stays locked from the
//! first byte written until the reply is decoded.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    decoder::{DecodeStatus, PacketDecoder},
    stream::{Channel, SharedChannel},
    PacketBuilder, ProtocolError, Response, ResponseCode, Target, DEFAULT_TIMEOUT_MS,
    POLL_INTERVAL_MS,
};

/// Cumulative link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    /// Replies rejected for a bad CRC
    pub crc_errors: u64,
    /// Bytes skipped while looking for a sentinel
    pub noise_bytes: u64,
}

/// Something that can carry out a request/response exchange.
///
/// Implementations never retry on their own; a failed exchange is reported
/// and the caller decides whether to resend the whole request.
pub trait Transactor: Send {
    /// Send a finished packet and wait for its reply
    fn execute_packet(
        &mut self,
        packet: PacketBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, ProtocolError>;

    /// Send `command` with `payload` to `target` and wait for the reply
    fn execute(
        &mut self,
        target: Target,
        command: u8,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Response, ProtocolError> {
        self.execute_packet(PacketBuilder::new(target, command).bytes(payload), cancel)
    }

    /// Link counters so far
    fn stats(&self) -> TransactionStats {
        TransactionStats::default()
    }
}

/// Map a reply's status onto the transaction result
pub fn check_response(response: Response) -> Result<Response, ProtocolError> {
    match response.code()? {
        ResponseCode::Ok => Ok(response),
        ResponseCode::BufferOverflow => Err(ProtocolError::BufferOverflow),
        ResponseCode::CrcMismatch => Err(ProtocolError::DeviceCrcMismatch),
        code => Err(ProtocolError::Device(code)),
    }
}

/// Transaction engine over a shared byte channel
pub struct SerialTransactor {
    channel: SharedChannel,
    timeout: Duration,
    stats: TransactionStats,
}

impl SerialTransactor {
    /// Create an engine with the default response timeout
    pub fn new(channel: SharedChannel) -> Self {
        Self::with_timeout(channel, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Create an engine that gives up on a reply after `timeout`
    pub fn with_timeout(channel: SharedChannel, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            stats: TransactionStats::default(),
        }
    }

    /// The channel this engine locks for each exchange
    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    /// Response timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Transactor for SerialTransactor {
    fn execute_packet(
        &mut self,
        packet: PacketBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, ProtocolError> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        let (target, command) = (packet.target(), packet.command());
        let bytes = packet.build()?;
        let deadline = Instant::now() + self.timeout;

        let mut guard = self.channel.lock();
        let channel: &mut dyn Channel = &mut **guard;

        // Anything already waiting belongs to an exchange that was abandoned
        channel.clear_input_buffer()?;
        channel.set_timeout(self.timeout.min(Duration::from_millis(POLL_INTERVAL_MS)))?;

        trace!("tx {:02x?}", bytes);
        channel.write_all(&bytes)?;
        channel.flush()?;
        self.stats.tx_bytes = self.stats.tx_bytes.saturating_add(bytes.len() as u64);
        self.stats.tx_packets = self.stats.tx_packets.saturating_add(1);

        let started = Instant::now();
        let payload = read_reply(channel, deadline, cancel, &mut self.stats)?;
        drop(guard);

        debug!(
            "transaction target={} cmd={} -> {} bytes in {}ms",
            target,
            command,
            payload.len(),
            started.elapsed().as_millis()
        );
        check_response(Response::new(payload)?)
    }

    fn stats(&self) -> TransactionStats {
        self.stats
    }
}

/// Feed channel bytes into a fresh decoder until a reply completes
fn read_reply(
    channel: &mut dyn Channel,
    deadline: Instant,
    cancel: &CancellationToken,
    stats: &mut TransactionStats,
) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = PacketDecoder::new();
    let mut buf = [0u8; 64];

    loop {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        if Instant::now() >= deadline {
            debug!("read_reply: timed out in state {:?}", decoder.state());
            return Err(ProtocolError::Timeout);
        }

        let n = match channel.read(&mut buf) {
            Ok(0) => return Err(ProtocolError::Disconnected),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(ProtocolError::Io(e)),
        };
        stats.rx_bytes = stats.rx_bytes.saturating_add(n as u64);
        trace!("rx {:02x?}", &buf[..n]);

        let before = decoder.discarded();
        let (used, status) = decoder.feed_slice(&buf[..n]);
        stats.noise_bytes += decoder.discarded() - before;
        match status {
            Ok(DecodeStatus::Pending) => continue,
            Ok(DecodeStatus::Complete(payload)) => {
                stats.rx_packets = stats.rx_packets.saturating_add(1);
                if used < n {
                    trace!("read_reply: ignoring {} trailing bytes", n - used);
                }
                return Ok(payload);
            }
            Err(e) => {
                stats.crc_errors += 1;
                return Err(e);
            }
        }
    }
}
