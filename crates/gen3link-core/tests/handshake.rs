//! Firmware handshake over a scripted link

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use gen3link_core::driver::{DriverError, MotionDriver, PacketDriver, Version};
use gen3link_core::machine::MachineProfile;
use gen3link_core::protocol::crc::crc8;
use gen3link_core::protocol::{
    share, DecodeStatus, PacketDecoder, ProtocolError, SerialTransactor, Transactor, SENTINEL,
};
use pretty_assertions::assert_eq;

/// Board that answers both version queries with `version` (the firmware's
/// `major * 100 + minor`) and accepts everything else
struct MockBoard {
    version: u16,
    decoder: PacketDecoder,
    outgoing: VecDeque<u8>,
}

impl MockBoard {
    fn new(version: u16) -> Self {
        Self {
            version,
            decoder: PacketDecoder::new(),
            outgoing: VecDeque::new(),
        }
    }

    fn respond(&mut self, payload: &[u8]) {
        self.outgoing.push_back(SENTINEL);
        self.outgoing.push_back(payload.len() as u8);
        self.outgoing.extend(payload.iter().copied());
        self.outgoing.push_back(crc8(payload));
    }
}

impl Read for MockBoard {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outgoing.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(self.outgoing.len());
        for (slot, b) in buf.iter_mut().zip(self.outgoing.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for MockBoard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if let Ok(DecodeStatus::Complete(request)) = self.decoder.feed(b) {
                match (request[0], request[1]) {
                    // stage GET_VERSION and toolhead VERSION
                    (0, 0) | (1, 0) => {
                        let [lo, hi] = self.version.to_le_bytes();
                        self.respond(&[1, lo, hi])
                    }
                    _ => self.respond(&[1]),
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl gen3link_core::protocol::Channel for MockBoard {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.outgoing.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.outgoing.len() as u32)
    }
}

fn board_driver(version: u16, minimum: Version) -> PacketDriver<SerialTransactor> {
    let mut profile = MachineProfile::default();
    profile.version_policy.minimum = minimum;
    let transactor =
        SerialTransactor::with_timeout(share(MockBoard::new(version)), Duration::from_millis(200));
    PacketDriver::new(transactor, Arc::new(profile))
}

fn driver_with_minimum(minimum: Version) -> PacketDriver<SerialTransactor> {
    board_driver(700, minimum)
}

#[test]
fn test_handshake_accepts_newer_firmware() {
    let mut driver = driver_with_minimum(Version::new(1, 0));
    let version = driver.initialize().unwrap();

    assert_eq!(version, Version::new(7, 0));
    assert!(driver.is_initialized());
    assert_eq!(driver.firmware_version(), Some(Version::new(7, 0)));
}

#[test]
fn test_handshake_rejects_older_firmware() {
    let mut driver = driver_with_minimum(Version::new(8, 0));

    match driver.initialize() {
        Err(DriverError::FirmwareTooOld { found, minimum }) => {
            assert_eq!(found, Version::new(7, 0));
            assert_eq!(minimum, Version::new(8, 0));
        }
        other => panic!("expected FirmwareTooOld, got {:?}", other),
    }
    assert!(!driver.is_initialized());
    assert!(matches!(
        driver.queue_point(Default::default(), 100.0),
        Err(DriverError::NotInitialized)
    ));
}

#[test]
fn test_handshake_packet_sequence() {
    let mut driver = driver_with_minimum(Version::new(1, 0));
    driver.initialize().unwrap();

    // GET_VERSION, toolhead 0 VERSION, INIT
    let stats = driver.transactor().stats();
    assert_eq!(stats.tx_packets, 3);
    assert_eq!(stats.rx_packets, 3);
    assert_eq!(stats.noise_bytes, 0);
    assert_eq!(stats.crc_errors, 0);
}

#[test]
fn test_handshake_decodes_firmware_version_number() {
    let mut driver = board_driver(103, Version::new(1, 0));
    assert_eq!(driver.initialize().unwrap(), Version::new(1, 3));
    assert_eq!(driver.tool_version(0).unwrap(), Version::new(1, 3));
}

#[test]
fn test_handshake_rejects_null_version() {
    let mut driver = board_driver(0, Version::new(1, 0));
    assert!(matches!(
        driver.initialize(),
        Err(DriverError::Protocol(ProtocolError::NullVersion))
    ));
    assert!(!driver.is_initialized());
}
