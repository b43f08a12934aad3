//! Dry-run transactions
//!
//! Answers every request locally and accumulates how long the machine
//! would spend executing the queued moves and delays. Used to estimate
//! build time without a machine attached.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{
    commands::response_len, PacketBuilder, ProtocolError, Response, ResponseCode, StageCommand,
    Target, ToolCommand, TransactionStats, Transactor,
};
use crate::motion::timer::{band_factor, CLOCK_HZ};

/// Transactor that performs no I/O
#[derive(Debug, Clone)]
pub struct EstimatingTransactor {
    firmware: (u16, u16),
    position: [i64; 3],
    seconds: f64,
    moves: u64,
    stats: TransactionStats,
}

impl Default for EstimatingTransactor {
    fn default() -> Self {
        Self::new((1, 3))
    }
}

impl EstimatingTransactor {
    /// Create a dry run that reports `firmware` as `(major, minor)`
    pub fn new(firmware: (u16, u16)) -> Self {
        Self {
            firmware,
            position: [0; 3],
            seconds: 0.0,
            moves: 0,
            stats: TransactionStats::default(),
        }
    }

    /// Estimated machine time so far
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.seconds)
    }

    /// Queued moves seen so far
    pub fn moves(&self) -> u64 {
        self.moves
    }

    /// Requests answered so far
    pub fn packets(&self) -> u64 {
        self.stats.tx_packets
    }

    /// Forget accumulated time and counters
    pub fn reset(&mut self) {
        self.position = [0; 3];
        self.seconds = 0.0;
        self.moves = 0;
        self.stats = TransactionStats::default();
    }

    fn queue_move(&mut self, delta: [i64; 3], band: u8, counter: u16) {
        let master = delta.iter().map(|d| d.unsigned_abs()).max().unwrap_or(0);
        let ticks_per_step = u64::from(counter) * u64::from(band_factor(band));
        self.seconds += (master * ticks_per_step) as f64 / CLOCK_HZ as f64;
        for (p, d) in self.position.iter_mut().zip(delta) {
            *p += d;
        }
        self.moves += 1;
    }

    fn stage(&mut self, command: StageCommand, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let need = |n: usize| {
            if payload.len() < n {
                Err(ProtocolError::Device(ResponseCode::GenericError))
            } else {
                Ok(())
            }
        };
        let xyz = |p: &[u8]| {
            [
                i64::from(LittleEndian::read_i32(&p[0..4])),
                i64::from(LittleEndian::read_i32(&p[4..8])),
                i64::from(LittleEndian::read_i32(&p[8..12])),
            ]
        };

        match command {
            StageCommand::GetVersion => Ok(version_bytes(self.firmware)),
            StageCommand::GetAvailableBuffer => Ok(u32::MAX.to_le_bytes().to_vec()),
            StageCommand::GetPosition => {
                let mut out = Vec::with_capacity(12);
                for p in self.position {
                    let p = i32::try_from(p)
                        .map_err(|_| ProtocolError::Device(ResponseCode::GenericError))?;
                    out.extend_from_slice(&p.to_le_bytes());
                }
                Ok(out)
            }
            // nothing is ever left running
            StageCommand::IsFinished => Ok(vec![1]),
            StageCommand::QueuePointRelative => {
                need(15)?;
                let counter = LittleEndian::read_u16(&payload[13..15]);
                self.queue_move(xyz(payload), payload[12], counter);
                Ok(Vec::new())
            }
            StageCommand::QueuePointAbsolute => {
                need(15)?;
                let target = xyz(payload);
                let delta = [
                    target[0] - self.position[0],
                    target[1] - self.position[1],
                    target[2] - self.position[2],
                ];
                let counter = LittleEndian::read_u16(&payload[13..15]);
                self.queue_move(delta, payload[12], counter);
                Ok(Vec::new())
            }
            StageCommand::SetPosition => {
                need(12)?;
                self.position = xyz(payload);
                Ok(Vec::new())
            }
            StageCommand::Delay => {
                need(4)?;
                self.seconds += f64::from(LittleEndian::read_u32(&payload[0..4])) / 1000.0;
                Ok(Vec::new())
            }
            other => Ok(vec![0; other.response_len()]),
        }
    }
}

/// GET_VERSION reply: `major * 100 + minor`
fn version_bytes((major, minor): (u16, u16)) -> Vec<u8> {
    major
        .saturating_mul(100)
        .saturating_add(minor)
        .to_le_bytes()
        .to_vec()
}

impl Transactor for EstimatingTransactor {
    fn execute_packet(
        &mut self,
        packet: PacketBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, ProtocolError> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        let (target, command) = (packet.target(), packet.command());
        let payload = packet.payload().to_vec();
        let framed = packet.build()?;
        self.stats.tx_bytes += framed.len() as u64;
        self.stats.tx_packets += 1;
        trace!("dry run: target={} cmd={} payload={:02x?}", target, command, payload);

        let data = if target == Target::Stage.byte() {
            match StageCommand::from_code(command) {
                Some(cmd) => self.stage(cmd, &payload)?,
                None => return Err(ProtocolError::Device(ResponseCode::Unsupported)),
            }
        } else if target == Target::Toolhead.byte() {
            match ToolCommand::from_code(command) {
                Some(ToolCommand::Version) => version_bytes(self.firmware),
                Some(_) => vec![0; response_len(Target::Toolhead, command).unwrap_or(0)],
                None => return Err(ProtocolError::Device(ResponseCode::Unsupported)),
            }
        } else {
            return Err(ProtocolError::Device(ResponseCode::Unsupported));
        };

        self.stats.rx_packets += 1;
        self.stats.rx_bytes += data.len() as u64 + 3;
        Ok(Response::with_data(ResponseCode::Ok, &data))
    }

    fn stats(&self) -> TransactionStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relative(dx: i32, dy: i32, dz: i32, band: u8, counter: u16) -> PacketBuilder {
        PacketBuilder::new(Target::Stage, StageCommand::QueuePointRelative.code())
            .add_i32(dx)
            .add_i32(dy)
            .add_i32(dz)
            .add8(band)
            .add16(counter)
    }

    #[test]
    fn test_version_reply() {
        let mut t = EstimatingTransactor::new((2, 5));
        let mut r = t
            .execute_packet(
                PacketBuilder::new(Target::Stage, 0).add16(100),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(r.get16().unwrap(), 205);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_move_and_delay_time() {
        let mut t = EstimatingTransactor::default();
        let cancel = CancellationToken::new();
        // 1600 steps at 10000 ticks/step = 1 s
        t.execute_packet(relative(1600, -800, 0, 0, 10_000), &cancel)
            .unwrap();
        // 1000 steps at 2000 * 8 ticks/step = 1 s
        t.execute_packet(relative(0, 0, 1000, 1, 2000), &cancel)
            .unwrap();
        t.execute_packet(
            PacketBuilder::new(Target::Stage, StageCommand::Delay.code()).add32(500),
            &cancel,
        )
        .unwrap();

        assert!((t.elapsed().as_secs_f64() - 2.5).abs() < 1e-9);
        assert_eq!(t.moves(), 2);
        assert_eq!(t.packets(), 3);
    }

    #[test]
    fn test_tracks_position() {
        let mut t = EstimatingTransactor::default();
        let cancel = CancellationToken::new();
        t.execute_packet(relative(10, -20, 30, 0, 100), &cancel)
            .unwrap();
        let mut r = t
            .execute(Target::Stage, StageCommand::GetPosition.code(), &[], &cancel)
            .unwrap();
        assert_eq!(r.get_i32().unwrap(), 10);
        assert_eq!(r.get_i32().unwrap(), -20);
        assert_eq!(r.get_i32().unwrap(), 30);
    }

    #[test]
    fn test_position_beyond_counters_is_an_error() {
        let mut t = EstimatingTransactor::default();
        let cancel = CancellationToken::new();
        t.execute_packet(relative(i32::MAX, 0, 0, 0, 1), &cancel)
            .unwrap();
        t.execute_packet(relative(1, 0, 0, 0, 1), &cancel).unwrap();
        let err = t
            .execute(Target::Stage, StageCommand::GetPosition.code(), &[], &cancel)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Device(ResponseCode::GenericError)));
    }

    #[test]
    fn test_always_finished() {
        let mut t = EstimatingTransactor::default();
        let mut r = t
            .execute(
                Target::Stage,
                StageCommand::IsFinished.code(),
                &[],
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(r.get8().unwrap(), 1);
    }

    #[test]
    fn test_zeroed_replies_are_sized() {
        let mut t = EstimatingTransactor::default();
        let r = t
            .execute(
                Target::Toolhead,
                ToolCommand::GetTemp.code(),
                &[0],
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(r.is_ok());
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn test_unknown_command_unsupported() {
        let mut t = EstimatingTransactor::default();
        let err = t
            .execute(Target::Stage, 77, &[], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Device(ResponseCode::Unsupported)));
    }
}
