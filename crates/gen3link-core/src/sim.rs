//! Simulated machine
//!
//! An in-process [`Channel`] that speaks the Gen3 protocol, for demos and
//! tests without hardware. It can inject line noise, corrupted replies and
//! full-buffer rejections to exercise the error paths.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::driver::Version;
use crate::protocol::{
    commands::response_len, crc::crc8, Channel, DecodeStatus, PacketDecoder, ResponseCode,
    StageCommand, Target, ToolCommand, SENTINEL,
};

/// Behaviour of a simulated machine
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub firmware: Version,
    pub toolhead_firmware: Version,
    pub tool_count: u8,
    /// Free bytes reported by GET_AVAILABLE_BUFFER
    pub buffer_capacity: u32,
    /// Chance that a reply is preceded by garbage bytes
    pub noise_rate: f64,
    /// Chance that a queued command is rejected as if the buffer were full
    pub overflow_rate: f64,
    /// Chance that a reply's CRC is corrupted
    pub corrupt_rate: f64,
    /// Text printed at power-up before the first packet
    pub banner: Option<String>,
    /// Seed for reproducible fault injection
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            firmware: Version::new(1, 3),
            toolhead_firmware: Version::new(1, 3),
            tool_count: 1,
            buffer_capacity: 512,
            noise_rate: 0.0,
            overflow_rate: 0.0,
            corrupt_rate: 0.0,
            banner: None,
            seed: None,
        }
    }
}

/// Observable machine state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimState {
    /// Stage position in steps
    pub position: [i64; 3],
    /// Axis lengths in steps
    pub range: [i32; 3],
    pub paused: bool,
    pub current_tool: u8,
    /// Moves accepted into the queue
    pub queued_moves: u64,
    /// Total queued dwell time
    pub delay_ms: u64,
    /// Requests received, including rejected ones
    pub requests: u64,
    pub temperature: u16,
    pub target_temperature: u16,
    pub fan_on: bool,
    pub valve_open: bool,
    /// Last TOGGLE_MOTOR flags for motors 1 and 2
    pub motor_flags: [u8; 2],
    /// Last speed for motors 1 and 2, microseconds per revolution
    pub motor_micros: [u32; 2],
    pub motor_pwm: [u8; 2],
    /// Heated platform; reaches its target immediately
    pub platform_temperature: u16,
    pub drives_enabled: bool,
    pub init_count: u32,
    pub reset_count: u32,
    /// IS_FINISHED queries answered
    pub finish_queries: u64,
}

#[derive(Debug, Default)]
struct Faults {
    reject_next: u32,
    busy_polls: u32,
    silent: bool,
    closed: bool,
}

/// Shared view of a simulated machine that outlives handing the channel
/// to a transactor
#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
    faults: Arc<Mutex<Faults>>,
}

impl SimHandle {
    /// Copy of the current state
    pub fn snapshot(&self) -> SimState {
        self.state.lock().clone()
    }

    /// Answer the next `n` queued commands with BUFFER_OVERFLOW
    pub fn reject_next(&self, n: u32) {
        self.faults.lock().reject_next = n;
    }

    /// Report motion still running for the next `n` IS_FINISHED queries
    pub fn hold_busy(&self, n: u32) {
        self.faults.lock().busy_polls = n;
    }

    /// Stop answering requests
    pub fn set_silent(&self, silent: bool) {
        self.faults.lock().silent = silent;
    }

    /// Make further reads report end of stream
    pub fn unplug(&self) {
        self.faults.lock().closed = true;
    }
}

/// Simulated Gen3 machine
pub struct SimulatedMachine {
    config: SimConfig,
    handle: SimHandle,
    rng: StdRng,
    decoder: PacketDecoder,
    rx: VecDeque<u8>,
    timeout: Duration,
}

impl SimulatedMachine {
    pub fn new(config: SimConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut rx = VecDeque::new();
        if let Some(banner) = &config.banner {
            rx.extend(banner.bytes());
        }
        let handle = SimHandle::default();
        handle.state.lock().range = [10_000, 10_000, 100_000];

        Self {
            config,
            handle,
            rng,
            decoder: PacketDecoder::new(),
            rx,
            timeout: Duration::from_millis(1),
        }
    }

    /// Handle for inspecting the machine after the channel is shared
    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn reply(&mut self, code: ResponseCode, data: &[u8]) {
        if self.handle.faults.lock().silent {
            return;
        }
        if self.rng.gen_bool(self.config.noise_rate.clamp(0.0, 1.0)) {
            let n = self.rng.gen_range(1..8);
            for _ in 0..n {
                // never a sentinel, or the noise would look like a packet
                let b: u8 = self.rng.gen_range(0..SENTINEL);
                self.rx.push_back(b);
            }
        }

        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(code as u8);
        payload.extend_from_slice(data);
        let mut crc = crc8(&payload);
        if self.rng.gen_bool(self.config.corrupt_rate.clamp(0.0, 1.0)) {
            trace!("sim: corrupting reply");
            crc ^= 0x5A;
        }

        self.rx.push_back(SENTINEL);
        self.rx.push_back(payload.len() as u8);
        self.rx.extend(payload);
        self.rx.push_back(crc);
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        self.handle.state.lock().requests += 1;
        if packet.len() < 2 {
            self.reply(ResponseCode::GenericError, &[]);
            return;
        }
        let (target, command, payload) = (packet[0], packet[1], &packet[2..]);
        trace!("sim: target={} cmd={} payload={:02x?}", target, command, payload);

        let result = if target == Target::Stage.byte() {
            match StageCommand::from_code(command) {
                Some(cmd) => self.stage(cmd, payload),
                None => Err(ResponseCode::Unsupported),
            }
        } else if target == Target::Toolhead.byte() {
            match ToolCommand::from_code(command) {
                Some(cmd) => self.toolhead(cmd, payload),
                None => Err(ResponseCode::Unsupported),
            }
        } else {
            Err(ResponseCode::Unsupported)
        };

        match result {
            Ok(data) => self.reply(ResponseCode::Ok, &data),
            Err(code) => {
                debug!("sim: replying {} to target={} cmd={}", code, target, command);
                self.reply(code, &[]);
            }
        }
    }

    fn buffer_full(&mut self) -> bool {
        let mut faults = self.handle.faults.lock();
        if faults.reject_next > 0 {
            faults.reject_next -= 1;
            return true;
        }
        drop(faults);
        self.rng.gen_bool(self.config.overflow_rate.clamp(0.0, 1.0))
    }

    fn stage(&mut self, cmd: StageCommand, p: &[u8]) -> Result<Vec<u8>, ResponseCode> {
        let need = |n: usize| {
            if p.len() < n {
                Err(ResponseCode::GenericError)
            } else {
                Ok(())
            }
        };
        if cmd.is_buffered() && self.buffer_full() {
            return Err(ResponseCode::BufferOverflow);
        }

        let busy = cmd == StageCommand::IsFinished && {
            let mut faults = self.handle.faults.lock();
            let busy = faults.busy_polls > 0;
            faults.busy_polls = faults.busy_polls.saturating_sub(1);
            busy
        };

        let mut state = self.handle.state.lock();
        match cmd {
            StageCommand::GetVersion => Ok(version_bytes(self.config.firmware)),
            StageCommand::IsFinished => {
                state.finish_queries += 1;
                Ok(vec![u8::from(!busy)])
            }
            StageCommand::Reset => {
                debug!("sim: watchdog reset");
                let reset_count = state.reset_count + 1;
                let range = state.range;
                *state = SimState {
                    range,
                    reset_count,
                    ..SimState::default()
                };
                Ok(Vec::new())
            }
            StageCommand::EnableAxes => {
                need(1)?;
                state.drives_enabled = p[0] & 0x80 != 0;
                Ok(Vec::new())
            }
            StageCommand::Init => {
                state.paused = false;
                state.current_tool = 0;
                state.init_count += 1;
                Ok(Vec::new())
            }
            StageCommand::GetAvailableBuffer => Ok(self.config.buffer_capacity.to_le_bytes().to_vec()),
            StageCommand::ClearBuffer => Ok(Vec::new()),
            StageCommand::GetPosition | StageCommand::Probe => Ok(xyz_bytes(state.position)),
            StageCommand::GetRange => Ok(xyz_bytes(state.range.map(i64::from))),
            StageCommand::SetRange => {
                need(12)?;
                state.range = read_xyz(p).map(|v| v as i32);
                Ok(Vec::new())
            }
            StageCommand::Abort => {
                state.paused = false;
                Ok(Vec::new())
            }
            StageCommand::Pause => {
                state.paused = !state.paused;
                Ok(Vec::new())
            }
            StageCommand::QueuePointRelative => {
                need(15)?;
                let delta = read_xyz(p);
                for (pos, d) in state.position.iter_mut().zip(delta) {
                    *pos += d;
                }
                state.queued_moves += 1;
                Ok(Vec::new())
            }
            StageCommand::QueuePointAbsolute => {
                need(15)?;
                state.position = read_xyz(p);
                state.queued_moves += 1;
                Ok(Vec::new())
            }
            StageCommand::SetPosition => {
                need(12)?;
                state.position = read_xyz(p);
                Ok(Vec::new())
            }
            StageCommand::FindMinimums | StageCommand::FindMaximums => {
                need(6)?;
                let flags = p[0];
                for axis in 0..3 {
                    if flags & (1 << axis) != 0 {
                        state.position[axis] = if cmd == StageCommand::FindMinimums {
                            0
                        } else {
                            i64::from(state.range[axis])
                        };
                    }
                }
                Ok(Vec::new())
            }
            StageCommand::Delay => {
                need(4)?;
                state.delay_ms += u64::from(LittleEndian::read_u32(&p[0..4]));
                Ok(Vec::new())
            }
            StageCommand::ChangeTool => {
                need(1)?;
                if p[0] >= self.config.tool_count {
                    return Err(ResponseCode::GenericError);
                }
                state.current_tool = p[0];
                Ok(Vec::new())
            }
            StageCommand::WaitForTool => {
                need(5)?;
                Ok(Vec::new())
            }
        }
    }

    fn toolhead(&mut self, cmd: ToolCommand, p: &[u8]) -> Result<Vec<u8>, ResponseCode> {
        if p.is_empty() || p[0] >= self.config.tool_count {
            return Err(ResponseCode::GenericError);
        }
        let args = &p[1..];
        let arg8 = || args.first().copied().ok_or(ResponseCode::GenericError);
        let arg16 = || {
            (args.len() >= 2)
                .then(|| LittleEndian::read_u16(args))
                .ok_or(ResponseCode::GenericError)
        };
        let arg32 = || {
            (args.len() >= 4)
                .then(|| LittleEndian::read_u32(args))
                .ok_or(ResponseCode::GenericError)
        };

        let mut state = self.handle.state.lock();
        match cmd {
            ToolCommand::Version => Ok(version_bytes(self.config.toolhead_firmware)),
            ToolCommand::GetTemp => {
                // heat or cool towards the target a little on every query
                let current = i32::from(state.temperature);
                let target = i32::from(state.target_temperature);
                let step = (target - current).clamp(-15, 15) + self.rng.gen_range(-1..=1);
                state.temperature = (current + step).clamp(0, i32::from(u16::MAX)) as u16;
                Ok(state.temperature.to_le_bytes().to_vec())
            }
            ToolCommand::SetTemp => {
                state.target_temperature = arg16()?;
                Ok(Vec::new())
            }
            ToolCommand::SetMotor1Pwm => {
                state.motor_pwm[0] = arg8()?;
                Ok(Vec::new())
            }
            ToolCommand::SetMotor2Pwm => {
                state.motor_pwm[1] = arg8()?;
                Ok(Vec::new())
            }
            ToolCommand::GetMotor1Rpm => Ok(state.motor_micros[0].to_le_bytes().to_vec()),
            ToolCommand::GetMotor2Rpm => Ok(state.motor_micros[1].to_le_bytes().to_vec()),
            ToolCommand::GetMotor1Pwm => Ok(vec![state.motor_pwm[0]]),
            ToolCommand::GetMotor2Pwm => Ok(vec![state.motor_pwm[1]]),
            ToolCommand::SetPlatformTemp => {
                state.platform_temperature = arg16()?;
                Ok(Vec::new())
            }
            ToolCommand::GetPlatformTemp => Ok(state.platform_temperature.to_le_bytes().to_vec()),
            ToolCommand::SetMotor1Rpm => {
                state.motor_micros[0] = arg32()?;
                Ok(Vec::new())
            }
            ToolCommand::SetMotor2Rpm => {
                state.motor_micros[1] = arg32()?;
                Ok(Vec::new())
            }
            ToolCommand::ToggleMotor1 => {
                state.motor_flags[0] = arg8()?;
                Ok(Vec::new())
            }
            ToolCommand::ToggleMotor2 => {
                state.motor_flags[1] = arg8()?;
                Ok(Vec::new())
            }
            ToolCommand::ToggleFan => {
                state.fan_on = arg8()? != 0;
                Ok(Vec::new())
            }
            ToolCommand::ToggleValve => {
                state.valve_open = arg8()? != 0;
                Ok(Vec::new())
            }
            ToolCommand::IsToolReady => {
                let ready = state.temperature.abs_diff(state.target_temperature) <= 2;
                Ok(vec![u8::from(ready)])
            }
            other => Ok(vec![0; response_len(Target::Toolhead, other.code()).unwrap_or(0)]),
        }
    }
}

fn version_bytes(v: Version) -> Vec<u8> {
    v.to_wire().to_le_bytes().to_vec()
}

fn xyz_bytes(v: [i64; 3]) -> Vec<u8> {
    v.iter().flat_map(|&c| (c as i32).to_le_bytes()).collect()
}

fn read_xyz(p: &[u8]) -> [i64; 3] {
    [
        i64::from(LittleEndian::read_i32(&p[0..4])),
        i64::from(LittleEndian::read_i32(&p[4..8])),
        i64::from(LittleEndian::read_i32(&p[8..12])),
    ]
}

impl Read for SimulatedMachine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.handle.faults.lock().closed {
            return Ok(0);
        }
        if self.rx.is_empty() {
            std::thread::sleep(self.timeout.min(Duration::from_millis(2)));
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(self.rx.len());
        for (slot, b) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for SimulatedMachine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.handle.faults.lock().closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        for &b in buf {
            match self.decoder.feed(b) {
                Ok(DecodeStatus::Pending) => {}
                Ok(DecodeStatus::Complete(packet)) => self.handle_packet(&packet),
                Err(e) => {
                    debug!("sim: rejecting request: {}", e);
                    self.handle.state.lock().requests += 1;
                    self.reply(ResponseCode::CrcMismatch, &[]);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for SimulatedMachine {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.rx.len() as u32)
    }
}
