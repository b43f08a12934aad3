//! Packet protocol driver
//!
//! Implements [`MotionDriver`] by encoding each operation as Gen3 packets
//! and running them through a [`Transactor`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DriverError, MotionDriver, MotorDirection, Version, VersionCheck};
use crate::machine::MachineProfile;
use crate::motion::{
    plan_move, quantize, safe_feedrate, timer::TICKS_PER_MINUTE, AxisSet, HomeDirection, Point3,
};
use crate::protocol::{
    PacketBuilder, ProtocolError, Response, ResponseCode, StageCommand, Target, ToolCommand,
    Transactor, HOST_VERSION,
};

/// Seconds a homing move may search before the firmware gives up
pub const HOMING_TIMEOUT_S: u16 = 300;

/// Interval at which the stage polls a tool it is waiting for
pub const TOOL_PING_MS: u16 = 100;

/// Default time the stage waits for a tool to become ready
pub const TOOL_TIMEOUT_S: u16 = 120;

/// Oldest stage firmware with a watchdog RESET command
pub const RESET_MIN_VERSION: Version = Version::new(1, 4);

/// ENABLE_AXES flags: bit 7 powers the drivers, low bits select X, Y and Z
const DRIVES_ON: u8 = 0x87;
const DRIVES_OFF: u8 = 0x07;

fn stage(command: StageCommand) -> PacketBuilder {
    PacketBuilder::new(Target::Stage, command.code())
}

/// Convert a motor speed to the firmware's microseconds per revolution
fn rpm_to_micros(rpm: f64) -> Result<u32, DriverError> {
    if !rpm.is_finite() || rpm <= 0.0 {
        return Err(DriverError::InvalidArgument(format!(
            "motor speed must be positive, got {} RPM",
            rpm
        )));
    }
    Ok((60_000_000.0 / rpm).round().min(f64::from(u32::MAX)) as u32)
}

/// Inverse of [`rpm_to_micros`]. A stopped motor reports zero.
fn micros_to_rpm(micros: u32) -> f64 {
    if micros == 0 {
        0.0
    } else {
        60_000_000.0 / f64::from(micros)
    }
}

fn read_version(r: &mut Response) -> Result<Version, DriverError> {
    Version::from_wire(r.get16()?).ok_or(DriverError::Protocol(ProtocolError::NullVersion))
}

/// Round a temperature to the firmware's whole degrees
fn celsius_to_wire(celsius: f64) -> Result<u16, DriverError> {
    if !celsius.is_finite() {
        return Err(DriverError::InvalidArgument(format!(
            "temperature {} is not a number",
            celsius
        )));
    }
    Ok(celsius.round().clamp(0.0, f64::from(u16::MAX)) as u16)
}

/// Driver for Gen3 electronics
pub struct PacketDriver<T: Transactor> {
    transactor: T,
    profile: Arc<MachineProfile>,
    cancel: CancellationToken,
    version: Option<Version>,
    initialized: bool,
    position: Option<Point3>,
    current_tool: u8,
    paused: bool,
    finished_unsupported: bool,
}

impl<T: Transactor> PacketDriver<T> {
    pub fn new(transactor: T, profile: Arc<MachineProfile>) -> Self {
        Self {
            transactor,
            profile,
            cancel: CancellationToken::new(),
            version: None,
            initialized: false,
            position: None,
            current_tool: 0,
            paused: false,
            finished_unsupported: false,
        }
    }

    /// Abort in-flight transactions when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this driver's transactions
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn profile(&self) -> &MachineProfile {
        &self.profile
    }

    pub fn transactor(&self) -> &T {
        &self.transactor
    }

    pub fn transactor_mut(&mut self) -> &mut T {
        &mut self.transactor
    }

    pub fn into_transactor(self) -> T {
        self.transactor
    }

    /// Stage firmware version from the last handshake
    pub fn firmware_version(&self) -> Option<Version> {
        self.version
    }

    pub fn current_tool(&self) -> u8 {
        self.current_tool
    }

    /// Whether the last pause toggle left the machine paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Ask a toolhead for its firmware version
    pub fn tool_version(&mut self, index: u8) -> Result<Version, DriverError> {
        let mut r = self.run(
            PacketBuilder::new(Target::Toolhead, ToolCommand::Version.code()).add8(index),
        )?;
        read_version(&mut r)
    }

    /// Run one request, resending it while the failure is retryable.
    ///
    /// A transport failure drops the cached position and requires a new
    /// handshake.
    fn run(&mut self, packet: PacketBuilder) -> Result<Response, DriverError> {
        let retries = self.profile.connection.max_retries;
        let delay = self.profile.connection.retry_delay();
        let mut attempt = 0;

        loop {
            match self.transactor.execute_packet(packet.clone(), &self.cancel) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    if matches!(e, ProtocolError::BufferOverflow) {
                        debug!("machine buffer full, retrying ({}/{})", attempt, retries);
                    } else {
                        warn!("{}, retrying ({}/{})", e, attempt, retries);
                    }
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    if e.is_transport_failure() {
                        warn!("link failure: {}; machine must be re-initialized", e);
                        self.initialized = false;
                        self.position = None;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    fn tool(&self, command: ToolCommand) -> PacketBuilder {
        PacketBuilder::new(Target::Toolhead, command.code()).add8(self.current_tool)
    }

    fn require_init(&self) -> Result<(), DriverError> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    fn check_tool(&self, index: u8) -> Result<(), DriverError> {
        if index >= self.profile.tool_count {
            return Err(DriverError::InvalidTool {
                index,
                count: self.profile.tool_count,
            });
        }
        Ok(())
    }

    fn run_tool(&mut self, packet: PacketBuilder) -> Result<Response, DriverError> {
        self.require_init()?;
        self.run(packet)
    }

    fn invalidate(&mut self) {
        if self.position.take().is_some() {
            debug!("cached position invalidated");
        }
    }

    /// Absolute steps of `position`, which must be finite and fit the
    /// firmware's 32-bit step counters
    fn target_steps(&self, position: &Point3) -> Result<[i64; 3], DriverError> {
        let out_of_range =
            || DriverError::InvalidArgument(format!("position {} is out of range", position));
        if !position.to_array().iter().all(|c| c.is_finite()) {
            return Err(out_of_range());
        }
        let steps = position.to_steps(&self.profile.steps_per_mm);
        if steps.iter().any(|&s| i32::try_from(s).is_err()) {
            return Err(out_of_range());
        }
        Ok(steps)
    }

    fn motor_speed(&mut self, command: ToolCommand) -> Result<f64, DriverError> {
        let packet = self.tool(command);
        let mut r = self.run_tool(packet)?;
        let rpm = micros_to_rpm(r.get32()?);
        debug!("tool {} {:?}: {:.1} RPM", self.current_tool, command, rpm);
        Ok(rpm)
    }

    fn motor_pwm(&mut self, command: ToolCommand) -> Result<u8, DriverError> {
        let packet = self.tool(command);
        let mut r = self.run_tool(packet)?;
        Ok(r.get8()?)
    }
}

impl<T: Transactor> MotionDriver for PacketDriver<T> {
    fn initialize(&mut self) -> Result<Version, DriverError> {
        self.initialized = false;
        self.invalidate();
        info!("initializing {}", self.profile.name);

        let version = self.get_version()?;
        let policy = self.profile.version_policy;
        match policy.check(version) {
            VersionCheck::BelowMinimum => {
                return Err(DriverError::FirmwareTooOld {
                    found: version,
                    minimum: policy.minimum,
                })
            }
            VersionCheck::BelowPreferred => warn!(
                "stage firmware {} is older than the recommended {}; some features may not work",
                version, policy.preferred
            ),
            VersionCheck::Ok => info!("stage firmware {}", version),
        }

        match self.tool_version(0) {
            Ok(v) => info!("toolhead 0 firmware {}", v),
            Err(e)
                if e.is_transport_failure()
                    || matches!(e, DriverError::Protocol(ProtocolError::Cancelled)) =>
            {
                return Err(e)
            }
            Err(e) => warn!("toolhead 0 did not report a version: {}", e),
        }

        self.run(stage(StageCommand::Init))?;
        self.current_tool = 0;
        self.paused = false;
        self.initialized = true;
        Ok(version)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn get_version(&mut self) -> Result<Version, DriverError> {
        let mut r = self.run(stage(StageCommand::GetVersion).add16(HOST_VERSION))?;
        let version = read_version(&mut r)?;
        debug!("machine reports firmware {}", version);
        self.version = Some(version);
        Ok(version)
    }

    fn queue_point(&mut self, position: Point3, feedrate: f64) -> Result<(), DriverError> {
        self.require_init()?;
        self.target_steps(&position)?;
        if !feedrate.is_finite() {
            return Err(DriverError::InvalidArgument(format!(
                "feedrate {} is not a number",
                feedrate
            )));
        }
        let current = match self.position {
            Some(p) => p,
            None => self.get_position()?,
        };

        let feedrate = safe_feedrate(&current, &position, feedrate, &self.profile.max_feedrate);
        let spm = self.profile.steps_per_mm;
        let segments = plan_move(&current, &position, feedrate, &spm);
        if segments.is_empty() {
            return Ok(());
        }
        debug!(
            "queue {} -> {} at {:.1} mm/min in {} segment(s)",
            current,
            position,
            feedrate,
            segments.len()
        );

        let mut reached = current.to_steps(&spm);
        for segment in &segments {
            if let Err(e) = self.run(segment.packet()) {
                // A request the machine rejected was not queued, so the
                // position after the last accepted segment is still exact
                self.position = match e {
                    DriverError::Protocol(
                        ProtocolError::BufferOverflow
                        | ProtocolError::DeviceCrcMismatch
                        | ProtocolError::Device(_),
                    ) => Some(Point3::from_steps(reached, &spm)),
                    _ => None,
                };
                return Err(e);
            }
            for (r, s) in reached.iter_mut().zip(segment.steps) {
                *r += i64::from(s);
            }
        }
        self.position = Some(position);
        Ok(())
    }

    fn set_current_position(&mut self, position: Point3) -> Result<(), DriverError> {
        self.require_init()?;
        let mut packet = stage(StageCommand::SetPosition);
        for steps in self.target_steps(&position)? {
            packet = packet.add_i32(steps as i32);
        }
        // the machine may have applied a request whose reply was lost
        if let Err(e) = self.run(packet) {
            self.invalidate();
            return Err(e);
        }
        debug!("position set to {}", position);
        self.position = Some(position);
        Ok(())
    }

    fn get_position(&mut self) -> Result<Point3, DriverError> {
        self.require_init()?;
        let mut r = self.run(stage(StageCommand::GetPosition))?;
        let steps = [
            i64::from(r.get_i32()?),
            i64::from(r.get_i32()?),
            i64::from(r.get_i32()?),
        ];
        let spm = self.profile.steps_per_mm;
        let reported = Point3::from_steps(steps, &spm);

        // While moves are queued the machine lags the queued endpoint, so
        // only an invalid cache is replaced
        match self.position {
            None => self.position = Some(reported),
            Some(cached) if cached.to_steps(&spm) != steps => {
                debug!("machine at {}, queued motion ends at {}", reported, cached)
            }
            Some(_) => {}
        }
        Ok(reported)
    }

    fn cached_position(&self) -> Option<Point3> {
        self.position
    }

    fn home_axes(
        &mut self,
        axes: AxisSet,
        direction: HomeDirection,
        feedrate: f64,
    ) -> Result<(), DriverError> {
        self.require_init()?;
        if axes.is_empty() {
            return Err(DriverError::InvalidArgument("no axes to home".into()));
        }

        let spm = self.profile.steps_per_mm.to_array();
        let max = self.profile.max_feedrate.to_array();
        let homed: Vec<usize> = [axes.x, axes.y, axes.z]
            .iter()
            .enumerate()
            .filter_map(|(i, &on)| on.then_some(i))
            .collect();

        let mut rate = if feedrate > 0.0 {
            feedrate
        } else {
            homed.iter().map(|&i| max[i]).fold(1.0, f64::max)
        };
        rate = homed.iter().map(|&i| max[i]).fold(rate, f64::min);
        let steps_per_mm = homed.iter().map(|&i| spm[i]).fold(0.0, f64::max);
        let timer = quantize((TICKS_PER_MINUTE as f64 / (rate * steps_per_mm)).floor() as u64);

        let command = match direction {
            HomeDirection::Minimum => StageCommand::FindMinimums,
            HomeDirection::Maximum => StageCommand::FindMaximums,
        };
        info!(
            "homing axes {:#05b} towards {:?} at {:.1} mm/min",
            axes.flags(),
            direction,
            rate
        );
        let result = self.run(
            stage(command)
                .add8(axes.flags())
                .add8(timer.band)
                .add16(timer.counter)
                .add16(HOMING_TIMEOUT_S),
        );
        self.invalidate();
        result.map(|_| ())
    }

    fn select_tool(&mut self, index: u8) -> Result<(), DriverError> {
        self.require_init()?;
        self.check_tool(index)?;
        self.run(stage(StageCommand::ChangeTool).add8(index))?;
        debug!("selected tool {}", index);
        self.current_tool = index;
        Ok(())
    }

    fn wait_for_tool(&mut self, index: u8, timeout: Duration) -> Result<(), DriverError> {
        self.require_init()?;
        self.check_tool(index)?;
        let secs = timeout.as_secs().clamp(1, u64::from(u16::MAX)) as u16;
        self.run(
            stage(StageCommand::WaitForTool)
                .add8(index)
                .add16(TOOL_PING_MS)
                .add16(secs),
        )?;
        Ok(())
    }

    fn delay(&mut self, duration: Duration) -> Result<(), DriverError> {
        self.require_init()?;
        let millis = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        self.run(stage(StageCommand::Delay).add32(millis))?;
        Ok(())
    }

    fn set_temperature(&mut self, celsius: f64) -> Result<(), DriverError> {
        let value = celsius_to_wire(celsius)?;
        debug!("tool {} temperature -> {}C", self.current_tool, value);
        let packet = self.tool(ToolCommand::SetTemp).add16(value);
        self.run_tool(packet)?;
        Ok(())
    }

    fn read_temperature(&mut self) -> Result<f64, DriverError> {
        let packet = self.tool(ToolCommand::GetTemp);
        let mut r = self.run_tool(packet)?;
        Ok(f64::from(r.get16()?))
    }

    fn enable_fan(&mut self) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::ToggleFan).add8(1);
        self.run_tool(packet).map(|_| ())
    }

    fn disable_fan(&mut self) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::ToggleFan).add8(0);
        self.run_tool(packet).map(|_| ())
    }

    fn open_valve(&mut self) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::ToggleValve).add8(1);
        self.run_tool(packet).map(|_| ())
    }

    fn close_valve(&mut self) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::ToggleValve).add8(0);
        self.run_tool(packet).map(|_| ())
    }

    fn enable_coolant(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("coolant"))
    }

    fn disable_coolant(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("coolant"))
    }

    fn enable_motor(&mut self, direction: MotorDirection) -> Result<(), DriverError> {
        let packet = self
            .tool(ToolCommand::ToggleMotor1)
            .add8(motor_flags(true, direction));
        self.run_tool(packet).map(|_| ())
    }

    fn disable_motor(&mut self) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::ToggleMotor1).add8(0);
        self.run_tool(packet).map(|_| ())
    }

    fn set_motor_rpm(&mut self, rpm: f64) -> Result<(), DriverError> {
        let micros = rpm_to_micros(rpm)?;
        let packet = self.tool(ToolCommand::SetMotor1Rpm).add32(micros);
        self.run_tool(packet).map(|_| ())
    }

    fn set_motor_pwm(&mut self, pwm: u8) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::SetMotor1Pwm).add8(pwm);
        self.run_tool(packet).map(|_| ())
    }

    fn enable_spindle(&mut self, direction: MotorDirection) -> Result<(), DriverError> {
        let packet = self
            .tool(ToolCommand::ToggleMotor2)
            .add8(motor_flags(true, direction));
        self.run_tool(packet).map(|_| ())
    }

    fn disable_spindle(&mut self) -> Result<(), DriverError> {
        let packet = self.tool(ToolCommand::ToggleMotor2).add8(0);
        self.run_tool(packet).map(|_| ())
    }

    fn set_spindle_rpm(&mut self, rpm: f64) -> Result<(), DriverError> {
        let micros = rpm_to_micros(rpm)?;
        let packet = self.tool(ToolCommand::SetMotor2Rpm).add32(micros);
        self.run_tool(packet).map(|_| ())
    }

    fn get_motor_rpm(&mut self) -> Result<f64, DriverError> {
        self.motor_speed(ToolCommand::GetMotor1Rpm)
    }

    fn get_motor_pwm(&mut self) -> Result<u8, DriverError> {
        self.motor_pwm(ToolCommand::GetMotor1Pwm)
    }

    fn get_spindle_rpm(&mut self) -> Result<f64, DriverError> {
        self.motor_speed(ToolCommand::GetMotor2Rpm)
    }

    fn get_spindle_pwm(&mut self) -> Result<u8, DriverError> {
        self.motor_pwm(ToolCommand::GetMotor2Pwm)
    }

    fn set_platform_temperature(&mut self, celsius: f64) -> Result<(), DriverError> {
        let value = celsius_to_wire(celsius)?;
        debug!("platform temperature -> {}C", value);
        let packet = self.tool(ToolCommand::SetPlatformTemp).add16(value);
        self.run_tool(packet).map(|_| ())
    }

    fn read_platform_temperature(&mut self) -> Result<f64, DriverError> {
        let packet = self.tool(ToolCommand::GetPlatformTemp);
        let mut r = self.run_tool(packet)?;
        Ok(f64::from(r.get16()?))
    }

    fn enable_drives(&mut self) -> Result<(), DriverError> {
        self.require_init()?;
        self.run(stage(StageCommand::EnableAxes).add8(DRIVES_ON))?;
        debug!("stepper drivers enabled");
        Ok(())
    }

    fn disable_drives(&mut self) -> Result<(), DriverError> {
        self.require_init()?;
        self.run(stage(StageCommand::EnableAxes).add8(DRIVES_OFF))?;
        debug!("stepper drivers disabled");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DriverError> {
        self.require_init()?;
        self.run(stage(StageCommand::Pause))?;
        self.paused = !self.paused;
        info!("machine {}", if self.paused { "paused" } else { "resumed" });
        Ok(())
    }

    fn abort(&mut self) -> Result<(), DriverError> {
        let result = self.run(stage(StageCommand::Abort));
        self.invalidate();
        self.paused = false;
        warn!("machine aborted");
        result.map(|_| ())
    }

    fn is_finished(&mut self) -> Result<bool, DriverError> {
        self.require_init()?;
        match self.run(stage(StageCommand::IsFinished)) {
            Ok(mut r) => {
                let finished = r.get8()? != 0;
                debug!("machine finished: {}", finished);
                Ok(finished)
            }
            Err(DriverError::Protocol(ProtocolError::Device(ResponseCode::Unsupported))) => {
                if !self.finished_unsupported {
                    warn!("firmware cannot report when motion is finished; update it");
                    self.finished_unsupported = true;
                }
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn reset(&mut self) -> Result<Version, DriverError> {
        self.initialized = false;
        match self.version {
            Some(v) if v >= RESET_MIN_VERSION => {
                info!("resetting stage");
                self.run(stage(StageCommand::Reset))?;
            }
            Some(v) => debug!("firmware {} has no RESET, reinitializing only", v),
            None => debug!("firmware version unknown, reinitializing only"),
        }
        self.initialize()
    }

    fn available_buffer(&mut self) -> Result<u32, DriverError> {
        let mut r = self.run(stage(StageCommand::GetAvailableBuffer))?;
        Ok(r.get32()?)
    }

    fn disconnect(&mut self) {
        self.initialized = false;
        self.version = None;
        self.paused = false;
        self.invalidate();
        info!("disconnected from {}", self.profile.name);
    }
}

/// TOGGLE_MOTOR flags: bit 0 enables, bit 1 selects clockwise
fn motor_flags(enable: bool, direction: MotorDirection) -> u8 {
    let mut flags = u8::from(enable);
    if direction == MotorDirection::Clockwise {
        flags |= 2;
    }
    flags
}
