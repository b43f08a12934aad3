//! Machine driver
//!
//! [`MotionDriver`] is the motion and tool interface the rest of an
//! application programs against. [`PacketDriver`] implements it on top of
//! any [`Transactor`](crate::protocol::Transactor), which is how the same
//! code drives a serial machine, the simulator, or a dry run.

mod error;
mod packet_driver;
mod version;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::motion::{AxisSet, HomeDirection, Point3};

pub use error::DriverError;
pub use packet_driver::{
    PacketDriver, HOMING_TIMEOUT_S, RESET_MIN_VERSION, TOOL_PING_MS, TOOL_TIMEOUT_S,
};
pub use version::{Version, VersionCheck, VersionPolicy};

/// Rotation of a toolhead motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotorDirection {
    #[default]
    Clockwise,
    CounterClockwise,
}

/// Motion and tool control of one machine.
///
/// Positions are millimetres and feedrates mm/min. Tool operations act on
/// the tool chosen with [`MotionDriver::select_tool`].
pub trait MotionDriver: Send {
    /// Check the firmware version and reset the machine
    fn initialize(&mut self) -> Result<Version, DriverError>;

    /// Whether `initialize` has succeeded since the last transport failure
    fn is_initialized(&self) -> bool;

    /// Stage firmware version
    fn get_version(&mut self) -> Result<Version, DriverError>;

    /// Queue a straight move to `position`
    fn queue_point(&mut self, position: Point3, feedrate: f64) -> Result<(), DriverError>;

    /// Redefine the current position without moving
    fn set_current_position(&mut self, position: Point3) -> Result<(), DriverError>;

    /// Ask the machine where it is
    fn get_position(&mut self) -> Result<Point3, DriverError>;

    /// Last known position, if still trusted
    fn cached_position(&self) -> Option<Point3>;

    /// Move `axes` until they hit their endstops
    fn home_axes(
        &mut self,
        axes: AxisSet,
        direction: HomeDirection,
        feedrate: f64,
    ) -> Result<(), DriverError>;

    fn select_tool(&mut self, index: u8) -> Result<(), DriverError>;

    /// Hold the motion queue until tool `index` reports ready
    fn wait_for_tool(&mut self, index: u8, timeout: Duration) -> Result<(), DriverError>;

    /// Queue a dwell
    fn delay(&mut self, duration: Duration) -> Result<(), DriverError>;

    fn set_temperature(&mut self, celsius: f64) -> Result<(), DriverError>;

    fn read_temperature(&mut self) -> Result<f64, DriverError>;

    fn enable_fan(&mut self) -> Result<(), DriverError>;

    fn disable_fan(&mut self) -> Result<(), DriverError>;

    fn open_valve(&mut self) -> Result<(), DriverError>;

    fn close_valve(&mut self) -> Result<(), DriverError>;

    fn enable_coolant(&mut self) -> Result<(), DriverError>;

    fn disable_coolant(&mut self) -> Result<(), DriverError>;

    fn enable_motor(&mut self, direction: MotorDirection) -> Result<(), DriverError>;

    fn disable_motor(&mut self) -> Result<(), DriverError>;

    fn set_motor_rpm(&mut self, rpm: f64) -> Result<(), DriverError>;

    fn set_motor_pwm(&mut self, pwm: u8) -> Result<(), DriverError>;

    fn enable_spindle(&mut self, direction: MotorDirection) -> Result<(), DriverError>;

    fn disable_spindle(&mut self) -> Result<(), DriverError>;

    fn set_spindle_rpm(&mut self, rpm: f64) -> Result<(), DriverError>;

    /// Motor speed readback
    fn get_motor_rpm(&mut self) -> Result<f64, DriverError>;

    fn get_motor_pwm(&mut self) -> Result<u8, DriverError>;

    fn get_spindle_rpm(&mut self) -> Result<f64, DriverError>;

    fn get_spindle_pwm(&mut self) -> Result<u8, DriverError>;

    /// Heated build platform attached to the current tool
    fn set_platform_temperature(&mut self, celsius: f64) -> Result<(), DriverError>;

    fn read_platform_temperature(&mut self) -> Result<f64, DriverError>;

    /// Power the stepper drivers. Most motion commands power them anyway.
    fn enable_drives(&mut self) -> Result<(), DriverError>;

    /// Release the stepper drivers so the axes can be moved by hand
    fn disable_drives(&mut self) -> Result<(), DriverError>;

    /// Toggle the machine's paused state
    fn pause(&mut self) -> Result<(), DriverError>;

    /// Stop immediately and discard queued motion
    fn abort(&mut self) -> Result<(), DriverError>;

    /// Whether every queued command has been executed. Firmware without
    /// the query is reported as finished.
    fn is_finished(&mut self) -> Result<bool, DriverError>;

    /// Reboot the stage where the firmware supports it, then initialize
    fn reset(&mut self) -> Result<Version, DriverError>;

    /// Free bytes in the machine's command queue
    fn available_buffer(&mut self) -> Result<u32, DriverError>;

    /// Forget session state. The machine must be initialized again.
    fn disconnect(&mut self);
}
