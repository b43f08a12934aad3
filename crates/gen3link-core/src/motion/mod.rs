//! Motion encoding
//!
//! Turns millimetre moves and feedrates into step deltas and step timer
//! settings the stage firmware can execute.

pub mod segment;
pub mod timer;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use segment::{plan_move, safe_feedrate, segment_steps, MotionSegment, MAX_SEGMENT_STEPS};
pub use timer::{quantize, TimerSetting};

/// A point or vector in machine space, usually millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// All three components set to `v`
    pub const fn splat(v: f64) -> Self {
        Self::new(v, v, v)
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn from_array([x, y, z]: [f64; 3]) -> Self {
        Self::new(x, y, z)
    }

    /// Euclidean distance to `other`
    pub fn distance(&self, other: &Point3) -> f64 {
        let (dx, dy, dz) = (other.x - self.x, other.y - self.y, other.z - self.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Largest component
    pub fn max_component(&self) -> f64 {
        self.x.max(self.y).max(self.z)
    }

    /// Convert millimetres to absolute step counts, rounding to the nearest step
    pub fn to_steps(&self, steps_per_mm: &Point3) -> [i64; 3] {
        [
            (self.x * steps_per_mm.x).round() as i64,
            (self.y * steps_per_mm.y).round() as i64,
            (self.z * steps_per_mm.z).round() as i64,
        ]
    }

    /// Convert absolute step counts back to millimetres
    pub fn from_steps(steps: [i64; 3], steps_per_mm: &Point3) -> Self {
        Self::new(
            steps[0] as f64 / steps_per_mm.x,
            steps[1] as f64 / steps_per_mm.y,
            steps[2] as f64 / steps_per_mm.z,
        )
    }
}

impl fmt::Display for Point3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// A machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Subset of the three axes, sent on the wire as bit flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AxisSet {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl AxisSet {
    /// X, Y and Z
    pub const ALL: AxisSet = AxisSet {
        x: true,
        y: true,
        z: true,
    };

    pub fn contains(&self, axis: Axis) -> bool {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.x || self.y || self.z)
    }

    /// Wire encoding: X=1, Y=2, Z=4
    pub fn flags(&self) -> u8 {
        (self.x as u8) | (self.y as u8) << 1 | (self.z as u8) << 2
    }

    pub fn from_flags(flags: u8) -> Self {
        Self {
            x: flags & 1 != 0,
            y: flags & 2 != 0,
            z: flags & 4 != 0,
        }
    }
}

impl FromIterator<Axis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = Axis>>(iter: I) -> Self {
        let mut set = AxisSet::default();
        for axis in iter {
            match axis {
                Axis::X => set.x = true,
                Axis::Y => set.y = true,
                Axis::Z => set.z = true,
            }
        }
        set
    }
}

/// Which endstops a homing move searches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HomeDirection {
    Minimum,
    Maximum,
}
