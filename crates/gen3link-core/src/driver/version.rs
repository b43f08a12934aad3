//! Firmware versions

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `major.minor` firmware version. Ordered by major, then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Decode the firmware's `major * 100 + minor` form. Zero means the
    /// board has no version.
    pub fn from_wire(value: u16) -> Option<Self> {
        (value != 0).then(|| Self::new(value / 100, value % 100))
    }

    /// Wire form of this version, saturating at `u16::MAX`
    pub fn to_wire(self) -> u16 {
        self.major.saturating_mul(100).saturating_add(self.minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl From<(u16, u16)> for Version {
    fn from((major, minor): (u16, u16)) -> Self {
        Self::new(major, minor)
    }
}

/// Firmware versions the driver accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionPolicy {
    /// Older firmware is refused
    pub minimum: Version,
    /// Older firmware works but is warned about
    pub preferred: Version,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self {
            minimum: Version::new(1, 1),
            preferred: Version::new(1, 3),
        }
    }
}

/// Outcome of checking a reported version against a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Ok,
    BelowPreferred,
    BelowMinimum,
}

impl VersionPolicy {
    pub fn check(&self, found: Version) -> VersionCheck {
        if found < self.minimum {
            VersionCheck::BelowMinimum
        } else if found < self.preferred {
            VersionCheck::BelowPreferred
        } else {
            VersionCheck::Ok
        }
    }
}
