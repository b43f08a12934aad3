//! Machine profiles
//!
//! Calibration and connection settings for one machine, stored as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::driver::VersionPolicy;
use crate::motion::Point3;
use crate::protocol::ConnectionConfig;

/// Errors loading or saving a machine profile
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid profile JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid profile: {0}")]
    Invalid(String),
}

/// Everything the driver needs to know about a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Display name
    pub name: String,

    /// Steps per millimetre of each axis
    pub steps_per_mm: Point3,

    /// Fastest allowed speed of each axis, mm/min
    pub max_feedrate: Point3,

    /// Number of addressable toolheads
    #[serde(default = "default_tool_count")]
    pub tool_count: u8,

    /// Serial link settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Accepted firmware versions
    #[serde(default)]
    pub version_policy: VersionPolicy,
}

fn default_tool_count() -> u8 {
    1
}

impl Default for MachineProfile {
    /// A Cupcake-class machine with a single extruder
    fn default() -> Self {
        Self {
            name: "Generic Gen3".to_string(),
            steps_per_mm: Point3::new(11.767463, 11.767463, 320.0),
            max_feedrate: Point3::new(5000.0, 5000.0, 150.0),
            tool_count: default_tool_count(),
            connection: ConnectionConfig::default(),
            version_policy: VersionPolicy::default(),
        }
    }
}

impl MachineProfile {
    /// Default profile location in the user's config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gen3link").join("machine.json"))
    }

    /// Load and validate a profile
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let content = fs::read_to_string(path.as_ref())?;
        let profile: MachineProfile = serde_json::from_str(&content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Write the profile as pretty JSON, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProfileError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject calibration the motion math cannot work with
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (axis, spm, max) in [
            ("X", self.steps_per_mm.x, self.max_feedrate.x),
            ("Y", self.steps_per_mm.y, self.max_feedrate.y),
            ("Z", self.steps_per_mm.z, self.max_feedrate.z),
        ] {
            if !(spm.is_finite() && spm > 0.0) {
                return Err(ProfileError::Invalid(format!(
                    "{} steps_per_mm must be positive, got {}",
                    axis, spm
                )));
            }
            if !(max.is_finite() && max > 0.0) {
                return Err(ProfileError::Invalid(format!(
                    "{} max_feedrate must be positive, got {}",
                    axis, max
                )));
            }
        }
        if self.tool_count == 0 {
            return Err(ProfileError::Invalid("tool_count must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Version;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        MachineProfile::default().validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("machine.json");

        let mut profile = MachineProfile::default();
        profile.name = "Thing-O-Matic".to_string();
        profile.tool_count = 2;
        profile.connection.port_name = "/dev/ttyUSB0".to_string();
        profile.save(&path).unwrap();

        let loaded = MachineProfile::from_file(&path).unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_minimal_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        fs::write(
            &path,
            r#"{
                "name": "cupcake",
                "steps_per_mm": {"x": 11.77, "y": 11.77, "z": 320.0},
                "max_feedrate": {"x": 5000.0, "y": 5000.0, "z": 150.0},
                "version_policy": {"minimum": {"major": 2, "minor": 0}}
            }"#,
        )
        .unwrap();

        let profile = MachineProfile::from_file(&path).unwrap();
        assert_eq!(profile.tool_count, 1);
        assert_eq!(profile.connection.baud_rate, 38400);
        assert_eq!(profile.version_policy.minimum, Version::new(2, 0));
        assert_eq!(profile.version_policy.preferred, Version::new(1, 3));
    }

    #[test]
    fn test_rejects_bad_calibration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut profile = MachineProfile::default();
        profile.steps_per_mm.z = 0.0;
        profile.save(&path).unwrap();

        match MachineProfile::from_file(&path) {
            Err(ProfileError::Invalid(msg)) => assert!(msg.contains("Z steps_per_mm")),
            other => panic!("expected Invalid, got {:?}", other),
        }

        let mut profile = MachineProfile::default();
        profile.max_feedrate.x = -1.0;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            MachineProfile::from_file(&path),
            Err(ProfileError::Parse(_))
        ));
    }
}
