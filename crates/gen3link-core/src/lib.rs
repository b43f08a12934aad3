//! # Gen3Link Core Library
//!
//! Host-side driver for motion controllers speaking the Gen3 binary packet
//! protocol: a three-axis stage plus a toolhead on one serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Packet framing with CRC-8 and a resynchronizing decoder
//! - A blocking request/response transaction engine with timeout and cancellation
//! - Move segmentation and step timer quantization
//! - The [`MotionDriver`](driver::MotionDriver) facade with retry handling
//! - Dry-run time estimation and an in-process simulated machine
//! - Build jobs run on a blocking task with pause and stop
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gen3link_core::prelude::*;
//!
//! let profile = Arc::new(MachineProfile::from_file("machine.json")?);
//! let channel = connect(&profile.connection)?;
//! let transactor = SerialTransactor::with_timeout(channel, profile.connection.timeout());
//!
//! let mut driver = PacketDriver::new(transactor, profile);
//! driver.initialize()?;
//! driver.queue_point(Point3::new(10.0, 10.0, 0.0), 1200.0)?;
//! ```

pub mod driver;
pub mod job;
pub mod machine;
pub mod motion;
pub mod protocol;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::driver::{DriverError, MotionDriver, PacketDriver, Version, VersionPolicy};
    pub use crate::job::{start_job, BuildJob, DriverCommand, JobOutcome, JobReport};
    pub use crate::machine::MachineProfile;
    pub use crate::motion::{Axis, AxisSet, HomeDirection, Point3};
    pub use crate::protocol::{
        connect, ConnectionConfig, EstimatingTransactor, ProtocolError, SerialTransactor,
        Transactor,
    };
    pub use crate::sim::{SimConfig, SimulatedMachine};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
