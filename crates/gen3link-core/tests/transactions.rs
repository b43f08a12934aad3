//! Driver and transaction engine against the simulated machine

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gen3link_core::driver::{DriverError, MotionDriver, PacketDriver, Version};
use gen3link_core::machine::MachineProfile;
use gen3link_core::motion::{AxisSet, HomeDirection, Point3};
use gen3link_core::protocol::{
    share, EstimatingTransactor, ProtocolError, SerialTransactor, Transactor,
};
use gen3link_core::sim::{SimConfig, SimHandle, SimulatedMachine};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn profile() -> MachineProfile {
    let mut profile = MachineProfile::default();
    profile.steps_per_mm = Point3::new(80.0, 80.0, 400.0);
    profile.max_feedrate = Point3::new(6000.0, 6000.0, 300.0);
    profile.connection.retry_delay_ms = 1;
    profile
}

fn connect_sim(
    config: SimConfig,
    profile: MachineProfile,
) -> (PacketDriver<SerialTransactor>, SimHandle) {
    let sim = SimulatedMachine::new(config);
    let handle = sim.handle();
    let transactor = SerialTransactor::with_timeout(share(sim), Duration::from_millis(100));
    (PacketDriver::new(transactor, Arc::new(profile)), handle)
}

#[test]
fn test_long_move_is_split_and_lossless() {
    let (mut driver, sim) = connect_sim(SimConfig::default(), profile());
    driver.initialize().unwrap();

    // 1000 mm at 80 steps/mm is more than one segment can carry
    driver.queue_point(Point3::new(1000.0, -250.0, 0.0), 6000.0).unwrap();
    let state = sim.snapshot();
    assert_eq!(state.position, [80_000, -20_000, 0]);
    assert_eq!(state.queued_moves, 2);
    assert_eq!(driver.get_position().unwrap(), Point3::new(1000.0, -250.0, 0.0));
}

#[test]
fn test_full_buffer_is_retried() {
    let (mut driver, sim) = connect_sim(SimConfig::default(), profile());
    driver.initialize().unwrap();

    sim.reject_next(3);
    driver.queue_point(Point3::new(5.0, 5.0, 0.0), 3000.0).unwrap();

    let state = sim.snapshot();
    assert_eq!(state.position, [400, 400, 0]);
    assert_eq!(state.queued_moves, 1);
}

#[test]
fn test_exhausted_retries_are_reported() {
    let mut p = profile();
    p.connection.max_retries = 2;
    let (mut driver, sim) = connect_sim(SimConfig::default(), p);
    driver.initialize().unwrap();

    sim.reject_next(10);
    let err = driver.delay(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, DriverError::Protocol(ProtocolError::BufferOverflow)));
    assert!(err.is_retryable());
    assert!(driver.is_initialized());
}

#[test]
fn test_noisy_line_still_works() {
    let config = SimConfig {
        noise_rate: 0.5,
        seed: Some(42),
        ..SimConfig::default()
    };
    let (mut driver, sim) = connect_sim(config, profile());
    driver.initialize().unwrap();

    for i in 1..=20 {
        driver.queue_point(Point3::new(i as f64, 0.0, 0.0), 3000.0).unwrap();
    }
    assert_eq!(sim.snapshot().position, [1600, 0, 0]);
    assert!(driver.transactor().stats().noise_bytes > 0);
}

#[test]
fn test_corrupt_replies_recovered_for_queries() {
    let config = SimConfig {
        corrupt_rate: 0.3,
        seed: Some(3),
        ..SimConfig::default()
    };
    let mut p = profile();
    p.connection.max_retries = 50;
    let (mut driver, _sim) = connect_sim(config, p);

    for _ in 0..60 {
        assert_eq!(driver.get_version().unwrap().to_string(), "1.3");
    }
    assert!(driver.transactor().stats().crc_errors > 0);
}

#[test]
fn test_silent_machine_times_out_and_invalidates() {
    let (mut driver, sim) = connect_sim(SimConfig::default(), profile());
    driver.initialize().unwrap();
    driver.get_position().unwrap();
    assert!(driver.cached_position().is_some());

    sim.set_silent(true);
    let started = Instant::now();
    let err = driver.available_buffer().unwrap_err();
    assert!(matches!(err, DriverError::Protocol(ProtocolError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!driver.is_initialized());
    assert_eq!(driver.cached_position(), None);

    sim.set_silent(false);
    driver.initialize().unwrap();
}

#[test]
fn test_cancel_interrupts_wait() {
    let sim = SimulatedMachine::new(SimConfig::default());
    sim.handle().set_silent(true);
    let mut transactor = SerialTransactor::with_timeout(share(sim), Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let started = Instant::now();
    let result = transactor.execute(gen3link_core::protocol::Target::Stage, 4, &[], &cancel);
    canceller.join().unwrap();

    assert!(matches!(result, Err(ProtocolError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_unplugged_machine_disconnects() {
    let (mut driver, sim) = connect_sim(SimConfig::default(), profile());
    driver.initialize().unwrap();

    sim.unplug();
    let err = driver.read_temperature().unwrap_err();
    assert!(err.is_transport_failure());
    assert!(!driver.is_initialized());
}

#[test]
fn test_homing_and_tools() {
    let mut p = profile();
    p.tool_count = 2;
    let config = SimConfig {
        tool_count: 2,
        ..SimConfig::default()
    };
    let (mut driver, sim) = connect_sim(config, p);
    driver.initialize().unwrap();

    driver.queue_point(Point3::new(10.0, 10.0, 1.0), 3000.0).unwrap();
    driver
        .home_axes(AxisSet { x: true, y: true, z: false }, HomeDirection::Minimum, 0.0)
        .unwrap();
    assert_eq!(driver.cached_position(), None);
    assert_eq!(driver.get_position().unwrap(), Point3::new(0.0, 0.0, 1.0));

    driver.select_tool(1).unwrap();
    driver.set_temperature(220.4).unwrap();
    driver.enable_fan().unwrap();
    let state = sim.snapshot();
    assert_eq!(state.current_tool, 1);
    assert_eq!(state.target_temperature, 220);
    assert!(state.fan_on);

    assert!(matches!(
        driver.select_tool(2),
        Err(DriverError::InvalidTool { index: 2, count: 2 })
    ));
}

#[test]
fn test_dry_run_estimate() {
    let mut driver = PacketDriver::new(EstimatingTransactor::default(), Arc::new(profile()));
    driver.initialize().unwrap();

    // 80000 steps at 2000 ticks each, then a two second dwell
    driver.queue_point(Point3::new(1000.0, 0.0, 0.0), 6000.0).unwrap();
    driver.delay(Duration::from_secs(2)).unwrap();

    let estimate = driver.transactor();
    assert_eq!(estimate.moves(), 2);
    assert!((estimate.elapsed().as_secs_f64() - 12.0).abs() < 1e-6);
}

#[test]
fn test_unreachable_target_is_refused() {
    let mut driver = PacketDriver::new(EstimatingTransactor::default(), Arc::new(profile()));
    driver.initialize().unwrap();

    let err = driver
        .queue_point(Point3::new(0.0, 0.0, 1.0e13), 100.0)
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidArgument(_)));
    let err = driver
        .queue_point(Point3::new(f64::NAN, 0.0, 0.0), 100.0)
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidArgument(_)));
    assert_eq!(driver.transactor().moves(), 0);
    assert!(driver.is_initialized());
}

#[test]
fn test_machine_readback() {
    let (mut driver, sim) = connect_sim(SimConfig::default(), profile());
    driver.initialize().unwrap();

    driver.set_motor_rpm(120.0).unwrap();
    driver.set_motor_pwm(200).unwrap();
    assert!((driver.get_motor_rpm().unwrap() - 120.0).abs() < 1e-6);
    assert_eq!(driver.get_motor_pwm().unwrap(), 200);
    assert_eq!(driver.get_spindle_rpm().unwrap(), 0.0);

    driver.set_platform_temperature(100.0).unwrap();
    assert_eq!(driver.read_platform_temperature().unwrap(), 100.0);

    driver.enable_drives().unwrap();
    assert!(sim.snapshot().drives_enabled);
    driver.disable_drives().unwrap();
    assert!(!sim.snapshot().drives_enabled);
}

#[test]
fn test_is_finished_tracks_machine() {
    let (mut driver, sim) = connect_sim(SimConfig::default(), profile());
    driver.initialize().unwrap();

    sim.hold_busy(1);
    assert!(!driver.is_finished().unwrap());
    assert!(driver.is_finished().unwrap());
}

#[test]
fn test_reset_reboots_newer_firmware() {
    let config = SimConfig {
        firmware: Version::new(1, 5),
        ..SimConfig::default()
    };
    let (mut driver, sim) = connect_sim(config, profile());
    driver.initialize().unwrap();
    driver.set_current_position(Point3::new(10.0, 0.0, 0.0)).unwrap();

    assert_eq!(driver.reset().unwrap(), Version::new(1, 5));
    let state = sim.snapshot();
    assert_eq!(state.reset_count, 1);
    assert_eq!(state.position, [0, 0, 0]);
    assert!(driver.is_initialized());
    assert_eq!(driver.cached_position(), None);
}
