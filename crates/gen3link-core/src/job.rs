//! Build jobs
//!
//! A build job is an ordered list of [`DriverCommand`]s stored as JSON. Jobs
//! run on a dedicated blocking task over a driver shared with interactive
//! use, and can be paused, stopped and estimated without a machine.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{DriverError, MotionDriver, MotorDirection, PacketDriver};
use crate::machine::MachineProfile;
use crate::motion::{Axis, AxisSet, HomeDirection, Point3};
use crate::protocol::{EstimatingTransactor, ProtocolError};

/// A driver shared between a running job and interactive commands
pub type SharedDriver = Arc<Mutex<Box<dyn MotionDriver>>>;

/// Wrap a driver for sharing
pub fn share_driver<D: MotionDriver + 'static>(driver: D) -> SharedDriver {
    Arc::new(Mutex::new(Box::new(driver)))
}

/// Errors loading or saving a job file
#[derive(Error, Debug)]
pub enum JobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid job JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_tool_timeout() -> u64 {
    u64::from(crate::driver::TOOL_TIMEOUT_S)
}

/// One step of a build job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverCommand {
    /// Firmware handshake and machine reset
    Initialize,
    /// Straight move in millimetres at a feedrate in mm/min
    Move { x: f64, y: f64, z: f64, feedrate: f64 },
    /// Redefine the current position
    SetPosition { x: f64, y: f64, z: f64 },
    /// Home the listed axes. A zero feedrate homes at the axes' maximum.
    Home {
        axes: Vec<Axis>,
        direction: HomeDirection,
        #[serde(default)]
        feedrate: f64,
    },
    SelectTool { tool: u8 },
    WaitForTool {
        tool: u8,
        #[serde(default = "default_tool_timeout")]
        timeout_s: u64,
    },
    /// Queued dwell
    Dwell { ms: u64 },
    SetTemperature { celsius: f64 },
    Fan { on: bool },
    Valve { open: bool },
    Coolant { on: bool },
    MotorOn {
        #[serde(default)]
        direction: MotorDirection,
    },
    MotorOff,
    MotorRpm { rpm: f64 },
    MotorPwm { pwm: u8 },
    SpindleOn {
        #[serde(default)]
        direction: MotorDirection,
    },
    SpindleOff,
    SpindleRpm { rpm: f64 },
    SetPlatformTemperature { celsius: f64 },
    /// Stepper driver power
    Drives { on: bool },
    Pause,
    Abort,
    /// Reboot the stage and repeat the handshake
    Reset,
}

impl DriverCommand {
    /// Perform the command on `driver`
    pub fn apply(&self, driver: &mut dyn MotionDriver) -> Result<(), DriverError> {
        match *self {
            DriverCommand::Initialize => driver.initialize().map(|_| ()),
            DriverCommand::Move { x, y, z, feedrate } => {
                driver.queue_point(Point3::new(x, y, z), feedrate)
            }
            DriverCommand::SetPosition { x, y, z } => {
                driver.set_current_position(Point3::new(x, y, z))
            }
            DriverCommand::Home {
                ref axes,
                direction,
                feedrate,
            } => driver.home_axes(axes.iter().copied().collect::<AxisSet>(), direction, feedrate),
            DriverCommand::SelectTool { tool } => driver.select_tool(tool),
            DriverCommand::WaitForTool { tool, timeout_s } => {
                driver.wait_for_tool(tool, Duration::from_secs(timeout_s))
            }
            DriverCommand::Dwell { ms } => driver.delay(Duration::from_millis(ms)),
            DriverCommand::SetTemperature { celsius } => driver.set_temperature(celsius),
            DriverCommand::Fan { on: true } => driver.enable_fan(),
            DriverCommand::Fan { on: false } => driver.disable_fan(),
            DriverCommand::Valve { open: true } => driver.open_valve(),
            DriverCommand::Valve { open: false } => driver.close_valve(),
            DriverCommand::Coolant { on: true } => driver.enable_coolant(),
            DriverCommand::Coolant { on: false } => driver.disable_coolant(),
            DriverCommand::MotorOn { direction } => driver.enable_motor(direction),
            DriverCommand::MotorOff => driver.disable_motor(),
            DriverCommand::MotorRpm { rpm } => driver.set_motor_rpm(rpm),
            DriverCommand::MotorPwm { pwm } => driver.set_motor_pwm(pwm),
            DriverCommand::SpindleOn { direction } => driver.enable_spindle(direction),
            DriverCommand::SpindleOff => driver.disable_spindle(),
            DriverCommand::SpindleRpm { rpm } => driver.set_spindle_rpm(rpm),
            DriverCommand::SetPlatformTemperature { celsius } => {
                driver.set_platform_temperature(celsius)
            }
            DriverCommand::Drives { on: true } => driver.enable_drives(),
            DriverCommand::Drives { on: false } => driver.disable_drives(),
            DriverCommand::Pause => driver.pause(),
            DriverCommand::Abort => driver.abort(),
            DriverCommand::Reset => driver.reset().map(|_| ()),
        }
    }
}

impl fmt::Display for DriverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverCommand::Move { x, y, z, feedrate } => {
                write!(f, "move to ({:.3}, {:.3}, {:.3}) at {}", x, y, z, feedrate)
            }
            DriverCommand::Dwell { ms } => write!(f, "dwell {} ms", ms),
            DriverCommand::SetTemperature { celsius } => write!(f, "set temperature {}C", celsius),
            DriverCommand::SelectTool { tool } => write!(f, "select tool {}", tool),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A named, timestamped command list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub commands: Vec<DriverCommand>,
}

/// Job files hold either a full job or a bare command array
#[derive(Deserialize)]
#[serde(untagged)]
enum JobFile {
    Job(BuildJob),
    Commands(Vec<DriverCommand>),
}

/// Predicted machine time of a job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobEstimate {
    pub duration: Duration,
    pub moves: u64,
    pub packets: u64,
}

impl BuildJob {
    pub fn new(name: impl Into<String>, commands: Vec<DriverCommand>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            commands,
        }
    }

    /// Load a job. A bare command array is named after the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, JobError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match serde_json::from_str::<JobFile>(&content) {
            Ok(JobFile::Job(job)) => Ok(job),
            Ok(JobFile::Commands(commands)) => {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "job".to_string());
                Ok(Self::new(name, commands))
            }
            // untagged errors say nothing useful, so report the array error
            Err(_) => Ok(Self::new(
                "job",
                serde_json::from_str::<Vec<DriverCommand>>(&content)?,
            )),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), JobError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Dry-run the job against `profile` and report the machine time
    pub fn estimate(&self, profile: Arc<MachineProfile>) -> Result<JobEstimate, DriverError> {
        let preferred = profile.version_policy.preferred;
        let transactor = EstimatingTransactor::new((preferred.major, preferred.minor));
        let mut driver = PacketDriver::new(transactor, profile);
        driver.initialize()?;

        for command in &self.commands {
            match command.apply(&mut driver) {
                Ok(()) => {}
                Err(DriverError::Unsupported(what)) => debug!("estimate: skipping {}", what),
                Err(e) => return Err(e),
            }
        }

        let transactor = driver.transactor();
        Ok(JobEstimate {
            duration: transactor.elapsed(),
            moves: transactor.moves(),
            packets: transactor.packets(),
        })
    }
}

/// How a job run handles trouble
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Times a command is re-applied after a retryable failure
    pub max_command_retries: u32,
    /// Wait before re-applying a command, giving the machine time to drain
    pub retry_wait: Duration,
    /// Begin in the paused state
    pub start_paused: bool,
    /// After the last command, poll until the machine has executed its
    /// queue before reporting completion
    pub wait_until_finished: bool,
    /// Interval between those polls
    pub finish_poll: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_command_retries: 40,
            retry_wait: Duration::from_millis(250),
            start_paused: false,
            wait_until_finished: true,
            finish_poll: Duration::from_millis(200),
        }
    }
}

/// Commands finished so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobProgress {
    pub completed: usize,
    pub total: usize,
}

impl JobProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed,
    Stopped,
    Failed,
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub outcome: JobOutcome,
    /// Failure message, when the outcome is `Failed`
    pub error: Option<String>,
}

/// Control of a running job
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    progress: watch::Receiver<JobProgress>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop after the command in flight. A blocked transaction is
    /// cancelled too when the driver shares the job's token.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop sending commands. Motion already queued on the machine keeps
    /// running.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> JobProgress {
        *self.progress.borrow()
    }

    /// Receiver notified after every completed command
    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end
    pub async fn wait(self) -> Result<JobReport, tokio::task::JoinError> {
        self.task.await
    }
}

/// Start `job` on a blocking task.
///
/// Must be called from within a tokio runtime.
pub fn start_job(
    job: BuildJob,
    driver: SharedDriver,
    cancel: CancellationToken,
    options: RunOptions,
) -> JobHandle {
    let paused = Arc::new(AtomicBool::new(options.start_paused));
    let (tx, rx) = watch::channel(JobProgress {
        completed: 0,
        total: job.commands.len(),
    });
    let id = job.id;

    let task = {
        let cancel = cancel.clone();
        let paused = paused.clone();
        tokio::task::spawn_blocking(move || run_job(&job, &driver, &cancel, &paused, &tx, &options))
    };

    JobHandle {
        id,
        cancel,
        paused,
        progress: rx,
        task,
    }
}

const PAUSE_POLL: Duration = Duration::from_millis(10);

/// Sleep for `duration` unless cancelled first. Returns false if cancelled.
fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(PAUSE_POLL.min(deadline - now));
    }
}

/// Block while paused. Returns false if cancelled.
fn wait_while_paused(paused: &AtomicBool, cancel: &CancellationToken) -> bool {
    while paused.load(Ordering::SeqCst) {
        if !sleep_unless_cancelled(PAUSE_POLL, cancel) {
            return false;
        }
    }
    !cancel.is_cancelled()
}

fn run_job(
    job: &BuildJob,
    driver: &SharedDriver,
    cancel: &CancellationToken,
    paused: &AtomicBool,
    progress: &watch::Sender<JobProgress>,
    options: &RunOptions,
) -> JobReport {
    let started_at = Utc::now();
    let total = job.commands.len();
    let mut completed = 0;
    info!("job {} '{}' started: {} commands", job.id, job.name, total);

    let finish = |completed: usize, outcome: JobOutcome, error: Option<String>| {
        match outcome {
            JobOutcome::Completed => info!("job {} completed", job.id),
            JobOutcome::Stopped => warn!("job {} stopped after {}/{}", job.id, completed, total),
            JobOutcome::Failed => error!("job {} failed after {}/{}", job.id, completed, total),
        }
        JobReport {
            job_id: job.id,
            name: job.name.clone(),
            started_at,
            finished_at: Utc::now(),
            total,
            completed,
            outcome,
            error,
        }
    };

    for command in &job.commands {
        let mut attempts = 0;
        loop {
            if !wait_while_paused(paused, cancel) {
                return finish(completed, JobOutcome::Stopped, None);
            }

            let result = {
                let mut driver = driver.lock();
                command.apply(driver.as_mut())
            };

            match result {
                Ok(()) => break,
                Err(DriverError::Protocol(ProtocolError::Cancelled)) => {
                    return finish(completed, JobOutcome::Stopped, None)
                }
                Err(e) if e.is_retryable() && attempts < options.max_command_retries => {
                    attempts += 1;
                    warn!("{} failed: {}; trying again ({})", command, e, attempts);
                    if !sleep_unless_cancelled(options.retry_wait, cancel) {
                        return finish(completed, JobOutcome::Stopped, None);
                    }
                }
                Err(e) => {
                    error!("{} failed: {}", command, e);
                    return finish(completed, JobOutcome::Failed, Some(e.to_string()));
                }
            }
        }

        completed += 1;
        progress.send_replace(JobProgress { completed, total });
    }

    if options.wait_until_finished && total > 0 {
        debug!("job {}: waiting for queued motion", job.id);
        loop {
            let result = driver.lock().is_finished();
            match result {
                Ok(true) => break,
                Ok(false) => {
                    if !sleep_unless_cancelled(options.finish_poll, cancel) {
                        return finish(completed, JobOutcome::Stopped, None);
                    }
                }
                Err(DriverError::Protocol(ProtocolError::Cancelled)) => {
                    return finish(completed, JobOutcome::Stopped, None)
                }
                Err(e) if e.is_retryable() => {
                    warn!("finish query failed: {}", e);
                    if !sleep_unless_cancelled(options.retry_wait, cancel) {
                        return finish(completed, JobOutcome::Stopped, None);
                    }
                }
                Err(e) => {
                    error!("finish query failed: {}", e);
                    return finish(completed, JobOutcome::Failed, Some(e.to_string()));
                }
            }
        }
    }

    finish(completed, JobOutcome::Completed, None)
}
