//! # gen3link
//!
//! Command-line front end for Gen3 motion controllers.
//!
//! ```bash
//! gen3link ports
//! gen3link --port /dev/ttyUSB0 info
//! gen3link --simulate jog --x 10 --y 5 --feedrate 1200
//! gen3link run job.json
//! gen3link estimate job.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gen3link_core::driver::{MotionDriver, PacketDriver};
use gen3link_core::job::{share_driver, start_job, BuildJob, JobOutcome, RunOptions};
use gen3link_core::machine::MachineProfile;
use gen3link_core::motion::{Axis, AxisSet, HomeDirection, Point3};
use gen3link_core::protocol::{connect, list_ports, share, SerialTransactor, SharedChannel};
use gen3link_core::sim::{SimConfig, SimulatedMachine};

#[derive(Parser, Debug)]
#[command(name = "gen3link")]
#[command(about = "Drive Gen3 packet-protocol motion controllers", long_about = None)]
#[command(version)]
struct Cli {
    /// Machine profile (JSON). Defaults to the user config directory.
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    /// Serial port, overriding the profile
    #[arg(long, global = true)]
    port: Option<String>,

    /// Talk to a simulated machine instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports, likely controllers first
    Ports,

    /// Handshake and print machine status
    Info,

    /// Move to a position
    Jog {
        #[arg(long)]
        x: Option<f64>,
        #[arg(long)]
        y: Option<f64>,
        #[arg(long)]
        z: Option<f64>,
        /// mm/min; 0 moves at the machine's maximum
        #[arg(short, long, default_value_t = 0.0)]
        feedrate: f64,
        /// Coordinates are offsets from the current position
        #[arg(short, long)]
        relative: bool,
    },

    /// Home axes against their endstops
    Home {
        /// Axes to home, e.g. "xy"
        #[arg(short, long, default_value = "xyz")]
        axes: String,
        /// Search towards the maximum endstops
        #[arg(long)]
        max: bool,
        #[arg(short, long, default_value_t = 0.0)]
        feedrate: f64,
    },

    /// Run a job file. Ctrl-C stops it.
    Run {
        job: PathBuf,
        /// Report completion once the last command is queued instead of
        /// when the machine has executed it
        #[arg(long)]
        no_wait: bool,
    },

    /// Power the stepper drivers on, or off with --off
    Drives {
        #[arg(long)]
        off: bool,
    },

    /// Reboot the machine and repeat the handshake
    Reset,

    /// Estimate how long a job file takes without a machine
    Estimate { job: PathBuf },

    /// Write the default profile for editing
    InitProfile { path: Option<PathBuf> },
}

fn load_profile(cli: &Cli) -> Result<MachineProfile> {
    let mut profile = match &cli.profile {
        Some(path) => MachineProfile::from_file(path)
            .with_context(|| format!("loading profile {}", path.display()))?,
        None => match MachineProfile::default_path().filter(|p| p.exists()) {
            Some(path) => MachineProfile::from_file(&path)
                .with_context(|| format!("loading profile {}", path.display()))?,
            None => {
                info!("no machine profile found, using defaults");
                MachineProfile::default()
            }
        },
    };
    if let Some(port) = &cli.port {
        profile.connection.port_name = port.clone();
    }
    Ok(profile)
}

fn open_channel(cli: &Cli, profile: &MachineProfile) -> Result<SharedChannel> {
    if cli.simulate {
        info!("using a simulated machine");
        return Ok(share(SimulatedMachine::new(SimConfig {
            tool_count: profile.tool_count,
            ..SimConfig::default()
        })));
    }
    let port = &profile.connection.port_name;
    connect(&profile.connection).with_context(|| format!("connecting to '{}'", port))
}

fn open_driver(
    cli: &Cli,
    profile: MachineProfile,
    cancel: CancellationToken,
) -> Result<PacketDriver<SerialTransactor>> {
    let channel = open_channel(cli, &profile)?;
    let transactor = SerialTransactor::with_timeout(channel, profile.connection.timeout());
    let mut driver = PacketDriver::new(transactor, Arc::new(profile)).with_cancel(cancel);
    let version = driver.initialize().context("machine handshake failed")?;
    info!("connected, firmware {}", version);
    Ok(driver)
}

fn parse_axes(axes: &str) -> Result<AxisSet> {
    axes.chars()
        .map(|c| match c.to_ascii_lowercase() {
            'x' => Ok(Axis::X),
            'y' => Ok(Axis::Y),
            'z' => Ok(Axis::Z),
            other => bail!("unknown axis '{}'", other),
        })
        .collect::<Result<Vec<_>>>()
        .map(|axes| axes.into_iter().collect())
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let mut line = port.name.clone();
        if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            line.push_str(&format!("  [{:04x}:{:04x}]", vid, pid));
        }
        if let Some(product) = &port.product {
            line.push_str(&format!("  {}", product));
        }
        if port.is_likely_controller() {
            line.push_str("  (likely controller)");
        }
        println!("{}", line);
    }
}

fn print_info(driver: &mut PacketDriver<SerialTransactor>) -> Result<()> {
    println!("Machine:     {}", driver.profile().name);
    if let Some(v) = driver.firmware_version() {
        println!("Firmware:    {}", v);
    }
    match driver.tool_version(0) {
        Ok(v) => println!("Toolhead 0:  {}", v),
        Err(e) => println!("Toolhead 0:  unavailable ({})", e),
    }
    println!("Position:    {}", driver.get_position()?);
    println!("Buffer free: {} bytes", driver.available_buffer()?);
    match driver.read_temperature() {
        Ok(t) => println!("Temperature: {:.0} C", t),
        Err(e) => println!("Temperature: unavailable ({})", e),
    }
    match driver.read_platform_temperature() {
        Ok(t) => println!("Platform:    {:.0} C", t),
        Err(e) => println!("Platform:    unavailable ({})", e),
    }
    println!(
        "Idle:        {}",
        if driver.is_finished()? { "yes" } else { "no, moving" }
    );
    Ok(())
}

fn jog(
    driver: &mut PacketDriver<SerialTransactor>,
    target: [Option<f64>; 3],
    feedrate: f64,
    relative: bool,
) -> Result<()> {
    let current = driver.get_position()?.to_array();
    let goal = Point3::from_array(std::array::from_fn(|i| match (target[i], relative) {
        (Some(v), true) => current[i] + v,
        (Some(v), false) => v,
        (None, _) => current[i],
    }));
    driver.queue_point(goal, feedrate)?;
    println!("Queued move to {}", goal);
    Ok(())
}

async fn run_job_file(
    cli: &Cli,
    profile: MachineProfile,
    path: &Path,
    options: RunOptions,
) -> Result<()> {
    let job = BuildJob::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    let cancel = CancellationToken::new();
    let driver = share_driver(open_driver(cli, profile, cancel.clone())?);

    let stop = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping job...");
        stop.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let handle = start_job(job, driver, cancel, options);
    let mut progress = handle.subscribe();
    while progress.changed().await.is_ok() {
        let p = *progress.borrow();
        eprint!("\r{}/{} ({:.0}%)", p.completed, p.total, p.fraction() * 100.0);
    }
    eprintln!();

    let report = handle.wait().await.context("job task panicked")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.outcome {
        JobOutcome::Completed => Ok(()),
        JobOutcome::Stopped => {
            warn!("job stopped; queued motion may still be running on the machine");
            Ok(())
        }
        JobOutcome::Failed => bail!(
            "job failed after {} of {} commands: {}",
            report.completed,
            report.total,
            report.error.unwrap_or_default()
        ),
    }
}

fn estimate_job_file(profile: MachineProfile, path: &Path) -> Result<()> {
    let job = BuildJob::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    let estimate = job.estimate(Arc::new(profile))?;
    let secs = estimate.duration.as_secs();
    println!(
        "{}: {} commands, {} moves, about {}h {:02}m {:02}s",
        job.name,
        job.commands.len(),
        estimate.moves,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Ports => {
            print_ports();
            Ok(())
        }

        Commands::InitProfile { path } => {
            let path = match path.clone().or_else(MachineProfile::default_path) {
                Some(p) => p,
                None => bail!("no config directory; pass a path"),
            };
            MachineProfile::default().save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }

        Commands::Estimate { job } => estimate_job_file(load_profile(&cli)?, job),

        Commands::Run { job, no_wait } => {
            let profile = load_profile(&cli)?;
            let options = RunOptions {
                wait_until_finished: !*no_wait,
                ..RunOptions::default()
            };
            run_job_file(&cli, profile, job, options).await
        }

        Commands::Drives { off } => {
            let profile = load_profile(&cli)?;
            let mut driver = open_driver(&cli, profile, CancellationToken::new())?;
            if *off {
                driver.disable_drives()?;
                println!("Stepper drivers off");
            } else {
                driver.enable_drives()?;
                println!("Stepper drivers on");
            }
            Ok(())
        }

        Commands::Reset => {
            let profile = load_profile(&cli)?;
            let mut driver = open_driver(&cli, profile, CancellationToken::new())?;
            let version = driver.reset().context("reset failed")?;
            println!("Machine reset, firmware {}", version);
            Ok(())
        }

        Commands::Info => {
            let profile = load_profile(&cli)?;
            let mut driver = open_driver(&cli, profile, CancellationToken::new())?;
            print_info(&mut driver)
        }

        Commands::Jog {
            x,
            y,
            z,
            feedrate,
            relative,
        } => {
            let profile = load_profile(&cli)?;
            let mut driver = open_driver(&cli, profile, CancellationToken::new())?;
            jog(&mut driver, [*x, *y, *z], *feedrate, *relative)
        }

        Commands::Home {
            axes,
            max,
            feedrate,
        } => {
            let axes = parse_axes(axes)?;
            let direction = if *max {
                HomeDirection::Maximum
            } else {
                HomeDirection::Minimum
            };
            let profile = load_profile(&cli)?;
            let mut driver = open_driver(&cli, profile, CancellationToken::new())?;
            driver.home_axes(axes, direction, *feedrate)?;
            println!("Homing {:?} towards {:?}", axes, direction);
            Ok(())
        }
    }
}
