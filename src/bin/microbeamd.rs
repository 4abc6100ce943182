//! Microbeam Daemon - scan run control and broadcast servers
//!
//! This binary drives the beam over the target, counts hits through the
//! trigger backend and publishes scan progress to subscribers.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground, real hardware through pigpiod)
//! microbeamd start
//!
//! # Start without hardware, hits come from the simulator
//! microbeamd start --simulate
//!
//! # Start the daemon (background/daemonized)
//! microbeamd start -d
//!
//! # Stop the daemon
//! microbeamd stop
//!
//! # Check daemon status
//! microbeamd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use microbeam_hw::{PigpioBackend, SimulatedBackend, TriggerBackend};
use microbeamd::config::{BackendKind, DaemonConfig};
use microbeamd::control::ControlServer;
use microbeamd::controller::spawn_controller;
use microbeamd::run_log::RunLogFile;
use microbeamd::subscribers::{SubscriberHub, SubscriberServer};

/// How long an active run may take to unwind on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Microbeam daemon - raster scan run control
#[derive(Parser, Debug)]
#[command(name = "microbeamd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start(StartArgs),
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

#[derive(clap::Args, Debug, Default)]
struct StartArgs {
    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Configuration file (default: $MICROBEAM_CONFIG, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the hit simulator instead of pigpiod
    #[arg(long)]
    simulate: bool,

    /// Directory holding run.id, cal.json and the run directories
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Require an ack from the primary subscriber at every scan point
    #[arg(long)]
    wait_for_ack: bool,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("microbeam")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("microbeamd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("microbeamd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Loads the configuration and applies command line overrides.
fn load_config(args: &StartArgs) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if args.simulate {
        config.hardware.backend = BackendKind::Simulated;
    }
    if let Some(run_dir) = &args.run_dir {
        config.run_dir = run_dir.clone();
    }
    if args.wait_for_ack {
        config.wait_for_client_ack = true;
    }
    // daemonizing changes the working directory
    config.run_dir = absolute(&config.run_dir)?;
    if let Some(fifo) = config.latch_fifo.take() {
        config.latch_fifo = Some(absolute(&fifo)?);
    }
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to resolve the working directory")?;
    Ok(cwd.join(path))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args
        .command
        .unwrap_or_else(|| Command::Start(StartArgs::default()));

    match command {
        Command::Start(start) => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'microbeamd stop' to stop it first.");
                process::exit(1);
            }

            let config = load_config(&start)?;

            if start.daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // an active run is wound down first
                for _ in 0..150 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 15 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                if let Ok(config) = DaemonConfig::load(None) {
                    println!("Control: {}", config.control_addr);
                    println!("Subscribers: {}", config.subscriber_addr);
                    println!("Run directory: {}", config.run_dir.display());
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

/// Console output plus the per-run log file.
fn init_logging(run_log: &RunLogFile) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("microbeamd=info".parse()?)
        .add_directive("microbeam_hw=info".parse()?)
        .add_directive("microbeam_core=info".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(run_log.clone()))
        .try_init()
        .context("Failed to install the log subscriber")?;
    Ok(())
}

async fn connect_backend(config: &DaemonConfig) -> Result<Arc<dyn TriggerBackend>> {
    let backend: Arc<dyn TriggerBackend> = match config.hardware.backend {
        BackendKind::Simulated => Arc::new(SimulatedBackend::new(
            config.hardware.trigger(),
            config.simulation.clone(),
        )),
        BackendKind::Pigpio => {
            let pigpio = config.hardware.pigpio();
            let addr = pigpio.addr.clone();
            let backend = PigpioBackend::connect(pigpio)
                .await
                .with_context(|| format!("Failed to connect to pigpiod at {addr}"))?;
            Arc::new(backend)
        }
    };
    Ok(backend)
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let run_log = RunLogFile::new();
    init_logging(&run_log)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        backend = ?config.hardware.backend,
        run_dir = %config.run_dir.display(),
        "Microbeam daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let backend = match connect_backend(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "Trigger backend unavailable");
            return Err(e);
        }
    };
    info!(backend = backend.name(), "Trigger backend ready");

    let hub = SubscriberHub::new();
    let subscribers =
        SubscriberServer::bind(&config.subscriber_addr, hub.clone(), cancel_token.clone()).await?;

    let controller = spawn_controller(
        config.controller_settings(),
        backend,
        hub,
        run_log,
        cancel_token.clone(),
    )?;
    info!("Run controller started");

    let control =
        ControlServer::bind(&config.control_addr, controller.clone(), cancel_token.clone())
            .await?;

    let subscriber_task = tokio::spawn(subscribers.run());

    info!(addr = %config.control_addr, "Starting control server");
    if let Err(e) = control.run().await {
        error!(error = %e, "Control server error");
        cancel_token.cancel();
    }

    match subscriber_task.await {
        Ok(Err(e)) => error!(error = %e, "Subscriber server error"),
        Err(e) => error!(error = %e, "Subscriber server task failed"),
        Ok(Ok(())) => {}
    }

    // the controller closes an active run and parks the hardware before exiting
    let start = Instant::now();
    while controller.is_connected() {
        if start.elapsed() > SHUTDOWN_GRACE {
            warn!("Run controller did not stop in time");
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    info!("Microbeam daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
