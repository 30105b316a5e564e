//! octant-init - process 1 for octant nodes.
//!
//! Boots the node, supervises launched services, and on SIGTERM, SIGUSR1 or
//! SIGUSR2 stops them and reboots, halts or powers off.
//!
//! # Failure Handling
//!
//! Process 1 exiting panics the kernel. Any error that ends the init run
//! therefore drops to the emergency shell when running as process 1,
//! including a runtime or signal handler that cannot be set up. Arguments
//! the kernel passes through are ignored rather than rejected. Outside process 1 (for example with
//! `--dry-run` in a container) errors are returned and the binary exits
//! non-zero.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use octant_core::MembraneController;
use octant_core::cgroup::CgroupTree;
use octant_core::config::{ConfigStore, DEFAULT_CONFIG_PATH};
use octant_core::store::{FsStateStore, StateStore};
use octant_init::boot::BootSequencer;
use octant_init::platform::{LinuxPlatform, Platform, RecordingPlatform};
use octant_init::signals::ShutdownSignals;
use octant_init::state::{InitStateHandle, SharedState};
use octant_init::{emergency, shutdown, supervise};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// octant init - boots and supervises an octant node
#[derive(Parser, Debug)]
#[command(name = "octant-init")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to node configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level filter (tracing `EnvFilter` syntax)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Record mounts, hostname changes and the terminal action instead of
    /// performing them
    #[arg(long)]
    dry_run: bool,
}

/// Synchronous entry point; builds the Tokio runtime by hand.
fn main() -> Result<()> {
    let is_pid1 = std::process::id() == 1;
    let args = parse_args(std::env::args_os(), is_pid1).unwrap_or_else(|e| e.exit());
    init_logging(&args);

    let platform: Arc<dyn Platform> = if args.dry_run {
        Arc::new(RecordingPlatform::new())
    } else {
        Arc::new(LinuxPlatform::new())
    };
    settle(run(args, Arc::clone(&platform)), platform.as_ref())
}

/// Parses the command line. As process 1, arguments that do not parse
/// (kernel boot parameters) fall back to the defaults.
fn parse_args<I, T>(argv: I, is_pid1: bool) -> Result<Args, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Args::try_parse_from(argv) {
        Err(e) if is_pid1 => {
            eprintln!("octant-init: ignoring arguments: {}", e.kind());
            Args::try_parse_from(["octant-init"])
        },
        parsed => parsed,
    }
}

/// Routes the outcome of the init run: process 1 never returns an error.
fn settle(result: Result<()>, platform: &dyn Platform) -> Result<()> {
    match result {
        Err(e) if platform.is_pid1() => emergency::enter(platform, e.as_ref()),
        result => result,
    }
}

fn run(args: Args, platform: Arc<dyn Platform>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, platform))
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let file = args.log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("octant-init: cannot open log file {}: {e}", path.display()))
            .ok()
    });

    if let Some(file) = file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        // Console logging; also the fallback when the log file is unusable,
        // since process 1 cannot bail out here.
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(path: &Path) -> ConfigStore {
    match ConfigStore::load(path) {
        Ok(config) => {
            info!(
                path = %path.display(),
                services = config.config().services.len(),
                "configuration loaded"
            );
            config
        },
        Err(e) => {
            error!(
                path = %path.display(),
                error = %e,
                "configuration unusable, booting with defaults"
            );
            ConfigStore::default()
        },
    }
}

async fn async_main(args: Args, platform: Arc<dyn Platform>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "octant-init starting");

    // Before phase 1: a signal during boot is held, not lost.
    let mut signals = ShutdownSignals::install().context("failed to register signal handlers")?;

    let config = Arc::new(load_config(&args.config));
    if args.dry_run {
        info!("dry run: OS actions are recorded, not performed");
    }

    let paths = &config.config().paths;
    let store: Arc<dyn StateStore> = Arc::new(FsStateStore::new(&paths.state_dir));
    let membranes = Arc::new(MembraneController::new(
        store,
        CgroupTree::with_root(&paths.cgroup_root),
    ));
    let state: SharedState = Arc::new(InitStateHandle::new(
        Arc::clone(&config),
        membranes,
        platform,
    ));

    let sequencer = BootSequencer::new(Arc::clone(&state));
    let boot = tokio::task::spawn_blocking(move || sequencer.run())
        .await
        .context("boot task panicked")?;
    let summary = boot.context("boot failed")?;
    if !summary.warnings.is_empty() {
        warn!(count = summary.warnings.len(), "boot finished with warnings");
    }

    let interval = config.config().supervision.interval;
    let supervisor = tokio::spawn(supervise::run(
        Arc::clone(&state),
        interval,
        state.shutdown_token(),
    ));

    let action = signals.next_action().await;
    info!(%action, uptime_secs = state.uptime_secs(), "shutdown requested");

    state.request_shutdown();
    if let Err(e) = supervisor.await {
        warn!(error = %e, "supervision task ended abnormally");
    }

    shutdown::reverse_sequence(&state).await;
    if let Err(e) = shutdown::finish(&state, action) {
        error!(error = %e, %action, "terminal action failed");
        return Err(e).context("terminal action failed");
    }
    Ok(())
}
