use anyhow::Context;
use clap::{ArgAction, Parser};
use dashsync::{Grouping, Mode, Priority, RetentionPolicy, SyncConfig, SyncEngine, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dashsync")]
#[command(about = "Sync recordings from a Wi-Fi dashcam to local storage", long_about = None)]
#[command(version)]
struct Args {
    /// Dashcam IP address or host name
    address: String,

    /// Download directory
    #[arg(short, long, default_value = ".")]
    destination: PathBuf,

    /// Group recordings into subdirectories by capture date
    #[arg(short, long, value_enum, default_value_t = Grouping::None)]
    grouping: Grouping,

    /// Download order
    #[arg(short, long, value_enum, default_value_t = Priority::Date)]
    priority: Priority,

    /// Only sync recordings whose filename contains one of these substrings
    #[arg(short, long, num_args = 1..)]
    filter: Vec<String>,

    /// Keep recordings for <number>[d|w], e.g. 30d or 2w
    #[arg(short, long)]
    keep: Option<String>,

    /// Stop downloading once the destination volume is this full (percent)
    #[arg(short = 'u', long, default_value_t = 90)]
    max_used_disk: u8,

    /// Camera connect and read timeout in seconds
    #[arg(short, long, default_value_t = 10.0)]
    timeout: f64,

    /// More logging (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log unrecoverable errors
    #[arg(short, long)]
    quiet: bool,

    /// Log what would be downloaded or deleted without doing it
    #[arg(long)]
    dry_run: bool,

    /// Write a GPX track next to every downloaded recording
    #[arg(long)]
    gps_extract: bool,

    /// Run a single pass and exit (default)
    #[arg(long)]
    run_once: bool,

    /// Keep running, re-scanning the camera every interval
    #[arg(long)]
    monitor: bool,

    /// Pause between passes in monitor mode, e.g. 10m or 90s
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    interval: Duration,
}

impl Args {
    /// Validates policy values and builds the engine configuration.
    fn into_config(self) -> Result<(SyncConfig, Mode), SyncError> {
        if self.run_once && self.monitor {
            return Err(SyncError::ConfigInvalid(
                "--run-once and --monitor are mutually exclusive".to_string(),
            ));
        }
        if self.max_used_disk > 100 {
            return Err(SyncError::ConfigInvalid(format!(
                "max-used-disk must be between 0 and 100, got {}",
                self.max_used_disk
            )));
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(SyncError::ConfigInvalid(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout
            )));
        }
        if self.monitor && self.interval.is_zero() {
            return Err(SyncError::ConfigInvalid("interval must not be zero".to_string()));
        }
        let keep = self
            .keep
            .as_deref()
            .map(str::parse::<RetentionPolicy>)
            .transpose()?;

        let mode = if self.monitor {
            Mode::Monitor {
                interval: self.interval,
            }
        } else {
            Mode::RunOnce
        };
        let config = SyncConfig {
            address: self.address,
            destination: self.destination,
            grouping: self.grouping,
            priority: self.priority,
            filters: self.filter,
            keep,
            max_used_disk: self.max_used_disk,
            timeout: Duration::from_secs_f64(self.timeout),
            dry_run: self.dry_run,
            gps_extract: self.gps_extract,
            show_progress: !self.quiet && atty::is(atty::Stream::Stderr),
            ..SyncConfig::default()
        };
        Ok((config, mode))
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let log_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dashsync={}", log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Flips the shutdown flag on Ctrl-C or SIGTERM. The engine picks it up
/// between transfers.
fn spawn_signal_listener(stop: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Stop requested, finishing the current transfer");
        let _ = stop.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (config, mode) = args.into_config()?;

    info!("🚀 dashsync {}", env!("CARGO_PKG_VERSION"));
    info!("Camera: {}", config.address);
    info!("Destination: {:?}", config.destination);
    if let Some(keep) = config.keep {
        info!("Keeping recordings for {} days", keep.days);
    }
    if config.dry_run {
        info!("Dry run: nothing will be written or deleted");
    }

    let engine = SyncEngine::new(config).context("Failed to set up the camera client")?;
    let (stop, shutdown) = watch::channel(false);
    spawn_signal_listener(stop);

    engine.run(mode, shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ Error: {:#}", e);
            match e.downcast_ref::<SyncError>() {
                Some(SyncError::ConfigInvalid(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
