//! CLI entry point for TransAV1
//!
//! Parses command line arguments, sets up logging and runs one batch.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transav1::config::{PriorityLevel, ProcessingMode};
use transav1::{
    clear_destination, prepare_destination, run_startup_checks, BatchDriver, Config, RunPaths,
};

/// Exit status when the run is interrupted with Ctrl-C
const INTERRUPTED: u8 = 130;

/// TransAV1 - batch conversion of a directory tree to AV1
#[derive(Parser, Debug)]
#[command(name = "transav1")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source directory, or a single video file
    #[arg(short, long)]
    source: PathBuf,

    /// Destination directory
    #[arg(short, long)]
    output: PathBuf,

    /// Optional configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory containing ffmpeg (default: next to this executable, then PATH)
    #[arg(long)]
    ffmpeg_dir: Option<PathBuf>,

    /// Encoder priority: idle, belownormal, normal, abovenormal
    #[arg(long)]
    priority: Option<PriorityLevel>,

    /// Primary (hardware) encoder name
    #[arg(long)]
    hwenc: Option<String>,

    /// Fallback (software) encoder name; empty disables the fallback
    #[arg(long)]
    cpuenc: Option<String>,

    /// Extra ffmpeg options for the primary encoder
    #[arg(long, allow_hyphen_values = true)]
    hwopt: Option<String>,

    /// Extra ffmpeg options for the fallback encoder
    #[arg(long, allow_hyphen_values = true)]
    cpuopt: Option<String>,

    /// Per-attempt timeout in seconds (0 disables)
    #[arg(long)]
    timeout: Option<u64>,

    /// Encode in place without a staging copy (faster, riskier)
    #[arg(long)]
    quick: bool,

    /// Also write the log to a file in the destination directory
    #[arg(long)]
    log: bool,

    /// Verbose logging, including all ffmpeg output
    #[arg(long)]
    debug: bool,

    /// Remove failure markers and empty videos from the destination first
    #[arg(long)]
    restart: bool,

    /// Delete the destination directory first (asks for confirmation)
    #[arg(long)]
    force: bool,
}

impl Args {
    /// Command line values take precedence over file and environment.
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.ffmpeg_dir {
            config.encoder.ffmpeg_dir = Some(dir.clone());
        }
        if let Some(priority) = self.priority {
            config.process.priority = priority;
        }
        if let Some(hwenc) = &self.hwenc {
            config.encoder.primary = hwenc.clone();
        }
        if let Some(cpuenc) = &self.cpuenc {
            config.encoder.fallback = cpuenc.clone();
        }
        if let Some(hwopt) = &self.hwopt {
            config.encoder.primary_options = hwopt.clone();
        }
        if let Some(cpuopt) = &self.cpuopt {
            config.encoder.fallback_options = cpuopt.clone();
        }
        if let Some(timeout) = self.timeout {
            config.encoder.timeout_secs = timeout;
        }
        if self.quick {
            config.processing.mode = ProcessingMode::Direct;
        }
        if self.log {
            config.logging.log_to_file = true;
        }
        if self.debug {
            config.logging.debug = true;
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env(),
    };
    args.apply(&mut config);
    Ok(config)
}

fn open_log_file(destination: &Path, started: &DateTime<Local>) -> Result<(PathBuf, File)> {
    if !destination.is_dir() {
        anyhow::bail!(
            "Log directory {} does not exist, no log file is written",
            destination.display()
        );
    }
    let path = destination.join(format!(
        "TransAV1_Log_{}.log",
        started.format("%Y%m%d_%H%M%S")
    ));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Cannot open log file {}", path.display()))?;
    Ok((path, file))
}

fn init_logging(destination: &Path, config: &Config, started: &DateTime<Local>) {
    let level = if config.logging.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,transav1={}", level)));

    let (log_path, file_error, file_layer) = if config.logging.log_to_file {
        match open_log_file(destination, started) {
            Ok((path, file)) => (
                Some(path),
                None,
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                ),
            ),
            Err(e) => (None, Some(e), None),
        }
    } else {
        (None, None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    if let Some(path) = log_path {
        info!("Log file: {}", path.display());
    }
    if let Some(e) = file_error {
        warn!("{:#} (logging to the console only)", e);
    }
    if config.logging.debug {
        info!("Debug logging enabled");
    }
}

/// Ask for an explicit `yes` before deleting the destination.
fn confirm_force(destination: &Path) -> Result<bool> {
    warn!(
        "--force given: the destination {} will be deleted entirely",
        destination.display()
    );
    print!("Really delete it? (yes/no): ");
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

async fn run(args: Args, started: DateTime<Local>) -> Result<ExitCode> {
    let config = load_config(&args)?;
    init_logging(&args.output, &config, &started);

    let paths = RunPaths::resolve(&args.source, &args.output)?;
    info!("Source: {}", paths.source.display());
    info!("Destination: {}", paths.destination.display());

    let (ffmpeg, plan) = run_startup_checks(&config)?;

    if args.force {
        if !confirm_force(&paths.destination)? {
            info!("Deletion cancelled, nothing was processed");
            return Ok(ExitCode::SUCCESS);
        }
        clear_destination(&paths.destination)?;
    }

    prepare_destination(&paths, args.restart)?;

    let driver = BatchDriver::from_config(&config, ffmpeg, plan)?;
    let summary = tokio::select! {
        summary = driver.run(&paths) => Some(summary),
        _ = tokio::signal::ctrl_c() => None,
    };
    driver.finish();

    match summary {
        Some(summary) => {
            summary.log();
            Ok(if summary.has_errors() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        None => {
            warn!(
                "Interrupted after {}s; the item in progress was restored and scratch files removed",
                (Local::now() - started).num_seconds()
            );
            Ok(ExitCode::from(INTERRUPTED))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let started = Local::now();
    let args = Args::parse();

    match run(args, started).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
