//! Startup checks module for TransAV1
//!
//! Resolves the ffmpeg executable and validates the encoder configuration
//! before any file is touched.

use crate::config::Config;
use crate::item::{AttemptPlan, ProcessingError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not found (looked in {searched} and on PATH)")]
    FfmpegNotFound { searched: String },

    #[error("Invalid encoder configuration: {0}")]
    Encoder(#[from] ProcessingError),
}

/// Platform file name of the ffmpeg executable.
pub fn ffmpeg_binary_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

/// Directory holding the running executable, where a bundled ffmpeg
/// is looked for when no directory is configured.
pub fn default_ffmpeg_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Locate ffmpeg.
///
/// Looks for `<dir>/ffmpeg[.exe]` first, then searches `PATH`.
///
/// # Arguments
///
/// * `ffmpeg_dir` - configured directory, or `None` for the executable's own directory
pub fn resolve_ffmpeg(ffmpeg_dir: Option<&Path>) -> Result<PathBuf, StartupError> {
    let dir = ffmpeg_dir.map(Path::to_path_buf).or_else(default_ffmpeg_dir);
    resolve_ffmpeg_in(dir.as_deref(), std::env::var_os("PATH"))
}

/// [`resolve_ffmpeg`] with an explicit search path.
pub fn resolve_ffmpeg_in(
    ffmpeg_dir: Option<&Path>,
    search_path: Option<OsString>,
) -> Result<PathBuf, StartupError> {
    let name = ffmpeg_binary_name();

    if let Some(dir) = ffmpeg_dir {
        let candidate = dir.join(name);
        match which::which(&candidate) {
            Ok(found) => {
                info!("Using ffmpeg: {}", found.display());
                return Ok(found);
            }
            Err(_) if candidate.exists() => {
                warn!("{} exists but is not executable", candidate.display())
            }
            Err(_) => {}
        }
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match which::which_in(name, search_path, cwd) {
        Ok(found) => {
            info!("Using ffmpeg from PATH: {}", found.display());
            Ok(found)
        }
        Err(_) => Err(StartupError::FfmpegNotFound {
            searched: ffmpeg_dir
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "<no directory>".to_string()),
        }),
    }
}

/// Run all startup checks.
///
/// # Returns
///
/// The resolved ffmpeg path and the encoder plan for the run.
pub fn run_startup_checks(cfg: &Config) -> Result<(PathBuf, AttemptPlan), StartupError> {
    let plan = AttemptPlan::from_config(cfg)?;
    let ffmpeg = resolve_ffmpeg(cfg.encoder.ffmpeg_dir.as_deref())?;

    info!(
        "Encoders: {} ({}), fallback: {}",
        plan.primary().encoder_id,
        plan.primary().encoder_options,
        plan.fallback()
            .map(|f| format!("{} ({})", f.encoder_id, f.encoder_options))
            .unwrap_or_else(|| "none".to_string())
    );
    match cfg.encode_timeout() {
        Some(timeout) => info!("Encode timeout: {}s per attempt", timeout.as_secs()),
        None => info!("Encode timeout: disabled"),
    }

    Ok((ffmpeg, plan))
}
