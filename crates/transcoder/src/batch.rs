//! Batch driver for TransAV1
//!
//! Validates the run paths, copies images and other files verbatim, then
//! feeds every video through the item state machine one at a time and
//! aggregates the per-item errors into a run summary.

use crate::config::Config;
use crate::encode::{EngineConfig, Encoder, FfmpegEngine};
use crate::fsops::{self, CopyOutcome};
use crate::item::{AttemptPlan, ItemOutcome, ItemProcessor, ProcessingItem};
use crate::restart::{self, RestartReport};
use crate::scan::{self, ScanResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors listed individually in the run summary.
pub const MAX_LISTED_ERRORS: usize = 20;

/// Error type for run-level failures
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Cannot access source {}: {source}", .path.display())]
    SourceUnavailable { path: PathBuf, source: io::Error },

    #[error("Source and destination are the same: {}", .0.display())]
    SameLocation(PathBuf),

    #[error("Destination {} is not a directory", .0.display())]
    DestinationNotDirectory(PathBuf),

    #[error("Single-file mode needs an existing destination directory: {}", .0.display())]
    DestinationMissing(PathBuf),

    #[error(
        "{} is not a supported video file (supported: {})",
        .0.display(),
        scan::extension_list(scan::VIDEO_EXTENSIONS)
    )]
    NotAVideo(PathBuf),

    #[error("Failed to {action} {}: {source}", .path.display())]
    Destination {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to create scratch area: {0}")]
    Scratch(#[source] io::Error),
}

/// Validated source and destination of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// The source is a single video rather than a directory
    pub single_file: bool,
}

fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl RunPaths {
    /// Resolve and validate the source and destination.
    ///
    /// A directory source may have a destination that does not exist yet;
    /// a single-file source needs an existing destination directory.
    pub fn resolve(source: &Path, destination: &Path) -> Result<Self, BatchError> {
        let source = absolutize(source).map_err(|e| BatchError::SourceUnavailable {
            path: source.to_path_buf(),
            source: e,
        })?;
        let destination = absolutize(destination).map_err(|e| BatchError::Destination {
            action: "resolve",
            path: destination.to_path_buf(),
            source: e,
        })?;

        let source_meta = fs::metadata(&source).map_err(|e| BatchError::SourceUnavailable {
            path: source.clone(),
            source: e,
        })?;
        let single_file = !source_meta.is_dir();

        let same = source == destination
            || matches!(
                (fs::canonicalize(&source), fs::canonicalize(&destination)),
                (Ok(a), Ok(b)) if a == b
            );
        if same {
            return Err(BatchError::SameLocation(source));
        }

        match fs::metadata(&destination) {
            Ok(meta) if !meta.is_dir() => {
                return Err(BatchError::DestinationNotDirectory(destination))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if single_file {
                    return Err(BatchError::DestinationMissing(destination));
                }
                info!(
                    "Destination {} does not exist and will be created",
                    destination.display()
                );
            }
            Err(e) => {
                return Err(BatchError::Destination {
                    action: "access",
                    path: destination,
                    source: e,
                })
            }
        }

        if single_file && !scan::is_video_file(&source) {
            return Err(BatchError::NotAVideo(source));
        }

        Ok(Self {
            source,
            destination,
            single_file,
        })
    }
}

/// Delete the destination tree entirely. The caller confirms first.
pub fn clear_destination(destination: &Path) -> Result<(), BatchError> {
    warn!("Deleting destination {}", destination.display());
    match fs::remove_dir_all(destination) {
        Ok(()) => {
            info!("Destination deleted");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BatchError::Destination {
            action: "delete",
            path: destination.to_path_buf(),
            source: e,
        }),
    }
}

/// Create the destination and optionally run the restart pass over it.
pub fn prepare_destination(
    paths: &RunPaths,
    restart: bool,
) -> Result<Option<RestartReport>, BatchError> {
    fs::create_dir_all(&paths.destination).map_err(|e| BatchError::Destination {
        action: "create",
        path: paths.destination.clone(),
        source: e,
    })?;
    Ok(restart.then(|| restart::clean_destination(&paths.destination)))
}

/// Counters and errors of one run.
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub elapsed: Duration,
    pub published: usize,
    pub skipped: usize,
    pub copied: usize,
    pub errors: Vec<String>,
}

impl BatchSummary {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Error lines for the summary, capped at [`MAX_LISTED_ERRORS`].
    pub fn error_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .errors
            .iter()
            .take(MAX_LISTED_ERRORS)
            .enumerate()
            .map(|(i, e)| format!("  [{}] {}", i + 1, e))
            .collect();
        if self.errors.len() > MAX_LISTED_ERRORS {
            lines.push(format!(
                "  ...and {} more errors (see the log)",
                self.errors.len() - MAX_LISTED_ERRORS
            ));
        }
        lines
    }

    pub fn log(&self) {
        info!(
            "Total time: {}s ({} published, {} skipped, {} copied)",
            self.elapsed.as_secs(),
            self.published,
            self.skipped,
            self.copied
        );
        if self.has_errors() {
            warn!("--- {} errors during the run ---", self.errors.len());
            for line in self.error_lines() {
                warn!("{}", line);
            }
        } else {
            info!("All items completed without errors");
        }
    }
}

fn label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Runs every item of a batch through one [`ItemProcessor`].
pub struct BatchDriver<E: Encoder> {
    processor: ItemProcessor<E>,
    output_suffix: String,
}

impl BatchDriver<FfmpegEngine> {
    /// Driver backed by the real ffmpeg engine.
    pub fn from_config(
        config: &Config,
        ffmpeg_path: PathBuf,
        plan: AttemptPlan,
    ) -> Result<Self, BatchError> {
        let engine = FfmpegEngine::new(EngineConfig::from_config(config, ffmpeg_path));
        let processor = ItemProcessor::new(engine, plan, config.processing.mode)
            .map_err(BatchError::Scratch)?;
        info!("Processing mode: {}", processor.mode());
        Ok(Self::new(processor, config.processing.output_suffix.clone()))
    }
}

impl<E: Encoder> BatchDriver<E> {
    pub fn new(processor: ItemProcessor<E>, output_suffix: impl Into<String>) -> Self {
        Self {
            processor,
            output_suffix: output_suffix.into(),
        }
    }

    /// Release the scratch area.
    pub fn finish(self) {
        self.processor.finish();
    }

    /// Process everything under `paths`.
    pub async fn run(&self, paths: &RunPaths) -> BatchSummary {
        let started = Instant::now();
        let mut summary = BatchSummary::default();

        if paths.single_file {
            info!("--- Single file mode ---");
            let parent = paths.source.parent().unwrap_or(Path::new(""));
            self.process_video(
                &paths.source,
                parent,
                &paths.destination,
                &mut summary,
            )
            .await;
        } else {
            info!("--- Directory mode ---");
            let exclude = paths
                .destination
                .starts_with(&paths.source)
                .then_some(paths.destination.as_path());
            let ScanResult {
                videos,
                images,
                others,
            } = scan::scan_source(&paths.source, exclude);

            info!("--- Copying {} images ---", images.len());
            self.copy_all(&images, paths, &mut summary);
            info!("--- Copying {} other files ---", others.len());
            self.copy_all(&others, paths, &mut summary);

            info!("--- Encoding {} videos ---", videos.len());
            let total = videos.len();
            for (index, video) in videos.iter().enumerate() {
                info!("--- Video {}/{}: {} ---", index + 1, total, label(video));
                self.process_video(video, &paths.source, &paths.destination, &mut summary)
                    .await;
            }
        }

        summary.elapsed = started.elapsed();
        summary
    }

    fn copy_all(&self, files: &[PathBuf], paths: &RunPaths, summary: &mut BatchSummary) {
        for file in files {
            let target = match scan::mirror_path(file, &paths.source, &paths.destination) {
                Ok(target) => target,
                Err(e) => {
                    warn!("{}", e);
                    summary.errors.push(format!("{}: {}", label(file), e));
                    continue;
                }
            };
            debug!("Copying {} -> {}", file.display(), target.display());
            match fsops::copy_verbatim(file, &target) {
                Ok(CopyOutcome::Copied(_)) => summary.copied += 1,
                Ok(CopyOutcome::SkippedExisting) => summary.skipped += 1,
                Err(e) => {
                    warn!("Copy of {} failed: {}", file.display(), e);
                    summary.errors.push(format!("{}: {}", label(file), e));
                }
            }
        }
    }

    async fn process_video(
        &self,
        video: &Path,
        src_root: &Path,
        dst_root: &Path,
        summary: &mut BatchSummary,
    ) {
        let output = match scan::output_path(video, src_root, dst_root, &self.output_suffix) {
            Ok(output) => output,
            Err(e) => {
                warn!("{}", e);
                summary.errors.push(format!("{}: {}", label(video), e));
                return;
            }
        };
        if let Some(parent) = output.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Could not create {}: {}", parent.display(), e);
                summary.errors.push(format!("{}: {}", label(video), e));
                return;
            }
        }

        info!("{} -> {}", video.display(), output.display());
        let item = ProcessingItem::new(video, output);
        match self.processor.process(&item).await {
            Ok(ItemOutcome::Published { .. }) => summary.published += 1,
            Ok(ItemOutcome::Skipped(_)) => summary.skipped += 1,
            Err(e) => {
                warn!("{} failed: {}", label(video), e);
                summary.errors.push(format!("{}: {}", label(video), e));
            }
        }
    }
}
