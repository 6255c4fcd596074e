//! Item processing state machine.
//!
//! One video item goes through
//! `PreCheck -> ModeSelect -> Attempt(primary) -> [Attempt(fallback)] -> Publish | Fail`.
//! Every step returns a [`StepOutcome`] naming the next state or the final
//! result, and [`ItemProcessor::process`] drives the loop. Cleanup happens in
//! the terminal steps, so every exit path leaves the source under its own
//! name and the final output either absent or complete.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, ProcessingMode};
use crate::encode::{EncodeAttempt, EncodeResult, Encoder, ExitClass};
use crate::fsops::{self, CopyError, MoveError};
use crate::marker::{self, MarkerKind};
use crate::scratch::ScratchArea;

/// Appended to the source name while direct mode owns it.
pub const PROCESSING_SUFFIX: &str = ".processing";

/// One unit of work handed over by the batch driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingItem {
    pub source_path: PathBuf,
    pub final_output_path: PathBuf,
}

impl ProcessingItem {
    pub fn new(source_path: impl Into<PathBuf>, final_output_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            final_output_path: final_output_path.into(),
        }
    }
}

/// Which configured encoder an attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Fallback,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Primary => write!(f, "primary"),
            Tier::Fallback => write!(f, "fallback"),
        }
    }
}

/// The primary attempt and the optional fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    primary: EncodeAttempt,
    fallback: Option<EncodeAttempt>,
}

impl AttemptPlan {
    pub fn new(primary: EncodeAttempt, fallback: Option<EncodeAttempt>) -> Self {
        Self { primary, fallback }
    }

    /// Build the plan from the `[encoder]` section.
    ///
    /// An empty primary promotes the fallback to the only attempt. Both
    /// attempts get the same deadline, each measured from its own start.
    pub fn from_config(config: &Config) -> Result<Self, ProcessingError> {
        let encoder = &config.encoder;
        let deadline = config.encode_timeout();
        let attempt = |id: &str, options: &str| {
            let id = id.trim();
            (!id.is_empty()).then(|| EncodeAttempt::new(id, options, deadline))
        };

        let primary = attempt(&encoder.primary, &encoder.primary_options);
        let fallback = attempt(&encoder.fallback, &encoder.fallback_options);

        match (primary, fallback) {
            (Some(primary), fallback) => Ok(Self::new(primary, fallback)),
            (None, Some(fallback)) => {
                info!(
                    "No primary encoder configured, using {} as the only encoder",
                    fallback.encoder_id
                );
                Ok(Self::new(fallback, None))
            }
            (None, None) => Err(ProcessingError::NoEncoder),
        }
    }

    pub fn primary(&self) -> &EncodeAttempt {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&EncodeAttempt> {
        self.fallback.as_ref()
    }

    pub fn attempt(&self, tier: Tier) -> Option<&EncodeAttempt> {
        match tier {
            Tier::Primary => Some(&self.primary),
            Tier::Fallback => self.fallback.as_ref(),
        }
    }
}

/// A failed encode, with its fields kept apart until display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeFailure {
    pub encoder_id: String,
    pub exit_class: ExitClass,
    pub timed_out: bool,
    pub diagnostic_text: String,
}

impl EncodeFailure {
    pub fn new(attempt: &EncodeAttempt, result: &EncodeResult) -> Self {
        Self {
            encoder_id: attempt.encoder_id.clone(),
            exit_class: result.exit_class,
            timed_out: result.exit_class.is_timeout(),
            diagnostic_text: result.diagnostic(),
        }
    }
}

impl fmt::Display for EncodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Encoder {} failed: {} (code {}, timed out: {})",
            self.encoder_id,
            self.exit_class,
            self.exit_class.code(),
            self.timed_out
        )?;
        if let Some(first) = self.diagnostic_text.lines().find(|l| !l.trim().is_empty()) {
            write!(f, ": {}", first.trim())?;
        }
        Ok(())
    }
}

impl std::error::Error for EncodeFailure {}

/// Errors that end an item.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Every planned attempt failed.
    #[error("{0}")]
    Encode(EncodeFailure),

    /// A rename, delete or directory creation failed.
    #[error("Failed to {action} {}: {source}", .path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// The source could not be copied into the scratch area.
    #[error("Failed to stage input: {0}")]
    Stage(#[source] CopyError),

    /// The encoded file could not be moved into place.
    #[error("Failed to publish output: {0}")]
    Publish(#[source] MoveError),

    /// Neither a primary nor a fallback encoder is configured.
    #[error("No encoder configured")]
    NoEncoder,
}

impl ProcessingError {
    fn filesystem(action: &'static str, path: &Path, source: io::Error) -> Self {
        ProcessingError::Filesystem {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why an item was not encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A non-empty output is already in place
    OutputExists,
    /// A previous run recorded a terminal failure
    MarkerPresent(MarkerKind),
}

/// How an item ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Skipped(SkipReason),
    Published { encoder_id: String, tier: Tier },
}

/// Paths an in-flight item owns, by mode.
#[derive(Debug)]
enum Workspace {
    Staged {
        staging_input: PathBuf,
        staging_output: PathBuf,
    },
    Direct {
        processing_path: PathBuf,
    },
}

impl Workspace {
    /// Encoder input and output.
    fn encode_paths<'a>(&'a self, item: &'a ProcessingItem) -> (&'a Path, &'a Path) {
        match self {
            Workspace::Staged {
                staging_input,
                staging_output,
            } => (staging_input.as_path(), staging_output.as_path()),
            Workspace::Direct { processing_path } => {
                (processing_path.as_path(), item.final_output_path.as_path())
            }
        }
    }
}

/// Puts an in-flight item back if its encode is abandoned.
///
/// The encode await is the only point where [`ItemProcessor::process`] can
/// be cancelled, so the guard is armed around it alone.
struct AbandonGuard<'a> {
    item: &'a ProcessingItem,
    workspace: &'a Workspace,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn arm(item: &'a ProcessingItem, workspace: &'a Workspace) -> Self {
        Self {
            item,
            workspace,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "Encode of {} interrupted, restoring it",
            self.item.source_path.display()
        );
        if let Workspace::Direct { processing_path } = self.workspace {
            restore_source(self.item, processing_path);
            fsops::remove_quietly(&self.item.final_output_path, "partial output");
        }
        release(self.workspace);
    }
}

struct AttemptFailure {
    attempt: EncodeAttempt,
    result: EncodeResult,
}

enum State {
    PreCheck,
    ModeSelect,
    Attempt { tier: Tier, workspace: Workspace },
    Publish { tier: Tier, workspace: Workspace },
    Fail { failure: AttemptFailure, workspace: Workspace },
}

enum StepOutcome {
    Next(State),
    Done(Result<ItemOutcome, ProcessingError>),
}

enum Strategy {
    Staged(ScratchArea),
    Direct,
}

/// Drives items through the state machine, one at a time.
pub struct ItemProcessor<E: Encoder> {
    encoder: E,
    plan: AttemptPlan,
    strategy: Strategy,
}

impl<E: Encoder> ItemProcessor<E> {
    /// Processor for `mode`; staged mode creates its scratch area here.
    pub fn new(encoder: E, plan: AttemptPlan, mode: ProcessingMode) -> io::Result<Self> {
        match mode {
            ProcessingMode::Staged => Ok(Self::staged(encoder, plan, ScratchArea::create()?)),
            ProcessingMode::Direct => Ok(Self::direct(encoder, plan)),
        }
    }

    pub fn staged(encoder: E, plan: AttemptPlan, scratch: ScratchArea) -> Self {
        Self {
            encoder,
            plan,
            strategy: Strategy::Staged(scratch),
        }
    }

    pub fn direct(encoder: E, plan: AttemptPlan) -> Self {
        Self {
            encoder,
            plan,
            strategy: Strategy::Direct,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn mode(&self) -> ProcessingMode {
        match self.strategy {
            Strategy::Staged(_) => ProcessingMode::Staged,
            Strategy::Direct => ProcessingMode::Direct,
        }
    }

    /// Remove the scratch area, if any.
    pub fn finish(self) {
        if let Strategy::Staged(scratch) = self.strategy {
            scratch.close();
        }
    }

    /// Process one item to a terminal state.
    pub async fn process(&self, item: &ProcessingItem) -> Result<ItemOutcome, ProcessingError> {
        let mut state = State::PreCheck;
        loop {
            let step = match state {
                State::PreCheck => self.pre_check(item),
                State::ModeSelect => self.select_mode(item),
                State::Attempt { tier, workspace } => self.attempt(item, tier, workspace).await,
                State::Publish { tier, workspace } => self.publish(item, tier, workspace),
                State::Fail { failure, workspace } => self.fail(item, failure, workspace),
            };
            match step {
                StepOutcome::Next(next) => state = next,
                StepOutcome::Done(result) => return result,
            }
        }
    }

    fn pre_check(&self, item: &ProcessingItem) -> StepOutcome {
        let output = &item.final_output_path;

        match fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => {
                info!("Output {} already exists, skipping", output.display());
                return StepOutcome::Done(Ok(ItemOutcome::Skipped(SkipReason::OutputExists)));
            }
            Ok(_) => {
                info!(
                    "Removing empty output {} left by an earlier run",
                    output.display()
                );
                if let Err(e) = fs::remove_file(output) {
                    return StepOutcome::Done(Err(ProcessingError::filesystem(
                        "remove empty output",
                        output,
                        e,
                    )));
                }
            }
            Err(_) => {}
        }

        if let Some((kind, path)) = marker::find_existing_marker(output) {
            info!(
                "Failure marker {} present, skipping {} until restart",
                path.display(),
                item.source_path.display()
            );
            return StepOutcome::Done(Ok(ItemOutcome::Skipped(SkipReason::MarkerPresent(kind))));
        }

        if !item.source_path.is_file() {
            return StepOutcome::Done(Err(ProcessingError::filesystem(
                "find source",
                &item.source_path,
                io::Error::from(io::ErrorKind::NotFound),
            )));
        }

        StepOutcome::Next(State::ModeSelect)
    }

    fn select_mode(&self, item: &ProcessingItem) -> StepOutcome {
        let workspace = match &self.strategy {
            Strategy::Staged(scratch) => {
                let staging_input = scratch.staging_input_path(&item.source_path);
                let staging_output = scratch.staging_output_path(&item.final_output_path);

                debug!(
                    "Staging {} as {}",
                    item.source_path.display(),
                    staging_input.display()
                );
                if let Err(e) = fsops::copy_file_synced(&item.source_path, &staging_input) {
                    if e.is_source_side() {
                        let content = format!("Source unreadable: {}", e);
                        match marker::write_marker(
                            &item.final_output_path,
                            MarkerKind::Unreadable,
                            &content,
                        ) {
                            Ok(path) => warn!("Source unreadable, wrote {}", path.display()),
                            Err(me) => warn!(
                                "Could not write unreadable marker for {}: {}",
                                item.final_output_path.display(),
                                me
                            ),
                        }
                    }
                    return StepOutcome::Done(Err(ProcessingError::Stage(e)));
                }

                Workspace::Staged {
                    staging_input,
                    staging_output,
                }
            }
            Strategy::Direct => {
                let processing_path = fsops::with_suffix(&item.source_path, PROCESSING_SUFFIX);
                if processing_path.exists() {
                    return StepOutcome::Done(Err(ProcessingError::filesystem(
                        "claim in-progress name",
                        &processing_path,
                        io::Error::from(io::ErrorKind::AlreadyExists),
                    )));
                }
                if let Err(e) = fs::rename(&item.source_path, &processing_path) {
                    return StepOutcome::Done(Err(ProcessingError::filesystem(
                        "rename source",
                        &item.source_path,
                        e,
                    )));
                }
                debug!(
                    "Renamed {} to {}",
                    item.source_path.display(),
                    processing_path.display()
                );

                Workspace::Direct { processing_path }
            }
        };

        StepOutcome::Next(State::Attempt {
            tier: Tier::Primary,
            workspace,
        })
    }

    async fn attempt(&self, item: &ProcessingItem, tier: Tier, workspace: Workspace) -> StepOutcome {
        let Some(attempt) = self.plan.attempt(tier) else {
            release(&workspace);
            return StepOutcome::Done(Err(ProcessingError::NoEncoder));
        };
        let (input, output) = workspace.encode_paths(item);

        info!(
            "Encoding {} with {} encoder {}",
            item.source_path.display(),
            tier,
            attempt.encoder_id
        );
        let guard = AbandonGuard::arm(item, &workspace);
        let result = self.encoder.encode(input, output, attempt).await;
        guard.disarm();

        if result.is_success() {
            return StepOutcome::Next(State::Publish { tier, workspace });
        }

        warn!(
            "{} encoder {} failed on {}: {}",
            tier,
            attempt.encoder_id,
            item.source_path.display(),
            result.exit_class
        );

        let fallback_allowed = tier == Tier::Primary && self.plan.fallback().is_some();
        if result.exit_class.is_timeout() {
            if fallback_allowed {
                info!("Not trying the fallback encoder after a timeout");
            }
        } else if fallback_allowed {
            fsops::remove_quietly(output, "partial output");
            return StepOutcome::Next(State::Attempt {
                tier: Tier::Fallback,
                workspace,
            });
        }

        StepOutcome::Next(State::Fail {
            failure: AttemptFailure {
                attempt: attempt.clone(),
                result,
            },
            workspace,
        })
    }

    fn publish(&self, item: &ProcessingItem, tier: Tier, workspace: Workspace) -> StepOutcome {
        let encoder_id = self
            .plan
            .attempt(tier)
            .map(|a| a.encoder_id.clone())
            .unwrap_or_default();
        let output = &item.final_output_path;

        let published = match &workspace {
            Workspace::Staged { staging_output, .. } => {
                if output.exists() {
                    warn!(
                        "{} appeared while encoding, discarding the new result",
                        output.display()
                    );
                    release(&workspace);
                    return StepOutcome::Done(Ok(ItemOutcome::Skipped(SkipReason::OutputExists)));
                }
                if let Some(parent) = output.parent() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        release(&workspace);
                        return StepOutcome::Done(Err(ProcessingError::filesystem(
                            "create output directory",
                            parent,
                            e,
                        )));
                    }
                }
                fsops::move_file(staging_output, output).map_err(ProcessingError::Publish)
            }
            Workspace::Direct { processing_path } => {
                if let Err(e) = fs::rename(processing_path, &item.source_path) {
                    warn!(
                        "Encoded {} but could not rename {} back to {}: {} (rename it manually)",
                        output.display(),
                        processing_path.display(),
                        item.source_path.display(),
                        e
                    );
                }
                Ok(())
            }
        };

        release(&workspace);
        match published {
            Ok(()) => {
                info!("Published {} ({} encoder {})", output.display(), tier, encoder_id);
                StepOutcome::Done(Ok(ItemOutcome::Published { encoder_id, tier }))
            }
            Err(e) => StepOutcome::Done(Err(e)),
        }
    }

    fn fail(&self, item: &ProcessingItem, failure: AttemptFailure, workspace: Workspace) -> StepOutcome {
        let AttemptFailure { attempt, result } = failure;
        let kind = MarkerKind::for_exit_class(result.exit_class).unwrap_or(MarkerKind::Error);
        let content = marker::failure_content(
            &attempt.encoder_id,
            &attempt.encoder_options,
            result.exit_class,
            &result.diagnostic(),
        );
        match marker::write_marker(&item.final_output_path, kind, &content) {
            Ok(path) => warn!("Wrote failure marker {}", path.display()),
            Err(e) => warn!(
                "Could not write failure marker for {}: {}",
                item.final_output_path.display(),
                e
            ),
        }

        if let Workspace::Direct { processing_path } = &workspace {
            restore_source(item, processing_path);
            fsops::remove_quietly(&item.final_output_path, "partial output");
        }
        release(&workspace);

        StepOutcome::Done(Err(ProcessingError::Encode(EncodeFailure::new(
            &attempt, &result,
        ))))
    }
}

/// Give a direct-mode source its own name back.
fn restore_source(item: &ProcessingItem, processing_path: &Path) {
    if !processing_path.exists() {
        return;
    }
    if let Err(e) = fs::rename(processing_path, &item.source_path) {
        warn!(
            "Could not rename {} back to {}: {} (rename it manually)",
            processing_path.display(),
            item.source_path.display(),
            e
        );
    }
}

/// Drop scratch files owned by the item.
fn release(workspace: &Workspace) {
    if let Workspace::Staged {
        staging_input,
        staging_output,
    } = workspace
    {
        fsops::remove_quietly(staging_input, "staged input");
        fsops::remove_quietly(staging_output, "staged output");
    }
}
