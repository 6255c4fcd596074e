//! Encode attempts, their outcomes, and the seam the state machine drives.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Exit code reported for an attempt killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -2;
/// Exit code reported when the encoder never ran or could not be supervised.
pub const LAUNCH_ERROR_EXIT_CODE: i32 = -3;
/// Exit code reported when the process ended without one (killed by a signal).
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// One invocation of the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeAttempt {
    /// Encoder name handed to `-c:v`
    pub encoder_id: String,
    /// Free-form options, split on whitespace
    pub encoder_options: String,
    /// `None` means the attempt may run forever
    pub deadline: Option<Duration>,
}

impl EncodeAttempt {
    pub fn new(
        encoder_id: impl Into<String>,
        encoder_options: impl Into<String>,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            encoder_id: encoder_id.into(),
            encoder_options: encoder_options.into(),
            deadline,
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    NonZeroExit(i32),
    TimedOut,
    LaunchError,
    StreamError,
}

impl ExitClass {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitClass::Success)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExitClass::TimedOut)
    }

    /// Numeric code for display, with sentinels for the non-exit classes.
    pub fn code(&self) -> i32 {
        match self {
            ExitClass::Success => 0,
            ExitClass::NonZeroExit(code) => *code,
            ExitClass::TimedOut => TIMEOUT_EXIT_CODE,
            ExitClass::LaunchError | ExitClass::StreamError => LAUNCH_ERROR_EXIT_CODE,
        }
    }
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClass::Success => write!(f, "success"),
            ExitClass::NonZeroExit(SIGNAL_EXIT_CODE) => write!(f, "terminated by signal"),
            ExitClass::NonZeroExit(code) => write!(f, "exit code {}", code),
            ExitClass::TimedOut => write!(f, "timed out"),
            ExitClass::LaunchError => write!(f, "launch error"),
            ExitClass::StreamError => write!(f, "stream error"),
        }
    }
}

/// Outcome of one [`EncodeAttempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeResult {
    pub exit_class: ExitClass,
    /// stdout and stderr lines in arrival order, untruncated
    pub captured_output: String,
    /// Launch or stream failure message, when there is one
    pub detail: Option<String>,
}

impl EncodeResult {
    pub fn success(captured_output: String) -> Self {
        Self {
            exit_class: ExitClass::Success,
            captured_output,
            detail: None,
        }
    }

    pub fn launch_error(detail: impl Into<String>) -> Self {
        Self {
            exit_class: ExitClass::LaunchError,
            captured_output: String::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_class.is_success()
    }

    /// Human readable diagnostic: the failure detail followed by the
    /// encoder's own output.
    pub fn diagnostic(&self) -> String {
        let output = self.captured_output.trim();
        match (&self.detail, output.is_empty()) {
            (Some(detail), true) => detail.clone(),
            (Some(detail), false) => format!("{}\n{}", detail, output),
            (None, _) => output.to_string(),
        }
    }
}

/// Runs one attempt to completion. Failures come back as data.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, input: &Path, output: &Path, attempt: &EncodeAttempt) -> EncodeResult;
}
