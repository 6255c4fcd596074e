//! Failure marker module for recording terminal item failures.
//!
//! A marker is a small sidecar next to the would-be output, named
//! `<final output><suffix>`. While one exists the item is skipped, so a
//! failed item is not retried until a restart pass clears its marker.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::encode::ExitClass;

/// Maximum number of characters persisted in a marker before truncation.
pub const MAX_MARKER_CONTENT: usize = 200;

/// Appended to marker content that was cut at [`MAX_MARKER_CONTENT`].
pub const TRUNCATION_SUFFIX: &str = "...";

/// Failure class recorded by a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// The encoder ran and exited with a nonzero code
    Failed,
    /// The encoder was killed at its deadline
    Timeout,
    /// The encoder could not be launched or supervised
    Error,
    /// The source could not be read while staging
    Unreadable,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 4] = [
        MarkerKind::Failed,
        MarkerKind::Timeout,
        MarkerKind::Error,
        MarkerKind::Unreadable,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            MarkerKind::Failed => ".failed",
            MarkerKind::Timeout => ".timeout",
            MarkerKind::Error => ".error",
            MarkerKind::Unreadable => ".unreadable",
        }
    }

    /// Marker kind for a failed encode. `None` for a success.
    pub fn for_exit_class(exit_class: ExitClass) -> Option<Self> {
        match exit_class {
            ExitClass::Success => None,
            ExitClass::NonZeroExit(_) => Some(MarkerKind::Failed),
            ExitClass::TimedOut => Some(MarkerKind::Timeout),
            ExitClass::LaunchError | ExitClass::StreamError => Some(MarkerKind::Error),
        }
    }
}

/// Constructs the marker path for a given output.
///
/// For example: `/out/movie_AV1.mp4` + `Timeout` -> `/out/movie_AV1.mp4.timeout`
pub fn marker_path(final_output: &Path, kind: MarkerKind) -> PathBuf {
    let mut path = final_output.as_os_str().to_owned();
    path.push(kind.suffix());
    PathBuf::from(path)
}

/// Returns the first marker found next to `final_output`, if any.
pub fn find_existing_marker(final_output: &Path) -> Option<(MarkerKind, PathBuf)> {
    MarkerKind::ALL.iter().find_map(|kind| {
        let path = marker_path(final_output, *kind);
        path.exists().then_some((*kind, path))
    })
}

/// Whether a file name ends in one of the marker suffixes (any case).
pub fn is_marker_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .map(|name| MarkerKind::ALL.iter().any(|kind| name.ends_with(kind.suffix())))
        .unwrap_or(false)
}

/// Cut `content` to [`MAX_MARKER_CONTENT`] characters.
///
/// Counts characters, not bytes, so multi-byte text is never split.
pub fn truncate_content(content: &str) -> String {
    match content.char_indices().nth(MAX_MARKER_CONTENT) {
        Some((cut, _)) => format!("{}{}", &content[..cut], TRUNCATION_SUFFIX),
        None => content.to_string(),
    }
}

/// Marker content for a failed encode attempt.
pub fn failure_content(
    encoder_id: &str,
    encoder_options: &str,
    exit_class: ExitClass,
    diagnostic: &str,
) -> String {
    format!(
        "Encoder: {}, Options: \"{}\", ExitCode: {}, TimedOut: {}, Error: {}",
        encoder_id,
        encoder_options,
        exit_class.code(),
        exit_class.is_timeout(),
        diagnostic.trim()
    )
}

/// Writes a marker next to `final_output` with truncated `content`.
///
/// # Returns
///
/// The path of the marker that was written.
pub fn write_marker(final_output: &Path, kind: MarkerKind, content: &str) -> io::Result<PathBuf> {
    let path = marker_path(final_output, kind);
    fs::write(&path, truncate_content(content))?;
    Ok(path)
}
