//! Filesystem primitives for staging, publishing and verbatim copies.
//!
//! Copies are flushed to disk before they are reported complete, and a move
//! that cannot be done with a single rename goes through a temporary name
//! in the destination directory so the destination never holds a partial
//! file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Suffix of the temporary name used while copying into place.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Errors from [`copy_file_synced`], split by which side failed.
#[derive(Debug, Error)]
pub enum CopyError {
    /// The source could not be opened or read.
    #[error("Cannot read {path}: {source}")]
    Source { path: PathBuf, source: io::Error },

    /// The destination could not be created, written or flushed.
    #[error("Cannot write {path}: {source}")]
    Destination { path: PathBuf, source: io::Error },
}

impl CopyError {
    pub fn is_source_side(&self) -> bool {
        matches!(self, CopyError::Source { .. })
    }
}

/// Errors from [`move_file`] once the rename shortcut has failed.
#[derive(Debug, Error)]
pub enum MoveError {
    #[error("Copy fallback failed: {0}")]
    Copy(#[from] CopyError),

    #[error("Size mismatch after copying to {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Result of a verbatim copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied(u64),
    /// The destination already existed and was left alone
    SkippedExisting,
}

/// Path with `suffix` appended to the full file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copies `src` to `dst` and flushes the destination to disk.
///
/// A partially written destination is removed before returning an error.
///
/// # Returns
///
/// * `Ok(bytes)` - number of bytes copied
/// * `Err(CopyError)` - which side failed and why
pub fn copy_file_synced(src: &Path, dst: &Path) -> Result<u64, CopyError> {
    let source_err = |source| CopyError::Source {
        path: src.to_path_buf(),
        source,
    };
    let dest_err = |source| CopyError::Destination {
        path: dst.to_path_buf(),
        source,
    };

    let mut reader = File::open(src).map_err(source_err)?;
    let mut writer = File::create(dst).map_err(dest_err)?;

    let result = pump(&mut reader, &mut writer, src, dst);
    let result = result.and_then(|bytes| {
        writer.sync_all().map_err(dest_err)?;
        Ok(bytes)
    });

    if result.is_err() {
        drop(writer);
        remove_quietly(dst, "partial copy");
    }
    result
}

fn pump(reader: &mut File, writer: &mut File, src: &Path, dst: &Path) -> Result<u64, CopyError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(CopyError::Source {
                    path: src.to_path_buf(),
                    source,
                })
            }
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|source| CopyError::Destination {
                path: dst.to_path_buf(),
                source,
            })?;
        total += read as u64;
    }
}

/// Moves `src` to `dst`.
///
/// Tries a rename first. When that is not possible (different devices,
/// for instance) the file is copied to `<dst>.partial`, flushed, checked
/// against the source size and renamed into place; the source is deleted
/// last, and failing to delete it is only a warning.
///
/// # Requirements
///
/// `dst` must not be observable in a partially written state.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), MoveError> {
    match fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) => debug!(
            "Rename {} -> {} failed ({}), falling back to copy",
            src.display(),
            dst.display(),
            e
        ),
    }

    copy_into_place(src, dst)
}

/// Copy half of [`move_file`]: copy to `<dst>.partial`, then commit.
pub fn copy_into_place(src: &Path, dst: &Path) -> Result<(), MoveError> {
    let partial = with_suffix(dst, PARTIAL_SUFFIX);
    copy_file_synced(src, &partial)?;
    commit_partial(src, &partial, dst)
}

/// Checks `partial` against the size of `src`, renames it to `dst` and
/// deletes `src`. On error `partial` is removed and `src` is kept.
fn commit_partial(src: &Path, partial: &Path, dst: &Path) -> Result<(), MoveError> {
    let expected = fs::metadata(src).map(|m| m.len()).map_err(|source| {
        remove_quietly(partial, "partial copy");
        CopyError::Source {
            path: src.to_path_buf(),
            source,
        }
    })?;
    let actual = fs::metadata(partial).map(|m| m.len()).unwrap_or(0);
    if expected != actual {
        remove_quietly(partial, "partial copy");
        return Err(MoveError::SizeMismatch {
            path: partial.to_path_buf(),
            expected,
            actual,
        });
    }

    if let Err(source) = fs::rename(partial, dst) {
        remove_quietly(partial, "partial copy");
        return Err(MoveError::Rename {
            from: partial.to_path_buf(),
            to: dst.to_path_buf(),
            source,
        });
    }

    if let Err(e) = fs::remove_file(src) {
        warn!(
            "Moved {} to {} but could not delete the original: {}",
            src.display(),
            dst.display(),
            e
        );
    }
    Ok(())
}

/// Copies a non-video file to its mirrored destination unchanged.
///
/// Existing destinations are skipped. Parent directories are created.
pub fn copy_verbatim(src: &Path, dst: &Path) -> Result<CopyOutcome, CopyError> {
    if dst.exists() {
        debug!("Destination {} exists, skipping copy", dst.display());
        return Ok(CopyOutcome::SkippedExisting);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|source| CopyError::Destination {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    copy_file_synced(src, dst).map(CopyOutcome::Copied)
}

/// Removes `path` if it exists.
///
/// # Returns
///
/// * `Ok(true)` if a file was removed
/// * `Ok(false)` if there was nothing to remove
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort removal. Failures are logged as warnings.
pub fn remove_quietly(path: &Path, what: &str) {
    match remove_if_exists(path) {
        Ok(true) => debug!("Removed {} {}", what, path.display()),
        Ok(false) => {}
        Err(e) => warn!("Could not remove {} {}: {}", what, path.display(), e),
    }
}
