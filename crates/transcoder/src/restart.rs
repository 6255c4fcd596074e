//! Restart pass: clears failure markers and empty videos from the
//! destination so the next run retries those items.

use std::fs;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::marker;
use crate::scan;

/// What a restart pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestartReport {
    pub markers_removed: usize,
    pub empty_videos_removed: usize,
    /// Files that matched but could not be removed
    pub failures: usize,
}

impl RestartReport {
    pub fn removed(&self) -> usize {
        self.markers_removed + self.empty_videos_removed
    }
}

/// Remove every failure marker and every zero-byte video under `dir`.
///
/// Unreadable entries and failed deletions are logged and counted, never
/// fatal.
pub fn clean_destination(dir: &Path) -> RestartReport {
    info!(
        "Restart: removing failure markers and empty videos under {}",
        dir.display()
    );
    let mut report = RestartReport::default();

    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Restart: skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        if marker::is_marker_file(path) {
            match fs::remove_file(path) {
                Ok(()) => {
                    info!("Restart: removed marker {}", path.display());
                    report.markers_removed += 1;
                }
                Err(e) => {
                    warn!("Restart: could not remove marker {}: {}", path.display(), e);
                    report.failures += 1;
                }
            }
            continue;
        }

        if scan::is_video_file(path) {
            let empty = match entry.metadata() {
                Ok(meta) => meta.len() == 0,
                Err(e) => {
                    warn!("Restart: could not stat {}: {}", path.display(), e);
                    continue;
                }
            };
            if !empty {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    info!("Restart: removed empty video {}", path.display());
                    report.empty_videos_removed += 1;
                }
                Err(e) => {
                    warn!("Restart: could not remove {}: {}", path.display(), e);
                    report.failures += 1;
                }
            }
        }
    }

    info!("Restart: {} files removed", report.removed());
    report
}
