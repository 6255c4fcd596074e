//! Scanner module for discovering and classifying files in the source tree.
//!
//! Every regular file under the source root is classified by extension as a
//! video, an image or anything else, and mapped to its place in the
//! destination tree.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Video file extensions (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".avi", ".mov", ".mkv", ".wmv", ".flv", ".webm", ".m4v", ".mpeg", ".mpg", ".ts",
    ".mts", ".m2ts", ".3gp", ".asf", ".divx",
];

/// Image file extensions (case-insensitive matching).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".tif", ".tiff", ".webp", ".heic", ".heif", ".raw",
    ".cr2", ".nef", ".orf", ".sr2", ".svg", ".avif",
];

const PROGRESS_EVERY: usize = 1000;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{} is not inside {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// What a file is, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Video,
    Image,
    Other,
}

/// Files found under a source root, in walk order.
#[derive(Debug, Default, Clone)]
pub struct ScanResult {
    pub videos: Vec<PathBuf>,
    pub images: Vec<PathBuf>,
    pub others: Vec<PathBuf>,
}

impl ScanResult {
    pub fn total(&self) -> usize {
        self.videos.len() + self.images.len() + self.others.len()
    }
}

fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

/// Classifies a file by its extension.
pub fn classify(path: &Path) -> FileKind {
    match dotted_extension(path) {
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => FileKind::Video,
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => FileKind::Image,
        _ => FileKind::Other,
    }
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    classify(path) == FileKind::Video
}

/// Sorted, space separated extension list for messages.
pub fn extension_list(extensions: &[&str]) -> String {
    let mut sorted = extensions.to_vec();
    sorted.sort_unstable();
    sorted.join(" ")
}

/// Maps a file to the same relative place under `dst_root`.
pub fn mirror_path(source: &Path, src_root: &Path, dst_root: &Path) -> Result<PathBuf, ScanError> {
    let relative = source
        .strip_prefix(src_root)
        .map_err(|_| ScanError::OutsideRoot {
            path: source.to_path_buf(),
            root: src_root.to_path_buf(),
        })?;
    Ok(dst_root.join(relative))
}

/// Output path for a video: `<dst_root>/<relative dir>/<stem><suffix>`.
///
/// The extension is dropped; a dot file without one keeps its full name.
pub fn output_path(
    source: &Path,
    src_root: &Path,
    dst_root: &Path,
    suffix: &str,
) -> Result<PathBuf, ScanError> {
    let mirrored = mirror_path(source, src_root, dst_root)?;
    let stem = mirrored
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(mirrored.with_file_name(format!("{}{}", stem, suffix)))
}

/// Walks `root` and classifies every regular file.
///
/// Unreadable entries are logged and skipped. Anything under `exclude`
/// (a destination nested inside the source) is not visited.
pub fn scan_source(root: &Path, exclude: Option<&Path>) -> ScanResult {
    let mut result = ScanResult::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match exclude {
            Some(excluded) => entry.depth() == 0 || !entry.path().starts_with(excluded),
            None => true,
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry during scan: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        match classify(&path) {
            FileKind::Video => result.videos.push(path),
            FileKind::Image => result.images.push(path),
            FileKind::Other => {
                debug!("Listed as other file: {}", path.display());
                result.others.push(path);
            }
        }

        let total = result.total();
        if total % PROGRESS_EVERY == 0 {
            info!("Scanning... {} files so far", total);
        }
    }

    info!(
        "Scan complete: {} videos, {} images, {} other files ({} total)",
        result.videos.len(),
        result.images.len(),
        result.others.len(),
        result.total()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_extension_lists() {
        assert_eq!(VIDEO_EXTENSIONS.len(), 16);
        assert_eq!(IMAGE_EXTENSIONS.len(), 17);
        assert!(VIDEO_EXTENSIONS.iter().all(|v| !IMAGE_EXTENSIONS.contains(v)));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Path::new("/media/movie.MKV")), FileKind::Video);
        assert_eq!(classify(Path::new("/media/clip.Mts")), FileKind::Video);
        assert_eq!(classify(Path::new("/media/cover.JPG")), FileKind::Image);
        assert_eq!(classify(Path::new("/media/raw.cr2")), FileKind::Image);
        assert_eq!(classify(Path::new("/media/notes.txt")), FileKind::Other);
        assert_eq!(classify(Path::new("/media/README")), FileKind::Other);
        assert!(!is_video_file(Path::new("/media/movie_AV1.mp4.failed")));
    }

    #[test]
    fn test_output_path_mapping() {
        let out = output_path(
            Path::new("/src/shows/s01/ep1.mkv"),
            Path::new("/src"),
            Path::new("/dst"),
            "_AV1.mp4",
        )
        .unwrap();
        assert_eq!(out, PathBuf::from("/dst/shows/s01/ep1_AV1.mp4"));
    }

    #[test]
    fn test_output_path_keeps_inner_dots() {
        let out = output_path(
            Path::new("/src/a.b.c.mov"),
            Path::new("/src"),
            Path::new("/dst"),
            "_AV1.mp4",
        )
        .unwrap();
        assert_eq!(out, PathBuf::from("/dst/a.b.c_AV1.mp4"));
    }

    #[test]
    fn test_output_path_outside_root() {
        let result = output_path(
            Path::new("/elsewhere/movie.mp4"),
            Path::new("/src"),
            Path::new("/dst"),
            "_AV1.mp4",
        );
        assert!(matches!(result, Err(ScanError::OutsideRoot { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_output_path_stays_under_destination(
            dirs in prop::collection::vec("[a-z0-9]{1,8}", 0..4),
            stem in "[a-zA-Z0-9_]{1,12}",
            ext in prop::sample::select(VIDEO_EXTENSIONS.to_vec()),
        ) {
            let src_root = Path::new("/src");
            let dst_root = Path::new("/dst");
            let mut source = src_root.to_path_buf();
            for dir in &dirs {
                source.push(dir);
            }
            source.push(format!("{}{}", stem, ext));

            let out = output_path(&source, src_root, dst_root, "_AV1.mp4").unwrap();

            prop_assert!(out.starts_with(dst_root));
            let expected_name = format!("{}_AV1.mp4", stem);
            prop_assert_eq!(out.file_name().unwrap().to_str().unwrap(), expected_name.as_str());
            prop_assert_eq!(out.components().count(), source.components().count());
        }
    }

    #[test]
    fn test_scan_source_classifies_and_excludes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("season1")).unwrap();
        fs::create_dir_all(root.join("out")).unwrap();
        File::create(root.join("season1").join("ep1.mkv")).unwrap();
        File::create(root.join("cover.png")).unwrap();
        File::create(root.join("notes.txt")).unwrap();
        File::create(root.join("out").join("ep1_AV1.mp4")).unwrap();

        let result = scan_source(root, Some(&root.join("out")));

        assert_eq!(result.videos, vec![root.join("season1").join("ep1.mkv")]);
        assert_eq!(result.images, vec![root.join("cover.png")]);
        assert_eq!(result.others, vec![root.join("notes.txt")]);
        assert_eq!(result.total(), 3);
    }

    #[test]
    fn test_extension_list_sorted() {
        assert_eq!(extension_list(&[".mp4", ".avi"]), ".avi .mp4");
    }
}
