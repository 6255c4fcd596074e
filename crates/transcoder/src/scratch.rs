//! Process-lifetime scratch area for staged processing.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of the scratch directory name.
pub const SCRATCH_PREFIX: &str = "transav1_";

/// Scratch directory owned by one run.
///
/// Everything inside is removed when the area is dropped, including on
/// early returns and panics that unwind.
#[derive(Debug)]
pub struct ScratchArea {
    dir: TempDir,
}

impl ScratchArea {
    /// Create a scratch area in the system temp directory.
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir()?;
        debug!("Scratch area created at {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Create a scratch area under `parent`.
    pub fn create_in<P: AsRef<Path>>(parent: P) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(parent)?;
        debug!("Scratch area created at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Unique staging path for a copy of `source`: `<uuid>_<file name>`.
    pub fn staging_input_path(&self, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        self.dir.path().join(format!("{}_{}", Uuid::new_v4(), name))
    }

    /// Unique staging path for the encoder output: `<stem>_<uuid>.<ext>`,
    /// keeping the final output's extension so the container is unchanged.
    pub fn staging_output_path(&self, final_output: &Path) -> PathBuf {
        let stem = final_output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let name = match final_output.extension() {
            Some(ext) => format!("{}_{}.{}", stem, Uuid::new_v4(), ext.to_string_lossy()),
            None => format!("{}_{}", stem, Uuid::new_v4()),
        };
        self.dir.path().join(name)
    }

    /// Remove the scratch area now, reporting any failure.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("Scratch area {} removed", path.display()),
            Err(e) => warn!("Could not remove scratch area {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_area_removed_on_drop() {
        let parent = TempDir::new().unwrap();
        let path = {
            let area = ScratchArea::create_in(parent.path()).unwrap();
            std::fs::write(area.path().join("leftover.mp4"), b"data").unwrap();
            area.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_area_close() {
        let parent = TempDir::new().unwrap();
        let area = ScratchArea::create_in(parent.path()).unwrap();
        let path = area.path().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SCRATCH_PREFIX));
        area.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_staging_paths_are_unique_and_inside() {
        let parent = TempDir::new().unwrap();
        let area = ScratchArea::create_in(parent.path()).unwrap();

        let source = Path::new("/media/in/movie.mkv");
        let a = area.staging_input_path(source);
        let b = area.staging_input_path(source);
        assert_ne!(a, b);
        assert!(a.starts_with(area.path()));
        assert!(a.file_name().unwrap().to_string_lossy().ends_with("_movie.mkv"));

        let output = area.staging_output_path(Path::new("/media/out/movie_AV1.mp4"));
        let name = output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("movie_AV1_"));
        assert!(name.ends_with(".mp4"));
        assert!(output.starts_with(area.path()));
    }
}
