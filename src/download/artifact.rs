//! Temporary files produced by downloads.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::{debug, warn};

use super::constants::TEMP_FILE_PREFIX;

/// An exclusively owned temporary file holding one downloaded body.
///
/// The file is removed when the artifact is deleted, discarded or dropped;
/// [`keep`](Self::keep) hands the path over to the caller instead. A file can
/// therefore be deleted at most once, and deleting one that is already gone is
/// not an error.
#[derive(Debug)]
pub struct TempArtifact {
    path: TempPath,
}

impl TempArtifact {
    /// Creates a new, uniquely named file in `dir` and returns it open for writing.
    pub(crate) fn create_in(dir: &Path) -> io::Result<(Self, std::fs::File)> {
        let named = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile_in(dir)?;
        let (file, path) = named.into_parts();
        Ok((Self { path }, file))
    }

    /// Location of the file on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error for anything other than a missing file.
    pub fn delete(self) -> io::Result<()> {
        match self.path.close() {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Deletes the file, logging instead of returning a failure.
    ///
    /// Used on cleanup paths where a deletion problem must not replace the
    /// error being reported.
    pub fn discard(self) {
        let path = self.path.to_path_buf();
        match self.delete() {
            Ok(()) => debug!(path = %path.display(), "discarded temporary file"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to delete temporary file"),
        }
    }

    /// Stops tracking the file and returns its path; the caller now owns deletion.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be persisted.
    pub fn keep(self) -> io::Result<PathBuf> {
        self.path.keep().map_err(|e| e.error)
    }
}

/// Removes a file that may already be gone.
///
/// # Errors
///
/// Returns the underlying IO error for anything other than a missing file.
pub fn remove_temp_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
