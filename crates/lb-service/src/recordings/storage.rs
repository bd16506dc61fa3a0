//! On-disk recording storage.
//!
//! All mutations are `rename` based: imports move staged directories into
//! place, publish/unpublish move format directories between the published
//! and unpublished trees, deletes remove whole recording directories.
//! Functions here are synchronous filesystem code; callers run them on
//! blocking threads.

use crate::models::RecordingState;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory name holding unpublished formats inside a recording directory.
const UNPUBLISHED_DIR: &str = "unpublished";

/// Directory name for in-flight imports, sibling to the tenant trees.
const STAGING_DIR: &str = ".staging";

/// Reject path segments that could escape the storage tree.
#[must_use]
pub fn safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment != UNPUBLISHED_DIR
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0'])
}

/// The recording storage tree rooted at `RECORDING_PATH`.
#[derive(Debug, Clone)]
pub struct RecordingStorage {
    basedir: PathBuf,
}

impl RecordingStorage {
    #[must_use]
    pub fn new(basedir: PathBuf) -> Self {
        Self { basedir }
    }

    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Root directory for one recording.
    #[must_use]
    pub fn record_dir(&self, tenant: &str, record_id: &str) -> PathBuf {
        self.basedir.join(tenant).join(record_id)
    }

    /// Directory of one format in the given publication state.
    #[must_use]
    pub fn format_dir(
        &self,
        tenant: &str,
        record_id: &str,
        format: &str,
        state: RecordingState,
    ) -> PathBuf {
        let record_dir = self.record_dir(tenant, record_id);
        match state {
            RecordingState::Published => record_dir.join(format),
            RecordingState::Unpublished => record_dir.join(UNPUBLISHED_DIR).join(format),
        }
    }

    /// Whether a format exists on disk in either publication state.
    #[must_use]
    pub fn format_exists(&self, tenant: &str, record_id: &str, format: &str) -> bool {
        self.format_dir(tenant, record_id, format, RecordingState::Published)
            .is_dir()
            || self
                .format_dir(tenant, record_id, format, RecordingState::Unpublished)
                .is_dir()
    }

    /// A fresh staging directory for one import.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` when the directory cannot be created.
    pub fn create_staging(&self, import_id: &str) -> io::Result<PathBuf> {
        let dir = self.basedir.join(STAGING_DIR).join(import_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Move a staged format directory into its final place, replacing any
    /// prior contents of that format in either publication state.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` when the rename fails.
    pub fn install_format(
        &self,
        staged: &Path,
        tenant: &str,
        record_id: &str,
        format: &str,
        state: RecordingState,
    ) -> io::Result<()> {
        let target = self.format_dir(tenant, record_id, format, state);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // A re-import replaces the format wherever it currently lives.
        for old_state in [RecordingState::Published, RecordingState::Unpublished] {
            let old = self.format_dir(tenant, record_id, format, old_state);
            if old.is_dir() {
                fs::remove_dir_all(&old)?;
            }
        }

        fs::rename(staged, &target)
    }

    /// Move every format of a recording into the published tree.
    ///
    /// # Errors
    ///
    /// Returns `io::ErrorKind::NotFound` when the recording directory does
    /// not exist, other `io::Error`s when a rename fails.
    pub fn publish(&self, tenant: &str, record_id: &str) -> io::Result<()> {
        let record_dir = self.record_dir(tenant, record_id);
        if !record_dir.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "recording not on disk"));
        }
        let unpublished = record_dir.join(UNPUBLISHED_DIR);
        if !unpublished.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&unpublished)? {
            let entry = entry?;
            let target = record_dir.join(entry.file_name());
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(entry.path(), target)?;
        }
        fs::remove_dir(unpublished)?;
        Ok(())
    }

    /// Move every format of a recording into the unpublished tree.
    ///
    /// # Errors
    ///
    /// See [`RecordingStorage::publish`].
    pub fn unpublish(&self, tenant: &str, record_id: &str) -> io::Result<()> {
        let record_dir = self.record_dir(tenant, record_id);
        if !record_dir.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "recording not on disk"));
        }
        let unpublished = record_dir.join(UNPUBLISHED_DIR);
        fs::create_dir_all(&unpublished)?;
        for entry in fs::read_dir(&record_dir)? {
            let entry = entry?;
            if entry.file_name() == UNPUBLISHED_DIR || !entry.path().is_dir() {
                continue;
            }
            let target = unpublished.join(entry.file_name());
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(entry.path(), target)?;
        }
        Ok(())
    }

    /// Remove a recording's directories, published and unpublished alike.
    /// Removing something that is not there is fine.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` for failures other than `NotFound`.
    pub fn delete(&self, tenant: &str, record_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.record_dir(tenant, record_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a staging directory, ignoring absence.
    pub fn discard_staging(&self, import_id: &str) {
        let dir = self.basedir.join(STAGING_DIR).join(import_id);
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    target: "lb.recordings",
                    import_id = %import_id,
                    error = %e,
                    "Failed to discard staging directory"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, RecordingStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingStorage::new(dir.path().to_path_buf());
        (dir, storage)
    }

    fn seed_format(storage: &RecordingStorage, state: RecordingState) {
        let dir = storage.format_dir("t1", "rec1", "presentation", state);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("metadata.xml"), "<recording/>").unwrap();
    }

    #[test]
    fn test_safe_segment() {
        assert!(safe_segment("tenant1"));
        assert!(safe_segment("rec-2024_01"));
        assert!(!safe_segment(""));
        assert!(!safe_segment("."));
        assert!(!safe_segment(".."));
        assert!(!safe_segment(".hidden"));
        assert!(!safe_segment("a/b"));
        assert!(!safe_segment("a\\b"));
        assert!(!safe_segment("unpublished"));
    }

    #[test]
    fn test_publish_unpublish_round_trip() {
        let (_guard, storage) = storage();
        seed_format(&storage, RecordingState::Published);

        storage.unpublish("t1", "rec1").unwrap();
        assert!(!storage
            .format_dir("t1", "rec1", "presentation", RecordingState::Published)
            .exists());
        let unpublished =
            storage.format_dir("t1", "rec1", "presentation", RecordingState::Unpublished);
        assert!(unpublished.join("metadata.xml").is_file());

        storage.publish("t1", "rec1").unwrap();
        let published = storage.format_dir("t1", "rec1", "presentation", RecordingState::Published);
        assert!(published.join("metadata.xml").is_file());
        assert!(!storage.record_dir("t1", "rec1").join("unpublished").exists());
    }

    #[test]
    fn test_publish_missing_recording_is_not_found() {
        let (_guard, storage) = storage();
        let err = storage.publish("t1", "nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_install_format_replaces_existing() {
        let (_guard, storage) = storage();
        seed_format(&storage, RecordingState::Unpublished);

        let staging = storage.create_staging("import-1").unwrap();
        let staged = staging.join("t1").join("rec1").join("presentation");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("metadata.xml"), "<recording>v2</recording>").unwrap();

        storage
            .install_format(&staged, "t1", "rec1", "presentation", RecordingState::Published)
            .unwrap();

        // New content in place, old unpublished copy gone.
        let published = storage.format_dir("t1", "rec1", "presentation", RecordingState::Published);
        assert!(fs::read_to_string(published.join("metadata.xml"))
            .unwrap()
            .contains("v2"));
        assert!(!storage
            .format_dir("t1", "rec1", "presentation", RecordingState::Unpublished)
            .exists());
    }

    #[test]
    fn test_delete_removes_both_trees_and_is_idempotent() {
        let (_guard, storage) = storage();
        seed_format(&storage, RecordingState::Published);
        seed_format(&storage, RecordingState::Unpublished);

        storage.delete("t1", "rec1").unwrap();
        assert!(!storage.record_dir("t1", "rec1").exists());

        // Deleting again is fine.
        storage.delete("t1", "rec1").unwrap();
    }

    #[test]
    fn test_format_exists_in_either_state() {
        let (_guard, storage) = storage();
        assert!(!storage.format_exists("t1", "rec1", "presentation"));

        seed_format(&storage, RecordingState::Unpublished);
        assert!(storage.format_exists("t1", "rec1", "presentation"));
    }
}
