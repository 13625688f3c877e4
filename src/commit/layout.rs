//! On-disk layout of live data, staging area and markers.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::transfer::DatabaseKind;

const MEDIA_DIR: &str = "media";
const STAGING_DIR: &str = "migration";
const MARKER_FILE: &str = "migration.id";
const DONE_MARKER: &str = "migration.done";
const SETTINGS_FILE: &str = "settings.json";
const SECURE_DIR: &str = "secure";
const CORE_BLOB: &str = "core.bin";
const ACCOUNT_BLOB: &str = "account.bin";
const JOURNAL_FILE: &str = "journal.json";
const PROGRESS_FILE: &str = "commit.json";
const TOKEN_FILE: &str = "session.token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    data: PathBuf,
}

impl Layout {
    pub fn new(data: impl Into<PathBuf>) -> Self {
        Self { data: data.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data.join(MEDIA_DIR)
    }

    pub fn live_database(&self, kind: DatabaseKind) -> PathBuf {
        self.data.join(kind.file_name())
    }

    /// Live secure configuration blobs
    pub fn secure_dir(&self) -> PathBuf {
        self.data.join(SECURE_DIR)
    }

    pub fn live_settings(&self) -> PathBuf {
        self.data.join(SETTINGS_FILE)
    }

    pub fn session_token(&self) -> PathBuf {
        self.data.join(TOKEN_FILE)
    }

    pub fn marker(&self) -> PathBuf {
        self.data.join(MARKER_FILE)
    }

    pub fn staging(&self) -> PathBuf {
        self.data.join(STAGING_DIR)
    }

    pub fn staging_media(&self) -> PathBuf {
        self.staging().join(MEDIA_DIR)
    }

    pub fn staged_database(&self, kind: DatabaseKind) -> PathBuf {
        self.staging().join(kind.file_name())
    }

    pub fn staged_settings(&self) -> PathBuf {
        self.staging().join(SETTINGS_FILE)
    }

    pub fn staged_core(&self) -> PathBuf {
        self.staging().join(SECURE_DIR).join(CORE_BLOB)
    }

    pub fn staged_account(&self) -> PathBuf {
        self.staging().join(SECURE_DIR).join(ACCOUNT_BLOB)
    }

    pub fn journal(&self) -> PathBuf {
        self.staging().join(JOURNAL_FILE)
    }

    pub fn commit_progress(&self) -> PathBuf {
        self.staging().join(PROGRESS_FILE)
    }

    pub fn done_marker(&self) -> PathBuf {
        self.staging().join(DONE_MARKER)
    }

    /// Journal key for a staged media path.
    pub fn media_key(relative: &str) -> String {
        format!("{}/{}", MEDIA_DIR, relative)
    }

    // =========================================================================
    // Markers
    // =========================================================================

    /// Write the in-progress marker and create the staging tree.
    pub fn begin(&self, session_id: Uuid) -> Result<()> {
        std::fs::create_dir_all(self.staging_media())
            .with_context(|| format!("Failed to create {}", self.staging_media().display()))?;
        std::fs::create_dir_all(self.staging().join(SECURE_DIR))?;
        write_atomic(&self.marker(), session_id.to_string().as_bytes())?;
        tracing::info!(
            event = "marker_written",
            session = %session_id,
            path = %self.marker().display(),
        );
        Ok(())
    }

    pub fn read_marker(&self) -> Option<String> {
        std::fs::read_to_string(self.marker())
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn has_marker(&self) -> bool {
        self.marker().exists()
    }

    pub fn mark_done(&self) -> Result<()> {
        write_atomic(&self.done_marker(), b"done")
    }

    pub fn is_done(&self) -> bool {
        self.done_marker().exists()
    }

    pub fn has_staging(&self) -> bool {
        self.staging().exists()
    }

    /// Remove staging and then the marker. Idempotent.
    pub fn discard(&self) -> Result<()> {
        let staging = self.staging();
        match std::fs::remove_dir_all(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", staging.display()))
            }
        }
        remove_if_exists(&self.marker())?;
        tracing::info!(event = "staging_discarded", path = %staging.display());
        Ok(())
    }
}

/// Write via a temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
