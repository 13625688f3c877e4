//! Commit/Cancel Coordinator.
//!
//! Installs a verified staging area as the live account, step by step,
//! recording each finished step so that a commit interrupted by a crash
//! can be re-run to completion. Also owns crash recovery at startup.

pub mod layout;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::{MigrationError, Result};
use crate::store::{
    read_settings_file, AccountSession, FileSecureStore, FileSettingsStore, SecureStore,
    SettingsStore, TokenAccountSession,
};
use crate::transfer::DatabaseKind;

pub use layout::Layout;

/// Everything a session touches outside the wire.
#[derive(Clone)]
pub struct MigrationEnv {
    pub layout: Layout,
    pub secure: Arc<dyn SecureStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub account: Arc<dyn AccountSession>,
    pub committer: Arc<dyn Committer>,
}

impl MigrationEnv {
    /// File-backed collaborators rooted at `data_dir`.
    pub fn file_backed(data_dir: impl Into<std::path::PathBuf>) -> Self {
        let layout = Layout::new(data_dir);
        Self {
            secure: Arc::new(FileSecureStore::new(layout.secure_dir())),
            settings: Arc::new(FileSettingsStore::new(layout.live_settings())),
            account: Arc::new(TokenAccountSession::new(layout.session_token())),
            committer: Arc::new(StagingCommitter),
            layout,
        }
    }
}

pub trait Committer: Send + Sync {
    /// Install the contents of `staging` as the live account.
    fn commit(&self, env: &MigrationEnv, staging: &Path) -> Result<()>;
}

// =============================================================================
// Commit progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStep {
    Verified,
    SignedOut,
    SecureInstalled,
    DatabaseInstalled,
    MediaInstalled,
    SettingsApplied,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommitProgress {
    done: BTreeSet<CommitStep>,
}

impl CommitProgress {
    fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Ignoring corrupt commit progress: {}", e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn finish(&mut self, step: CommitStep, path: &Path) -> Result<()> {
        self.done.insert(step);
        let json = serde_json::to_vec(self).map_err(|e| MigrationError::Internal(e.to_string()))?;
        layout::write_atomic(path, &json)?;
        tracing::info!(event = "commit_step", step = ?step);
        Ok(())
    }
}

// =============================================================================
// StagingCommitter
// =============================================================================

/// Moves staged files over the live ones with renames.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagingCommitter;

impl StagingCommitter {
    fn verify(staging: &Path, layout: &Layout) -> Result<()> {
        if !staging.is_dir() {
            return Err(MigrationError::Staging(format!(
                "{} does not exist",
                staging.display()
            )));
        }
        for blob in [layout.staged_core(), layout.staged_account()] {
            if !blob.is_file() {
                return Err(MigrationError::SecureStore(format!(
                    "missing staged blob {}",
                    blob.display()
                )));
            }
        }
        if !DatabaseKind::ALL
            .iter()
            .any(|kind| layout.staged_database(*kind).is_file())
        {
            return Err(MigrationError::BadDatabase(
                "no staged database variant".to_string(),
            ));
        }
        if !layout.staged_settings().is_file() {
            return Err(MigrationError::Staging("missing staged settings".to_string()));
        }
        Ok(())
    }

    fn install_secure(env: &MigrationEnv) -> Result<()> {
        let layout = &env.layout;
        let core = std::fs::read(layout.staged_core())
            .map_err(|e| MigrationError::path(layout.staged_core(), e))?;
        let account = std::fs::read(layout.staged_account())
            .map_err(|e| MigrationError::path(layout.staged_account(), e))?;
        env.secure
            .replace(&core, &account)
            .map_err(|e| MigrationError::SecureStore(format!("{:#}", e)))
    }

    fn install_database(layout: &Layout) -> Result<()> {
        let Some(kind) = DatabaseKind::ALL
            .into_iter()
            .find(|kind| layout.staged_database(*kind).is_file())
        else {
            // Already moved by an earlier attempt
            return Ok(());
        };
        let staged = layout.staged_database(kind);
        let live = layout.live_database(kind);
        std::fs::rename(&staged, &live).map_err(|e| MigrationError::path(&live, e))?;
        for other in DatabaseKind::ALL.into_iter().filter(|k| *k != kind) {
            layout::remove_if_exists(&layout.live_database(other))?;
        }
        Ok(())
    }

    fn install_media(layout: &Layout) -> Result<()> {
        let staged = layout.staging_media();
        let live = layout.media_dir();
        let previous = layout.staging().join("media.prev");
        if staged.exists() {
            if live.exists() {
                if previous.exists() {
                    std::fs::remove_dir_all(&previous)
                        .map_err(|e| MigrationError::path(&previous, e))?;
                }
                std::fs::rename(&live, &previous).map_err(|e| MigrationError::path(&live, e))?;
            }
            std::fs::rename(&staged, &live).map_err(|e| MigrationError::path(&live, e))?;
        }
        if previous.exists() {
            std::fs::remove_dir_all(&previous).map_err(|e| MigrationError::path(&previous, e))?;
        }
        Ok(())
    }
}

impl Committer for StagingCommitter {
    fn commit(&self, env: &MigrationEnv, staging: &Path) -> Result<()> {
        let layout = &env.layout;
        let progress_path = layout.commit_progress();
        let mut progress = CommitProgress::load(&progress_path);
        if !progress.done.is_empty() {
            tracing::info!(completed = progress.done.len(), "Resuming interrupted commit");
        }

        if !progress.done.contains(&CommitStep::Verified) {
            Self::verify(staging, layout)?;
            progress.finish(CommitStep::Verified, &progress_path)?;
        }
        if !progress.done.contains(&CommitStep::SignedOut) {
            env.account.sign_out().map_err(MigrationError::from)?;
            progress.finish(CommitStep::SignedOut, &progress_path)?;
        }
        if !progress.done.contains(&CommitStep::SecureInstalled) {
            Self::install_secure(env)?;
            progress.finish(CommitStep::SecureInstalled, &progress_path)?;
        }
        if !progress.done.contains(&CommitStep::DatabaseInstalled) {
            Self::install_database(layout)?;
            progress.finish(CommitStep::DatabaseInstalled, &progress_path)?;
        }
        if !progress.done.contains(&CommitStep::MediaInstalled) {
            Self::install_media(layout)?;
            progress.finish(CommitStep::MediaInstalled, &progress_path)?;
        }
        if !progress.done.contains(&CommitStep::SettingsApplied) {
            let values = read_settings_file(&layout.staged_settings())?;
            env.settings.apply(&values)?;
            progress.finish(CommitStep::SettingsApplied, &progress_path)?;
        }

        layout::remove_if_exists(&layout.marker())?;
        match std::fs::remove_dir_all(staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MigrationError::path(staging, e)),
        }
        tracing::info!(event = "commit_complete", data = %layout.data_dir().display());
        Ok(())
    }
}

// =============================================================================
// Recovery
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing was left behind
    Clean,
    /// A finished transfer was committed
    Committed,
    /// An unfinished transfer was discarded
    Canceled,
    /// Staging without a marker was deleted
    StaleStagingRemoved,
}

/// Resolve whatever an interrupted process left on disk.
pub fn recover(env: &MigrationEnv) -> Result<Recovery> {
    let layout = &env.layout;
    if layout.has_marker() {
        if layout.is_done() {
            tracing::info!(session = ?layout.read_marker(), "Re-running interrupted commit");
            env.committer.commit(env, &layout.staging())?;
            return Ok(Recovery::Committed);
        }
        tracing::info!(session = ?layout.read_marker(), "Discarding unfinished migration");
        layout.discard()?;
        return Ok(Recovery::Canceled);
    }
    if layout.has_staging() {
        layout.discard()?;
        return Ok(Recovery::StaleStagingRemoved);
    }
    Ok(Recovery::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Setting;
    use crate::store::{write_settings_file, ACCOUNT_KEY, CORE_KEY};
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn stage_everything(env: &MigrationEnv, setting: Uuid) {
        let layout = &env.layout;
        layout.begin(Uuid::new_v4()).unwrap();
        fs::write(layout.staged_core(), b"peer-core").unwrap();
        fs::write(layout.staged_account(), b"peer-account").unwrap();
        fs::write(layout.staged_database(DatabaseKind::Encrypted), b"peer-db").unwrap();
        fs::create_dir_all(layout.staging_media().join("photos")).unwrap();
        fs::write(layout.staging_media().join("photos/p.jpg"), b"jpeg").unwrap();
        write_settings_file(
            &layout.staged_settings(),
            &[Setting {
                id: setting,
                value: "dark".into(),
            }],
        )
        .unwrap();
    }

    fn live_account(env: &MigrationEnv) {
        let layout = &env.layout;
        fs::create_dir_all(layout.media_dir()).unwrap();
        fs::write(layout.media_dir().join("old.jpg"), b"old").unwrap();
        fs::write(layout.live_database(DatabaseKind::Plain), b"own-db").unwrap();
        fs::write(layout.session_token(), b"token").unwrap();
        env.secure.set(CORE_KEY, b"own-core").unwrap();
        env.secure.set(ACCOUNT_KEY, b"own-account").unwrap();
    }

    #[test]
    fn test_commit_installs_staging() {
        let tmp = TempDir::new().unwrap();
        let env = MigrationEnv::file_backed(tmp.path());
        let setting = Uuid::new_v4();
        live_account(&env);
        stage_everything(&env, setting);
        env.layout.mark_done().unwrap();

        StagingCommitter.commit(&env, &env.layout.staging()).unwrap();

        let layout = &env.layout;
        assert_eq!(env.secure.get(CORE_KEY).unwrap().unwrap(), b"peer-core");
        assert_eq!(env.secure.get(ACCOUNT_KEY).unwrap().unwrap(), b"peer-account");
        assert_eq!(fs::read(layout.live_database(DatabaseKind::Encrypted)).unwrap(), b"peer-db");
        assert!(!layout.live_database(DatabaseKind::Plain).exists());
        assert!(layout.media_dir().join("photos/p.jpg").exists());
        assert!(!layout.media_dir().join("old.jpg").exists());
        assert!(!layout.session_token().exists());
        assert_eq!(env.settings.snapshot().unwrap()[0].id, setting);
        assert!(!layout.has_marker());
        assert!(!layout.has_staging());
    }

    #[test]
    fn test_incomplete_staging_leaves_live_untouched() {
        let tmp = TempDir::new().unwrap();
        let env = MigrationEnv::file_backed(tmp.path());
        live_account(&env);
        stage_everything(&env, Uuid::new_v4());
        fs::remove_file(env.layout.staged_database(DatabaseKind::Encrypted)).unwrap();

        let err = StagingCommitter
            .commit(&env, &env.layout.staging())
            .unwrap_err();
        assert!(matches!(err, MigrationError::BadDatabase(_)));
        assert_eq!(env.secure.get(CORE_KEY).unwrap().unwrap(), b"own-core");
        assert!(env.layout.session_token().exists());
        assert!(env.layout.media_dir().join("old.jpg").exists());
    }

    #[test]
    fn test_interrupted_commit_converges() {
        let tmp = TempDir::new().unwrap();
        let env = MigrationEnv::file_backed(tmp.path());
        live_account(&env);
        stage_everything(&env, Uuid::new_v4());
        env.layout.mark_done().unwrap();

        // Simulate a crash right after the database was moved
        let layout = &env.layout;
        fs::rename(
            layout.staged_database(DatabaseKind::Encrypted),
            layout.live_database(DatabaseKind::Encrypted),
        )
        .unwrap();
        let mut progress = CommitProgress::default();
        for step in [
            CommitStep::Verified,
            CommitStep::SignedOut,
            CommitStep::SecureInstalled,
        ] {
            progress.finish(step, &layout.commit_progress()).unwrap();
        }

        assert_eq!(recover(&env).unwrap(), Recovery::Committed);
        assert!(layout.media_dir().join("photos/p.jpg").exists());
        assert!(!layout.has_marker());
    }

    #[test]
    fn test_recover_discards_unfinished_transfer() {
        let tmp = TempDir::new().unwrap();
        let env = MigrationEnv::file_backed(tmp.path());
        live_account(&env);
        stage_everything(&env, Uuid::new_v4());

        assert_eq!(recover(&env).unwrap(), Recovery::Canceled);
        assert!(!env.layout.has_staging());
        assert_eq!(env.secure.get(CORE_KEY).unwrap().unwrap(), b"own-core");
        assert_eq!(recover(&env).unwrap(), Recovery::Clean);
    }

    #[test]
    fn test_recover_removes_orphaned_staging() {
        let tmp = TempDir::new().unwrap();
        let env = MigrationEnv::file_backed(tmp.path());
        fs::create_dir_all(env.layout.staging_media()).unwrap();
        assert_eq!(recover(&env).unwrap(), Recovery::StaleStagingRemoved);
        assert!(!env.layout.has_staging());
    }
}
