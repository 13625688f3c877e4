//! Collaborators the session and the commit coordinator consume.
//!
//! The traits are the seams; the file-backed implementations are what the
//! CLI runs with and what the tests exercise.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::commit::layout::{remove_if_exists, write_atomic};
use crate::protocol::Setting;

/// Key of the core secrets blob
pub const CORE_KEY: &str = "core";

/// Key of the account credentials blob
pub const ACCOUNT_KEY: &str = "account";

// =============================================================================
// Traits
// =============================================================================

/// Opaque blob store for secret configuration.
pub trait SecureStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// Install both blobs so that readers see either the old pair or the new one.
    fn replace(&self, core: &[u8], account: &[u8]) -> Result<()>;
}

pub trait SettingsStore: Send + Sync {
    fn snapshot(&self) -> Result<Vec<Setting>>;

    fn apply(&self, values: &[Setting]) -> Result<()>;
}

pub trait AccountSession: Send + Sync {
    /// Invalidate the current account's session. Idempotent.
    fn sign_out(&self) -> Result<()>;
}

// =============================================================================
// FileSecureStore
// =============================================================================

/// One `<key>.bin` file per blob under a directory. `replace` builds the
/// new directory beside the live one and swaps it in with renames.
#[derive(Debug, Clone)]
pub struct FileSecureStore {
    dir: PathBuf,
}

impl FileSecureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.dir.with_file_name(name)
    }

    fn blob_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.bin", key))
    }

    /// Finish a swap that stopped between its two renames.
    fn settle(&self) -> Result<()> {
        let fresh = self.sibling(".new");
        if !self.dir.exists() && fresh.exists() {
            std::fs::rename(&fresh, &self.dir)
                .with_context(|| format!("Failed to install {}", fresh.display()))?;
            tracing::warn!(path = %self.dir.display(), "Completed an interrupted secure store swap");
        }
        Ok(())
    }
}

impl SecureStore for FileSecureStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.settle()?;
        let path = Self::blob_path(&self.dir, key);
        match std::fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn set(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.settle()?;
        write_atomic(&Self::blob_path(&self.dir, key), blob)
    }

    fn replace(&self, core: &[u8], account: &[u8]) -> Result<()> {
        self.settle()?;
        let fresh = self.sibling(".new");
        let old = self.sibling(".old");

        if fresh.exists() {
            std::fs::remove_dir_all(&fresh)?;
        }
        write_atomic(&Self::blob_path(&fresh, CORE_KEY), core)?;
        write_atomic(&Self::blob_path(&fresh, ACCOUNT_KEY), account)?;

        if old.exists() {
            std::fs::remove_dir_all(&old)?;
        }
        if self.dir.exists() {
            std::fs::rename(&self.dir, &old)
                .with_context(|| format!("Failed to move aside {}", self.dir.display()))?;
        }
        std::fs::rename(&fresh, &self.dir)
            .with_context(|| format!("Failed to install {}", self.dir.display()))?;
        if old.exists() {
            std::fs::remove_dir_all(&old)?;
        }
        Ok(())
    }
}

// =============================================================================
// FileSettingsStore
// =============================================================================

/// Settings persisted as a JSON object of `uuid -> value`.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsStore for FileSettingsStore {
    fn snapshot(&self) -> Result<Vec<Setting>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_settings_file(&self.path)
    }

    fn apply(&self, values: &[Setting]) -> Result<()> {
        let mut merged: BTreeMap<Uuid, String> = self
            .snapshot()?
            .into_iter()
            .map(|s| (s.id, s.value))
            .collect();
        for s in values {
            merged.insert(s.id, s.value.clone());
        }
        let json = serde_json::to_vec_pretty(&merged)?;
        write_atomic(&self.path, &json)
    }
}

/// Read a settings file written by [`write_settings_file`].
pub fn read_settings_file(path: &Path) -> Result<Vec<Setting>> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let map: BTreeMap<Uuid, String> = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(map
        .into_iter()
        .map(|(id, value)| Setting { id, value })
        .collect())
}

pub fn write_settings_file(path: &Path, values: &[Setting]) -> Result<()> {
    let map: BTreeMap<Uuid, &str> = values.iter().map(|s| (s.id, s.value.as_str())).collect();
    let json = serde_json::to_vec_pretty(&map)?;
    write_atomic(path, &json)
}

// =============================================================================
// TokenAccountSession
// =============================================================================

/// Signs out by deleting the stored session token.
#[derive(Debug, Clone)]
pub struct TokenAccountSession {
    token: PathBuf,
}

impl TokenAccountSession {
    pub fn new(token: impl Into<PathBuf>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AccountSession for TokenAccountSession {
    fn sign_out(&self) -> Result<()> {
        remove_if_exists(&self.token)?;
        tracing::info!(event = "signed_out", token = %self.token.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secure_store_replace_swaps_both_blobs() {
        let tmp = TempDir::new().unwrap();
        let store = FileSecureStore::new(tmp.path().join("secure"));
        assert!(store.get(CORE_KEY).unwrap().is_none());

        store.set(CORE_KEY, b"old-core").unwrap();
        store.set(ACCOUNT_KEY, b"old-account").unwrap();
        store.replace(b"new-core", b"new-account").unwrap();

        assert_eq!(store.get(CORE_KEY).unwrap().unwrap(), b"new-core");
        assert_eq!(store.get(ACCOUNT_KEY).unwrap().unwrap(), b"new-account");
        assert!(!tmp.path().join("secure.old").exists());
        assert!(!tmp.path().join("secure.new").exists());
    }

    #[test]
    fn test_secure_store_settles_interrupted_swap() {
        let tmp = TempDir::new().unwrap();
        let fresh = tmp.path().join("secure.new");
        std::fs::create_dir_all(&fresh).unwrap();
        std::fs::write(fresh.join("core.bin"), b"c").unwrap();

        let store = FileSecureStore::new(tmp.path().join("secure"));
        assert_eq!(store.get(CORE_KEY).unwrap().unwrap(), b"c");
    }

    #[test]
    fn test_settings_apply_merges() {
        let tmp = TempDir::new().unwrap();
        let store = FileSettingsStore::new(tmp.path().join("settings.json"));
        assert!(store.snapshot().unwrap().is_empty());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .apply(&[Setting {
                id: a,
                value: "1".into(),
            }])
            .unwrap();
        store
            .apply(&[
                Setting {
                    id: a,
                    value: "2".into(),
                },
                Setting {
                    id: b,
                    value: "x".into(),
                },
            ])
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&Setting {
            id: a,
            value: "2".into()
        }));
    }

    #[test]
    fn test_sign_out_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let token = tmp.path().join("session.token");
        std::fs::write(&token, b"t").unwrap();
        let session = TokenAccountSession::new(&token);
        session.sign_out().unwrap();
        assert!(!token.exists());
        session.sign_out().unwrap();
    }
}
