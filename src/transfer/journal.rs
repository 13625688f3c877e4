//! Receive journal.
//!
//! Remembers, per staged path, the size and mtime the peer announced and
//! whether the file was verified. A later listing can then resume from the
//! on-disk length instead of starting over.
//!
//! Stored as JSON and replaced atomically (temp file + rename).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::transfer::same_second;

const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub size: i64,
    /// Milliseconds since the Unix epoch
    pub mtime: i64,
    pub complete: bool,
}

impl JournalEntry {
    /// Same file as announced, comparing mtimes in whole seconds.
    pub fn matches(&self, size: i64, mtime: i64) -> bool {
        self.size == size && same_second(self.mtime, mtime)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    version: u32,
    entries: BTreeMap<String, JournalEntry>,
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    entries: BTreeMap<String, JournalEntry>,
    dirty: bool,
}

impl Journal {
    /// Load the journal at `path`. A missing or unreadable journal starts
    /// empty, which only costs a full retransfer.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read(path) {
            Ok(raw) => match serde_json::from_slice::<JournalFile>(&raw) {
                Ok(file) if file.version == JOURNAL_VERSION => file.entries,
                Ok(file) => {
                    tracing::warn!(
                        path = %path.display(),
                        version = file.version,
                        "Ignoring journal with unknown version"
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Ignoring corrupt journal: {}", e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Cannot read journal: {}", e);
                BTreeMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&JournalEntry> {
        self.entries.get(key)
    }

    /// Record an announcement. A changed size or mtime clears `complete`.
    pub fn record(&mut self, key: &str, size: i64, mtime: i64) {
        let complete = self
            .entries
            .get(key)
            .map(|e| e.complete && e.matches(size, mtime))
            .unwrap_or(false);
        let entry = JournalEntry {
            size,
            mtime,
            complete,
        };
        if self.entries.get(key) != Some(&entry) {
            self.entries.insert(key.to_string(), entry);
            self.dirty = true;
        }
    }

    pub fn set_complete(&mut self, key: &str, complete: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.complete != complete {
                entry.complete = complete;
                self.dirty = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist if anything changed since the last save.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let dir = self
            .path
            .parent()
            .context("Journal path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let file = JournalFile {
            version: JOURNAL_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        tracing::debug!(
            event = "journal_saved",
            path = %self.path.display(),
            entries = self.entries.len(),
        );
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.json");

        let mut journal = Journal::load(&path);
        assert!(journal.is_empty());
        journal.record("media/a.jpg", 100, 1_700_000_000_500);
        journal.set_complete("media/a.jpg", true);
        journal.save().unwrap();

        let reloaded = Journal::load(&path);
        let entry = reloaded.get("media/a.jpg").unwrap();
        assert_eq!(entry.size, 100);
        assert!(entry.complete);
    }

    #[test]
    fn test_changed_announcement_clears_complete() {
        let tmp = TempDir::new().unwrap();
        let mut journal = Journal::load(&tmp.path().join("journal.json"));
        journal.record("k", 10, 5_000);
        journal.set_complete("k", true);

        // Same second, different millis: still the same file
        journal.record("k", 10, 5_900);
        assert!(journal.get("k").unwrap().complete);

        journal.record("k", 11, 5_900);
        assert!(!journal.get("k").unwrap().complete);
    }

    #[test]
    fn test_corrupt_journal_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(Journal::load(&path).is_empty());
    }
}
