//! Receive side of the transfer engine.
//!
//! Writes chunks into the staging area, strictly in order per file, and
//! verifies the SHA-256 carried by the final chunk. Resume offsets come
//! from the receive journal and the on-disk length of staged files.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::commit::Layout;
use crate::protocol::{ListAck, ListEntry, OnPutFile, PutFile};
use crate::session::status::ByteCounters;
use crate::transfer::{hash_prefix, validate_path, DatabaseKind, Journal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IncomingState {
    Listed,
    Receiving,
    Done,
    Failed,
}

struct ReceiveStream {
    file: File,
    hasher: Sha256,
}

struct IncomingFile {
    key: String,
    dest: PathBuf,
    size: i64,
    mtime: i64,
    state: IncomingState,
    /// Bytes written and hashed so far
    position: i64,
    stream: Option<ReceiveStream>,
}

/// What handling one chunk produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub result_offset: i64,
    /// The file was verified by this chunk
    pub completed: bool,
    pub database: Option<DatabaseKind>,
}

impl ChunkOutcome {
    fn reply(result_offset: i64) -> Self {
        Self {
            result_offset,
            completed: false,
            database: None,
        }
    }
}

pub struct FileReceiver {
    layout: Layout,
    journal: Journal,
    incoming: HashMap<i32, IncomingFile>,
    errors: u64,
}

impl FileReceiver {
    pub fn new(layout: Layout) -> Self {
        let journal = Journal::load(&layout.journal());
        Self {
            layout,
            journal,
            incoming: HashMap::new(),
            errors: 0,
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Some listed file is neither verified nor failed.
    pub fn has_active(&self) -> bool {
        self.incoming
            .values()
            .any(|f| matches!(f.state, IncomingState::Listed | IncomingState::Receiving))
    }

    pub fn counters(&self) -> ByteCounters {
        let mut c = ByteCounters::default();
        for f in self.incoming.values() {
            if f.state == IncomingState::Failed {
                continue;
            }
            c.total += f.size;
            c.done += if f.state == IncomingState::Done {
                f.size
            } else {
                f.position
            };
        }
        c
    }

    /// Close open streams and forget in-memory progress. Bytes on disk
    /// stay; the next listing resumes from them.
    pub fn reset(&mut self) {
        for f in self.incoming.values_mut() {
            if let Some(stream) = f.stream.take() {
                let _ = stream.file.sync_all();
            }
        }
        self.incoming.clear();
        if let Err(e) = self.journal.save() {
            tracing::warn!("Failed to save journal: {:#}", e);
        }
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Register a listed batch and compute a resume offset per file.
    pub fn on_list(&mut self, entries: &[ListEntry]) -> Vec<ListAck> {
        let acks = entries
            .iter()
            .map(|entry| {
                let offset = match self.register(entry) {
                    Ok(offset) => offset,
                    Err(e) => {
                        tracing::warn!(path = %entry.path, "Refusing listed file: {:#}", e);
                        self.errors += 1;
                        OnPutFile::IO_FAILURE
                    }
                };
                ListAck {
                    file_id: entry.file_id,
                    offset,
                }
            })
            .collect();
        if let Err(e) = self.journal.save() {
            tracing::warn!("Failed to save journal: {:#}", e);
        }
        acks
    }

    fn register(&mut self, entry: &ListEntry) -> Result<i64> {
        if entry.size < 0 {
            anyhow::bail!("negative size {}", entry.size);
        }
        let (key, dest) = match DatabaseKind::from_record_id(entry.file_id) {
            Some(kind) => (
                kind.file_name().to_string(),
                self.layout.staged_database(kind),
            ),
            None => (
                Layout::media_key(&entry.path),
                validate_path(&self.layout.staging_media(), &entry.path)?,
            ),
        };

        let on_disk = match std::fs::metadata(&dest) {
            Ok(meta) => meta.len() as i64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", dest.display())),
        };

        let (offset, complete) = match self.journal.get(&key) {
            Some(j) if j.matches(entry.size, entry.mtime) => {
                let offset = on_disk.min(entry.size);
                (offset, j.complete && on_disk == entry.size)
            }
            _ => {
                if on_disk > 0 {
                    // Stale copy of a different version
                    OpenOptions::new()
                        .write(true)
                        .open(&dest)
                        .and_then(|f| f.set_len(0))
                        .with_context(|| format!("Failed to truncate {}", dest.display()))?;
                }
                (0, false)
            }
        };
        self.journal.record(&key, entry.size, entry.mtime);
        self.journal.set_complete(&key, complete);

        self.incoming.insert(
            entry.file_id,
            IncomingFile {
                key,
                dest,
                size: entry.size,
                mtime: entry.mtime,
                state: IncomingState::Listed,
                position: offset,
                stream: None,
            },
        );
        Ok(offset)
    }

    // =========================================================================
    // Chunks
    // =========================================================================

    pub fn on_chunk(&mut self, put: &PutFile) -> ChunkOutcome {
        let Some(file) = self.incoming.get_mut(&put.file_id) else {
            tracing::warn!(file_id = put.file_id, "Chunk for a file that was never listed");
            return ChunkOutcome::reply(OnPutFile::IO_FAILURE);
        };
        match file.state {
            IncomingState::Done => return ChunkOutcome::reply(file.size),
            IncomingState::Failed => return ChunkOutcome::reply(OnPutFile::IO_FAILURE),
            IncomingState::Listed | IncomingState::Receiving => {}
        }

        match Self::apply(file, put, &mut self.journal, &mut self.errors) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(path = %file.dest.display(), "Write failed: {:#}", e);
                file.stream = None;
                file.state = IncomingState::Failed;
                self.errors += 1;
                ChunkOutcome::reply(OnPutFile::IO_FAILURE)
            }
        }
    }

    fn apply(
        file: &mut IncomingFile,
        put: &PutFile,
        journal: &mut Journal,
        errors: &mut u64,
    ) -> Result<ChunkOutcome> {
        let offset = put.chunk_offset;

        if file.stream.is_none() {
            let local_len = match std::fs::metadata(&file.dest) {
                Ok(meta) => meta.len() as i64,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            if offset > local_len {
                // Peer is ahead of what we hold; make it resend from our end
                file.position = local_len;
                return Ok(ChunkOutcome::reply(local_len));
            }
            Self::open_at(file, offset)?;
        } else if offset < file.position {
            // Explicit resend from an earlier offset
            Self::open_at(file, offset)?;
        } else if offset > file.position {
            return Ok(ChunkOutcome::reply(file.position));
        }

        let Some(stream) = file.stream.as_mut() else {
            anyhow::bail!("stream for {} is not open", file.dest.display());
        };

        let Some(declared) = put.sha256 else {
            let data = put.chunk_data.as_deref().unwrap_or(&[]);
            if data.len() as i64 != i64::from(put.chunk_size) {
                tracing::debug!(
                    file_id = put.file_id,
                    len = data.len(),
                    chunk_size = put.chunk_size,
                    "Chunk length disagrees with chunkSize"
                );
                return Ok(ChunkOutcome::reply(file.position));
            }
            if file.position + data.len() as i64 > file.size {
                return Ok(ChunkOutcome::reply(file.position));
            }
            stream.file.write_all(data)?;
            stream.hasher.update(data);
            file.position += data.len() as i64;
            return Ok(ChunkOutcome::reply(file.position));
        };

        let digest: [u8; 32] = stream.hasher.clone().finalize().into();
        if file.position == file.size && digest == declared {
            stream.file.flush()?;
            stream.file.sync_all()?;
            file.stream = None;
            file.state = IncomingState::Done;

            let secs = file.mtime.div_euclid(1000);
            let nanos = (file.mtime.rem_euclid(1000) * 1_000_000) as u32;
            if let Err(e) = filetime::set_file_mtime(
                &file.dest,
                filetime::FileTime::from_unix_time(secs, nanos),
            ) {
                tracing::debug!(path = %file.dest.display(), "Failed to set mtime: {}", e);
            }
            journal.set_complete(&file.key, true);
            journal.save()?;

            tracing::debug!(path = %file.dest.display(), size = file.size, "File verified");
            return Ok(ChunkOutcome {
                result_offset: file.size,
                completed: true,
                database: DatabaseKind::from_record_id(put.file_id),
            });
        }

        tracing::warn!(
            path = %file.dest.display(),
            position = file.position,
            size = file.size,
            expected = %hex::encode(declared),
            actual = %hex::encode(digest),
            "Hash mismatch, discarding received data"
        );
        *errors += 1;
        stream.file.set_len(0)?;
        file.stream = None;
        file.position = 0;
        file.state = IncomingState::Listed;
        journal.set_complete(&file.key, false);
        Ok(ChunkOutcome::reply(0))
    }

    /// Open the staged file, cut it to `offset`, and hash what remains.
    fn open_at(file: &mut IncomingFile, offset: i64) -> Result<()> {
        if let Some(parent) = file.dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file.dest)
            .with_context(|| format!("Failed to open {}", file.dest.display()))?;
        handle.set_len(offset as u64)?;
        let hasher = hash_prefix(&mut handle, offset as u64)?;
        handle.seek(SeekFrom::Start(offset as u64))?;

        file.stream = Some(ReceiveStream {
            file: handle,
            hasher,
        });
        file.position = offset;
        file.state = IncomingState::Receiving;
        Ok(())
    }
}
