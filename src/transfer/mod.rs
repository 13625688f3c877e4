//! File Transfer Engine.
//!
//! Chunked, windowed, resumable transfer of media files and the account
//! database. The sender streams one record at a time; the receiver writes
//! chunks in order and verifies a SHA-256 over the whole file.

pub mod journal;
pub mod receiver;
pub mod scan;
pub mod sender;

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

pub use journal::{Journal, JournalEntry};
pub use receiver::{ChunkOutcome, FileReceiver};
pub use scan::{query_info, scan_media, ScanResult};
pub use sender::{AckOutcome, FileSender};

/// Record id of the plain account database
pub const DB_PLAIN_ID: i32 = 1;

/// Record id of the encrypted account database
pub const DB_ENCRYPTED_ID: i32 = 2;

/// First id handed to discovered media files
pub const FIRST_FILE_ID: i32 = 16;

/// Read buffer for hashing an existing prefix (1MB)
const HASH_BUF_SIZE: usize = 1024 * 1024;

// =============================================================================
// Database variants
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Plain,
    Encrypted,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 2] = [DatabaseKind::Encrypted, DatabaseKind::Plain];

    pub fn file_name(&self) -> &'static str {
        match self {
            DatabaseKind::Plain => "account.db",
            DatabaseKind::Encrypted => "account.db.enc",
        }
    }

    pub fn record_id(&self) -> i32 {
        match self {
            DatabaseKind::Plain => DB_PLAIN_ID,
            DatabaseKind::Encrypted => DB_ENCRYPTED_ID,
        }
    }

    pub fn from_record_id(id: i32) -> Option<Self> {
        match id {
            DB_PLAIN_ID => Some(DatabaseKind::Plain),
            DB_ENCRYPTED_ID => Some(DatabaseKind::Encrypted),
            _ => None,
        }
    }
}

// =============================================================================
// FileRecord
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Discovered,
    WaitingListAck,
    Queued,
    Sending,
    WaitingAck,
    Done,
    Dropped,
}

/// One transferable unit on the sending side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i32,
    /// Path relative to the media root, `/`-separated
    pub path: String,
    /// Absolute local path
    pub source: PathBuf,
    pub size: i64,
    /// Milliseconds since the Unix epoch
    pub mtime: i64,
    /// Resume offset reported by the peer
    pub offset: i64,
    /// Highest position the peer has confirmed
    pub acked: i64,
    pub state: RecordState,
}

impl FileRecord {
    pub fn new(id: i32, path: String, source: PathBuf, size: i64, mtime: i64) -> Self {
        Self {
            id,
            path,
            source,
            size,
            mtime,
            offset: 0,
            acked: 0,
            state: RecordState::Discovered,
        }
    }

    pub fn is_database(&self) -> bool {
        DatabaseKind::from_record_id(self.id).is_some()
    }
}

// =============================================================================
// TransferWindow
// =============================================================================

/// What the sender expects back for one in-flight chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub file_id: i32,
    /// `resultOffset` that confirms the chunk
    pub expected: i64,
    /// Data bytes carried by the chunk
    pub len: i64,
    pub is_final: bool,
}

/// Bounded set of sent-but-unacknowledged chunk requests.
#[derive(Debug)]
pub struct TransferWindow {
    max_requests: usize,
    chunk_size: usize,
    in_flight: HashMap<u64, ChunkAck>,
    bytes: i64,
}

impl TransferWindow {
    pub fn new(max_requests: usize, chunk_size: usize) -> Self {
        Self {
            max_requests,
            chunk_size,
            in_flight: HashMap::new(),
            bytes: 0,
        }
    }

    pub fn has_room(&self) -> bool {
        self.in_flight.len() < self.max_requests
    }

    pub fn insert(&mut self, request_id: u64, ack: ChunkAck) {
        debug_assert!(ack.len <= self.chunk_size as i64);
        self.bytes += ack.len;
        if let Some(old) = self.in_flight.insert(request_id, ack) {
            self.bytes -= old.len;
        }
    }

    pub fn remove(&mut self, request_id: u64) -> Option<ChunkAck> {
        let ack = self.in_flight.remove(&request_id)?;
        self.bytes -= ack.len;
        Some(ack)
    }

    /// Forget every chunk of `file_id`; their late acks become unknown.
    pub fn remove_file(&mut self, file_id: i32) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, ack| ack.file_id != file_id);
        self.bytes = self.in_flight.values().map(|a| a.len).sum();
        before - self.in_flight.len()
    }

    pub fn pending_bytes(&self) -> i64 {
        self.bytes
    }

    /// Upper bound on `pending_bytes`.
    pub fn max_bytes(&self) -> i64 {
        (self.max_requests * self.chunk_size) as i64
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.bytes = 0;
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Modification time in milliseconds since the Unix epoch.
pub fn mtime_millis(meta: &Metadata) -> i64 {
    let t = filetime::FileTime::from_last_modification_time(meta);
    t.unix_seconds() * 1000 + i64::from(t.nanoseconds() / 1_000_000)
}

/// Timestamps match when they fall in the same whole second.
pub fn same_second(a_ms: i64, b_ms: i64) -> bool {
    a_ms.div_euclid(1000) == b_ms.div_euclid(1000)
}

/// SHA-256 state over the first `len` bytes of `file`, read from the start.
pub(crate) fn hash_prefix(file: &mut File, len: u64) -> Result<Sha256> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut left = len;
    while left > 0 {
        let want = (left as usize).min(buf.len());
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            anyhow::bail!("File ended {} bytes before the resume offset", left);
        }
        hasher.update(&buf[..n]);
        left -= n as u64;
    }
    Ok(hasher)
}

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        anyhow::bail!("Empty path not allowed");
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        anyhow::bail!("Absolute paths not allowed: {}", relative);
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("Path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) | Component::RootDir => {
                anyhow::bail!("Rooted paths not allowed: {}", relative);
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        anyhow::bail!("Path escapes root directory: {}", relative);
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}
