//! Migration message catalogue.
//!
//! Every message is `schema_id (16) || schema_version (u32) || fields`.
//! Decoding dispatches only on the `(schema_id, schema_version)` pair;
//! an unknown pair is a hard error.

use crate::protocol::wire::{put_blob, put_bool, put_opt_blob, put_string, put_uuid, FieldReader};
use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

/// Largest repeated group accepted in one ListFiles / OnListFiles
pub const MAX_LIST_ENTRIES: usize = 1024;

/// Largest settings snapshot accepted in one Settings message
pub const MAX_SETTINGS: usize = 16 * 1024;

/// Size of a SHA-256 digest
pub const SHA256_LEN: usize = 32;

// =============================================================================
// Schema identifiers
// =============================================================================

pub mod schema {
    use uuid::Uuid;

    pub const QUERY_STATS: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0001);
    pub const ON_QUERY_STATS: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0002);
    pub const START: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0003);
    pub const LIST_FILES: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0004);
    pub const ON_LIST_FILES: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0005);
    pub const PUT_FILE: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0006);
    pub const ON_PUT_FILE: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0007);
    pub const SETTINGS: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0008);
    pub const ACCOUNT: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_0009);
    pub const TERMINATE: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_000a);
    pub const SHUTDOWN: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_000b);
    pub const ERROR: Uuid = Uuid::from_u128(0x6f1c_2a10_8d3e_4b52_9a41_00c3_5e7d_000c);
}

// =============================================================================
// Schema lookup
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    QueryStats,
    OnQueryStats,
    Start,
    ListFiles,
    OnListFiles,
    PutFile,
    OnPutFile,
    Settings,
    Account,
    Terminate,
    Shutdown,
    Error,
}

impl Kind {
    fn from_id(id: &Uuid) -> Option<Self> {
        let table = [
            (schema::QUERY_STATS, Kind::QueryStats),
            (schema::ON_QUERY_STATS, Kind::OnQueryStats),
            (schema::START, Kind::Start),
            (schema::LIST_FILES, Kind::ListFiles),
            (schema::ON_LIST_FILES, Kind::OnListFiles),
            (schema::PUT_FILE, Kind::PutFile),
            (schema::ON_PUT_FILE, Kind::OnPutFile),
            (schema::SETTINGS, Kind::Settings),
            (schema::ACCOUNT, Kind::Account),
            (schema::TERMINATE, Kind::Terminate),
            (schema::SHUTDOWN, Kind::Shutdown),
            (schema::ERROR, Kind::Error),
        ];
        table.iter().find(|(s, _)| s == id).map(|(_, k)| *k)
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    InternalError = 1,
    NoSpaceLeft = 2,
    IoError = 3,
    Revoked = 4,
    BadPeerVersion = 5,
    BadDatabase = 6,
    SecureStoreError = 7,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::InternalError),
            2 => Some(Self::NoSpaceLeft),
            3 => Some(Self::IoError),
            4 => Some(Self::Revoked),
            5 => Some(Self::BadPeerVersion),
            6 => Some(Self::BadDatabase),
            7 => Some(Self::SecureStoreError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InternalError => "INTERNAL_ERROR",
            Self::NoSpaceLeft => "NO_SPACE_LEFT",
            Self::IoError => "IO_ERROR",
            Self::Revoked => "REVOKED",
            Self::BadPeerVersion => "BAD_PEER_VERSION",
            Self::BadDatabase => "BAD_DATABASE",
            Self::SecureStoreError => "SECURE_STORE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Capacity snapshot a side reports once per negotiation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryInfo {
    pub dir_count: i64,
    pub file_count: i64,
    pub max_file_size: i64,
    pub total_file_size: i64,
    pub db_file_size: i64,
    pub db_free_space: i64,
    pub fs_free_space: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub path: String,
    pub file_id: i32,
    pub size: i64,
    /// Milliseconds since the Unix epoch; 0 when the peer speaks ListFiles v1
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListAck {
    pub file_id: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutFile {
    pub file_id: i32,
    pub chunk_offset: i64,
    pub chunk_data: Option<Bytes>,
    pub chunk_size: i32,
    /// Present only on the terminal chunk of a file
    pub sha256: Option<[u8; SHA256_LEN]>,
}

impl PutFile {
    pub fn is_final(&self) -> bool {
        self.sha256.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnPutFile {
    pub file_id: i32,
    pub result_offset: i64,
}

impl OnPutFile {
    /// Sentinel for an unrecoverable I/O error on the receiving side.
    pub const IO_FAILURE: i64 = -1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub id: Uuid,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Settings {
    pub has_peer_settings: bool,
    pub values: Vec<Setting>,
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct Account {
    pub secured_config: Bytes,
    pub account_config: Bytes,
    pub has_peer_account: bool,
}

// Secrets never reach the logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("secured_config_len", &self.secured_config.len())
            .field("account_config_len", &self.account_config.len())
            .field("has_peer_account", &self.has_peer_account)
            .finish()
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    QueryStats { max_file_size: i64 },
    OnQueryStats(QueryInfo),
    Start { max_file_size: i64 },
    ListFiles(Vec<ListEntry>),
    OnListFiles(Vec<ListAck>),
    PutFile(PutFile),
    OnPutFile(OnPutFile),
    Settings(Settings),
    Account(Account),
    TerminateMigration { commit: bool, done: bool },
    Shutdown { close: bool },
    Error(ErrorCode),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::QueryStats { .. } => "QueryStats",
            Message::OnQueryStats(_) => "OnQueryStats",
            Message::Start { .. } => "Start",
            Message::ListFiles(_) => "ListFiles",
            Message::OnListFiles(_) => "OnListFiles",
            Message::PutFile(_) => "PutFile",
            Message::OnPutFile(_) => "OnPutFile",
            Message::Settings(_) => "Settings",
            Message::Account(_) => "Account",
            Message::TerminateMigration { .. } => "TerminateMigration",
            Message::Shutdown { .. } => "Shutdown",
            Message::Error(_) => "Error",
        }
    }

    /// Schema identity written in front of the fields.
    pub fn schema(&self) -> (Uuid, u32) {
        match self {
            Message::QueryStats { .. } => (schema::QUERY_STATS, 1),
            Message::OnQueryStats(_) => (schema::ON_QUERY_STATS, 1),
            Message::Start { .. } => (schema::START, 1),
            Message::ListFiles(_) => (schema::LIST_FILES, 2),
            Message::OnListFiles(_) => (schema::ON_LIST_FILES, 1),
            Message::PutFile(_) => (schema::PUT_FILE, 1),
            Message::OnPutFile(_) => (schema::ON_PUT_FILE, 1),
            Message::Settings(_) => (schema::SETTINGS, 1),
            Message::Account(_) => (schema::ACCOUNT, 1),
            Message::TerminateMigration { .. } => (schema::TERMINATE, 1),
            Message::Shutdown { .. } => (schema::SHUTDOWN, 1),
            Message::Error(_) => (schema::ERROR, 1),
        }
    }

    pub fn encode(&self) -> Bytes {
        let (id, version) = self.schema();
        let mut buf = BytesMut::with_capacity(20 + self.payload_hint());
        put_uuid(&mut buf, &id);
        buf.put_u32(version);

        match self {
            Message::QueryStats { max_file_size } | Message::Start { max_file_size } => {
                buf.put_i64(*max_file_size);
            }
            Message::OnQueryStats(info) => {
                buf.put_i64(info.dir_count);
                buf.put_i64(info.file_count);
                buf.put_i64(info.max_file_size);
                buf.put_i64(info.total_file_size);
                buf.put_i64(info.db_file_size);
                buf.put_i64(info.db_free_space);
                buf.put_i64(info.fs_free_space);
            }
            Message::ListFiles(entries) => {
                buf.put_i32(entries.len() as i32);
                for e in entries {
                    put_string(&mut buf, &e.path);
                    buf.put_i32(e.file_id);
                    buf.put_i64(e.size);
                    buf.put_i64(e.mtime);
                }
            }
            Message::OnListFiles(acks) => {
                buf.put_i32(acks.len() as i32);
                for a in acks {
                    buf.put_i32(a.file_id);
                    buf.put_i64(a.offset);
                }
            }
            Message::PutFile(put) => {
                buf.put_i32(put.file_id);
                buf.put_i64(put.chunk_offset);
                put_opt_blob(&mut buf, put.chunk_data.as_deref());
                buf.put_i32(put.chunk_size);
                put_opt_blob(&mut buf, put.sha256.as_ref().map(|h| &h[..]));
            }
            Message::OnPutFile(ack) => {
                buf.put_i32(ack.file_id);
                buf.put_i64(ack.result_offset);
            }
            Message::Settings(settings) => {
                put_bool(&mut buf, settings.has_peer_settings);
                buf.put_i32(settings.values.len() as i32);
                for s in &settings.values {
                    put_uuid(&mut buf, &s.id);
                    put_string(&mut buf, &s.value);
                }
            }
            Message::Account(account) => {
                put_blob(&mut buf, &account.secured_config);
                put_blob(&mut buf, &account.account_config);
                put_bool(&mut buf, account.has_peer_account);
            }
            Message::TerminateMigration { commit, done } => {
                put_bool(&mut buf, *commit);
                put_bool(&mut buf, *done);
            }
            Message::Shutdown { close } => put_bool(&mut buf, *close),
            Message::Error(code) => buf.put_u32(*code as u32),
        }

        buf.freeze()
    }

    fn payload_hint(&self) -> usize {
        match self {
            Message::PutFile(put) => 64 + put.chunk_data.as_ref().map_or(0, |d| d.len()),
            Message::ListFiles(entries) => entries.iter().map(|e| 24 + e.path.len()).sum(),
            Message::Account(a) => 16 + a.secured_config.len() + a.account_config.len(),
            _ => 64,
        }
    }

    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut r = FieldReader::new(frame, "message header");
        let id = r.uuid("schema_id")?;
        let version = r.u32("schema_version")?;

        let kind = Kind::from_id(&id)
            .ok_or_else(|| anyhow::anyhow!("Unknown message schema {} version {}", id, version))?;

        let msg = match (kind, version) {
            (Kind::QueryStats, 1) => {
                r.set_message("QueryStats");
                Message::QueryStats {
                    max_file_size: r.i64("maxFileSize")?,
                }
            }
            (Kind::OnQueryStats, 1) => {
                r.set_message("OnQueryStats");
                Message::OnQueryStats(QueryInfo {
                    dir_count: r.i64("dirCount")?,
                    file_count: r.i64("fileCount")?,
                    max_file_size: r.i64("maxFileSize")?,
                    total_file_size: r.i64("totalFileSize")?,
                    db_file_size: r.i64("dbFileSize")?,
                    db_free_space: r.i64("dbFreeSpace")?,
                    fs_free_space: r.i64("fsFreeSpace")?,
                })
            }
            (Kind::Start, 1) => {
                r.set_message("Start");
                Message::Start {
                    max_file_size: r.i64("maxFileSize")?,
                }
            }
            (Kind::ListFiles, 1) | (Kind::ListFiles, 2) => {
                r.set_message("ListFiles");
                let count = r.count("files", MAX_LIST_ENTRIES)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let path = r.string("path")?;
                    let file_id = r.i32("fileId")?;
                    let size = r.i64("size")?;
                    let mtime = if version >= 2 { r.i64("mtime")? } else { 0 };
                    entries.push(ListEntry {
                        path,
                        file_id,
                        size,
                        mtime,
                    });
                }
                Message::ListFiles(entries)
            }
            (Kind::OnListFiles, 1) => {
                r.set_message("OnListFiles");
                let count = r.count("files", MAX_LIST_ENTRIES)?;
                let mut acks = Vec::with_capacity(count);
                for _ in 0..count {
                    acks.push(ListAck {
                        file_id: r.i32("fileId")?,
                        offset: r.i64("offset")?,
                    });
                }
                Message::OnListFiles(acks)
            }
            (Kind::PutFile, 1) => {
                r.set_message("PutFile");
                let file_id = r.i32("fileId")?;
                let chunk_offset = r.i64("chunkOffset")?;
                let chunk_data = r.opt_blob("chunkData")?;
                let chunk_size = r.i32("chunkSize")?;
                let sha256 = match r.opt_blob("sha256")? {
                    Some(raw) => {
                        let digest: [u8; SHA256_LEN] = raw.as_ref().try_into().map_err(|_| {
                            anyhow::anyhow!("PutFile sha256 has {} bytes, expected 32", raw.len())
                        })?;
                        Some(digest)
                    }
                    None => None,
                };
                Message::PutFile(PutFile {
                    file_id,
                    chunk_offset,
                    chunk_data,
                    chunk_size,
                    sha256,
                })
            }
            (Kind::OnPutFile, 1) => {
                r.set_message("OnPutFile");
                Message::OnPutFile(OnPutFile {
                    file_id: r.i32("fileId")?,
                    result_offset: r.i64("resultOffset")?,
                })
            }
            (Kind::Settings, 1) => {
                r.set_message("Settings");
                let has_peer_settings = r.bool("hasPeerSettings")?;
                let count = r.count("settings", MAX_SETTINGS)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(Setting {
                        id: r.uuid("settingId")?,
                        value: r.string("value")?,
                    });
                }
                Message::Settings(Settings {
                    has_peer_settings,
                    values,
                })
            }
            (Kind::Account, 1) => {
                r.set_message("Account");
                Message::Account(Account {
                    secured_config: r.blob("securedConfig")?,
                    account_config: r.blob("accountConfig")?,
                    has_peer_account: r.bool("hasPeerAccount")?,
                })
            }
            (Kind::Terminate, 1) => {
                r.set_message("TerminateMigration");
                Message::TerminateMigration {
                    commit: r.bool("commit")?,
                    done: r.bool("done")?,
                }
            }
            (Kind::Shutdown, 1) => {
                r.set_message("Shutdown");
                Message::Shutdown {
                    close: r.bool("close")?,
                }
            }
            (Kind::Error, 1) => {
                r.set_message("Error");
                let raw = r.u32("errorCode")?;
                let code = ErrorCode::from_u32(raw)
                    .ok_or_else(|| anyhow::anyhow!("Unknown error code {}", raw))?;
                Message::Error(code)
            }
            (kind, version) => {
                anyhow::bail!("Unknown message schema {:?} version {}", kind, version);
            }
        };

        Ok(msg)
    }
}

// =============================================================================
// Tests
// =============================================================================
