//! Send side of the transfer engine.
//!
//! Records flow: listed in batches, acknowledged with a resume offset,
//! queued, then streamed one at a time in fixed-size chunks. The last
//! chunk of a file carries the SHA-256 of the whole file instead of data.

use anyhow::{Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::protocol::{ListAck, ListEntry, Message, OnPutFile, PutFile};
use crate::session::status::ByteCounters;
use crate::transfer::{hash_prefix, ChunkAck, FileRecord, RecordState, TransferWindow};
use crate::transport::Outbox;

/// Result of applying one `OnPutFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Not a chunk we are waiting for (stale or duplicate)
    Unknown,
    Progress,
    Completed { file_id: i32, is_database: bool },
    /// Resent from the reported offset
    Requeued { file_id: i32, offset: i64 },
    /// Peer reported an unrecoverable error; not retried
    Dropped { file_id: i32 },
}

struct SendStream {
    file_id: i32,
    file: File,
    hasher: Sha256,
    position: i64,
    size: i64,
}

pub struct FileSender {
    records: HashMap<i32, FileRecord>,
    to_list: VecDeque<i32>,
    wait_list_ack: HashMap<u64, Vec<i32>>,
    queue: VecDeque<i32>,
    current: Option<SendStream>,
    window: TransferWindow,
    chunk_size: usize,
    list_batch: usize,
    errors: u64,
    buf: Vec<u8>,
}

impl FileSender {
    pub fn new(chunk_size: usize, window_size: usize, list_batch: usize) -> Self {
        Self {
            records: HashMap::new(),
            to_list: VecDeque::new(),
            wait_list_ack: HashMap::new(),
            queue: VecDeque::new(),
            current: None,
            window: TransferWindow::new(window_size, chunk_size),
            chunk_size,
            list_batch: list_batch.max(1),
            errors: 0,
            buf: vec![0u8; chunk_size],
        }
    }

    pub fn add(&mut self, mut record: FileRecord) {
        record.state = RecordState::Discovered;
        record.offset = 0;
        record.acked = 0;
        self.to_list.push_back(record.id);
        self.records.insert(record.id, record);
    }

    pub fn record(&self, id: i32) -> Option<&FileRecord> {
        self.records.get(&id)
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn window(&self) -> &TransferWindow {
        &self.window
    }

    /// Nothing left to list and every batch acknowledged.
    pub fn listing_done(&self) -> bool {
        self.to_list.is_empty() && self.wait_list_ack.is_empty()
    }

    /// No listing, queued, streaming or unacknowledged work.
    pub fn is_idle(&self) -> bool {
        self.listing_done()
            && self.queue.is_empty()
            && self.current.is_none()
            && self.window.is_empty()
    }

    pub fn counters(&self) -> ByteCounters {
        let mut c = ByteCounters {
            pending: self.window.pending_bytes(),
            ..Default::default()
        };
        for r in self.records.values() {
            if r.state == RecordState::Dropped {
                continue;
            }
            c.total += r.size;
            c.done += r.acked;
        }
        c
    }

    /// Forget all in-memory progress, e.g. after the link dropped.
    pub fn reset(&mut self) {
        self.records.clear();
        self.to_list.clear();
        self.wait_list_ack.clear();
        self.queue.clear();
        self.current = None;
        self.window.clear();
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Send every unlisted record in batches.
    pub fn list_pending(&mut self, outbox: &mut Outbox) {
        while !self.to_list.is_empty() {
            let n = self.to_list.len().min(self.list_batch);
            let ids: Vec<i32> = self.to_list.drain(..n).collect();
            let mut entries = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(r) = self.records.get_mut(id) {
                    r.state = RecordState::WaitingListAck;
                    entries.push(ListEntry {
                        path: r.path.clone(),
                        file_id: r.id,
                        size: r.size,
                        mtime: r.mtime,
                    });
                }
            }
            let request_id = outbox.request(Message::ListFiles(entries));
            tracing::debug!(request_id, files = ids.len(), "Listed batch");
            self.wait_list_ack.insert(request_id, ids);
        }
    }

    /// Apply resume offsets for one listed batch. Returns false for an
    /// unknown request id.
    pub fn on_list_ack(&mut self, request_id: u64, acks: &[ListAck]) -> bool {
        let Some(ids) = self.wait_list_ack.remove(&request_id) else {
            return false;
        };
        let offsets: HashMap<i32, i64> = acks.iter().map(|a| (a.file_id, a.offset)).collect();

        for id in ids {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            let offset = offsets.get(&id).copied().unwrap_or(0);
            if offset < 0 {
                tracing::warn!(path = %record.path, "Peer refused file");
                record.state = RecordState::Dropped;
                self.errors += 1;
                continue;
            }
            // A resume point past the end means the peer copy is unusable
            let offset = if offset > record.size { 0 } else { offset };
            record.offset = offset;
            record.acked = offset;
            record.state = RecordState::Queued;
            self.queue.push_back(id);
        }
        true
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Fill the transfer window with chunk requests.
    pub fn pump(&mut self, outbox: &mut Outbox) {
        while self.window.has_room() {
            if self.current.is_none() {
                let Some(id) = self.queue.pop_front() else {
                    return;
                };
                match self.open(id) {
                    Ok(stream) => self.current = Some(stream),
                    Err(e) => {
                        tracing::warn!(file_id = id, "Cannot send file: {:#}", e);
                        self.drop_record(id);
                        continue;
                    }
                }
            }
            if let Err(e) = self.next_chunk(outbox) {
                if let Some(stream) = self.current.take() {
                    tracing::warn!(file_id = stream.file_id, "Read failed: {:#}", e);
                    self.drop_record(stream.file_id);
                }
            }
        }
    }

    fn open(&mut self, id: i32) -> Result<SendStream> {
        let record = self
            .records
            .get_mut(&id)
            .with_context(|| format!("No record {}", id))?;
        let mut file = File::open(&record.source)
            .with_context(|| format!("Failed to open {}", record.source.display()))?;
        let len = file.metadata()?.len() as i64;
        if len < record.size {
            anyhow::bail!(
                "{} shrank from {} to {} bytes",
                record.source.display(),
                record.size,
                len
            );
        }

        // The digest covers the whole file, including the part the peer has
        let hasher = hash_prefix(&mut file, record.offset as u64)
            .with_context(|| format!("Failed to hash {}", record.source.display()))?;
        file.seek(SeekFrom::Start(record.offset as u64))?;

        record.state = RecordState::Sending;
        tracing::debug!(
            file_id = id,
            path = %record.path,
            offset = record.offset,
            size = record.size,
            "Streaming file"
        );
        Ok(SendStream {
            file_id: id,
            file,
            hasher,
            position: record.offset,
            size: record.size,
        })
    }

    fn next_chunk(&mut self, outbox: &mut Outbox) -> Result<()> {
        let Some(stream) = self.current.as_mut() else {
            return Ok(());
        };

        if stream.position < stream.size {
            let want = ((stream.size - stream.position) as usize).min(self.chunk_size);
            stream.file.read_exact(&mut self.buf[..want])?;
            stream.hasher.update(&self.buf[..want]);

            let put = PutFile {
                file_id: stream.file_id,
                chunk_offset: stream.position,
                chunk_data: Some(Bytes::copy_from_slice(&self.buf[..want])),
                chunk_size: want as i32,
                sha256: None,
            };
            stream.position += want as i64;
            let request_id = outbox.request(Message::PutFile(put));
            self.window.insert(
                request_id,
                ChunkAck {
                    file_id: stream.file_id,
                    expected: stream.position,
                    len: want as i64,
                    is_final: false,
                },
            );
            return Ok(());
        }

        let Some(stream) = self.current.take() else {
            return Ok(());
        };
        let digest: [u8; 32] = stream.hasher.finalize().into();
        let put = PutFile {
            file_id: stream.file_id,
            chunk_offset: stream.size,
            chunk_data: None,
            chunk_size: 0,
            sha256: Some(digest),
        };
        let request_id = outbox.request(Message::PutFile(put));
        self.window.insert(
            request_id,
            ChunkAck {
                file_id: stream.file_id,
                expected: stream.size,
                len: 0,
                is_final: true,
            },
        );
        if let Some(record) = self.records.get_mut(&stream.file_id) {
            record.state = RecordState::WaitingAck;
        }
        Ok(())
    }

    // =========================================================================
    // Acknowledgements
    // =========================================================================

    pub fn on_put_ack(&mut self, request_id: u64, ack: &OnPutFile) -> AckOutcome {
        let Some(chunk) = self.window.remove(request_id) else {
            return AckOutcome::Unknown;
        };
        let file_id = chunk.file_id;
        if ack.file_id != file_id {
            tracing::debug!(
                expected = file_id,
                got = ack.file_id,
                "OnPutFile names a different file"
            );
        }
        let Some(record) = self.records.get_mut(&file_id) else {
            return AckOutcome::Unknown;
        };
        let result = ack.result_offset;

        if result < 0 {
            tracing::warn!(path = %record.path, "Peer failed to write file");
            self.drop_record(file_id);
            return AckOutcome::Dropped { file_id };
        }

        if chunk.is_final && result == record.size {
            record.acked = record.size;
            record.state = RecordState::Done;
            tracing::debug!(file_id, path = %record.path, "File sent");
            return AckOutcome::Completed {
                file_id,
                is_database: record.is_database(),
            };
        }

        if !chunk.is_final && result == chunk.expected {
            record.acked = record.acked.max(result);
            return AckOutcome::Progress;
        }

        let offset = if result > record.size { 0 } else { result };
        self.requeue(file_id, offset);
        AckOutcome::Requeued { file_id, offset }
    }

    fn requeue(&mut self, file_id: i32, offset: i64) {
        let dropped = self.window.remove_file(file_id);
        if self.current.as_ref().map(|s| s.file_id) == Some(file_id) {
            self.current = None;
        }
        let Some(record) = self.records.get_mut(&file_id) else {
            return;
        };
        tracing::debug!(
            file_id,
            path = %record.path,
            offset,
            cancelled_chunks = dropped,
            "Requeueing file"
        );
        record.offset = offset;
        record.acked = offset;
        if record.state != RecordState::Queued {
            record.state = RecordState::Queued;
            self.queue.push_front(file_id);
        }
    }

    fn drop_record(&mut self, file_id: i32) {
        self.window.remove_file(file_id);
        if self.current.as_ref().map(|s| s.file_id) == Some(file_id) {
            self.current = None;
        }
        self.queue.retain(|id| *id != file_id);
        if let Some(record) = self.records.get_mut(&file_id) {
            record.state = RecordState::Dropped;
        }
        self.errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use crate::transport::Outgoing;
    use std::fs;
    use tempfile::TempDir;

    fn record(tmp: &TempDir, name: &str, data: &[u8], id: i32) -> FileRecord {
        let path = tmp.path().join(name);
        fs::write(&path, data).unwrap();
        FileRecord::new(id, name.to_string(), path, data.len() as i64, 0)
    }

    fn requests(outbox: &mut Outbox) -> Vec<(u64, Message)> {
        outbox
            .drain()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Request { id, message } => Some((id, message)),
                _ => None,
            })
            .collect()
    }

    fn list_and_ack(sender: &mut FileSender, outbox: &mut Outbox, offset: i64) {
        sender.list_pending(outbox);
        for (id, msg) in requests(outbox) {
            let Message::ListFiles(entries) = msg else {
                panic!("Expected ListFiles");
            };
            let acks: Vec<_> = entries
                .iter()
                .map(|e| ListAck {
                    file_id: e.file_id,
                    offset,
                })
                .collect();
            assert!(sender.on_list_ack(id, &acks));
        }
    }

    #[test]
    fn test_chunks_then_hash() {
        let tmp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let mut sender = FileSender::new(100, 8, 64);
        let mut outbox = Outbox::new(Role::Initiator);
        sender.add(record(&tmp, "a.bin", &data, 16));
        list_and_ack(&mut sender, &mut outbox, 0);

        sender.pump(&mut outbox);
        let sent = requests(&mut outbox);
        assert_eq!(sent.len(), 4);

        let puts: Vec<_> = sent
            .iter()
            .map(|(_, m)| match m {
                Message::PutFile(p) => p.clone(),
                other => panic!("Expected PutFile, got {:?}", other),
            })
            .collect();
        assert_eq!(puts[0].chunk_offset, 0);
        assert_eq!(puts[2].chunk_size, 50);
        assert!(puts[3].is_final());
        assert_eq!(puts[3].chunk_offset, 250);
        let expected: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(puts[3].sha256, Some(expected));

        for (i, (id, _)) in sent.iter().enumerate() {
            let result = [100, 200, 250, 250][i];
            let outcome = sender.on_put_ack(
                *id,
                &OnPutFile {
                    file_id: 16,
                    result_offset: result,
                },
            );
            if i == 3 {
                assert_eq!(
                    outcome,
                    AckOutcome::Completed {
                        file_id: 16,
                        is_database: false
                    }
                );
            } else {
                assert_eq!(outcome, AckOutcome::Progress);
            }
        }
        assert!(sender.is_idle());
        let c = sender.counters();
        assert_eq!((c.done, c.pending, c.total), (250, 0, 250));
    }

    #[test]
    fn test_window_limits_in_flight_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut sender = FileSender::new(10, 3, 64);
        let mut outbox = Outbox::new(Role::Responder);
        sender.add(record(&tmp, "a.bin", &[7u8; 100], 16));
        list_and_ack(&mut sender, &mut outbox, 0);

        sender.pump(&mut outbox);
        assert_eq!(requests(&mut outbox).len(), 3);
        assert!(sender.window().pending_bytes() <= sender.window().max_bytes());
    }

    #[test]
    fn test_resume_sends_only_tail_but_hashes_whole_file() {
        let tmp = TempDir::new().unwrap();
        let data = b"0123456789abcdefghij".to_vec();
        let mut sender = FileSender::new(8, 8, 64);
        let mut outbox = Outbox::new(Role::Initiator);
        sender.add(record(&tmp, "r.txt", &data, 16));
        list_and_ack(&mut sender, &mut outbox, 12);

        sender.pump(&mut outbox);
        let sent = requests(&mut outbox);
        assert_eq!(sent.len(), 2);
        match &sent[0].1 {
            Message::PutFile(p) => {
                assert_eq!(p.chunk_offset, 12);
                assert_eq!(p.chunk_data.as_deref(), Some(&data[12..]));
            }
            other => panic!("Expected PutFile, got {:?}", other),
        }
        match &sent[1].1 {
            Message::PutFile(p) => {
                let expected: [u8; 32] = Sha256::digest(&data).into();
                assert_eq!(p.sha256, Some(expected));
            }
            other => panic!("Expected PutFile, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_ack_requeues_and_cancels_stream() {
        let tmp = TempDir::new().unwrap();
        let mut sender = FileSender::new(10, 2, 64);
        let mut outbox = Outbox::new(Role::Initiator);
        sender.add(record(&tmp, "a.bin", &[1u8; 50], 16));
        list_and_ack(&mut sender, &mut outbox, 0);

        sender.pump(&mut outbox);
        let sent = requests(&mut outbox);
        assert_eq!(sent.len(), 2);

        // Peer says it only has 0 bytes
        let outcome = sender.on_put_ack(
            sent[0].0,
            &OnPutFile {
                file_id: 16,
                result_offset: 0,
            },
        );
        assert_eq!(
            outcome,
            AckOutcome::Requeued {
                file_id: 16,
                offset: 0
            }
        );
        // The other in-flight chunk is forgotten
        assert_eq!(
            sender.on_put_ack(
                sent[1].0,
                &OnPutFile {
                    file_id: 16,
                    result_offset: 20
                }
            ),
            AckOutcome::Unknown
        );

        sender.pump(&mut outbox);
        let resent = requests(&mut outbox);
        match &resent[0].1 {
            Message::PutFile(p) => assert_eq!(p.chunk_offset, 0),
            other => panic!("Expected PutFile, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_ack_drops_without_retry() {
        let tmp = TempDir::new().unwrap();
        let mut sender = FileSender::new(10, 4, 64);
        let mut outbox = Outbox::new(Role::Initiator);
        sender.add(record(&tmp, "a.bin", &[1u8; 5], 16));
        list_and_ack(&mut sender, &mut outbox, 0);
        sender.pump(&mut outbox);
        let sent = requests(&mut outbox);

        let outcome = sender.on_put_ack(
            sent[0].0,
            &OnPutFile {
                file_id: 16,
                result_offset: OnPutFile::IO_FAILURE,
            },
        );
        assert_eq!(outcome, AckOutcome::Dropped { file_id: 16 });
        assert_eq!(sender.errors(), 1);
        assert!(sender.is_idle());
        assert_eq!(sender.counters().total, 0);
    }

    #[test]
    fn test_offset_past_end_restarts_from_zero() {
        let tmp = TempDir::new().unwrap();
        let mut sender = FileSender::new(64, 4, 64);
        let mut outbox = Outbox::new(Role::Initiator);
        sender.add(record(&tmp, "a.bin", &[1u8; 5], 16));
        list_and_ack(&mut sender, &mut outbox, 99);
        assert_eq!(sender.record(16).unwrap().offset, 0);
    }
}
