//! Migration State Machine.
//!
//! Pure, synchronous core of a session: consumes adapter events, performs
//! file I/O through the transfer engine and queues outgoing messages in an
//! [`Outbox`]. The worker owns the machine and moves the outbox to the wire.

use uuid::Uuid;

use crate::commit::layout::write_atomic;
use crate::commit::MigrationEnv;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::protocol::{Account, EnvelopeKind, ErrorCode, Message, OnPutFile, QueryInfo, Settings};
use crate::session::status::ByteCounters;
use crate::session::{Role, State, Status};
use crate::store::{write_settings_file, ACCOUNT_KEY, CORE_KEY};
use crate::transfer::scan::{check_capacity, database_record};
use crate::transfer::{query_info, scan_media, AckOutcome, FileReceiver, FileSender};
use crate::transport::{CloseReason, Inbound, Outbox, Outgoing};

pub struct Machine {
    role: Role,
    session_id: Uuid,
    config: MigrationConfig,
    env: MigrationEnv,
    state: State,
    outbox: Outbox,
    sender: FileSender,
    receiver: FileReceiver,
    connected: bool,

    /// Smaller of our cap and the peer's, for this round
    negotiated_max: i64,
    peer_info: Option<QueryInfo>,

    // Survive reconnects
    settings_sent: bool,
    settings_received: bool,
    database_received: bool,
    account_sent: bool,
    account_received: bool,

    // Request ids of the current round
    account_request: Option<u64>,
    terminate_request: Option<u64>,
    shutdown_request: Option<u64>,
    /// Peer's terminate request that arrived before we could accept it
    deferred_terminate: Option<u64>,

    error_code: Option<ErrorCode>,
    canceled: bool,
    /// Send and receive counters captured when the session ended
    final_counters: Option<(ByteCounters, ByteCounters)>,
}

impl Machine {
    pub fn new(role: Role, session_id: Uuid, config: MigrationConfig, env: MigrationEnv) -> Self {
        let receiver = FileReceiver::new(env.layout.clone());
        Self {
            role,
            session_id,
            sender: FileSender::new(config.chunk_size, config.window_size, config.list_batch_size),
            receiver,
            negotiated_max: config.max_file_size,
            config,
            env,
            state: State::Starting,
            outbox: Outbox::new(role),
            connected: false,
            peer_info: None,
            settings_sent: false,
            settings_received: false,
            database_received: false,
            account_sent: false,
            account_received: false,
            account_request: None,
            terminate_request: None,
            shutdown_request: None,
            deferred_terminate: None,
            error_code: None,
            canceled: false,
            final_counters: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    /// Messages queued since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.outbox.drain()
    }

    pub fn status(&self) -> Status {
        let (send, receive) = self
            .final_counters
            .unwrap_or_else(|| (self.sender.counters(), self.receiver.counters()));
        Status::derive(
            self.session_id,
            self.role,
            self.state,
            send,
            receive,
            self.sender.errors(),
            self.receiver.errors(),
            self.error_code,
            self.canceled,
        )
    }

    /// `TERMINATE` may be entered, or already was.
    pub fn can_terminate(&self) -> bool {
        self.state == State::Terminate
            || (self.state == State::WaitAccount && self.account_sent && self.account_received)
    }

    fn set_state(&mut self, to: State) {
        if self.state == to {
            return;
        }
        tracing::info!(
            session = %self.session_id,
            role = %self.role,
            from = %self.state,
            to = %to,
            "State transition"
        );
        self.state = to;
    }

    // =========================================================================
    // Link events
    // =========================================================================

    /// Handshake finished: start a negotiation round.
    pub fn on_connected(&mut self) {
        self.connected = true;
        if self.state.is_terminal() {
            return;
        }
        self.negotiated_max = self.config.max_file_size;
        self.peer_info = None;
        self.set_state(State::Negotiate);
        self.outbox.request(Message::QueryStats {
            max_file_size: self.config.max_file_size,
        });
    }

    /// Returns true when the session wants the link re-established.
    pub fn on_disconnected(&mut self, reason: CloseReason) -> bool {
        self.connected = false;
        if self.state.is_terminal() {
            return false;
        }
        match reason {
            CloseReason::Lost => {
                tracing::warn!(session = %self.session_id, state = %self.state, "Link lost");
                self.restart();
                true
            }
            CloseReason::NotAuthorized => {
                self.cancel_with(Some(ErrorCode::BadPeerVersion));
                false
            }
            CloseReason::Revoked => {
                self.cancel_with(Some(ErrorCode::Revoked));
                false
            }
            CloseReason::Normal => {
                tracing::info!(session = %self.session_id, "Peer closed the session");
                self.cancel_with(None);
                false
            }
        }
    }

    /// The peer failed the version handshake.
    pub fn on_rejected(&mut self, peer: &str) {
        tracing::error!(session = %self.session_id, peer, "Peer protocol version not supported");
        self.connected = false;
        self.cancel_with(Some(ErrorCode::BadPeerVersion));
    }

    /// Forget in-memory transfer progress; bytes on disk and the exchange
    /// flags stay.
    fn restart(&mut self) {
        self.sender.reset();
        self.receiver.reset();
        self.outbox.clear();
        self.peer_info = None;
        self.account_request = None;
        self.terminate_request = None;
        self.shutdown_request = None;
        self.deferred_terminate = None;
        self.set_state(State::Starting);
    }

    // =========================================================================
    // Ending a session
    // =========================================================================

    /// Cancel from any state. Idempotent.
    pub fn cancel(&mut self) {
        self.cancel_with(None);
    }

    fn cancel_with(&mut self, code: Option<ErrorCode>) {
        if self.state.is_terminal() {
            return;
        }
        self.outbox.clear();
        if self.connected {
            self.outbox.notify(Message::TerminateMigration {
                commit: false,
                done: false,
            });
        }
        if self.error_code.is_none() {
            self.error_code = code;
        }
        self.freeze_counters();
        self.sender.reset();
        self.receiver.reset();
        self.set_state(State::Canceled);
        if let Err(e) = self.env.layout.discard() {
            tracing::warn!(session = %self.session_id, "Failed to clean up staging: {:#}", e);
        }
        self.canceled = true;
        self.set_state(State::Stopped);
    }

    /// Local session-fatal error; the peer is told with an `Error` notify.
    pub fn fail(&mut self, err: MigrationError) {
        if self.state.is_terminal() {
            return;
        }
        tracing::error!(session = %self.session_id, state = %self.state, "Migration failed: {}", err);
        let code = err.code();
        self.outbox.clear();
        if self.connected {
            self.outbox.notify(Message::Error(code));
        }
        self.enter_error(code);
    }

    fn enter_error(&mut self, code: ErrorCode) {
        self.error_code = Some(code);
        self.freeze_counters();
        self.sender.reset();
        self.receiver.reset();
        self.set_state(State::Error);
        if let Err(e) = self.env.layout.discard() {
            tracing::warn!(session = %self.session_id, "Failed to clean up staging: {:#}", e);
        }
    }

    /// Keep the progress numbers of the last round once the session ends.
    fn freeze_counters(&mut self) {
        if self.final_counters.is_none() {
            self.final_counters = Some((self.sender.counters(), self.receiver.counters()));
        }
    }

    /// Both sides agreed to terminate: commit the staging area.
    fn finish(&mut self) {
        self.set_state(State::Terminated);
        self.freeze_counters();
        self.receiver.reset();
        let result = self
            .env
            .layout
            .mark_done()
            .map_err(MigrationError::from)
            .and_then(|()| self.env.committer.commit(&self.env, &self.env.layout.staging()));
        match result {
            Ok(()) => {
                tracing::info!(event = "migration_complete", session = %self.session_id);
                self.set_state(State::Stopped);
            }
            Err(e) => {
                // Staging and the done marker stay for recovery
                tracing::error!(session = %self.session_id, "Commit failed: {}", e);
                self.error_code = Some(e.code());
                self.set_state(State::Error);
            }
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn on_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            kind,
            request_id,
            message,
        } = inbound;

        if self.state.is_terminal() || self.state == State::Terminated {
            if kind == EnvelopeKind::Request
                && matches!(message, Message::TerminateMigration { commit: true, .. })
                && matches!(self.state, State::Terminated | State::Stopped)
            {
                self.outbox.respond(
                    request_id,
                    Message::TerminateMigration {
                        commit: true,
                        done: true,
                    },
                );
            } else {
                tracing::debug!(state = %self.state, message = message.name(), "Dropping message after session end");
            }
            return;
        }

        let result = match kind {
            EnvelopeKind::Request => self.on_request(request_id, message),
            EnvelopeKind::Response => self.on_response(request_id, message),
            EnvelopeKind::Notify => {
                self.on_notify(message);
                Ok(())
            }
        };
        let result = result.and_then(|()| self.advance());
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn drop_message(&self, message: &Message) {
        tracing::debug!(state = %self.state, message = message.name(), "Dropping out-of-sequence message");
    }

    fn on_request(&mut self, id: u64, message: Message) -> Result<()> {
        let exchanging = self.state.is_exchanging();
        match message {
            Message::QueryStats { max_file_size } if self.state == State::Negotiate => {
                self.negotiated_max = self.negotiated_max.min(max_file_size);
                let info = self.local_info()?;
                self.outbox.respond(id, Message::OnQueryStats(info));
            }
            Message::Start { max_file_size } if self.state == State::Negotiate => {
                self.negotiated_max = self.negotiated_max.min(max_file_size);
                let local = self.local_info()?;
                match &self.peer_info {
                    Some(peer) => check_capacity(&local, peer)?,
                    None => tracing::debug!("Start before peer stats; skipping capacity check"),
                }
                self.outbox.respond(
                    id,
                    Message::Start {
                        max_file_size: self.negotiated_max,
                    },
                );
                self.enter_list_files()?;
            }
            Message::ListFiles(entries) if exchanging => {
                let acks = self.receiver.on_list(&entries);
                self.outbox.respond(id, Message::OnListFiles(acks));
            }
            Message::PutFile(put) if exchanging => {
                let outcome = self.receiver.on_chunk(&put);
                if let (true, Some(kind)) = (outcome.completed, outcome.database) {
                    tracing::info!(session = %self.session_id, database = kind.file_name(), "Database received");
                    self.database_received = true;
                }
                self.outbox.respond(
                    id,
                    Message::OnPutFile(OnPutFile {
                        file_id: put.file_id,
                        result_offset: outcome.result_offset,
                    }),
                );
            }
            Message::Settings(settings) if exchanging => {
                write_settings_file(&self.env.layout.staged_settings(), &settings.values)?;
                self.settings_received = true;
                if settings.has_peer_settings {
                    self.settings_sent = true;
                }
                tracing::debug!(values = settings.values.len(), "Settings staged");
                self.outbox.respond(
                    id,
                    Message::Settings(Settings {
                        has_peer_settings: true,
                        values: Vec::new(),
                    }),
                );
            }
            Message::Account(account) if exchanging => {
                let layout = &self.env.layout;
                write_atomic(&layout.staged_core(), &account.secured_config)
                    .and_then(|()| write_atomic(&layout.staged_account(), &account.account_config))
                    .map_err(|e| MigrationError::SecureStore(format!("{:#}", e)))?;
                self.account_received = true;
                if account.has_peer_account {
                    self.account_sent = true;
                }
                tracing::info!(session = %self.session_id, "Peer account staged");
                self.outbox.respond(
                    id,
                    Message::Account(Account {
                        has_peer_account: true,
                        ..Default::default()
                    }),
                );
            }
            Message::TerminateMigration { commit: false, .. } => {
                tracing::info!(session = %self.session_id, "Peer canceled the migration");
                self.cancel();
            }
            Message::TerminateMigration { commit: true, .. } => {
                if self.can_terminate() {
                    self.set_state(State::Terminate);
                    self.outbox.respond(
                        id,
                        Message::TerminateMigration {
                            commit: true,
                            done: true,
                        },
                    );
                } else if exchanging || self.state == State::Negotiate {
                    tracing::debug!(state = %self.state, "Deferring peer terminate");
                    self.deferred_terminate = Some(id);
                }
            }
            Message::Shutdown { .. } if self.state == State::Terminate => {
                self.outbox.respond(id, Message::Shutdown { close: true });
                self.finish();
            }
            other => self.drop_message(&other),
        }
        Ok(())
    }

    fn on_response(&mut self, id: u64, message: Message) -> Result<()> {
        match message {
            Message::OnQueryStats(info) if self.state == State::Negotiate => {
                self.peer_info = Some(info);
                if self.role == Role::Initiator {
                    let local = self.local_info()?;
                    check_capacity(&local, &info)?;
                    self.outbox.request(Message::Start {
                        max_file_size: self.negotiated_max,
                    });
                }
            }
            Message::Start { max_file_size }
                if self.state == State::Negotiate && self.role == Role::Initiator =>
            {
                self.negotiated_max = self.negotiated_max.min(max_file_size);
                self.enter_list_files()?;
            }
            Message::OnListFiles(acks) => {
                if !self.sender.on_list_ack(id, &acks) {
                    tracing::debug!(request_id = id, "List ack for an unknown batch");
                }
            }
            Message::OnPutFile(ack) => match self.sender.on_put_ack(id, &ack) {
                AckOutcome::Unknown => {
                    tracing::debug!(request_id = id, file_id = ack.file_id, "Stale chunk ack")
                }
                AckOutcome::Completed {
                    is_database: true, ..
                } => tracing::info!(session = %self.session_id, "Database sent"),
                _ => {}
            },
            Message::Settings(_) => self.settings_sent = true,
            Message::Account(account) => {
                if self.account_request == Some(id) && account.has_peer_account {
                    self.account_sent = true;
                    tracing::info!(session = %self.session_id, "Account delivered");
                }
            }
            Message::TerminateMigration { done: true, .. }
                if self.state == State::Terminate && self.terminate_request == Some(id) =>
            {
                self.shutdown_request = Some(self.outbox.request(Message::Shutdown { close: true }));
            }
            Message::Shutdown { .. }
                if self.state == State::Terminate && self.shutdown_request == Some(id) =>
            {
                self.finish();
            }
            other => self.drop_message(&other),
        }
        Ok(())
    }

    fn on_notify(&mut self, message: Message) {
        match message {
            Message::Error(code) => {
                tracing::error!(session = %self.session_id, code = %code, "Peer reported an error");
                self.outbox.clear();
                self.enter_error(code);
            }
            Message::TerminateMigration { commit: false, .. } => {
                tracing::info!(session = %self.session_id, "Peer canceled the migration");
                self.connected = false;
                self.cancel();
            }
            other => self.drop_message(&other),
        }
    }

    // =========================================================================
    // Progression
    // =========================================================================

    fn local_info(&self) -> Result<QueryInfo> {
        let scan = scan_media(&self.env.layout.media_dir(), self.negotiated_max)?;
        Ok(query_info(&self.env.layout, &scan)?)
    }

    fn enter_list_files(&mut self) -> Result<()> {
        self.set_state(State::ListFiles);
        let scan = scan_media(&self.env.layout.media_dir(), self.negotiated_max)?;
        tracing::info!(
            session = %self.session_id,
            files = scan.records.len(),
            bytes = scan.total_size(),
            skipped = scan.skipped,
            max_file_size = self.negotiated_max,
            "Listing files"
        );
        for record in scan.records {
            self.sender.add(record);
        }
        self.sender.list_pending(&mut self.outbox);
        Ok(())
    }

    /// Apply every transition whose condition holds.
    fn advance(&mut self) -> Result<()> {
        loop {
            let before = self.state;
            match self.state {
                State::ListFiles => {
                    if self.sender.listing_done() {
                        self.set_state(State::SendFiles);
                    }
                }
                State::SendFiles => {
                    self.sender.pump(&mut self.outbox);
                    if self.sender.is_idle() {
                        if !self.settings_sent {
                            let values = self.env.settings.snapshot()?;
                            self.outbox.request(Message::Settings(Settings {
                                has_peer_settings: self.settings_received,
                                values,
                            }));
                        }
                        self.set_state(State::SendSettings);
                    }
                }
                State::SendSettings => {
                    let record = database_record(&self.env.layout)?.ok_or_else(|| {
                        MigrationError::BadDatabase("no local database to send".to_string())
                    })?;
                    self.sender.add(record);
                    self.sender.list_pending(&mut self.outbox);
                    self.set_state(State::SendDatabase);
                }
                State::SendDatabase => {
                    if self.sender.listing_done() {
                        self.sender.pump(&mut self.outbox);
                    }
                    if self.sender.is_idle() {
                        self.set_state(State::WaitFiles);
                    }
                }
                State::WaitFiles => {
                    if self.settings_received
                        && self.database_received
                        && !self.receiver.has_active()
                    {
                        self.send_account()?;
                        self.set_state(State::SendAccount);
                    }
                }
                State::SendAccount => self.set_state(State::WaitAccount),
                State::WaitAccount => {
                    if self.account_sent && self.account_received {
                        self.set_state(State::Terminate);
                        self.enter_terminate();
                    }
                }
                _ => {}
            }
            if self.state == before {
                return Ok(());
            }
        }
    }

    fn send_account(&mut self) -> Result<()> {
        if self.account_sent {
            return Ok(());
        }
        let secure = &self.env.secure;
        let read = |key: &str| -> Result<bytes::Bytes> {
            secure
                .get(key)
                .map_err(|e| MigrationError::SecureStore(format!("{:#}", e)))?
                .map(bytes::Bytes::from)
                .ok_or_else(|| MigrationError::SecureStore(format!("no {} blob", key)))
        };
        let account = Account {
            secured_config: read(CORE_KEY)?,
            account_config: read(ACCOUNT_KEY)?,
            has_peer_account: self.account_received,
        };
        self.account_request = Some(self.outbox.request(Message::Account(account)));
        Ok(())
    }

    fn enter_terminate(&mut self) {
        match self.role {
            Role::Initiator => {
                if self.terminate_request.is_none() {
                    self.terminate_request = Some(self.outbox.request(
                        Message::TerminateMigration {
                            commit: true,
                            done: false,
                        },
                    ));
                }
            }
            Role::Responder => {
                if let Some(id) = self.deferred_terminate.take() {
                    self.outbox.respond(
                        id,
                        Message::TerminateMigration {
                            commit: true,
                            done: true,
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Committer;
    use crate::protocol::{ListAck, ListEntry, PutFile};
    use sha2::{Digest, Sha256};
    use crate::store::SecureStore;
    use crate::transfer::DatabaseKind;
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingCommitter(AtomicU32);

    impl Committer for CountingCommitter {
        fn commit(&self, _env: &MigrationEnv, _staging: &Path) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn machine(tmp: &TempDir, role: Role) -> (Machine, Arc<CountingCommitter>) {
        let committer = Arc::new(CountingCommitter::default());
        let mut env = MigrationEnv::file_backed(tmp.path());
        env.committer = committer.clone();
        let id = Uuid::new_v4();
        env.layout.begin(id).unwrap();
        let mut m = Machine::new(role, id, MigrationConfig::default(), env);
        m.on_connected();
        m.take_outgoing();
        (m, committer)
    }

    fn request(id: u64, message: Message) -> Inbound {
        Inbound {
            kind: EnvelopeKind::Request,
            request_id: id,
            message,
        }
    }

    fn response(id: u64, message: Message) -> Inbound {
        Inbound {
            kind: EnvelopeKind::Response,
            request_id: id,
            message,
        }
    }

    const TERMINATE: Message = Message::TerminateMigration {
        commit: true,
        done: false,
    };

    #[test]
    fn test_duplicate_terminate_does_not_recommit() {
        let tmp = TempDir::new().unwrap();
        let (mut m, commits) = machine(&tmp, Role::Responder);
        m.state = State::WaitAccount;
        m.account_sent = true;
        m.account_received = true;

        m.on_inbound(request(1, TERMINATE));
        assert_eq!(m.state(), State::Terminate);
        m.on_inbound(request(2, TERMINATE));
        assert_eq!(m.state(), State::Terminate);

        m.on_inbound(request(3, Message::Shutdown { close: true }));
        assert_eq!(m.state(), State::Stopped);
        assert_eq!(commits.0.load(Ordering::SeqCst), 1);
        assert!(m.status().is_success());

        m.take_outgoing();
        m.on_inbound(request(4, TERMINATE));
        assert_eq!(commits.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            m.take_outgoing(),
            vec![Outgoing::Response {
                id: 4,
                message: Message::TerminateMigration {
                    commit: true,
                    done: true
                }
            }]
        );
    }

    #[test]
    fn test_early_terminate_is_deferred() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        m.state = State::WaitFiles;

        m.on_inbound(request(9, TERMINATE));
        assert_eq!(m.state(), State::WaitFiles);
        assert!(m.take_outgoing().is_empty());

        m.state = State::WaitAccount;
        m.on_inbound(response(77, Message::Account(Account::default())));
        m.account_sent = true;
        m.on_inbound(request(
            10,
            Message::Account(Account {
                has_peer_account: true,
                ..Default::default()
            }),
        ));
        assert_eq!(m.state(), State::Terminate);
        let out = m.take_outgoing();
        assert!(out.contains(&Outgoing::Response {
            id: 9,
            message: Message::TerminateMigration {
                commit: true,
                done: true
            }
        }));
    }

    #[test]
    fn test_capacity_failure_enters_error() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Initiator);
        std::fs::write(m.env.layout.live_database(DatabaseKind::Plain), vec![7u8; 600]).unwrap();

        let peer = QueryInfo {
            db_file_size: 600,
            db_free_space: 500,
            fs_free_space: 1 << 40,
            ..Default::default()
        };
        m.on_inbound(response(1, Message::OnQueryStats(peer)));

        assert_eq!(m.state(), State::Error);
        assert_eq!(m.error_code(), Some(ErrorCode::NoSpaceLeft));
        assert_eq!(
            m.take_outgoing(),
            vec![Outgoing::Notify(Message::Error(ErrorCode::NoSpaceLeft))]
        );
        assert!(!m.env.layout.has_staging());
        assert_eq!(m.status().error_code, Some(ErrorCode::NoSpaceLeft));
    }

    #[test]
    fn test_start_lists_only_files_under_cap() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        let media = m.env.layout.media_dir();
        std::fs::create_dir_all(&media).unwrap();
        std::fs::write(media.join("small.bin"), vec![1u8; 100]).unwrap();
        std::fs::write(media.join("large.bin"), vec![1u8; 5_000_000]).unwrap();

        m.on_inbound(request(
            1,
            Message::QueryStats {
                max_file_size: 1_000_000,
            },
        ));
        let out = m.take_outgoing();
        let Some(Message::OnQueryStats(info)) = out.first().map(|o| o.message().clone()) else {
            panic!("expected stats reply, got {:?}", out);
        };
        assert_eq!(info.file_count, 1);
        assert_eq!(info.total_file_size, 100);

        m.on_inbound(request(
            2,
            Message::Start {
                max_file_size: 1_000_000,
            },
        ));
        assert_eq!(m.state(), State::ListFiles);
        let listed: Vec<_> = m
            .take_outgoing()
            .into_iter()
            .filter_map(|o| match o.message() {
                Message::ListFiles(entries) => Some(entries.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "small.bin");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (mut m, commits) = machine(&tmp, Role::Initiator);
        m.cancel();
        m.cancel();
        assert_eq!(m.state(), State::Stopped);
        assert!(m.status().canceled);
        assert!(!m.status().is_success());
        assert!(!m.env.layout.has_marker());
        assert_eq!(
            m.take_outgoing(),
            vec![Outgoing::Notify(Message::TerminateMigration {
                commit: false,
                done: false
            })]
        );
        assert_eq!(commits.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_file_traffic_dropped_while_negotiating() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        m.on_inbound(request(5, Message::ListFiles(Vec::new())));
        assert!(m.take_outgoing().is_empty());
        assert_eq!(m.state(), State::Negotiate);
    }

    #[test]
    fn test_lost_link_keeps_account_flags() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Initiator);
        m.state = State::WaitAccount;
        m.account_received = true;
        m.account_request = Some(3);

        assert!(m.on_disconnected(CloseReason::Lost));
        assert_eq!(m.state(), State::Starting);
        assert!(m.account_received);
        assert!(m.account_request.is_none());

        // A late ack for the old request no longer counts
        m.on_connected();
        m.on_inbound(response(
            3,
            Message::Account(Account {
                has_peer_account: true,
                ..Default::default()
            }),
        ));
        assert!(!m.account_sent);
    }

    #[test]
    fn test_account_requires_secure_blobs() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        m.state = State::WaitFiles;
        m.settings_received = true;
        m.database_received = true;
        m.on_inbound(request(1, Message::Shutdown { close: true }));
        assert_eq!(m.state(), State::Error);
        assert_eq!(m.error_code(), Some(ErrorCode::SecureStoreError));

        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        m.env.secure.set(CORE_KEY, b"c").unwrap();
        m.env.secure.set(ACCOUNT_KEY, b"a").unwrap();
        m.state = State::WaitFiles;
        m.settings_received = true;
        m.database_received = true;
        m.on_inbound(request(1, Message::Shutdown { close: true }));
        assert_eq!(m.state(), State::WaitAccount);
        assert!(m.account_request.is_some());
    }

    const PHOTO: i32 = 16;
    const PHOTO_MTIME: i64 = 1_700_000_000_000;

    fn list_photo(id: u64, size: usize) -> Inbound {
        request(
            id,
            Message::ListFiles(vec![ListEntry {
                path: "photos/a.jpg".to_string(),
                file_id: PHOTO,
                size: size as i64,
                mtime: PHOTO_MTIME,
            }]),
        )
    }

    fn photo_chunk(id: u64, content: &[u8], offset: usize, len: usize) -> Inbound {
        let data = &content[offset..offset + len];
        request(
            id,
            Message::PutFile(PutFile {
                file_id: PHOTO,
                chunk_offset: offset as i64,
                chunk_data: Some(bytes::Bytes::copy_from_slice(data)),
                chunk_size: len as i32,
                sha256: None,
            }),
        )
    }

    fn put_ack(id: u64, result_offset: i64) -> Outgoing {
        Outgoing::Response {
            id,
            message: Message::OnPutFile(OnPutFile {
                file_id: PHOTO,
                result_offset,
            }),
        }
    }

    #[test]
    fn test_relisting_after_lost_link_resumes_at_staged_length() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        m.state = State::WaitFiles;

        m.on_inbound(list_photo(1, content.len()));
        assert_eq!(
            m.take_outgoing(),
            vec![Outgoing::Response {
                id: 1,
                message: Message::OnListFiles(vec![ListAck {
                    file_id: PHOTO,
                    offset: 0
                }])
            }]
        );
        m.on_inbound(photo_chunk(2, &content, 0, 4096));
        assert_eq!(m.take_outgoing(), vec![put_ack(2, 4096)]);

        assert!(m.on_disconnected(CloseReason::Lost));
        m.on_connected();
        m.take_outgoing();
        m.state = State::WaitFiles;

        // The peer learns the exact byte to continue from
        m.on_inbound(list_photo(3, content.len()));
        assert_eq!(
            m.take_outgoing(),
            vec![Outgoing::Response {
                id: 3,
                message: Message::OnListFiles(vec![ListAck {
                    file_id: PHOTO,
                    offset: 4096
                }])
            }]
        );

        m.on_inbound(photo_chunk(4, &content, 4096, 4096));
        assert_eq!(m.take_outgoing(), vec![put_ack(4, 8192)]);
        m.on_inbound(photo_chunk(5, &content, 8192, content.len() - 8192));
        assert_eq!(m.take_outgoing(), vec![put_ack(5, 10_000)]);
        m.on_inbound(request(
            6,
            Message::PutFile(PutFile {
                file_id: PHOTO,
                chunk_offset: content.len() as i64,
                chunk_data: None,
                chunk_size: 0,
                sha256: Some(Sha256::digest(&content).into()),
            }),
        ));
        assert_eq!(m.take_outgoing(), vec![put_ack(6, 10_000)]);

        let staged = std::fs::read(m.env.layout.staging_media().join("photos/a.jpg")).unwrap();
        assert_eq!(staged, content);
        let status = m.status();
        assert_eq!(status.bytes_received, 10_000);
        assert_eq!(status.receive_errors, 0);
    }

    #[test]
    fn test_canceled_session_keeps_progress() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        let content = vec![3u8; 10_000];
        m.state = State::WaitFiles;
        m.on_inbound(list_photo(1, content.len()));
        m.on_inbound(photo_chunk(2, &content, 0, 4096));

        m.cancel();
        let status = m.status();
        assert_eq!(status.state, State::Stopped);
        assert!(status.canceled);
        assert_eq!(status.bytes_received, 4096);
        assert_eq!(status.receive_total, 10_000);
    }

    #[test]
    fn test_committed_session_keeps_byte_totals() {
        let tmp = TempDir::new().unwrap();
        let (mut m, _) = machine(&tmp, Role::Responder);
        let content = vec![9u8; 5_000];
        m.state = State::WaitFiles;
        m.on_inbound(list_photo(1, content.len()));
        m.on_inbound(photo_chunk(2, &content, 0, content.len()));
        m.on_inbound(request(
            3,
            Message::PutFile(PutFile {
                file_id: PHOTO,
                chunk_offset: content.len() as i64,
                chunk_data: None,
                chunk_size: 0,
                sha256: Some(Sha256::digest(&content).into()),
            }),
        ));

        m.state = State::Terminate;
        m.on_inbound(request(4, Message::Shutdown { close: true }));
        let status = m.status();
        assert!(status.is_success());
        assert_eq!(status.bytes_received, 5_000);
        assert_eq!(status.receive_total, 5_000);
    }

    #[derive(Debug, Clone)]
    enum Step {
        PeerAccount { has_peer_account: bool },
        AccountAck { ours: bool },
        PeerTerminate,
        PeerShutdown,
        TerminateAck,
        ShutdownAck,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            any::<bool>().prop_map(|has_peer_account| Step::PeerAccount { has_peer_account }),
            any::<bool>().prop_map(|ours| Step::AccountAck { ours }),
            Just(Step::PeerTerminate),
            Just(Step::PeerShutdown),
            Just(Step::TerminateAck),
            Just(Step::ShutdownAck),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_terminate_requires_both_account_flags(
            initiator in any::<bool>(),
            steps in proptest::collection::vec(step(), 0..12),
        ) {
            let tmp = TempDir::new().unwrap();
            let role = if initiator { Role::Initiator } else { Role::Responder };
            let (mut m, commits) = machine(&tmp, role);
            m.state = State::WaitAccount;
            m.account_request = Some(1000);

            for (n, step) in steps.into_iter().enumerate() {
                let id = 2000 + n as u64;
                let inbound = match step {
                    Step::PeerAccount { has_peer_account } => request(id, Message::Account(Account {
                        has_peer_account,
                        ..Default::default()
                    })),
                    Step::AccountAck { ours } => response(
                        if ours { 1000 } else { id },
                        Message::Account(Account { has_peer_account: true, ..Default::default() }),
                    ),
                    Step::PeerTerminate => request(id, TERMINATE),
                    Step::PeerShutdown => request(id, Message::Shutdown { close: true }),
                    Step::TerminateAck => response(
                        m.terminate_request.unwrap_or(id),
                        Message::TerminateMigration { commit: true, done: true },
                    ),
                    Step::ShutdownAck => response(
                        m.shutdown_request.unwrap_or(id),
                        Message::Shutdown { close: true },
                    ),
                };
                m.on_inbound(inbound);
                m.take_outgoing();

                if matches!(m.state(), State::Terminate | State::Terminated | State::Stopped) {
                    prop_assert!(m.account_sent && m.account_received);
                }
                prop_assert!(commits.0.load(Ordering::SeqCst) <= 1);
            }
        }
    }
}
