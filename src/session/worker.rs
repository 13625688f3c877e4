//! Per-session worker task.
//!
//! One task owns the [`Machine`] and the [`TransportAdapter`]; channel
//! events, commands and timers are all handled in arrival order on it.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::commit::MigrationEnv;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::session::{Machine, Role, Status};
use crate::transport::{AdapterEvent, CloseReason, PeerLink, TransportAdapter};

#[derive(Debug)]
enum Command {
    Cancel,
}

/// Handle to a running session.
pub struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    task: JoinHandle<Status>,
}

impl SessionHandle {
    /// Start a session over `link`. Writes the in-progress marker first.
    pub fn spawn(
        role: Role,
        config: MigrationConfig,
        env: MigrationEnv,
        link: PeerLink,
    ) -> Result<Self> {
        let adapter = TransportAdapter::new(link, config.legacy_frame_size);
        Self::spawn_with_adapter(role, config, env, adapter)
    }

    /// Like [`SessionHandle::spawn`] with a preconfigured adapter.
    pub fn spawn_with_adapter(
        role: Role,
        config: MigrationConfig,
        env: MigrationEnv,
        adapter: TransportAdapter,
    ) -> Result<Self> {
        config.validate()?;
        let session_id = Uuid::new_v4();
        env.layout.begin(session_id)?;
        tracing::info!(session = %session_id, role = %role, "Starting migration session");

        let machine = Machine::new(role, session_id, config.clone(), env);
        let (status_tx, status) = watch::channel(machine.status());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            machine,
            adapter,
            config,
            commands: commands_rx,
            commands_open: true,
            status: status_tx,
            reconnect_at: None,
            reconnect_attempts: 0,
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            session_id,
            commands,
            status,
            task,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    /// Wait for the session to end and return its final status.
    pub async fn wait(self) -> Result<Status> {
        self.task
            .await
            .map_err(|e| MigrationError::Internal(format!("session task failed: {}", e)))
    }
}

struct Worker {
    machine: Machine,
    adapter: TransportAdapter,
    config: MigrationConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    status: watch::Sender<Status>,
    /// When to try re-establishing the link
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl Worker {
    async fn run(mut self) -> Status {
        let mut liveness = tokio::time::interval_at(
            Instant::now() + self.config.liveness_interval(),
            self.config.liveness_interval(),
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress = tokio::time::interval(self.config.progress_interval());
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.machine.state().is_terminal() {
            let reconnect_at = self.reconnect_at.unwrap_or_else(Instant::now);
            tokio::select! {
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(Command::Cancel) => {
                        tracing::info!(session = %self.machine.session_id(), "Cancel requested");
                        self.machine.cancel();
                    }
                    None => self.commands_open = false,
                },
                event = self.adapter.next_event() => match event {
                    Some(event) => {
                        for event in self.adapter.handle_event(event).await {
                            self.dispatch(event);
                        }
                    }
                    None => self.machine.fail(MigrationError::Transport(
                        "channel event stream ended".to_string(),
                    )),
                },
                _ = liveness.tick() => {
                    if self.adapter.check_liveness() {
                        tracing::warn!(
                            session = %self.machine.session_id(),
                            pending = self.adapter.pending_requests(),
                            "Requests stuck, dropping link"
                        );
                        self.adapter.close(CloseReason::Lost).await;
                        self.dispatch(AdapterEvent::Disconnected(CloseReason::Lost));
                    }
                },
                _ = tokio::time::sleep_until(reconnect_at), if self.reconnect_at.is_some() => {
                    self.reconnect().await;
                },
                _ = progress.tick() => {}
            }
            self.flush().await;
            self.publish();
        }

        self.flush().await;
        self.adapter.close(CloseReason::Normal).await;
        let status = self.machine.status();
        tracing::info!(
            session = %status.session_id,
            state = %status.state,
            error_code = ?status.error_code,
            canceled = status.canceled,
            sent = status.bytes_sent,
            received = status.bytes_received,
            "Migration session ended"
        );
        self.publish();
        status
    }

    fn dispatch(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Connected { peer, framing } => {
                tracing::info!(
                    session = %self.machine.session_id(),
                    peer = %peer,
                    ?framing,
                    "Connected to peer"
                );
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.machine.on_connected();
            }
            AdapterEvent::Inbound(inbound) => self.machine.on_inbound(inbound),
            AdapterEvent::Rejected { peer } => self.machine.on_rejected(&peer.to_string()),
            AdapterEvent::Disconnected(reason) => {
                if self.machine.on_disconnected(reason) {
                    self.schedule_reconnect(self.config.reconnect_delay());
                }
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.reconnect_at = None;
            self.machine.fail(MigrationError::Transport(format!(
                "gave up after {} reconnect attempts",
                self.reconnect_attempts
            )));
            return;
        }
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn reconnect(&mut self) {
        self.reconnect_attempts += 1;
        tracing::info!(
            session = %self.machine.session_id(),
            attempt = self.reconnect_attempts,
            "Reconnecting"
        );
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.adapter.reconnect()).await {
            // Success shows up as a later Open; retry if it never does
            Ok(Ok(())) => self.schedule_reconnect(timeout),
            Ok(Err(e)) => {
                tracing::warn!("Reconnect failed: {}", e);
                self.schedule_reconnect(self.config.reconnect_delay());
            }
            Err(_) => {
                tracing::warn!("Reconnect timed out after {:?}", timeout);
                self.schedule_reconnect(self.config.reconnect_delay());
            }
        }
    }

    /// Hand queued messages to the adapter in order.
    async fn flush(&mut self) {
        for out in self.machine.take_outgoing() {
            let name = out.message().name();
            if let Err(e) = self.adapter.send(out).await {
                // The close event that follows restarts the round
                tracing::debug!(message = name, "Dropping outgoing messages: {}", e);
                break;
            }
        }
    }

    fn publish(&self) {
        let status = self.machine.status();
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}
