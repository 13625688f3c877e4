//! Transport Adapter: turns raw channel events into typed messages.
//!
//! Owns one [`PeerLink`] and handles, per connection:
//! - the hello handshake and framing selection
//! - envelope decoding and response matching against pending requests
//! - the liveness check for stuck requests

use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{MigrationError, Result};
use crate::protocol::{
    negotiate_version, Envelope, EnvelopeKind, FrameDecoder, FrameOutcome, Framing, Hello,
    Message, ProtocolVersion, VersionNegotiationResult,
};
use crate::transport::{ChannelEvent, CloseReason, Outgoing, PeerLink};

/// Consecutive liveness checks without progress before the link is dropped
pub const STUCK_CHECKS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Down,
    AwaitingHello,
    Ready,
}

/// A decoded message from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub kind: EnvelopeKind,
    pub request_id: u64,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Handshake done; protocol messages may flow
    Connected {
        peer: ProtocolVersion,
        framing: Framing,
    },
    Inbound(Inbound),
    /// Peer version is too old; the link was closed with `NotAuthorized`
    Rejected { peer: ProtocolVersion },
    /// Link went down
    Disconnected(CloseReason),
}

pub struct TransportAdapter {
    link: PeerLink,
    local: Hello,
    legacy_frame_size: usize,
    state: LinkState,
    framing: Framing,
    decoder: FrameDecoder,
    /// Outstanding requests: id -> message name
    pending: HashMap<u64, &'static str>,
    responses_since_check: u64,
    stuck_checks: u32,
    peer_version: Option<ProtocolVersion>,
}

impl TransportAdapter {
    pub fn new(link: PeerLink, legacy_frame_size: usize) -> Self {
        Self::with_hello(link, Hello::local(), legacy_frame_size)
    }

    /// Adapter that announces a specific hello, e.g. to emulate an older peer.
    pub fn with_hello(link: PeerLink, local: Hello, legacy_frame_size: usize) -> Self {
        let framing = Framing::Native;
        Self {
            link,
            local,
            legacy_frame_size,
            state: LinkState::Down,
            framing,
            decoder: framing.decoder(),
            pending: HashMap::new(),
            responses_since_check: 0,
            stuck_checks: 0,
            peer_version: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn peer_version(&self) -> Option<ProtocolVersion> {
        self.peer_version
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the next raw channel event.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.link.events.recv().await
    }

    pub async fn handle_event(&mut self, event: ChannelEvent) -> Vec<AdapterEvent> {
        match event {
            ChannelEvent::Open => {
                self.reset_link(LinkState::AwaitingHello);
                if let Err(e) = self.link.channel.send(self.local.encode()).await {
                    tracing::warn!("Failed to send hello: {:#}", e);
                }
                Vec::new()
            }
            ChannelEvent::Message(frame) => self.handle_frame(frame).await,
            ChannelEvent::Closed(reason) => {
                let was_up = self.state != LinkState::Down;
                self.reset_link(LinkState::Down);
                if was_up {
                    vec![AdapterEvent::Disconnected(reason)]
                } else {
                    // Already handled locally (e.g. a forced close)
                    tracing::debug!(?reason, "Close on a link that is already down");
                    if reason.is_recoverable() {
                        Vec::new()
                    } else {
                        vec![AdapterEvent::Disconnected(reason)]
                    }
                }
            }
            ChannelEvent::Error(e) => {
                tracing::warn!("Channel error: {}", e);
                Vec::new()
            }
        }
    }

    async fn handle_frame(&mut self, frame: Bytes) -> Vec<AdapterEvent> {
        match self.state {
            LinkState::Down => {
                tracing::debug!(len = frame.len(), "Dropping frame on a closed link");
                Vec::new()
            }
            LinkState::AwaitingHello => {
                let peer = match Hello::decode(frame) {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::debug!("Dropping frame before hello: {:#}", e);
                        return Vec::new();
                    }
                };
                match negotiate_version(&self.local, &peer, self.legacy_frame_size) {
                    VersionNegotiationResult::Supported { peer, framing } => {
                        tracing::info!(peer = %peer, ?framing, "Peer handshake complete");
                        self.state = LinkState::Ready;
                        self.framing = framing;
                        self.decoder = framing.decoder();
                        self.peer_version = Some(peer);
                        vec![AdapterEvent::Connected { peer, framing }]
                    }
                    VersionNegotiationResult::TooOld {
                        peer,
                        min_supported,
                    } => {
                        tracing::error!(
                            peer = %peer,
                            min_supported,
                            "Rejecting peer with unsupported protocol version"
                        );
                        self.peer_version = Some(peer);
                        self.close(CloseReason::NotAuthorized).await;
                        vec![AdapterEvent::Rejected { peer }]
                    }
                }
            }
            LinkState::Ready => match self.decoder.push(frame) {
                Ok(FrameOutcome::Incomplete) => Vec::new(),
                Ok(FrameOutcome::Complete(bytes)) => match Envelope::decode(bytes) {
                    Ok(env) => self.accept(env).into_iter().collect(),
                    Err(e) => {
                        tracing::debug!("Dropping undecodable message: {:#}", e);
                        Vec::new()
                    }
                },
                Err(e) => {
                    tracing::debug!("Dropping malformed frame: {}", e);
                    self.decoder.reset();
                    Vec::new()
                }
            },
        }
    }

    fn accept(&mut self, env: Envelope) -> Option<AdapterEvent> {
        if env.kind == EnvelopeKind::Response {
            match self.pending.remove(&env.request_id) {
                Some(_) => self.responses_since_check += 1,
                None => {
                    tracing::debug!(
                        request_id = env.request_id,
                        message = env.message.name(),
                        "Dropping response to unknown request"
                    );
                    return None;
                }
            }
        }
        Some(AdapterEvent::Inbound(Inbound {
            kind: env.kind,
            request_id: env.request_id,
            message: env.message,
        }))
    }

    /// Encode, frame and send one outgoing message.
    pub async fn send(&mut self, out: Outgoing) -> Result<()> {
        if self.state != LinkState::Ready {
            return Err(MigrationError::Transport(format!(
                "cannot send {} while the link is down",
                out.message().name()
            )));
        }
        let env = match out {
            Outgoing::Request { id, message } => {
                self.pending.insert(id, message.name());
                Envelope::request(id, message)
            }
            Outgoing::Response { id, message } => Envelope::response(id, message),
            Outgoing::Notify(message) => Envelope::notify(message),
        };
        for frame in self.framing.frames(env.encode()) {
            self.link
                .channel
                .send(frame)
                .await
                .map_err(|e| MigrationError::Transport(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// Periodic liveness check. Returns true when requests have gone
    /// unanswered for [`STUCK_CHECKS`] consecutive checks.
    pub fn check_liveness(&mut self) -> bool {
        if self.state != LinkState::Ready || self.pending.is_empty() {
            self.stuck_checks = 0;
        } else if self.responses_since_check == 0 {
            self.stuck_checks += 1;
        } else {
            self.stuck_checks = 0;
        }
        self.responses_since_check = 0;
        self.stuck_checks >= STUCK_CHECKS
    }

    pub async fn close(&mut self, reason: CloseReason) {
        self.link.channel.close(reason).await;
        self.reset_link(LinkState::Down);
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        self.link
            .channel
            .reconnect()
            .await
            .map_err(|e| MigrationError::Transport(format!("{:#}", e)))
    }

    fn reset_link(&mut self, state: LinkState) {
        self.state = state;
        self.pending.clear();
        self.decoder.reset();
        self.responses_since_check = 0;
        self.stuck_checks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Capabilities, ProtocolVersion};
    use crate::transport::MemoryChannel;

    async fn connect(a: &mut TransportAdapter, b: &mut TransportAdapter) {
        for _ in 0..2 {
            for adapter in [&mut *a, &mut *b] {
                if let Ok(ev) = adapter.link.events.try_recv() {
                    adapter.handle_event(ev).await;
                }
            }
        }
    }

    async fn pump(adapter: &mut TransportAdapter) -> Vec<AdapterEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = adapter.link.events.try_recv() {
            out.extend(adapter.handle_event(ev).await);
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_and_request_response() {
        let (la, lb, _faults) = MemoryChannel::pair();
        let mut a = TransportAdapter::new(la, 1024);
        let mut b = TransportAdapter::new(lb, 1024);
        connect(&mut a, &mut b).await;
        assert!(a.is_ready() && b.is_ready());
        assert_eq!(a.framing(), Framing::Native);

        a.send(Outgoing::Request {
            id: 7,
            message: Message::QueryStats { max_file_size: 1 },
        })
        .await
        .unwrap();
        assert_eq!(a.pending_requests(), 1);

        let events = pump(&mut b).await;
        assert!(matches!(
            &events[..],
            [AdapterEvent::Inbound(Inbound { kind: EnvelopeKind::Request, request_id: 7, .. })]
        ));

        b.send(Outgoing::Response {
            id: 7,
            message: Message::Start { max_file_size: 1 },
        })
        .await
        .unwrap();
        let events = pump(&mut a).await;
        assert_eq!(events.len(), 1);
        assert_eq!(a.pending_requests(), 0);

        // A second response to the same id is unknown and dropped
        b.send(Outgoing::Response {
            id: 7,
            message: Message::Start { max_file_size: 1 },
        })
        .await
        .unwrap();
        assert!(pump(&mut a).await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_peer_uses_segmented_framing() {
        let (la, lb, _faults) = MemoryChannel::pair();
        let legacy = Hello {
            version: ProtocolVersion { major: 2, minor: 0 },
            capabilities: Capabilities::empty(),
        };
        let mut a = TransportAdapter::new(la, 32);
        let mut b = TransportAdapter::with_hello(lb, legacy, 32);
        connect(&mut a, &mut b).await;
        assert_eq!(a.framing(), Framing::Segmented { max_frame: 32 });

        let big = Message::Settings(crate::protocol::Settings {
            has_peer_settings: false,
            values: (0..20)
                .map(|i| crate::protocol::Setting {
                    id: uuid::Uuid::from_u128(i),
                    value: "x".repeat(10),
                })
                .collect(),
        });
        a.send(Outgoing::Notify(big.clone())).await.unwrap();
        let events = pump(&mut b).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            AdapterEvent::Inbound(inbound) => assert_eq!(inbound.message, big),
            other => panic!("Expected Inbound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_old_peer_rejected() {
        let (la, lb, _faults) = MemoryChannel::pair();
        let ancient = Hello {
            version: ProtocolVersion { major: 1, minor: 0 },
            capabilities: Capabilities::empty(),
        };
        let mut a = TransportAdapter::new(la, 1024);
        let mut b = TransportAdapter::with_hello(lb, ancient, 1024);

        let open = a.link.events.try_recv().unwrap();
        a.handle_event(open).await;
        let open = b.link.events.try_recv().unwrap();
        b.handle_event(open).await;
        let events = pump(&mut a).await;
        assert!(matches!(events[..], [AdapterEvent::Rejected { .. }]));
        assert!(!a.is_ready());

        let events = pump(&mut b).await;
        assert!(events.contains(&AdapterEvent::Disconnected(CloseReason::NotAuthorized)));
    }

    #[tokio::test]
    async fn test_liveness_trips_after_two_quiet_checks() {
        let (la, lb, _faults) = MemoryChannel::pair();
        let mut a = TransportAdapter::new(la, 1024);
        let mut b = TransportAdapter::new(lb, 1024);
        connect(&mut a, &mut b).await;

        assert!(!a.check_liveness());
        a.send(Outgoing::Request {
            id: 1,
            message: Message::Shutdown { close: true },
        })
        .await
        .unwrap();
        assert!(!a.check_liveness());
        assert!(a.check_liveness());
    }
}
