//! Transport Adapter and the byte-channel abstraction beneath it.
//!
//! A [`PeerChannel`] is an ordered, reliable-while-connected message pipe.
//! Its events arrive on a separate queue so the session worker can wait on
//! them while still owning the channel for sends.

pub mod adapter;
pub mod ids;
pub mod memory;
pub mod outbox;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use adapter::{AdapterEvent, Inbound, TransportAdapter};
pub use ids::RequestIds;
pub use memory::{FaultInjector, MemoryChannel};
pub use outbox::{Outbox, Outgoing};
pub use tcp::TcpChannel;

/// Why a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown after a finished or canceled session
    Normal,
    /// Unexpected loss; the session should reconnect
    Lost,
    /// Peer failed the version handshake
    NotAuthorized,
    /// Peer pairing was revoked
    Revoked,
}

impl CloseReason {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CloseReason::Lost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed(CloseReason),
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

#[async_trait]
pub trait PeerChannel: Send {
    /// Send one channel message. Fails while disconnected.
    async fn send(&mut self, frame: Bytes) -> anyhow::Result<()>;

    /// Close the link. The remote side observes `Closed`.
    async fn close(&mut self, reason: CloseReason);

    /// Re-establish the link; success is reported as a later `Open` event.
    async fn reconnect(&mut self) -> anyhow::Result<()>;
}

/// A channel together with the queue its events arrive on.
pub struct PeerLink {
    pub channel: Box<dyn PeerChannel>,
    pub events: EventReceiver,
}

impl PeerLink {
    pub fn new(channel: impl PeerChannel + 'static, events: EventReceiver) -> Self {
        Self {
            channel: Box::new(channel),
            events,
        }
    }
}
