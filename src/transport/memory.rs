//! In-process channel pair with fault injection.
//!
//! Both ends share one link. A disconnect (injected or via `close`) drops
//! the link for both sides; it comes back once both sides call
//! `reconnect`, at which point each side sees a fresh `Open`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{ChannelEvent, CloseReason, EventSender, PeerChannel, PeerLink};

struct Link {
    connected: bool,
    ready: [bool; 2],
    events: [EventSender; 2],
    /// Frames still allowed before the link is cut
    cut_after: Option<u64>,
    frames: u64,
    disconnects: u64,
}

impl Link {
    fn cut(&mut self, reason: CloseReason) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.ready = [false, false];
        self.disconnects += 1;
        for tx in &self.events {
            let _ = tx.send(ChannelEvent::Closed(reason));
        }
    }
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MemoryChannel {
    side: usize,
    link: Arc<Mutex<Link>>,
}

impl MemoryChannel {
    /// Two connected ends; each starts with an `Open` event queued.
    pub fn pair() -> (PeerLink, PeerLink, FaultInjector) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let _ = tx_a.send(ChannelEvent::Open);
        let _ = tx_b.send(ChannelEvent::Open);

        let link = Arc::new(Mutex::new(Link {
            connected: true,
            ready: [false, false],
            events: [tx_a, tx_b],
            cut_after: None,
            frames: 0,
            disconnects: 0,
        }));

        let a = MemoryChannel {
            side: 0,
            link: link.clone(),
        };
        let b = MemoryChannel {
            side: 1,
            link: link.clone(),
        };
        (
            PeerLink::new(a, rx_a),
            PeerLink::new(b, rx_b),
            FaultInjector { link },
        )
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    async fn send(&mut self, frame: Bytes) -> anyhow::Result<()> {
        let mut link = lock(&self.link);
        if !link.connected {
            anyhow::bail!("Memory channel is not connected");
        }
        if let Some(left) = link.cut_after {
            if left == 0 {
                link.cut_after = None;
                link.cut(CloseReason::Lost);
                anyhow::bail!("Memory channel lost");
            }
            link.cut_after = Some(left - 1);
        }
        link.frames += 1;
        let peer = 1 - self.side;
        link.events[peer]
            .send(ChannelEvent::Message(frame))
            .map_err(|_| anyhow::anyhow!("Peer end of memory channel dropped"))
    }

    async fn close(&mut self, reason: CloseReason) {
        let mut link = lock(&self.link);
        if !link.connected {
            return;
        }
        link.connected = false;
        link.ready = [false, false];
        link.disconnects += 1;
        let peer = 1 - self.side;
        let _ = link.events[peer].send(ChannelEvent::Closed(reason));
    }

    async fn reconnect(&mut self) -> anyhow::Result<()> {
        let mut link = lock(&self.link);
        if link.connected {
            return Ok(());
        }
        link.ready[self.side] = true;
        if link.ready == [true, true] {
            link.connected = true;
            link.ready = [false, false];
            for tx in &link.events {
                let _ = tx.send(ChannelEvent::Open);
            }
        }
        Ok(())
    }
}

/// Test hook for breaking a [`MemoryChannel`] pair.
#[derive(Clone)]
pub struct FaultInjector {
    link: Arc<Mutex<Link>>,
}

impl FaultInjector {
    /// Drop the link now; both sides see `Closed(Lost)`.
    pub fn disconnect(&self) {
        lock(&self.link).cut(CloseReason::Lost);
    }

    /// Drop the link after `frames` more frames have been delivered.
    pub fn disconnect_after(&self, frames: u64) {
        lock(&self.link).cut_after = Some(frames);
    }

    pub fn frames_delivered(&self) -> u64 {
        lock(&self.link).frames
    }

    pub fn disconnects(&self) -> u64 {
        lock(&self.link).disconnects
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.link).connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b, _faults) = MemoryChannel::pair();
        assert_eq!(a.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Open));

        a.channel.send(Bytes::from_static(b"one")).await.unwrap();
        a.channel.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"one")))
        );
        assert_eq!(
            b.events.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"two")))
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (mut a, mut b, faults) = MemoryChannel::pair();
        a.events.recv().await;
        b.events.recv().await;

        faults.disconnect();
        assert_eq!(
            a.events.recv().await,
            Some(ChannelEvent::Closed(CloseReason::Lost))
        );
        assert!(a.channel.send(Bytes::from_static(b"x")).await.is_err());

        a.channel.reconnect().await.unwrap();
        assert!(!faults.is_connected());
        b.channel.reconnect().await.unwrap();
        assert!(faults.is_connected());
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Closed(CloseReason::Lost)));
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(a.events.recv().await, Some(ChannelEvent::Open));
    }

    #[tokio::test]
    async fn test_disconnect_after_frames() {
        let (mut a, _b, faults) = MemoryChannel::pair();
        faults.disconnect_after(1);
        a.channel.send(Bytes::from_static(b"ok")).await.unwrap();
        assert!(a.channel.send(Bytes::from_static(b"cut")).await.is_err());
        assert_eq!(faults.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_peer_only() {
        let (mut a, mut b, _faults) = MemoryChannel::pair();
        a.events.recv().await;
        b.events.recv().await;
        a.channel.close(CloseReason::NotAuthorized).await;
        assert_eq!(
            b.events.recv().await,
            Some(ChannelEvent::Closed(CloseReason::NotAuthorized))
        );
        assert!(a.events.try_recv().is_err());
    }
}
