//! TCP-backed peer channel.
//!
//! Frame format on the socket: `len:u32 || bytes`. The dialing side
//! re-dials on reconnect, the listening side accepts the next connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ChannelEvent, CloseReason, EventSender, PeerChannel, PeerLink};

/// Maximum socket frame size (64MB)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single length-prefixed frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;
    Ok(Bytes::from(payload))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> Result<()> {
    let len = u32::try_from(frame.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| anyhow::anyhow!("Frame of {} bytes is too large", frame.len()))?;
    w.write_u32(len).await.context("Failed to write frame length")?;
    w.write_all(frame).await.context("Failed to write frame")?;
    w.flush().await?;
    Ok(())
}

enum Endpoint {
    Dial { addr: String, timeout: Duration },
    Listen { listener: Arc<TcpListener> },
}

pub struct TcpChannel {
    endpoint: Endpoint,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    events: EventSender,
}

impl TcpChannel {
    /// Dial `addr` and return a connected link.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<PeerLink> {
        let (events, rx) = mpsc::unbounded_channel();
        let mut channel = TcpChannel {
            endpoint: Endpoint::Dial {
                addr: addr.to_string(),
                timeout,
            },
            writer: None,
            reader: None,
            events,
        };
        channel.establish().await?;
        Ok(PeerLink::new(channel, rx))
    }

    /// Wait for the first peer on `listener` and return a connected link.
    pub async fn accept(listener: TcpListener) -> Result<PeerLink> {
        let (events, rx) = mpsc::unbounded_channel();
        let mut channel = TcpChannel {
            endpoint: Endpoint::Listen {
                listener: Arc::new(listener),
            },
            writer: None,
            reader: None,
            events,
        };
        channel.establish().await?;
        Ok(PeerLink::new(channel, rx))
    }

    async fn establish(&mut self) -> Result<()> {
        let stream = match &self.endpoint {
            Endpoint::Dial { addr, timeout } => {
                tokio::time::timeout(*timeout, TcpStream::connect(addr.as_str()))
                    .await
                    .with_context(|| format!("Timed out connecting to {}", addr))?
                    .with_context(|| format!("Failed to connect to {}", addr))?
            }
            Endpoint::Listen { listener } => {
                let (stream, peer) = listener.accept().await.context("Failed to accept peer")?;
                tracing::info!(peer = %peer, "Accepted migration peer");
                stream
            }
        };
        stream.set_nodelay(true)?;

        let (mut read_half, write_half) = stream.into_split();
        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(frame) => {
                        if events.send(ChannelEvent::Message(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("TCP peer read ended: {:#}", e);
                        let _ = events.send(ChannelEvent::Closed(CloseReason::Lost));
                        break;
                    }
                }
            }
        });

        self.writer = Some(write_half);
        self.reader = Some(reader);
        let _ = self.events.send(ChannelEvent::Open);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn send(&mut self, frame: Bytes) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("TCP channel is not connected"))?;
        if let Err(e) = write_frame(writer, &frame).await {
            self.teardown();
            let _ = self.events.send(ChannelEvent::Closed(CloseReason::Lost));
            return Err(e);
        }
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        tracing::debug!(?reason, "Closing TCP channel");
        self.teardown();
    }

    async fn reconnect(&mut self) -> anyhow::Result<()> {
        self.teardown();
        self.establish().await
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}
