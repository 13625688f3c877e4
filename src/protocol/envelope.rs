//! Request/response correlation wrapped around every message frame.
//!
//! Envelope: `kind:u8 || request_id:u64 || message frame`

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::messages::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Request = 1,
    Response = 2,
    Notify = 3,
}

impl EnvelopeKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Notify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Zero for notifications
    pub request_id: u64,
    pub message: Message,
}

impl Envelope {
    pub fn request(request_id: u64, message: Message) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            request_id,
            message,
        }
    }

    pub fn response(request_id: u64, message: Message) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            request_id,
            message,
        }
    }

    pub fn notify(message: Message) -> Self {
        Self {
            kind: EnvelopeKind::Notify,
            request_id: 0,
            message,
        }
    }

    pub fn encode(&self) -> Bytes {
        let body = self.message.encode();
        let mut buf = BytesMut::with_capacity(9 + body.len());
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.request_id);
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.remaining() < 9 {
            anyhow::bail!("Envelope truncated: {} bytes", frame.remaining());
        }
        let raw_kind = frame.get_u8();
        let kind = EnvelopeKind::from_u8(raw_kind)
            .ok_or_else(|| anyhow::anyhow!("Unknown envelope kind {}", raw_kind))?;
        let request_id = frame.get_u64();
        let message = Message::decode(frame)?;
        Ok(Self {
            kind,
            request_id,
            message,
        })
    }
}
