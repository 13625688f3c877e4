//! Version handshake exchanged as the first message after the channel opens.
//!
//! Hello wire format (never segmented): `magic "PMIG" || version:string(u16 len) || caps:u32`

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::protocol::framing::Framing;

pub const HELLO_MAGIC: &[u8; 4] = b"PMIG";

/// Current protocol version
pub const PROTOCOL_MAJOR: u32 = 3;
pub const PROTOCOL_MINOR: u32 = 0;

/// Oldest peer major version accepted
pub const PROTOCOL_MAJOR_MIN: u32 = 2;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Channel delivers whole messages; no control-byte segmentation
        const NATIVE_FRAMING = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
    };

    pub fn parse(s: &str) -> Result<Self> {
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        Ok(Self {
            major: major
                .trim()
                .parse()
                .with_context(|| format!("Invalid major version in {:?}", s))?,
            minor: minor
                .trim()
                .parse()
                .with_context(|| format!("Invalid minor version in {:?}", s))?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: ProtocolVersion,
    pub capabilities: Capabilities,
}

impl Hello {
    pub fn local() -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            capabilities: Capabilities::NATIVE_FRAMING,
        }
    }

    pub fn encode(&self) -> Bytes {
        let version = self.version.to_string();
        let mut buf = BytesMut::with_capacity(4 + 2 + version.len() + 4);
        buf.put_slice(HELLO_MAGIC);
        buf.put_u16(version.len() as u16);
        buf.put_slice(version.as_bytes());
        buf.put_u32(self.capabilities.bits());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 || &payload[..4] != HELLO_MAGIC {
            anyhow::bail!("Not a migration hello frame");
        }
        payload.advance(4);
        let len = payload.get_u16() as usize;
        if payload.remaining() < len + 4 {
            anyhow::bail!("Hello payload truncated");
        }
        let version = String::from_utf8(payload.copy_to_bytes(len).to_vec())
            .context("Invalid UTF-8 in Hello version")?;
        let capabilities = Capabilities::from_bits_truncate(payload.get_u32());
        Ok(Self {
            version: ProtocolVersion::parse(&version)?,
            capabilities,
        })
    }
}

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Peer is compatible; carries the framing both sides agreed on
    Supported {
        peer: ProtocolVersion,
        framing: Framing,
    },
    /// Peer major version is below the minimum we accept
    TooOld {
        peer: ProtocolVersion,
        min_supported: u32,
    },
}

/// Check a peer hello against ours.
///
/// Native framing is used only when both sides advertise it; otherwise
/// every message is segmented into `legacy_frame_size` frames.
pub fn negotiate_version(
    local: &Hello,
    peer: &Hello,
    legacy_frame_size: usize,
) -> VersionNegotiationResult {
    if peer.version.major < PROTOCOL_MAJOR_MIN {
        return VersionNegotiationResult::TooOld {
            peer: peer.version,
            min_supported: PROTOCOL_MAJOR_MIN,
        };
    }
    let native = local.capabilities.contains(Capabilities::NATIVE_FRAMING)
        && peer.capabilities.contains(Capabilities::NATIVE_FRAMING);
    let framing = if native {
        Framing::Native
    } else {
        Framing::Segmented {
            max_frame: legacy_frame_size,
        }
    };
    VersionNegotiationResult::Supported {
        peer: peer.version,
        framing,
    }
}
