//! Migration wire protocol.
//!
//! Layers, outermost first:
//! - hello handshake (raw, once per connection)
//! - channel framing (native or control-byte segmented)
//! - envelope (request / response / notify + request id)
//! - schema-tagged message

pub mod envelope;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod wire;

pub use envelope::{Envelope, EnvelopeKind};
pub use framing::{FrameDecoder, FrameOutcome, Framing, FramingError};
pub use handshake::{negotiate_version, Capabilities, Hello, ProtocolVersion, VersionNegotiationResult};
pub use messages::{
    Account, ErrorCode, ListAck, ListEntry, Message, OnPutFile, PutFile, QueryInfo, Setting,
    Settings,
};
