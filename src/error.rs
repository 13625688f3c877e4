use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to access {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not enough space on the {volume} volume: need {needed} bytes, {available} available")]
    NoSpaceLeft {
        volume: &'static str,
        needed: u64,
        available: u64,
    },

    #[error("Peer protocol version {peer} is older than the minimum supported major version {minimum}")]
    BadPeerVersion { peer: String, minimum: u32 },

    #[error("Peer connection was revoked")]
    Revoked,

    #[error("Staged database is unusable: {0}")]
    BadDatabase(String),

    #[error("Secure configuration error: {0}")]
    SecureStore(String),

    #[error("Staging area is incomplete: {0}")]
    Staging(String),

    #[error("Migration was canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// Wire code reported to the peer and exposed through `Status`.
    pub fn code(&self) -> ErrorCode {
        match self {
            MigrationError::Io(_) | MigrationError::Path { .. } => ErrorCode::IoError,
            MigrationError::NoSpaceLeft { .. } => ErrorCode::NoSpaceLeft,
            MigrationError::BadPeerVersion { .. } => ErrorCode::BadPeerVersion,
            MigrationError::Revoked => ErrorCode::Revoked,
            MigrationError::BadDatabase(_) => ErrorCode::BadDatabase,
            MigrationError::SecureStore(_) | MigrationError::Staging(_) => {
                ErrorCode::SecureStoreError
            }
            MigrationError::Protocol(_)
            | MigrationError::Transport(_)
            | MigrationError::Config(_)
            | MigrationError::Canceled
            | MigrationError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn path(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MigrationError::Path {
            path: path.into(),
            source,
        }
    }
}

impl From<anyhow::Error> for MigrationError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<MigrationError>() {
            Ok(e) => e,
            Err(err) => match err.downcast::<io::Error>() {
                Ok(io) => MigrationError::Io(io),
                Err(other) => MigrationError::Internal(format!("{:#}", other)),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = MigrationError::NoSpaceLeft {
            volume: "database",
            needed: 600,
            available: 500,
        };
        assert_eq!(err.code(), ErrorCode::NoSpaceLeft);
        assert!(err.to_string().contains("600"));

        assert_eq!(MigrationError::Revoked.code(), ErrorCode::Revoked);
        assert_eq!(
            MigrationError::Staging("missing settings".into()).code(),
            ErrorCode::SecureStoreError
        );
    }

    #[test]
    fn test_from_anyhow_keeps_io_kind() {
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: MigrationError = anyhow::Error::new(io).into();
        assert!(matches!(err, MigrationError::Io(_)));
        assert_eq!(err.code(), ErrorCode::IoError);
    }
}
