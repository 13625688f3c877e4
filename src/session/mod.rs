//! Migration State Machine, status reporting and the per-session worker.

pub mod machine;
pub mod status;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use machine::Machine;
pub use status::Status;
pub use worker::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dials the peer and drives termination
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Starting,
    Negotiate,
    ListFiles,
    SendFiles,
    SendSettings,
    SendDatabase,
    WaitFiles,
    SendAccount,
    WaitAccount,
    Terminate,
    Terminated,
    Stopped,
    Canceled,
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Starting => "STARTING",
            State::Negotiate => "NEGOTIATE",
            State::ListFiles => "LIST_FILES",
            State::SendFiles => "SEND_FILES",
            State::SendSettings => "SEND_SETTINGS",
            State::SendDatabase => "SEND_DATABASE",
            State::WaitFiles => "WAIT_FILES",
            State::SendAccount => "SEND_ACCOUNT",
            State::WaitAccount => "WAIT_ACCOUNT",
            State::Terminate => "TERMINATE",
            State::Terminated => "TERMINATED",
            State::Stopped => "STOPPED",
            State::Canceled => "CANCELED",
            State::Error => "ERROR",
        }
    }

    /// No further protocol work happens in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Stopped | State::Canceled | State::Error)
    }

    /// States in which file, settings and account traffic is accepted.
    pub fn is_exchanging(&self) -> bool {
        matches!(
            self,
            State::ListFiles
                | State::SendFiles
                | State::SendSettings
                | State::SendDatabase
                | State::WaitFiles
                | State::SendAccount
                | State::WaitAccount
                | State::Terminate
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
