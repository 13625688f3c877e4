//! Derived, read-only progress snapshot.

use serde::Serialize;
use uuid::Uuid;

use crate::protocol::ErrorCode;
use crate::session::{Role, State};

/// Raw per-direction byte counters kept by the transfer engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub done: i64,
    pub pending: i64,
    pub total: i64,
}

impl ByteCounters {
    /// Clamp to non-negative values with `done + pending <= total`.
    pub fn clamped(&self) -> (u64, u64, u64) {
        let total = self.total.max(0) as u64;
        let done = (self.done.max(0) as u64).min(total);
        let pending = (self.pending.max(0) as u64).min(total - done);
        (done, pending, total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub session_id: Uuid,
    pub role: Role,
    pub state: State,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_total: u64,
    pub receive_total: u64,
    pub pending_send: u64,
    pub pending_receive: u64,
    pub remaining: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    #[serde(serialize_with = "serialize_code")]
    pub error_code: Option<ErrorCode>,
    pub percent: u8,
    pub canceled: bool,
}

fn serialize_code<S: serde::Serializer>(code: &Option<ErrorCode>, s: S) -> Result<S::Ok, S::Error> {
    match code {
        Some(c) => s.serialize_some(c.as_str()),
        None => s.serialize_none(),
    }
}

impl Status {
    /// Build a snapshot from raw counters.
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        session_id: Uuid,
        role: Role,
        state: State,
        send: ByteCounters,
        receive: ByteCounters,
        send_errors: u64,
        receive_errors: u64,
        error_code: Option<ErrorCode>,
        canceled: bool,
    ) -> Self {
        let (bytes_sent, pending_send, send_total) = send.clamped();
        let (bytes_received, pending_receive, receive_total) = receive.clamped();

        let finished = state == State::Terminated || state.is_terminal();
        let remaining = if finished {
            0
        } else {
            (send_total - bytes_sent) + (receive_total - bytes_received)
        };

        let total = send_total + receive_total;
        let percent = if state == State::Stopped && !canceled && error_code.is_none() {
            100
        } else if total == 0 {
            0
        } else {
            (((bytes_sent + bytes_received) as u128 * 100) / total as u128).min(100) as u8
        };

        Self {
            session_id,
            role,
            state,
            bytes_sent,
            bytes_received,
            send_total,
            receive_total,
            pending_send,
            pending_receive,
            remaining,
            send_errors,
            receive_errors,
            error_code,
            percent,
            canceled,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == State::Stopped && !self.canceled && self.error_code.is_none()
    }
}
