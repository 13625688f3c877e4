//! Messages queued by the state machine for the adapter to send.

use std::collections::VecDeque;

use crate::protocol::Message;
use crate::session::Role;
use crate::transport::ids::RequestIds;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Request { id: u64, message: Message },
    Response { id: u64, message: Message },
    Notify(Message),
}

impl Outgoing {
    pub fn message(&self) -> &Message {
        match self {
            Outgoing::Request { message, .. } | Outgoing::Response { message, .. } => message,
            Outgoing::Notify(message) => message,
        }
    }
}

/// Owns the request id namespace so callers know an id before it is sent.
#[derive(Debug)]
pub struct Outbox {
    ids: RequestIds,
    queue: VecDeque<Outgoing>,
}

impl Outbox {
    pub fn new(role: Role) -> Self {
        Self {
            ids: RequestIds::new(role),
            queue: VecDeque::new(),
        }
    }

    pub fn request(&mut self, message: Message) -> u64 {
        let id = self.ids.next_id();
        self.queue.push_back(Outgoing::Request { id, message });
        id
    }

    pub fn respond(&mut self, id: u64, message: Message) {
        self.queue.push_back(Outgoing::Response { id, message });
    }

    pub fn notify(&mut self, message: Message) {
        self.queue.push_back(Outgoing::Notify(message));
    }

    pub fn drain(&mut self) -> Vec<Outgoing> {
        self.queue.drain(..).collect()
    }

    /// Drop queued messages that were never handed to the channel.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
