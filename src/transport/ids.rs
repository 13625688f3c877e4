//! Request id namespaces.
//!
//! Initiator ids carry the top bit, responder ids never do, so a late
//! response can never be matched to the other side's request.

use crate::session::Role;

pub const INITIATOR_TAG: u64 = 1 << 63;

#[derive(Debug, Clone)]
pub struct RequestIds {
    tag: u64,
    next: u64,
}

impl RequestIds {
    pub fn new(role: Role) -> Self {
        let tag = match role {
            Role::Initiator => INITIATOR_TAG,
            Role::Responder => 0,
        };
        Self { tag, next: 1 }
    }

    /// Next id. The counter survives reconnects.
    pub fn next_id(&mut self) -> u64 {
        let id = self.tag | (self.next & !INITIATOR_TAG);
        self.next = self.next.wrapping_add(1).max(1);
        id
    }
}
