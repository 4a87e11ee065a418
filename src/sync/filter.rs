//! Receiver-side ordering filter
//!
//! Delivers each sender's sub-messages strictly in order. Anything that is
//! not exactly the next sequence is dropped; the sender's batch
//! retransmission delivers it again later.

use std::collections::HashMap;

/// Per-sender in-order, no-gap filter.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Last accepted sequence per user id.
    cursors: HashMap<String, u32>,
}

impl MessageFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seq` from `user_id` should be delivered.
    ///
    /// The first message seen from a sender is accepted and sets its
    /// cursor. Later messages are accepted only at `cursor + 1`.
    pub fn accept(&mut self, user_id: &str, seq: u32) -> bool {
        match self.cursors.get_mut(user_id) {
            None => {
                self.cursors.insert(user_id.to_string(), seq);
                true
            }
            Some(last) if last.checked_add(1) == Some(seq) => {
                *last = seq;
                true
            }
            Some(_) => false,
        }
    }

    /// Last accepted sequence for `user_id`.
    pub fn cursor(&self, user_id: &str) -> Option<u32> {
        self.cursors.get(user_id).copied()
    }

    /// Forget every sender.
    pub fn clear(&mut self) {
        self.cursors.clear();
    }
}
