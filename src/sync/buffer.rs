//! Outgoing accumulator
//!
//! Collects battle sub-messages until the peer acknowledges them. The whole
//! pending batch rides in every Battle datagram, so a lost datagram is
//! repaired by the next send instead of a targeted retransmission.

use crate::core::{MAX_BATCH_BYTES, OUTGOING_CAPACITY};
use crate::wire::{BattleMessage, MessageType, Packet};

/// First sequence number of a fresh session.
pub const INITIAL_SEQ: u32 = 1;

/// Send-side seq/ack state plus the unacknowledged batch.
#[derive(Debug, Clone)]
pub struct OutgoingBuffer {
    /// Datagram template carrying the pending batch and our ack.
    packet: Packet,

    /// Sequence assigned to the next pushed sub-message.
    next_seq: u32,

    /// Lowest sequence not yet acknowledged by the peer.
    confirmed_through: u32,

    /// Maximum queued sub-messages.
    capacity: usize,

    /// Body bytes across the pending batch.
    pending_bytes: usize,
}

impl Default for OutgoingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingBuffer {
    /// Create a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(OUTGOING_CAPACITY)
    }

    /// Create a buffer holding at most `capacity` sub-messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            packet: Packet::battle(""),
            next_seq: INITIAL_SEQ,
            confirmed_through: INITIAL_SEQ,
            capacity,
            pending_bytes: 0,
        }
    }

    /// Tag outgoing datagrams with `session_id`.
    pub fn set_session_id(&mut self, session_id: &str) {
        self.packet.session_id = session_id.to_string();
    }

    /// Whether another sub-message fits.
    pub fn can_push(&self) -> bool {
        self.room() > 0
    }

    /// Largest body the next sub-message may carry; 0 when full.
    ///
    /// Bounded by both the sub-message count and [`MAX_BATCH_BYTES`], so
    /// the whole batch always encodes into one datagram.
    pub fn room(&self) -> usize {
        if self.packet.battle_data.len() >= self.capacity {
            return 0;
        }
        MAX_BATCH_BYTES.saturating_sub(self.pending_bytes)
    }

    /// Queue `body` from `user_id` under the next sequence number.
    ///
    /// Returns `false` without queuing when the buffer is full or `body`
    /// exceeds [`room`](Self::room); the caller keeps the bytes and retries
    /// once acknowledgements free space.
    pub fn push(&mut self, user_id: &str, body: &[u8]) -> bool {
        if body.len() > self.room() || !self.can_push() {
            return false;
        }
        let seq = self.next_seq;
        self.packet.battle_data.push(BattleMessage {
            user_id: user_id.to_string(),
            seq,
            body: body.to_vec(),
        });
        self.packet.seq = seq;
        self.next_seq += 1;
        self.pending_bytes += body.len();
        true
    }

    /// Apply the peer's `seq` and `ack` from a received Battle datagram.
    ///
    /// Drops every queued sub-message with sequence `<= ack` and raises the
    /// ack we send to `max(current, seq)`.
    pub fn apply_seq_ack(&mut self, seq: u32, ack: u32) {
        if self.confirmed_through <= ack {
            self.packet.battle_data.retain(|m| m.seq > ack);
            self.pending_bytes = self.packet.battle_data.iter().map(|m| m.body.len()).sum();
            self.confirmed_through = ack + 1;
        }
        if self.packet.ack < seq {
            self.packet.ack = seq;
        }
    }

    /// Datagram to send: pending batch, our latest seq and ack.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Sub-messages awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.packet.battle_data.len()
    }

    /// Lowest sequence the peer has not acknowledged.
    pub fn confirmed_through(&self) -> u32 {
        self.confirmed_through
    }

    /// Ack we report to the peer.
    pub fn ack(&self) -> u32 {
        self.packet.ack
    }

    /// Forget everything; sequences restart at [`INITIAL_SEQ`].
    pub fn clear(&mut self) {
        self.packet = Packet {
            kind: MessageType::Battle,
            ..Default::default()
        };
        self.next_seq = INITIAL_SEQ;
        self.confirmed_through = INITIAL_SEQ;
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_assigns_sequences() {
        let mut buf = OutgoingBuffer::new();
        assert!(buf.push("u1", b"a"));
        assert!(buf.push("u1", b"b"));
        let seqs: Vec<u32> = buf.packet().battle_data.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(buf.packet().seq, 2);
        assert_eq!(buf.packet().kind, MessageType::Battle);
    }

    #[test]
    fn test_full_buffer_refuses_push() {
        let mut buf = OutgoingBuffer::with_capacity(2);
        assert!(buf.push("u1", b"a"));
        assert!(buf.push("u1", b"b"));
        assert!(!buf.can_push());
        assert!(!buf.push("u1", b"c"));
        assert_eq!(buf.pending(), 2);

        buf.apply_seq_ack(0, 1);
        assert!(buf.push("u1", b"c"));
        assert_eq!(buf.packet().battle_data.last().unwrap().seq, 3);
    }

    #[test]
    fn test_byte_budget_keeps_batch_encodable() {
        use crate::core::{MAX_BATTLE_CHUNK, RECV_BUFFER_SIZE};

        let mut buf = OutgoingBuffer::new();
        buf.set_session_id("ABCDEFGH");
        let chunk = vec![0xAB; MAX_BATTLE_CHUNK];
        let mut pushed = 0;
        while buf.push("some-user-id", &chunk) {
            pushed += 1;
        }
        assert_eq!(pushed, MAX_BATCH_BYTES / MAX_BATTLE_CHUNK);
        assert_eq!(buf.room(), 0);
        assert!(!buf.push("some-user-id", b""));
        let encoded = buf.packet().encode().unwrap();
        assert!(encoded.len() <= RECV_BUFFER_SIZE);

        buf.apply_seq_ack(0, 1);
        assert_eq!(buf.room(), MAX_BATTLE_CHUNK);
        assert!(!buf.push("some-user-id", &vec![0; MAX_BATTLE_CHUNK + 1]));
        assert!(buf.push("some-user-id", &chunk));
    }

    #[test]
    fn test_ack_trims_and_advances() {
        let mut buf = OutgoingBuffer::new();
        for _ in 0..5 {
            buf.push("u1", b"x");
        }
        buf.apply_seq_ack(9, 3);
        assert!(buf.packet().battle_data.iter().all(|m| m.seq > 3));
        assert_eq!(buf.pending(), 2);
        assert_eq!(buf.confirmed_through(), 4);
        assert_eq!(buf.ack(), 9);

        // Stale ack neither trims nor lowers anything.
        buf.apply_seq_ack(2, 1);
        assert_eq!(buf.pending(), 2);
        assert_eq!(buf.confirmed_through(), 4);
        assert_eq!(buf.ack(), 9);
    }

    #[test]
    fn test_ack_trim_property() {
        let mut buf = OutgoingBuffer::new();
        let mut ack = 0;
        for round in 0..40u32 {
            for _ in 0..(round % 4) {
                buf.push("u1", &[round as u8]);
            }
            ack += round % 3;
            let ack = ack.min(buf.packet().seq);
            if ack + 1 >= buf.confirmed_through() {
                buf.apply_seq_ack(round, ack);
                assert!(buf.packet().battle_data.iter().all(|m| m.seq > ack));
                assert_eq!(buf.confirmed_through(), ack + 1);
            }
        }
    }

    #[test]
    fn test_clear_restarts_sequences() {
        let mut buf = OutgoingBuffer::new();
        buf.set_session_id("S");
        buf.push("u1", b"a");
        buf.apply_seq_ack(5, 1);
        buf.clear();
        assert_eq!(buf.pending(), 0);
        assert_eq!(buf.ack(), 0);
        assert_eq!(buf.confirmed_through(), INITIAL_SEQ);
        buf.push("u1", b"b");
        assert_eq!(buf.packet().battle_data[0].seq, INITIAL_SEQ);
    }
}
