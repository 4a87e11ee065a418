//! Match relay session state machine.
//!
//! Pure protocol logic with no sockets and no clock of its own: the worker
//! feeds it ticks and received datagrams and performs the I/O it asks for.
//!
//! ```text
//! Start ──► SessionExchange ──► AwaitHello ──► PingTest ──► InBattle
//!                 │                  │             │            │
//!                 └──────────────────┴─────────────┴────────────┴──► End
//! ```

use std::collections::VecDeque;

use crate::core::{
    HELLO_INTERVAL_TICKS, MAX_BATTLE_CHUNK, MCS_FIRST_MESSAGE_SIZE, MCS_GREETING,
    MCS_SESSION_ID_RANGE, PING_INTERVAL_TICKS, RETRANSMIT_INTERVAL_TICKS,
};
use crate::sync::{MessageFilter, OutgoingBuffer};
use crate::transport::PingMeter;
use crate::wire::{MessageType, Packet};

/// Close reason: the peer sent a Fin.
pub const REASON_RECV_FIN: &str = "cl_recv_fin";

/// Close reason: the guest closed the socket.
pub const REASON_CLOSE: &str = "cl_close";

/// Close reason: hard reset or mode switch.
pub const REASON_HARD_RESET: &str = "cl_hard_reset";

/// Close reason: unrecoverable socket error.
pub const REASON_ERROR: &str = "cl_error";

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UdpState {
    /// Nothing happened yet.
    Start,
    /// Greeting delivered, waiting for the guest's first message.
    SessionExchange,
    /// Session id known, waiting for the HelloServer reply.
    AwaitHello,
    /// Measuring round trips.
    PingTest,
    /// Relaying battle traffic.
    InBattle,
    /// Closed; nothing more happens.
    End,
}

/// Work requested by one step of the state machine.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionEvents {
    /// Datagrams to send to the relay.
    pub send: Vec<Packet>,
    /// Bytes for the guest to read.
    pub deliver: Vec<u8>,
    /// Newly derived max-lag.
    pub max_lag: Option<u8>,
}

/// Match relay session.
#[derive(Debug)]
pub struct UdpSession {
    state: UdpState,
    tick: u64,
    session_id: String,
    user_id: String,
    outgoing: OutgoingBuffer,
    filter: MessageFilter,
    meter: PingMeter,
    retransmit_countdown: u32,
}

impl Default for UdpSession {
    fn default() -> Self {
        Self::new(OutgoingBuffer::new())
    }
}

impl UdpSession {
    /// Create a session around `outgoing`.
    pub fn new(mut outgoing: OutgoingBuffer) -> Self {
        outgoing.clear();
        Self {
            state: UdpState::Start,
            tick: 0,
            session_id: String::new(),
            user_id: String::new(),
            outgoing,
            filter: MessageFilter::new(),
            meter: PingMeter::new(),
            retransmit_countdown: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> UdpState {
        self.state
    }

    /// Session id, empty until the guest's first message.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// User id, empty until the HelloServer reply.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Send-side reliability state.
    pub fn outgoing(&self) -> &OutgoingBuffer {
        &self.outgoing
    }

    /// Advance one tick. `pending` holds guest bytes not yet sent.
    pub fn step(&mut self, now_ms: i64, pending: &mut VecDeque<u8>) -> SessionEvents {
        let mut ev = SessionEvents::default();
        match self.state {
            UdpState::Start => {
                pending.clear();
                ev.deliver.extend_from_slice(&MCS_GREETING);
                self.state = UdpState::SessionExchange;
            }
            UdpState::SessionExchange => {
                if pending.len() >= MCS_FIRST_MESSAGE_SIZE {
                    let first: Vec<u8> = pending.drain(..).collect();
                    self.session_id = String::from_utf8_lossy(&first[MCS_SESSION_ID_RANGE])
                        .into_owned();
                    self.outgoing.set_session_id(&self.session_id);
                    tracing::info!(session_id = %self.session_id, "mcs session id");
                    self.state = UdpState::AwaitHello;
                    ev.send.push(Packet::hello_server(&self.session_id));
                }
            }
            UdpState::AwaitHello => {
                if self.tick % HELLO_INTERVAL_TICKS == 0 {
                    ev.send.push(Packet::hello_server(&self.session_id));
                }
            }
            UdpState::PingTest => {
                if self.tick % PING_INTERVAL_TICKS == 0 || self.meter.all_answered() {
                    ev.send
                        .push(Packet::ping(&self.session_id, &self.user_id, now_ms));
                    self.meter.on_sent();
                }
            }
            UdpState::InBattle => self.step_battle(pending, &mut ev),
            UdpState::End => {}
        }
        self.tick += 1;
        ev
    }

    fn step_battle(&mut self, pending: &mut VecDeque<u8>, ev: &mut SessionEvents) {
        let mut pushed = false;
        if !pending.is_empty() {
            let room = self.outgoing.room();
            if room > 0 {
                let n = pending.len().min(MAX_BATTLE_CHUNK).min(room);
                let chunk: Vec<u8> = pending.drain(..n).collect();
                pushed = self.outgoing.push(&self.user_id, &chunk);
            } else {
                tracing::debug!(
                    pending = pending.len(),
                    "outgoing window full, holding guest bytes"
                );
            }
        }
        if pushed || self.retransmit_countdown == 0 {
            ev.send.push(self.outgoing.packet().clone());
            self.retransmit_countdown = RETRANSMIT_INTERVAL_TICKS;
        } else {
            self.retransmit_countdown -= 1;
        }
    }

    /// Handle a datagram received from the relay.
    pub fn on_packet(&mut self, packet: Packet, now_ms: i64) -> SessionEvents {
        let mut ev = SessionEvents::default();
        match packet.kind {
            MessageType::HelloServer => {
                let Some(data) = packet.hello_server_data else {
                    return ev;
                };
                if self.state == UdpState::AwaitHello && data.ok {
                    self.user_id = data.user_id;
                    tracing::info!(user_id = %self.user_id, "mcs user id");
                    self.meter.reset();
                    self.state = UdpState::PingTest;
                }
            }
            MessageType::Pong => {
                let Some(pong) = packet.pong_data else {
                    return ev;
                };
                if self.state != UdpState::PingTest {
                    return ev;
                }
                let rtt = (now_ms - pong.timestamp) as f64;
                self.meter.on_pong(rtt);
                tracing::debug!(rtt_ms = rtt, count = self.meter.received(), "pong");
                if let Some(lag) = self.meter.max_lag() {
                    let mean = self.meter.mean_ms().unwrap_or_default();
                    tracing::info!("PING:{:.0}ms DELAY:{}fr", mean, lag);
                    ev.max_lag = Some(lag);
                    self.retransmit_countdown = 0;
                    self.state = UdpState::InBattle;
                }
            }
            MessageType::Battle => {
                if self.state != UdpState::InBattle {
                    return ev;
                }
                self.outgoing.apply_seq_ack(packet.seq, packet.ack);
                for msg in packet.battle_data {
                    if self.filter.accept(&msg.user_id, msg.seq) {
                        ev.deliver.extend_from_slice(&msg.body);
                    }
                }
            }
            MessageType::Fin => {
                if self.state == UdpState::End {
                    return ev;
                }
                let detail = packet.fin_data.map(|f| f.detail).unwrap_or_default();
                tracing::info!(%detail, "mcs fin received");
                if let Some(fin) = self.close(REASON_RECV_FIN) {
                    ev.send.push(fin);
                }
            }
            MessageType::Ping | MessageType::None => {
                tracing::warn!(kind = ?packet.kind, "unexpected datagram");
            }
        }
        ev
    }

    /// Enter `End`, returning the Fin to send unless the session had
    /// already ended. The Fin carries an empty session id before the guest
    /// has sent one.
    pub fn close(&mut self, reason: &str) -> Option<Packet> {
        let was_open = self.state != UdpState::End;
        self.state = UdpState::End;
        was_open.then(|| Packet::fin(&self.session_id, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BattleMessage, HelloServerData, PongData};

    fn first_message(session: &[u8; 8]) -> Vec<u8> {
        let mut msg = vec![0x82, 0x02];
        msg.extend_from_slice(&[0u8; 10]);
        msg.extend_from_slice(session);
        msg
    }

    fn hello_reply(user_id: &str) -> Packet {
        Packet {
            kind: MessageType::HelloServer,
            hello_server_data: Some(HelloServerData {
                session_id: "ABCDEFGH".into(),
                ok: true,
                user_id: user_id.into(),
            }),
            ..Default::default()
        }
    }

    fn pong(timestamp: i64) -> Packet {
        Packet {
            kind: MessageType::Pong,
            pong_data: Some(PongData {
                timestamp,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn battle(seq: u32, ack: u32, msgs: &[(&str, u32, &[u8])]) -> Packet {
        Packet {
            kind: MessageType::Battle,
            seq,
            ack,
            battle_data: msgs
                .iter()
                .map(|(u, s, b)| BattleMessage {
                    user_id: u.to_string(),
                    seq: *s,
                    body: b.to_vec(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn session_in_battle() -> (UdpSession, VecDeque<u8>) {
        let mut s = UdpSession::default();
        let mut pending = VecDeque::new();
        s.step(0, &mut pending);
        pending.extend(first_message(b"ABCDEFGH"));
        s.step(0, &mut pending);
        s.on_packet(hello_reply("me"), 0);
        for _ in 0..10 {
            s.step(0, &mut pending);
            s.on_packet(pong(0), 16);
        }
        assert_eq!(s.state(), UdpState::InBattle);
        (s, pending)
    }

    #[test]
    fn test_start_delivers_greeting() {
        let mut s = UdpSession::default();
        let mut pending = VecDeque::new();
        let ev = s.step(0, &mut pending);
        assert_eq!(ev.deliver, MCS_GREETING.to_vec());
        assert_eq!(s.state(), UdpState::SessionExchange);
    }

    #[test]
    fn test_session_handshake_extracts_id() {
        let mut s = UdpSession::default();
        let mut pending = VecDeque::new();
        s.step(0, &mut pending);

        pending.extend(&first_message(b"ABCDEFGH")[..19]);
        assert!(s.step(0, &mut pending).send.is_empty());
        assert_eq!(s.state(), UdpState::SessionExchange);

        pending.push_back(b'H');
        let ev = s.step(0, &mut pending);
        assert_eq!(s.session_id(), "ABCDEFGH");
        assert_eq!(s.state(), UdpState::AwaitHello);
        assert!(pending.is_empty());
        assert_eq!(ev.send.len(), 1);
        assert_eq!(ev.send[0].kind, MessageType::HelloServer);
        assert_eq!(ev.send[0].session_id, "ABCDEFGH");
    }

    #[test]
    fn test_hello_retried_until_reply() {
        let mut s = UdpSession::default();
        let mut pending = VecDeque::new();
        s.step(0, &mut pending);
        pending.extend(first_message(b"ABCDEFGH"));
        s.step(0, &mut pending);

        let mut hellos = 0;
        for _ in 0..250 {
            hellos += s.step(0, &mut pending).send.len();
        }
        assert_eq!(hellos, 2);

        let mut rejected = hello_reply("x");
        rejected.hello_server_data.as_mut().unwrap().ok = false;
        s.on_packet(rejected, 0);
        assert_eq!(s.state(), UdpState::AwaitHello);

        s.on_packet(hello_reply("user-1"), 0);
        assert_eq!(s.user_id(), "user-1");
        assert_eq!(s.state(), UdpState::PingTest);
    }

    #[test]
    fn test_ping_derived_lag() {
        let mut s = UdpSession::default();
        let mut pending = VecDeque::new();
        s.step(0, &mut pending);
        pending.extend(first_message(b"ABCDEFGH"));
        s.step(0, &mut pending);
        s.on_packet(hello_reply("me"), 0);

        let rtts = [64, 60, 68, 64, 64, 70, 58, 64, 62, 66];
        let mut lag = None;
        for (i, rtt) in rtts.iter().enumerate() {
            let sent_at = (i as i64) * 1000;
            let ev = s.step(sent_at, &mut pending);
            assert_eq!(ev.send.len(), 1, "ping {i}");
            let ts = ev.send[0].ping_data.as_ref().unwrap().timestamp;
            assert_eq!(ts, sent_at);
            // No new ping while one is outstanding.
            assert!(s.step(sent_at, &mut pending).send.is_empty() || i == 0);
            lag = s.on_packet(pong(ts), sent_at + rtt).max_lag.or(lag);
        }
        assert_eq!(lag, Some(8));
        assert_eq!(s.state(), UdpState::InBattle);
    }

    #[test]
    fn test_battle_relay_pushes_and_delivers() {
        let (mut s, mut pending) = session_in_battle();
        pending.extend([1u8, 2, 3]);
        let ev = s.step(0, &mut pending);
        assert!(pending.is_empty());
        assert_eq!(ev.send.len(), 1);
        let pkt = &ev.send[0];
        assert_eq!(pkt.session_id, "ABCDEFGH");
        assert_eq!(pkt.battle_data.len(), 1);
        assert_eq!(pkt.battle_data[0].user_id, "me");
        assert_eq!(pkt.battle_data[0].body, vec![1, 2, 3]);

        let ev = s.on_packet(
            battle(2, 1, &[("peer", 1, b"ab"), ("peer", 2, b"cd")]),
            0,
        );
        assert_eq!(ev.deliver, b"abcd".to_vec());
        assert_eq!(s.outgoing().pending(), 0);
        assert_eq!(s.outgoing().ack(), 2);

        // Retransmitted batch with an old and a new message.
        let ev = s.on_packet(battle(3, 1, &[("peer", 2, b"cd"), ("peer", 3, b"ef")]), 0);
        assert_eq!(ev.deliver, b"ef".to_vec());
    }

    #[test]
    fn test_idle_retransmit_countdown() {
        let (mut s, mut pending) = session_in_battle();
        let mut sends = Vec::new();
        for tick in 0..100 {
            if !s.step(0, &mut pending).send.is_empty() {
                sends.push(tick);
            }
        }
        let gap = RETRANSMIT_INTERVAL_TICKS as usize + 1;
        assert_eq!(sends[..3], [0, gap, 2 * gap]);
    }

    #[test]
    fn test_full_window_holds_bytes() {
        let mut s = UdpSession::new(OutgoingBuffer::with_capacity(1));
        let mut pending = VecDeque::new();
        s.step(0, &mut pending);
        pending.extend(first_message(b"ABCDEFGH"));
        s.step(0, &mut pending);
        s.on_packet(hello_reply("me"), 0);
        for _ in 0..10 {
            s.step(0, &mut pending);
            s.on_packet(pong(0), 0);
        }

        pending.extend([1u8]);
        s.step(0, &mut pending);
        pending.extend([2u8]);
        let ev = s.step(0, &mut pending);
        assert!(ev.send.is_empty());
        assert_eq!(pending.len(), 1);

        s.on_packet(battle(0, 1, &[]), 0);
        let ev = s.step(0, &mut pending);
        assert!(pending.is_empty());
        assert_eq!(ev.send[0].battle_data[0].body, vec![2]);
    }

    #[test]
    fn test_flooded_batch_stays_within_one_datagram() {
        use crate::core::{MAX_BATCH_BYTES, RECV_BUFFER_SIZE};

        let (mut s, mut pending) = session_in_battle();
        pending.extend(std::iter::repeat_n(0x5Au8, 4 * MAX_BATCH_BYTES));
        for _ in 0..60 {
            for pkt in s.step(0, &mut pending).send {
                assert!(pkt.encode().unwrap().len() <= RECV_BUFFER_SIZE);
            }
        }
        let carried: usize = s.outgoing().packet().battle_data.iter().map(|m| m.body.len()).sum();
        assert_eq!(carried, MAX_BATCH_BYTES);
        assert_eq!(pending.len(), 3 * MAX_BATCH_BYTES);
    }

    #[test]
    fn test_fin_ends_session() {
        let (mut s, _) = session_in_battle();
        let ev = s.on_packet(Packet::fin("ABCDEFGH", "server_shutdown"), 0);
        assert_eq!(s.state(), UdpState::End);
        assert_eq!(ev.send.len(), 1);
        assert_eq!(
            ev.send[0].fin_data.as_ref().unwrap().detail,
            REASON_RECV_FIN
        );
        let mut pending = VecDeque::from(vec![1u8]);
        assert_eq!(s.step(0, &mut pending), SessionEvents::default());
        assert!(s.close(REASON_CLOSE).is_none());
    }

    #[test]
    fn test_close_before_session_id_still_sends_fin() {
        let mut s = UdpSession::default();
        let fin = s.close(REASON_HARD_RESET).unwrap();
        assert_eq!(fin.kind, MessageType::Fin);
        assert!(fin.session_id.is_empty());
        assert_eq!(fin.fin_data.unwrap().detail, REASON_HARD_RESET);
        assert_eq!(s.state(), UdpState::End);
        assert!(s.close(REASON_HARD_RESET).is_none());
    }
}
