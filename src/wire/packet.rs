//! UDP session datagram.
//!
//! Every datagram exchanged with the match relay is one [`Packet`],
//! serialized with bincode. The embedded [`MessageType`] selects which of
//! the optional payload sections is meaningful.

use serde::{Deserialize, Serialize};

use crate::core::{PacketError, RECV_BUFFER_SIZE};

/// Datagram type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageType {
    /// Unset.
    #[default]
    None,
    /// Session registration and its reply.
    HelloServer,
    /// Latency ping.
    Ping,
    /// Latency ping reply.
    Pong,
    /// Relayed battle bytes with seq/ack.
    Battle,
    /// Session teardown.
    Fin,
}

/// HelloServer payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HelloServerData {
    /// Session being joined.
    pub session_id: String,
    /// Set by the server when the session is accepted.
    pub ok: bool,
    /// Server-assigned user id.
    pub user_id: String,
}

/// Ping payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingData {
    /// Sender clock in milliseconds.
    pub timestamp: i64,
    /// Sender user id.
    pub user_id: String,
}

/// Pong payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PongData {
    /// Timestamp echoed from the ping.
    pub timestamp: i64,
    /// Responder user id.
    pub user_id: String,
    /// Address the responder saw the ping from.
    pub public_addr: String,
}

/// One relayed chunk of guest bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BattleMessage {
    /// Originating user.
    pub user_id: String,
    /// Per-sender sequence number, starting at 1.
    pub seq: u32,
    /// Guest bytes.
    pub body: Vec<u8>,
}

/// Fin payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinData {
    /// Close reason.
    pub detail: String,
}

/// A session datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Packet {
    /// Datagram type.
    pub kind: MessageType,
    /// Session the datagram belongs to.
    pub session_id: String,
    /// Highest battle sequence carried by the sender.
    pub seq: u32,
    /// Highest battle sequence the sender received.
    pub ack: u32,
    /// HelloServer section.
    pub hello_server_data: Option<HelloServerData>,
    /// Ping section.
    pub ping_data: Option<PingData>,
    /// Pong section.
    pub pong_data: Option<PongData>,
    /// Battle section.
    pub battle_data: Vec<BattleMessage>,
    /// Fin section.
    pub fin_data: Option<FinData>,
}

impl Packet {
    /// HelloServer registration for `session_id`.
    pub fn hello_server(session_id: &str) -> Self {
        Self {
            kind: MessageType::HelloServer,
            session_id: session_id.to_string(),
            hello_server_data: Some(HelloServerData {
                session_id: session_id.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Latency ping stamped with `timestamp`.
    pub fn ping(session_id: &str, user_id: &str, timestamp: i64) -> Self {
        Self {
            kind: MessageType::Ping,
            session_id: session_id.to_string(),
            ping_data: Some(PingData {
                timestamp,
                user_id: user_id.to_string(),
            }),
            ..Default::default()
        }
    }

    /// Teardown with a reason.
    pub fn fin(session_id: &str, detail: &str) -> Self {
        Self {
            kind: MessageType::Fin,
            session_id: session_id.to_string(),
            fin_data: Some(FinData {
                detail: detail.to_string(),
            }),
            ..Default::default()
        }
    }

    /// Empty battle datagram.
    pub fn battle(session_id: &str) -> Self {
        Self {
            kind: MessageType::Battle,
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let data = bincode::serialize(self)?;
        if data.len() > RECV_BUFFER_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }
        Ok(data)
    }

    /// Parse a received datagram.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battle_packet_roundtrip() {
        let mut pkt = Packet::battle("ABCDEFGH");
        pkt.seq = 3;
        pkt.ack = 7;
        pkt.battle_data.push(BattleMessage {
            user_id: "u1".into(),
            seq: 3,
            body: vec![0x04, 0x40, 0x00, 0x00],
        });
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.kind, MessageType::Battle);
    }

    #[test]
    fn test_constructors_fill_sections() {
        let hello = Packet::hello_server("S1");
        assert_eq!(hello.hello_server_data.unwrap().session_id, "S1");

        let ping = Packet::ping("S1", "u1", 42);
        assert_eq!(ping.ping_data.unwrap().timestamp, 42);

        let fin = Packet::fin("S1", "cl_hard_reset");
        assert_eq!(fin.kind, MessageType::Fin);
        assert_eq!(fin.fin_data.unwrap().detail, "cl_hard_reset");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Packet::decode(&[0xff; 3]).is_err());
    }
}
