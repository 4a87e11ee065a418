//! Match server (MCS) message codec.
//!
//! Two frame shapes share one stream:
//! ```text
//! connection id (fixed 20 bytes):
//! +0   Magic 0x82 0x02
//! +2   Connection data (18 bytes)
//!
//! length-prefixed:
//! +0   Total Length (1 byte, >= 4)
//! +1   Kind (high 4 bits) | Sender (low 4 bits)
//! +2   Parameter (1 byte)
//! +3   Kind-specific (variable)
//! ```
//!
//! Key input frames (18 bytes) carry two key samples:
//! ```text
//! +2   First Key (2 bytes BE16)
//! +8   First Frame (2 bytes LE16)
//! +10  Second Key (2 bytes BE16)
//! +16  Second Frame (2 bytes LE16)
//! ```

use std::fmt;

use super::framer::Frame;
use crate::core::{MCS_CONNECTION_ID_MAGIC, MCS_CONNECTION_ID_SIZE, MCS_MIN_FRAME_SIZE};

/// Kind of an MCS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McsKind {
    /// Fixed-size connection-id frame.
    ConnectionId,
    /// Player introduction.
    Intro,
    /// Reply to an introduction.
    IntroReturn,
    /// Pad input samples.
    KeyInput,
    /// Latency ping.
    Ping,
    /// Latency ping reply.
    Pong,
    /// Round start.
    Start,
    /// Stage load started.
    LoadStart,
    /// Stage load finished.
    LoadEnd,
    /// Lag control ping.
    LagControlTest,
    /// Forced end of battle.
    Force,
    /// Anything else.
    Unknown,
}

impl McsKind {
    /// Name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            McsKind::ConnectionId => "ConnectionIdMsg",
            McsKind::Intro => "IntroMsg",
            McsKind::IntroReturn => "IntroMsgReturn",
            McsKind::KeyInput => "KeyMsg",
            McsKind::Ping => "PingMsg",
            McsKind::Pong => "PongMsg",
            McsKind::Start => "StartMsg",
            McsKind::LoadStart => "LoadStartMsg",
            McsKind::LoadEnd => "LoadEndMsg",
            McsKind::LagControlTest => "LagControlTestMsg",
            McsKind::Force => "ForceMsg",
            McsKind::Unknown => "UnknownMsg",
        }
    }

    /// Byte template of a synthesizable kind, sender slot zero.
    fn template(self) -> Option<&'static [u8]> {
        const KEY: [u8; 18] = [0x12, 0x20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        const PING: [u8; 20] = [
            0x14, 0x30, 0x00, 0x00, 0x04, 0x12, 0x01, 0x00, 0x04, 0x12, 0x01, 0x00, 0x00, 0x36,
            0x36, 0x38, 0x39, 0x31, 0x32, 0x32,
        ];
        let bytes: &'static [u8] = match self {
            McsKind::Intro => &[0x04, 0x10, 0x00, 0x00],
            McsKind::IntroReturn => &[0x04, 0x10, 0x01, 0x00],
            McsKind::KeyInput => &KEY,
            McsKind::Ping => &PING,
            McsKind::Pong => &[0x06, 0x30, 0x01, 0x00, 0x02, 0x00],
            McsKind::Start => &[0x04, 0x40, 0x00, 0x00],
            McsKind::LoadStart => &[0x04, 0x50, 0x00, 0x00],
            McsKind::LoadEnd => &[0x04, 0x50, 0x01, 0x00],
            McsKind::LagControlTest => &[0x04, 0x90, 0x00, 0x00],
            McsKind::Force => &[0x04, 0x70, 0x00, 0x00],
            McsKind::ConnectionId | McsKind::Unknown => return None,
        };
        Some(bytes)
    }
}

impl fmt::Display for McsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One MCS frame, stored as its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct McsMessage {
    /// Frame bytes including the length byte.
    pub body: Vec<u8>,
}

impl McsMessage {
    /// Wrap raw frame bytes.
    pub fn from_bytes(body: Vec<u8>) -> Self {
        Self { body }
    }

    /// Build a frame of `kind` from `sender`.
    ///
    /// Returns `None` for kinds that cannot be synthesized.
    pub fn create(kind: McsKind, sender: u8) -> Option<Self> {
        let mut msg = Self {
            body: kind.template()?.to_vec(),
        };
        msg.set_sender(sender);
        Some(msg)
    }

    /// Classify the frame.
    pub fn kind(&self) -> McsKind {
        let b = &self.body;
        if b.len() < MCS_MIN_FRAME_SIZE {
            return McsKind::Unknown;
        }
        if b[..2] == MCS_CONNECTION_ID_MAGIC {
            return McsKind::ConnectionId;
        }
        match (b[1] >> 4, b[2]) {
            (1, 0) => McsKind::Intro,
            (1, 1) => McsKind::IntroReturn,
            (2, _) => McsKind::KeyInput,
            (3, 0) => McsKind::Ping,
            (3, 1) => McsKind::Pong,
            (4, _) => McsKind::Start,
            (5, 0) => McsKind::LoadStart,
            (5, 1) => McsKind::LoadEnd,
            (7, _) => McsKind::Force,
            (9, _) => McsKind::LagControlTest,
            _ => McsKind::Unknown,
        }
    }

    /// Sender slot (low nibble of byte 1).
    pub fn sender(&self) -> u8 {
        self.body.get(1).map_or(0, |b| b & 0x0f)
    }

    /// Replace the sender slot.
    pub fn set_sender(&mut self, sender: u8) -> &mut Self {
        if let Some(b) = self.body.get_mut(1) {
            *b = (*b & 0xf0) | (sender & 0x0f);
        }
        self
    }

    /// Ping counter carried by a ping frame.
    pub fn ping_count(&self) -> Option<u8> {
        self.expect_kind(McsKind::Ping)?;
        self.body.get(4).copied()
    }

    /// Address a pong frame to player `id`.
    pub fn set_pong_to(&mut self, id: u8) -> &mut Self {
        self.put(McsKind::Pong, 4, id)
    }

    /// Echo the ping counter in a pong frame.
    pub fn set_pong_count(&mut self, count: u8) -> &mut Self {
        self.put(McsKind::Pong, 3, count)
    }

    /// First key sample.
    pub fn first_key(&self) -> Option<u16> {
        self.be16(2)
    }

    /// Set the first key sample.
    pub fn set_first_key(&mut self, code: u16) -> &mut Self {
        let [hi, lo] = code.to_be_bytes();
        self.put(McsKind::KeyInput, 2, hi).put(McsKind::KeyInput, 3, lo)
    }

    /// Second key sample.
    pub fn second_key(&self) -> Option<u16> {
        self.be16(10)
    }

    /// Set the second key sample.
    pub fn set_second_key(&mut self, code: u16) -> &mut Self {
        let [hi, lo] = code.to_be_bytes();
        self.put(McsKind::KeyInput, 10, hi).put(McsKind::KeyInput, 11, lo)
    }

    /// Frame number of the first key sample.
    pub fn first_frame(&self) -> Option<u16> {
        self.le16(8)
    }

    /// Set the frame number of the first key sample.
    pub fn set_first_frame(&mut self, frame: u16) -> &mut Self {
        let [lo, hi] = frame.to_le_bytes();
        self.put(McsKind::KeyInput, 8, lo).put(McsKind::KeyInput, 9, hi)
    }

    /// Frame number of the second key sample.
    pub fn second_frame(&self) -> Option<u16> {
        self.le16(16)
    }

    /// Set the frame number of the second key sample.
    pub fn set_second_frame(&mut self, frame: u16) -> &mut Self {
        let [lo, hi] = frame.to_le_bytes();
        self.put(McsKind::KeyInput, 16, lo).put(McsKind::KeyInput, 17, hi)
    }

    /// Lowercase hex dump for log lines.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.body)
    }

    /// Encoded bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.body.clone()
    }

    fn expect_kind(&self, kind: McsKind) -> Option<()> {
        (self.kind() == kind).then_some(())
    }

    fn be16(&self, at: usize) -> Option<u16> {
        self.expect_kind(McsKind::KeyInput)?;
        let b = self.body.get(at..at + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn le16(&self, at: usize) -> Option<u16> {
        self.expect_kind(McsKind::KeyInput)?;
        let b = self.body.get(at..at + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn put(&mut self, kind: McsKind, at: usize, value: u8) -> &mut Self {
        if self.kind() == kind {
            if let Some(b) = self.body.get_mut(at) {
                *b = value;
            }
        }
        self
    }
}

impl Frame for McsMessage {
    fn try_decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < MCS_MIN_FRAME_SIZE {
            return None;
        }
        let size = if buf[..2] == MCS_CONNECTION_ID_MAGIC {
            MCS_CONNECTION_ID_SIZE
        } else {
            // A length byte below the minimum still consumes a minimal frame.
            (buf[0] as usize).max(MCS_MIN_FRAME_SIZE)
        };
        let body = buf.get(..size)?.to_vec();
        Some((Self { body }, size))
    }
}

impl fmt::Display for McsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [{}]", self.kind(), self.sender(), self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_classify_as_their_kind() {
        let kinds = [
            McsKind::Intro,
            McsKind::IntroReturn,
            McsKind::KeyInput,
            McsKind::Ping,
            McsKind::Pong,
            McsKind::Start,
            McsKind::LoadStart,
            McsKind::LoadEnd,
            McsKind::LagControlTest,
            McsKind::Force,
        ];
        for kind in kinds {
            let msg = McsMessage::create(kind, 3).unwrap();
            assert_eq!(msg.kind(), kind);
            assert_eq!(msg.sender(), 3);
            assert_eq!(msg.body[0] as usize, msg.body.len(), "{kind}");
        }
        assert!(McsMessage::create(McsKind::ConnectionId, 0).is_none());
        assert!(McsMessage::create(McsKind::Unknown, 0).is_none());
    }

    #[test]
    fn test_connection_id_frame() {
        let mut bytes = vec![0x82, 0x02];
        bytes.extend_from_slice(&[0x11; 18]);
        bytes.extend_from_slice(&[0x04, 0x10, 0x00, 0x00]);

        assert!(McsMessage::try_decode(&bytes[..19]).is_none());
        let (msg, used) = McsMessage::try_decode(&bytes).unwrap();
        assert_eq!(used, 20);
        assert_eq!(msg.kind(), McsKind::ConnectionId);

        let (next, _) = McsMessage::try_decode(&bytes[used..]).unwrap();
        assert_eq!(next.kind(), McsKind::Intro);
    }

    #[test]
    fn test_malformed_magic_degrades_to_unknown() {
        let bytes = [0x04, 0x02, 0x00, 0x00];
        let (msg, _) = McsMessage::try_decode(&bytes).unwrap();
        assert_eq!(msg.kind(), McsKind::Unknown);

        let bytes = [0x04, 0xf3, 0x00, 0x00];
        let (msg, _) = McsMessage::try_decode(&bytes).unwrap();
        assert_eq!(msg.kind(), McsKind::Unknown);
        assert_eq!(msg.sender(), 3);
    }

    #[test]
    fn test_short_length_byte_consumes_minimum() {
        let bytes = [0x00, 0x10, 0x00, 0x00, 0x04, 0x40, 0x00, 0x00];
        let (msg, used) = McsMessage::try_decode(&bytes).unwrap();
        assert_eq!(used, 4);
        assert_eq!(msg.body.len(), 4);
        let (next, _) = McsMessage::try_decode(&bytes[used..]).unwrap();
        assert_eq!(next.kind(), McsKind::Start);
    }

    #[test]
    fn test_incomplete_prefixes() {
        let msg = McsMessage::create(McsKind::Ping, 1).unwrap();
        let bytes = msg.encode();
        for n in 0..bytes.len() {
            assert!(McsMessage::try_decode(&bytes[..n]).is_none(), "prefix {n}");
        }
        let (decoded, used) = McsMessage::try_decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_key_accessors() {
        let mut msg = McsMessage::create(McsKind::KeyInput, 2).unwrap();
        msg.set_first_key(0xbeef)
            .set_second_key(0x1234)
            .set_first_frame(300)
            .set_second_frame(301);
        assert_eq!(msg.first_key(), Some(0xbeef));
        assert_eq!(msg.second_key(), Some(0x1234));
        assert_eq!(msg.first_frame(), Some(300));
        assert_eq!(msg.second_frame(), Some(301));
        assert_eq!(&msg.body[2..4], &[0xbe, 0xef]);
        assert_eq!(msg.sender(), 2);
    }

    #[test]
    fn test_ping_pong_accessors() {
        let ping = McsMessage::create(McsKind::Ping, 0).unwrap();
        assert_eq!(ping.ping_count(), Some(0x04));
        assert_eq!(ping.first_key(), None);

        let mut pong = McsMessage::create(McsKind::Pong, 1).unwrap();
        pong.set_pong_to(3).set_pong_count(9);
        assert_eq!(pong.body, vec![0x06, 0x31, 0x01, 0x09, 0x03, 0x00]);
        assert_eq!(pong.kind(), McsKind::Pong);
    }

    #[test]
    fn test_hex_dump() {
        let msg = McsMessage::create(McsKind::Start, 1).unwrap();
        assert_eq!(msg.to_hex(), "04410000");
        assert_eq!(msg.to_string(), "StartMsg from 1 [04410000]");
    }
}
