//! Lobby server (LBS) message codec.
//!
//! Wire format:
//! ```text
//! +0   Direction (1 byte)
//! +1   Category (1 byte)
//! +2   Command (2 bytes BE16)
//! +4   Body Length (2 bytes BE16)
//! +6   Sequence (2 bytes BE16)
//! +8   Status (4 bytes BE32)
//! +12  Body (variable)
//! ```

use std::fmt;

use super::cursor::{ByteReader, ByteWriter};
use super::framer::Frame;
use crate::core::{
    LBS_CATEGORY_ANSWER, LBS_CATEGORY_CUSTOM, LBS_CATEGORY_NOTICE, LBS_CATEGORY_QUESTION,
    LBS_DIR_CLIENT_TO_SERVER, LBS_DIR_SERVER_TO_CLIENT, LBS_HEADER_SIZE, LBS_STATUS_SUCCESS,
    WireError, WireResult,
};

/// Who sent the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to client (`0x18`).
    ServerToClient,
    /// Client to server (`0x81`).
    ClientToServer,
    /// Any other byte, kept verbatim.
    Other(u8),
}

impl Direction {
    /// Decode the direction byte.
    pub fn from_byte(b: u8) -> Self {
        match b {
            LBS_DIR_SERVER_TO_CLIENT => Direction::ServerToClient,
            LBS_DIR_CLIENT_TO_SERVER => Direction::ClientToServer,
            other => Direction::Other(other),
        }
    }

    /// Encode the direction byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Direction::ServerToClient => LBS_DIR_SERVER_TO_CLIENT,
            Direction::ClientToServer => LBS_DIR_CLIENT_TO_SERVER,
            Direction::Other(b) => b,
        }
    }
}

/// Kind of envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Request expecting an answer.
    Question,
    /// Reply to a question.
    Answer,
    /// Unsolicited server push.
    Notice,
    /// Emulator extension.
    Custom,
    /// Any other byte, kept verbatim.
    Other(u8),
}

impl Category {
    /// Decode the category byte.
    pub fn from_byte(b: u8) -> Self {
        match b {
            LBS_CATEGORY_QUESTION => Category::Question,
            LBS_CATEGORY_ANSWER => Category::Answer,
            LBS_CATEGORY_NOTICE => Category::Notice,
            LBS_CATEGORY_CUSTOM => Category::Custom,
            other => Category::Other(other),
        }
    }

    /// Encode the category byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Category::Question => LBS_CATEGORY_QUESTION,
            Category::Answer => LBS_CATEGORY_ANSWER,
            Category::Notice => LBS_CATEGORY_NOTICE,
            Category::Custom => LBS_CATEGORY_CUSTOM,
            Category::Other(b) => b,
        }
    }
}

/// LBS command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LbsCommand(pub u16);

impl LbsCommand {
    /// Keepalive.
    pub const LINE_CHECK: Self = Self(0x6001);
    /// Client leaves the lobby.
    pub const LOGOUT: Self = Self(0x6002);
    /// Server shutdown notice.
    pub const SHUTDOWN: Self = Self(0x6003);
    /// Opponent lost during battle.
    pub const VS_USER_LOST: Self = Self(0x6004);
    /// Connection id assignment.
    pub const CONNECTION_ID: Self = Self(0x6101);
    /// Client asks for its connection id.
    pub const ASK_CONNECTION_ID: Self = Self(0x6102);
    /// Server warning text.
    pub const WARNING_MESSAGE: Self = Self(0x6103);
    /// Login type negotiation.
    pub const LOGIN_TYPE: Self = Self(0x6110);
    /// Enter matchmaking.
    pub const LOBBY_MATCHING_ENTRY: Self = Self(0x640F);
    /// Battle room is ready.
    pub const READY_BATTLE: Self = Self(0x6910);
    /// Number of players in the match.
    pub const ASK_MATCHING_JOIN: Self = Self(0x6911);
    /// Own player slot.
    pub const ASK_PLAYER_SIDE: Self = Self(0x6912);
    /// Player record by slot.
    pub const ASK_PLAYER_INFO: Self = Self(0x6913);
    /// Battle rule blob.
    pub const ASK_RULE_DATA: Self = Self(0x6914);
    /// Battle code.
    pub const ASK_BATTLE_CODE: Self = Self(0x6915);
    /// Match server address.
    pub const ASK_MCS_ADDRESS: Self = Self(0x6916);
    /// Match server protocol version.
    pub const ASK_MCS_VERSION: Self = Self(0x6917);
    /// Emulator platform report.
    pub const PLATFORM_INFO: Self = Self(0x9950);

    /// Name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::LINE_CHECK => "lbsLineCheck",
            Self::LOGOUT => "lbsLogout",
            Self::SHUTDOWN => "lbsShutDown",
            Self::VS_USER_LOST => "lbsVSUserLost",
            Self::CONNECTION_ID => "lbsConnectionId",
            Self::ASK_CONNECTION_ID => "lbsAskConnectionId",
            Self::WARNING_MESSAGE => "lbsWarningMessage",
            Self::LOGIN_TYPE => "lbsLoginType",
            Self::LOBBY_MATCHING_ENTRY => "lbsLobbyMatchingEntry",
            Self::READY_BATTLE => "lbsReadyBattle",
            Self::ASK_MATCHING_JOIN => "lbsAskMatchingJoin",
            Self::ASK_PLAYER_SIDE => "lbsAskPlayerSide",
            Self::ASK_PLAYER_INFO => "lbsAskPlayerInfo",
            Self::ASK_RULE_DATA => "lbsAskRuleData",
            Self::ASK_BATTLE_CODE => "lbsAskBattleCode",
            Self::ASK_MCS_ADDRESS => "lbsAskMcsAddress",
            Self::ASK_MCS_VERSION => "lbsAskMcsVersion",
            Self::PLATFORM_INFO => "lbsPlatformInfo",
            _ => "unknown",
        }
    }
}

impl fmt::Display for LbsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04X})", self.name(), self.0)
    }
}

/// One LBS envelope.
///
/// The body length is not stored; it is always `body.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbsMessage {
    /// Sender side.
    pub direction: Direction,
    /// Envelope kind.
    pub category: Category,
    /// Command code.
    pub command: LbsCommand,
    /// Sequence number, echoed by answers.
    pub seq: u16,
    /// Status word.
    pub status: u32,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl LbsMessage {
    fn new(direction: Direction, category: Category, command: LbsCommand) -> Self {
        Self {
            direction,
            category,
            command,
            seq: 0,
            status: LBS_STATUS_SUCCESS,
            body: Vec::new(),
        }
    }

    /// Client question.
    pub fn cl_question(command: LbsCommand) -> Self {
        Self::new(Direction::ClientToServer, Category::Question, command)
    }

    /// Client custom message (emulator extension).
    pub fn cl_custom(command: LbsCommand) -> Self {
        Self::new(Direction::ClientToServer, Category::Custom, command)
    }

    /// Server answer to `question`: same command and sequence, success status.
    pub fn sv_answer(question: &LbsMessage) -> Self {
        let mut msg = Self::new(Direction::ServerToClient, Category::Answer, question.command);
        msg.seq = question.seq;
        msg
    }

    /// Server notice.
    pub fn sv_notice(command: LbsCommand) -> Self {
        Self::new(Direction::ServerToClient, Category::Notice, command)
    }

    /// Set the sequence number.
    pub fn with_seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    /// Set the status word.
    pub fn with_status(mut self, status: u32) -> Self {
        self.status = status;
        self
    }

    /// Append one byte to the body.
    pub fn write_u8(mut self, v: u8) -> Self {
        self.body.push(v);
        self
    }

    /// Append a big-endian 16-bit value to the body.
    pub fn write_u16(mut self, v: u16) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a big-endian 32-bit value to the body.
    pub fn write_u32(mut self, v: u32) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a length-prefixed byte field; fields over 64 KiB are truncated.
    pub fn write_bytes(mut self, data: &[u8]) -> Self {
        let len = data.len().min(u16::MAX as usize);
        self.body.extend_from_slice(&(len as u16).to_be_bytes());
        self.body.extend_from_slice(&data[..len]);
        self
    }

    /// Append a length-prefixed string.
    pub fn write_string(self, s: &str) -> Self {
        self.write_bytes(s.as_bytes())
    }

    /// Reader over the body.
    pub fn reader(&self) -> ByteReader<'_> {
        ByteReader::new(&self.body)
    }

    /// Total wire size.
    pub fn wire_size(&self) -> usize {
        LBS_HEADER_SIZE + self.body.len()
    }

    /// Encode to wire format.
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let body_len =
            u16::try_from(self.body.len()).map_err(|_| WireError::BodyTooLarge(self.body.len()))?;
        let mut w = ByteWriter::with_capacity(self.wire_size());
        w.put_u8(self.direction.to_byte())
            .put_u8(self.category.to_byte())
            .put_u16(self.command.0)
            .put_u16(body_len)
            .put_u16(self.seq)
            .put_u32(self.status)
            .put_slice(&self.body);
        Ok(w.into_inner())
    }
}

impl Frame for LbsMessage {
    fn try_decode(buf: &[u8]) -> Option<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let direction = Direction::from_byte(r.read_u8().ok()?);
        let category = Category::from_byte(r.read_u8().ok()?);
        let command = LbsCommand(r.read_u16().ok()?);
        let body_len = r.read_u16().ok()? as usize;
        let seq = r.read_u16().ok()?;
        let status = r.read_u32().ok()?;
        let body = r.read_exact(body_len).ok()?.to_vec();
        let msg = Self {
            direction,
            category,
            command,
            seq,
            status,
            body,
        };
        Some((msg, LBS_HEADER_SIZE + body_len))
    }
}

impl fmt::Display for LbsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} {} seq={} status=0x{:08X} body={}",
            self.direction,
            self.category,
            self.command,
            self.seq,
            self.status,
            self.body.len()
        )
    }
}
