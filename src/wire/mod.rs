//! Wire formats.
//!
//! - LBS: lobby envelopes with a 12-byte header ([`LbsMessage`])
//! - MCS: compact match frames ([`McsMessage`])
//! - [`StreamFramer`]: cuts either format out of a byte stream
//! - [`Packet`]: the UDP session datagram

mod cursor;
mod framer;
mod lbs;
mod mcs;
mod packet;

pub use cursor::{ByteReader, ByteWriter};
pub use framer::{Frame, LbsFramer, McsFramer, StreamFramer};
pub use lbs::{Category, Direction, LbsCommand, LbsMessage};
pub use mcs::{McsKind, McsMessage};
pub use packet::{
    BattleMessage, FinData, HelloServerData, MessageType, Packet, PingData, PongData,
};
