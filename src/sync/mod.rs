//! Reliability layer over the unreliable UDP transport
//!
//! - [`OutgoingBuffer`]: sequence numbers, ack window, batch retransmission
//! - [`MessageFilter`]: per-sender in-order, duplicate-free delivery

mod buffer;
mod filter;

pub use buffer::{INITIAL_SEQ, OutgoingBuffer};
pub use filter::MessageFilter;
