//! Transport layer
//!
//! Socket plumbing shared by the live backends:
//!
//! - **UDP**: [`McsSocket`], one datagram socket paired with a match relay
//! - **TCP**: [`LobbyStream`], the lobby stream driven with bounded `block_on` calls
//! - **Timing**: [`PingMeter`] and [`max_lag_for_rtt`] for input-delay derivation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Backends                     │
//! ├─────────────────────────────────────────┤
//! │   Reliability (seq/ack, filter)         │  UDP path only
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   sockets, timeouts, ping timing        │
//! ├─────────────────────────────────────────┤
//! │            UDP / TCP                    │
//! └─────────────────────────────────────────┘
//! ```

mod socket;
mod tcp;
mod timing;

pub use socket::{McsSocket, McsSocketBuilder};
pub use tcp::{LobbyStream, POLL_WAIT};
pub use timing::{PingMeter, SessionClock, max_lag_for_rtt};
