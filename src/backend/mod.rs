//! Backends implementing the emulated-socket contract.
//!
//! - [`TcpBackend`]: live lobby relay over TCP
//! - [`UdpBackend`]: live match relay over reliable UDP
//! - [`ReplayBackend`]: deterministic playback of a recorded battle
//! - [`RollbackBackend`]: bridge to a rollback-netcode peer session
//!
//! Replay and rollback answer lobby questions locally through [`lobby`].
//!
//! All of them share [`NetShared`], the few values the embedding emulator
//! reads while a backend runs.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::core::DEFAULT_MAX_LAG;

pub mod tcp;
pub mod udp;

#[cfg(feature = "replay")]
#[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
pub mod lobby;

#[cfg(feature = "replay")]
#[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
pub mod replay;

#[cfg(feature = "rollback")]
#[cfg_attr(docsrs, doc(cfg(feature = "rollback")))]
pub mod rollback;

pub use tcp::{LbsFilter, LbsObserver, PlatformInfo, TcpBackend};
pub use udp::UdpBackend;
pub use udp::session::{UdpSession, UdpState};
pub use udp::worker::WorkerOptions;

#[cfg(feature = "replay")]
pub use replay::{ReplayBackend, ReplayState};

#[cfg(feature = "rollback")]
pub use rollback::{
    BarrierStatus, KeyFrameBarrier, KeyPhase, P2pMatching, PeerCandidate, RollbackBackend,
    RollbackSession, RollbackState,
};

/// Values shared between backends and the embedding emulator.
#[derive(Debug)]
pub struct NetShared {
    /// Input delay in frames.
    max_lag: AtomicU8,
    /// A backend asked the emulator to stop (replay exhausted).
    end_requested: AtomicBool,
}

impl Default for NetShared {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LAG)
    }
}

impl NetShared {
    /// Shared state starting at `max_lag`.
    pub fn new(max_lag: u8) -> Self {
        Self {
            max_lag: AtomicU8::new(max_lag),
            end_requested: AtomicBool::new(false),
        }
    }

    /// Current input delay.
    pub fn max_lag(&self) -> u8 {
        self.max_lag.load(Ordering::Acquire)
    }

    /// Publish a new input delay.
    pub fn set_max_lag(&self, lag: u8) {
        self.max_lag.store(lag, Ordering::Release);
    }

    /// Ask the emulator to stop.
    pub fn request_end(&self) {
        self.end_requested.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn end_requested(&self) -> bool {
        self.end_requested.load(Ordering::Acquire)
    }

    /// Consume a pending stop request.
    pub fn take_end_request(&self) -> bool {
        self.end_requested.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_defaults() {
        let shared = NetShared::default();
        assert_eq!(shared.max_lag(), DEFAULT_MAX_LAG);
        assert!(!shared.end_requested());
    }

    #[test]
    fn test_end_request_consumed_once() {
        let shared = NetShared::new(5);
        shared.request_end();
        assert!(shared.take_end_request());
        assert!(!shared.take_end_request());
        shared.set_max_lag(12);
        assert_eq!(shared.max_lag(), 12);
    }
}
