//! Latency measurement and input-delay derivation.
//!
//! The match relay measures round trips with a burst of pings before the
//! battle starts. The mean round trip decides how many frames of input
//! delay ("max-lag") the game runs with.

use std::time::Instant;

use crate::core::{MAX_LAG_BASE, MAX_LAG_MAX, MAX_LAG_MIN, MAX_LAG_RTT_PER_FRAME_MS, PING_TEST_COUNT};

/// Max-lag for a mean round trip of `rtt_ms`.
///
/// `clamp(4 + floor(rtt / 16), 5, 127)`
pub fn max_lag_for_rtt(rtt_ms: f64) -> u8 {
    let extra = (rtt_ms.max(0.0) / MAX_LAG_RTT_PER_FRAME_MS as f64).floor();
    let lag = (MAX_LAG_BASE as f64 + extra).min(MAX_LAG_MAX as f64);
    (lag as u8).clamp(MAX_LAG_MIN, MAX_LAG_MAX)
}

/// Accumulates ping round trips until the test completes.
#[derive(Debug, Clone)]
pub struct PingMeter {
    /// Pings sent.
    sent: u32,
    /// Pongs received.
    received: u32,
    /// Sum of round trips in milliseconds.
    total_ms: f64,
    /// Pongs needed.
    target: u32,
}

impl Default for PingMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl PingMeter {
    /// Meter expecting [`PING_TEST_COUNT`] pongs.
    pub fn new() -> Self {
        Self::with_target(PING_TEST_COUNT)
    }

    /// Meter expecting `target` pongs.
    pub fn with_target(target: u32) -> Self {
        Self {
            sent: 0,
            received: 0,
            total_ms: 0.0,
            target: target.max(1),
        }
    }

    /// Count an outgoing ping.
    pub fn on_sent(&mut self) {
        self.sent += 1;
    }

    /// Record a pong with round trip `rtt_ms`.
    pub fn on_pong(&mut self, rtt_ms: f64) {
        if self.is_complete() {
            return;
        }
        self.received += 1;
        self.total_ms += rtt_ms.max(0.0);
    }

    /// Every ping sent so far has been answered.
    pub fn all_answered(&self) -> bool {
        self.sent == self.received
    }

    /// Pongs received.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Enough pongs received.
    pub fn is_complete(&self) -> bool {
        self.received >= self.target
    }

    /// Mean round trip in milliseconds.
    pub fn mean_ms(&self) -> Option<f64> {
        (self.received > 0).then(|| self.total_ms / self.received as f64)
    }

    /// Derived max-lag once the test is complete.
    pub fn max_lag(&self) -> Option<u8> {
        if !self.is_complete() {
            return None;
        }
        self.mean_ms().map(max_lag_for_rtt)
    }

    /// Start over.
    pub fn reset(&mut self) {
        *self = Self::with_target(self.target);
    }
}

/// Millisecond clock relative to a session start.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClock {
    /// Clock starting now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds since the clock started.
    pub fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_lag_formula() {
        assert_eq!(max_lag_for_rtt(0.0), 5);
        assert_eq!(max_lag_for_rtt(16.0), 5);
        assert_eq!(max_lag_for_rtt(63.9), 7);
        assert_eq!(max_lag_for_rtt(64.0), 8);
        assert_eq!(max_lag_for_rtt(100.0), 10);
        assert_eq!(max_lag_for_rtt(10_000.0), 127);
    }

    #[test]
    fn test_mean_of_ten_pongs() {
        let mut meter = PingMeter::new();
        let samples = [50.0, 78.0, 64.0, 64.0, 60.0, 68.0, 64.0, 64.0, 70.0, 58.0];
        for (i, rtt) in samples.iter().enumerate() {
            meter.on_sent();
            assert!(meter.max_lag().is_none(), "after {i} pongs");
            meter.on_pong(*rtt);
        }
        assert!(meter.is_complete());
        assert_eq!(meter.mean_ms(), Some(64.0));
        assert_eq!(meter.max_lag(), Some(8));
    }

    #[test]
    fn test_extra_pongs_ignored() {
        let mut meter = PingMeter::with_target(2);
        meter.on_pong(10.0);
        meter.on_pong(30.0);
        meter.on_pong(1000.0);
        assert_eq!(meter.received(), 2);
        assert_eq!(meter.mean_ms(), Some(20.0));
        meter.reset();
        assert_eq!(meter.received(), 0);
        assert!(meter.all_answered());
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = SessionClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
