//! Lobby relay over TCP.
//!
//! Guest writes are framed as LBS and forwarded one complete frame at a
//! time. Received frames pass an optional observer and filter before being
//! queued for the guest. TCP provides ordering and retransmission, so there
//! is no seq/ack here.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::core::{Backend, BackendError, CONNECT_TIMEOUT, OpenTarget, SOCKET_TIMEOUT};
use crate::transport::LobbyStream;
use crate::wire::{LbsCommand, LbsFramer, LbsMessage};

/// Predicate deciding whether a received frame reaches the guest.
pub type LbsFilter = Box<dyn FnMut(&LbsMessage) -> bool + Send>;

/// Callback invoked with every received frame.
pub type LbsObserver = Box<dyn FnMut(&LbsMessage) + Send>;

/// Emulator platform report sent right after connecting.
///
/// The body is one length-prefixed `key=value\n` text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    entries: Vec<(String, String)>,
}

impl PlatformInfo {
    /// Empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry.
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.entries.push((key.to_string(), value.to_string()));
        self
    }

    /// Report text.
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect()
    }

    /// Custom LBS message carrying the report.
    pub fn to_message(&self) -> LbsMessage {
        LbsMessage::cl_custom(LbsCommand::PLATFORM_INFO).write_string(&self.text())
    }
}

/// Lobby backend over a single TCP stream.
pub struct TcpBackend {
    stream: Option<LobbyStream>,
    /// Guest bytes waiting for a complete frame.
    outgoing: LbsFramer,
    /// Server bytes waiting for a complete frame.
    incoming: LbsFramer,
    /// Accepted frames for the guest.
    recv_queue: VecDeque<u8>,
    filter: Option<LbsFilter>,
    observer: Option<LbsObserver>,
    platform_info: Option<PlatformInfo>,
    connect_timeout: Duration,
    socket_timeout: Duration,
}

impl fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpBackend")
            .field("peer", &self.stream.as_ref().map(|s| s.peer_addr()))
            .field("recv_queue", &self.recv_queue.len())
            .field("has_filter", &self.filter.is_some())
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for TcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpBackend {
    /// Create an idle backend with default timeouts.
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT, SOCKET_TIMEOUT)
    }

    /// Create an idle backend with custom timeouts.
    pub fn with_timeouts(connect_timeout: Duration, socket_timeout: Duration) -> Self {
        Self {
            stream: None,
            outgoing: LbsFramer::new(),
            incoming: LbsFramer::new(),
            recv_queue: VecDeque::new(),
            filter: None,
            observer: None,
            platform_info: None,
            connect_timeout,
            socket_timeout,
        }
    }

    /// Drop received frames for which `filter` returns `false`.
    pub fn set_filter(&mut self, filter: LbsFilter) {
        self.filter = Some(filter);
    }

    /// Observe every received frame.
    pub fn set_observer(&mut self, observer: LbsObserver) {
        self.observer = Some(observer);
    }

    /// Send `info` first on every connect.
    pub fn set_platform_info(&mut self, info: PlatformInfo) {
        self.platform_info = Some(info);
    }

    fn send(&mut self, msg: &LbsMessage) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let result = msg
            .encode()
            .map_err(BackendError::from)
            .and_then(|bytes| stream.write_all(&bytes));
        match result {
            Ok(()) => {
                tracing::debug!(command = %msg.command, seq = msg.seq, "lbs send");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, command = %msg.command, "lbs send failed");
                if e.is_fatal() || matches!(e, BackendError::Io(_)) {
                    self.stream = None;
                }
                false
            }
        }
    }

    fn receive(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.poll_read() {
            Ok(bytes) => self.incoming.write(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "lbs receive failed");
                self.stream = None;
                return;
            }
        }
        while let Some(msg) = self.incoming.try_extract_frame() {
            tracing::debug!(command = %msg.command, seq = msg.seq, "lbs recv");
            if let Some(observer) = self.observer.as_mut() {
                observer(&msg);
            }
            if let Some(filter) = self.filter.as_mut()
                && !filter(&msg)
            {
                continue;
            }
            match msg.encode() {
                Ok(bytes) => self.recv_queue.extend(bytes),
                Err(e) => tracing::error!(error = %e, "lbs frame re-encode failed"),
            }
        }
    }

    fn clear(&mut self) {
        self.stream = None;
        self.outgoing.clear();
        self.incoming.clear();
        self.recv_queue.clear();
    }
}

/// Bytes of the latest write covered by `sent` framed bytes, given `held`
/// bytes were already buffered in front of it.
fn accepted_bytes(held: usize, sent: usize, written: usize) -> usize {
    sent.saturating_sub(held).min(written)
}

impl Backend for TcpBackend {
    fn open(&mut self, target: &OpenTarget) -> bool {
        self.clear();
        let authority = target.authority();
        match LobbyStream::connect_with(&authority, self.connect_timeout, self.socket_timeout) {
            Ok(stream) => {
                tracing::info!(%target, peer = %stream.peer_addr(), "lbs connected");
                self.stream = Some(stream);
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "lbs connect failed");
                return false;
            }
        }
        if let Some(info) = self.platform_info.clone() {
            return self.send(&info.to_message());
        }
        true
    }

    fn close(&mut self) {
        if self.stream.is_some() {
            tracing::info!("lbs closed");
        }
        self.clear();
    }

    /// Forward every complete frame; a trailing partial frame is kept and
    /// counts as written. When a send fails, only the bytes of `data` that
    /// went out in earlier frames are reported.
    fn on_write(&mut self, data: &[u8]) -> usize {
        if self.stream.is_none() {
            return 0;
        }
        let held = self.outgoing.len();
        self.outgoing.write(data);
        let mut sent = 0;
        while let Some(msg) = self.outgoing.try_extract_frame() {
            if !self.send(&msg) {
                return accepted_bytes(held, sent, data.len());
            }
            sent += msg.wire_size();
        }
        data.len()
    }

    fn on_read(&mut self, buf: &mut [u8]) -> usize {
        if self.recv_queue.is_empty() {
            self.receive();
        }
        let n = buf.len().min(self.recv_queue.len());
        for (dst, src) in buf.iter_mut().zip(self.recv_queue.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn on_poll(&mut self) -> usize {
        self.receive();
        self.recv_queue.len()
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
