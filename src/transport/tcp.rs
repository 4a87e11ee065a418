//! Blocking-with-timeout TCP stream for the lobby relay.
//!
//! The lobby backend runs on the emulation thread, so the stream owns a
//! small current-thread runtime and drives it with `block_on`. Every call is
//! bounded by a timeout. Callers must not be running inside another tokio
//! runtime.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;

use crate::core::{BackendError, BackendResult, CONNECT_TIMEOUT, RECV_BUFFER_SIZE, SOCKET_TIMEOUT};

/// How long a poll waits for bytes before reporting none.
pub const POLL_WAIT: Duration = Duration::from_millis(1);

/// Connected lobby stream.
#[derive(Debug)]
pub struct LobbyStream {
    runtime: Runtime,
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    recv_buffer: Vec<u8>,
}

impl LobbyStream {
    /// Connect with the default timeouts.
    pub fn connect(authority: &str) -> BackendResult<Self> {
        Self::connect_with(authority, CONNECT_TIMEOUT, SOCKET_TIMEOUT)
    }

    /// Connect to `authority` (`host:port`).
    pub fn connect_with(
        authority: &str,
        connect_timeout: Duration,
        socket_timeout: Duration,
    ) -> BackendResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let stream = runtime
            .block_on(async { timeout(connect_timeout, TcpStream::connect(authority)).await })
            .map_err(|_| BackendError::ConnectTimeout(authority.to_string()))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            runtime,
            stream,
            peer,
            timeout: socket_timeout,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write all of `data`.
    pub fn write_all(&mut self, data: &[u8]) -> BackendResult<()> {
        let Self {
            runtime,
            stream,
            timeout: limit,
            ..
        } = &mut *self;
        runtime
            .block_on(async { timeout(*limit, stream.write_all(data)).await })
            .map_err(|_| BackendError::Timeout)??;
        Ok(())
    }

    /// Read whatever is available within [`POLL_WAIT`].
    ///
    /// Returns an empty slice when nothing arrived and
    /// [`BackendError::Closed`] once the peer has closed the stream.
    pub fn poll_read(&mut self) -> BackendResult<&[u8]> {
        let Self {
            runtime,
            stream,
            recv_buffer,
            ..
        } = &mut *self;
        let read = runtime.block_on(async { timeout(POLL_WAIT, stream.read(recv_buffer)).await });
        match read {
            Err(_) => Ok(&[]),
            Ok(Ok(0)) => Err(BackendError::Closed),
            Ok(Ok(n)) => Ok(&self.recv_buffer[..n]),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}
