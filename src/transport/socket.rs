//! Async UDP socket towards one match relay.
//!
//! Sends and receives [`Packet`] datagrams. Datagrams from any address other
//! than the relay are discarded before decoding.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::core::{BackendError, BackendResult, RECV_BUFFER_SIZE, SOCKET_TIMEOUT};
use crate::wire::Packet;

/// UDP socket bound to an ephemeral port and paired with one relay address.
#[derive(Debug)]
pub struct McsSocket {
    /// The underlying UDP socket.
    socket: UdpSocket,
    /// Relay address; everything else is dropped.
    remote: SocketAddr,
    /// Receive buffer.
    recv_buffer: Vec<u8>,
    /// Bound applied to every send.
    timeout: Duration,
}

impl McsSocket {
    /// Resolve `authority` (`host:port`) and bind a socket towards it.
    pub async fn connect(authority: &str) -> BackendResult<Self> {
        McsSocketBuilder::new().connect(authority).await
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relay address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Encode and send `packet` to the relay.
    pub async fn send_packet(&self, packet: &Packet) -> BackendResult<()> {
        let data = packet.encode()?;
        match timeout(self.timeout, self.socket.send_to(&data, self.remote)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BackendError::Timeout),
        }
    }

    /// Try to receive one datagram from the relay without blocking.
    ///
    /// Returns `Ok(None)` once no data is pending. Datagrams from other
    /// addresses are skipped. A datagram that fails to decode yields
    /// `Err(BackendError::Packet)`, which callers drop silently.
    pub fn try_recv_packet(&mut self) -> BackendResult<Option<Packet>> {
        loop {
            match self.socket.try_recv_from(&mut self.recv_buffer) {
                Ok((len, from)) => {
                    if from != self.remote {
                        tracing::debug!(%from, "dropping datagram from unknown address");
                        continue;
                    }
                    return Ok(Some(Packet::decode(&self.recv_buffer[..len])?));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Builder for [`McsSocket`] with custom options.
#[derive(Debug, Clone)]
pub struct McsSocketBuilder {
    recv_buffer_size: usize,
    timeout: Duration,
}

impl Default for McsSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl McsSocketBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: RECV_BUFFER_SIZE,
            timeout: SOCKET_TIMEOUT,
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `authority` and bind a socket of the matching family.
    pub async fn connect(self, authority: &str) -> BackendResult<McsSocket> {
        let remote = match timeout(self.timeout, tokio::net::lookup_host(authority)).await {
            Ok(Ok(mut addrs)) => addrs
                .next()
                .ok_or_else(|| BackendError::Resolve(authority.to_string()))?,
            Ok(Err(_)) => return Err(BackendError::Resolve(authority.to_string())),
            Err(_) => return Err(BackendError::ConnectTimeout(authority.to_string())),
        };
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(McsSocket {
            socket,
            remote,
            recv_buffer: vec![0u8; self.recv_buffer_size],
            timeout: self.timeout,
        })
    }
}
