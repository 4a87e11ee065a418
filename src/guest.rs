//! Guest RPC record.
//!
//! The guest runtime talks to the relay through six consecutive 32-bit
//! words in its own memory:
//!
//! ```text
//! +0   request    SOCK_OPEN .. SOCK_POLL, 0 when idle
//! +4   response   result written by the host
//! +8   param1
//! +12  param2
//! +16  param3
//! +20  param4
//! ```

use std::net::Ipv4Addr;

use crate::core::{GuestMemory, SOCK_CLOSE, SOCK_OPEN, SOCK_POLL, SOCK_READ, SOCK_WRITE};

/// Raw RPC record as laid out in guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GdxRpc {
    /// Request code.
    pub request: u32,
    /// Response word.
    pub response: u32,
    /// First parameter.
    pub param1: u32,
    /// Second parameter.
    pub param2: u32,
    /// Third parameter.
    pub param3: u32,
    /// Fourth parameter.
    pub param4: u32,
}

impl GdxRpc {
    /// Size of the record in guest memory.
    pub const SIZE: u32 = 24;

    /// Read the record at `addr`.
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Self {
        let word = |i: u32| mem.read32(addr.wrapping_add(i * 4));
        Self {
            request: word(0),
            response: word(1),
            param1: word(2),
            param2: word(3),
            param3: word(4),
            param4: word(5),
        }
    }

    /// Write the whole record at `addr`.
    pub fn write(&self, mem: &mut dyn GuestMemory, addr: u32) {
        let words = [
            self.request,
            self.response,
            self.param1,
            self.param2,
            self.param3,
            self.param4,
        ];
        for (i, w) in words.into_iter().enumerate() {
            mem.write32(addr.wrapping_add(i as u32 * 4), w);
        }
    }

    /// Store `response` and mark the request as served.
    pub fn complete(mem: &mut dyn GuestMemory, addr: u32, response: u32) {
        mem.write32(addr.wrapping_add(4), response);
        mem.write32(addr, 0);
    }

    /// Whether a request is pending.
    pub fn is_pending(&self) -> bool {
        self.request != 0
    }

    /// Decode the request.
    pub fn decode(&self) -> RpcRequest {
        match self.request {
            SOCK_OPEN => RpcRequest::Open {
                to_lobby: self.param1 == 1,
                // The guest stores the address in network order; its
                // little-endian load reverses it.
                ip: Ipv4Addr::from(self.param2.to_le_bytes()),
                port: self.param3 as u16,
            },
            SOCK_CLOSE => RpcRequest::Close,
            SOCK_READ => RpcRequest::Read {
                addr: self.param1,
                len: self.param2,
            },
            SOCK_WRITE => RpcRequest::Write {
                addr: self.param1,
                len: self.param2,
            },
            SOCK_POLL => RpcRequest::Poll,
            other => RpcRequest::Unknown(other),
        }
    }
}

/// Decoded guest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcRequest {
    /// Open a socket.
    Open {
        /// Lobby when set, match server otherwise.
        to_lobby: bool,
        /// Match server address; unused for the lobby.
        ip: Ipv4Addr,
        /// Destination port.
        port: u16,
    },
    /// Close the socket.
    Close,
    /// Copy up to `len` received bytes to guest address `addr`.
    Read {
        /// Destination in guest memory.
        addr: u32,
        /// Capacity at `addr`.
        len: u32,
    },
    /// Send `len` bytes from guest address `addr`.
    Write {
        /// Source in guest memory.
        addr: u32,
        /// Byte count.
        len: u32,
    },
    /// Report readable bytes.
    Poll,
    /// Unrecognized code.
    Unknown(u32),
}
