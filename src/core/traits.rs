//! Core traits of the relay.
//!
//! [`Backend`] is the emulated-socket contract every backend implements.
//! [`GuestMemory`] is the boundary to the emulated machine's memory.

use std::fmt;

/// Which service the guest is opening a socket to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Lobby server (LBS framing).
    Lobby,
    /// Match server (MCS framing).
    Match,
}

/// Destination of a guest `SOCK_OPEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTarget {
    /// Service being opened.
    pub service: ServiceKind,
    /// Host name or dotted address.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl OpenTarget {
    /// Target for the lobby server.
    pub fn lobby(host: impl Into<String>, port: u16) -> Self {
        Self {
            service: ServiceKind::Lobby,
            host: host.into(),
            port,
        }
    }

    /// Target for a match server.
    pub fn match_server(host: impl Into<String>, port: u16) -> Self {
        Self {
            service: ServiceKind::Match,
            host: host.into(),
            port,
        }
    }

    /// `host:port` string for resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for OpenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let service = match self.service {
            ServiceKind::Lobby => "lbs",
            ServiceKind::Match => "mcs",
        };
        write!(f, "{}://{}:{}", service, self.host, self.port)
    }
}

/// The emulated-socket contract.
///
/// Every call is made from the emulation thread and must return promptly:
/// implementations either work on local buffers or bound every socket call
/// with a short timeout.
///
/// # Contract
///
/// - `open` returns `false` on transport failure; the caller falls back to offline
/// - `on_write` accepts bytes and returns how many were taken
/// - `on_read` copies at most `buf.len()` bytes and returns the count
/// - `on_poll` returns the number of bytes readable right now
/// - `reset` returns the backend to its initial state, releasing every resource
pub trait Backend: Send {
    /// Open the socket towards `target`.
    fn open(&mut self, target: &OpenTarget) -> bool;

    /// Close the socket at the guest's request.
    fn close(&mut self);

    /// Bytes written by the guest.
    fn on_write(&mut self, data: &[u8]) -> usize;

    /// Bytes read by the guest.
    fn on_read(&mut self, buf: &mut [u8]) -> usize;

    /// Bytes ready for the guest.
    fn on_poll(&mut self) -> usize;

    /// Tear down and return to the initial state.
    fn reset(&mut self);

    /// Whether a socket is currently open.
    fn is_open(&self) -> bool;

    /// Apply or restore guest memory patches tied to the backend's session.
    ///
    /// Called once per frame by the host. Backends without patches keep the
    /// default no-op.
    fn sync_patches(&mut self, mem: &mut dyn GuestMemory) {
        let _ = mem;
    }
}

/// Byte-addressed view of the emulated machine's memory.
///
/// Multi-byte helpers are little-endian, the guest CPU's byte order.
pub trait GuestMemory {
    /// Read one byte.
    fn read8(&self, addr: u32) -> u8;

    /// Write one byte.
    fn write8(&mut self, addr: u32, value: u8);

    /// Read a little-endian 16-bit value.
    fn read16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read8(addr), self.read8(addr.wrapping_add(1))])
    }

    /// Read a little-endian 32-bit value.
    fn read32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.read8(addr),
            self.read8(addr.wrapping_add(1)),
            self.read8(addr.wrapping_add(2)),
            self.read8(addr.wrapping_add(3)),
        ])
    }

    /// Write a little-endian 16-bit value.
    fn write16(&mut self, addr: u32, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write8(addr.wrapping_add(i as u32), b);
        }
    }

    /// Write a little-endian 32-bit value.
    fn write32(&mut self, addr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write8(addr.wrapping_add(i as u32), b);
        }
    }

    /// Copy `buf.len()` bytes out of guest memory.
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read8(addr.wrapping_add(i as u32));
        }
    }

    /// Copy `data` into guest memory.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write8(addr.wrapping_add(i as u32), *b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct SparseMemory(HashMap<u32, u8>);

    impl GuestMemory for SparseMemory {
        fn read8(&self, addr: u32) -> u8 {
            self.0.get(&addr).copied().unwrap_or(0)
        }

        fn write8(&mut self, addr: u32, value: u8) {
            self.0.insert(addr, value);
        }
    }

    #[test]
    fn test_guest_memory_little_endian() {
        let mut mem = SparseMemory::default();
        mem.write32(0x0c00_0000, 0x1234_5678);
        assert_eq!(mem.read8(0x0c00_0000), 0x78);
        assert_eq!(mem.read16(0x0c00_0002), 0x1234);
        assert_eq!(mem.read32(0x0c00_0000), 0x1234_5678);
    }

    #[test]
    fn test_guest_memory_bytes() {
        let mut mem = SparseMemory::default();
        mem.write_bytes(0x100, b"gdxsv");
        let mut buf = [0u8; 5];
        mem.read_bytes(0x100, &mut buf);
        assert_eq!(&buf, b"gdxsv");
    }

    #[test]
    fn test_open_target_display() {
        let target = OpenTarget::lobby("zdxsv.net", 3333);
        assert_eq!(target.to_string(), "lbs://zdxsv.net:3333");
        assert_eq!(target.authority(), "zdxsv.net:3333");
        assert_eq!(OpenTarget::match_server("10.0.0.1", 9000).service, ServiceKind::Match);
    }
}
