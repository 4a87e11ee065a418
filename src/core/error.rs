//! Error types for the relay core.

use thiserror::Error;

/// Errors raised by the byte cursor and the wire codecs.
///
/// Truncated input is not an error: framers return `None` until enough
/// bytes arrive. These variants only surface from explicit body reads and
/// from encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Read past the end of the buffer.
    #[error("incomplete: need {needed} bytes, {available} available")]
    Incomplete {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Body does not fit the 16-bit length field.
    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),

    /// Length-prefixed field does not fit a 16-bit prefix.
    #[error("field too large: {0} bytes")]
    FieldTooLarge(usize),
}

/// Errors encoding or decoding a UDP session datagram.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Serialization failed.
    #[error("packet codec: {0}")]
    Codec(#[from] bincode::Error),

    /// Datagram exceeds the receive buffer.
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}

/// Errors in a backend's transport.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connect did not finish in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// Host name did not resolve.
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// Socket call did not finish in time.
    #[error("socket call timed out")]
    Timeout,

    /// Peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// Backend is not open.
    #[error("backend not open")]
    NotOpen,

    /// Worker thread could not be started or joined.
    #[error("worker: {0}")]
    Worker(String),

    /// Datagram codec failure.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Wire codec failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Faults that end the connection; the dispatcher falls back to offline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::ConnectTimeout(_)
                | BackendError::Resolve(_)
                | BackendError::Closed
                | BackendError::NotOpen
                | BackendError::Worker(_)
        )
    }

    /// Faults that drop a single datagram and leave the session intact.
    pub fn is_silent_drop(&self) -> bool {
        matches!(self, BackendError::Packet(_) | BackendError::Wire(_))
    }
}

/// Errors loading or saving a battle log.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Log file could not be decoded.
    #[error("battle log codec: {0}")]
    Codec(#[from] bincode::Error),

    /// Log decoded but is not playable.
    #[error("invalid battle log: {0}")]
    Invalid(String),

    /// Point of view is not one of the log's users.
    #[error("point of view {pov} out of range ({users} users)")]
    PovOutOfRange {
        /// Requested point of view.
        pov: usize,
        /// Users in the log.
        users: usize,
    },

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML could not be parsed.
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field has an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Wire codec error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Backend error.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Replay error.
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias for wire codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result alias for replay operations.
pub type ReplayResult<T> = Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_classification() {
        assert!(BackendError::Closed.is_fatal());
        assert!(BackendError::ConnectTimeout("x:1".into()).is_fatal());
        assert!(!BackendError::Timeout.is_fatal());

        let wire = BackendError::from(WireError::BodyTooLarge(70000));
        assert!(wire.is_silent_drop());
        assert!(!wire.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = WireError::Incomplete { needed: 4, available: 1 };
        assert_eq!(err.to_string(), "incomplete: need 4 bytes, 1 available");

        let err = RelayError::from(ReplayError::PovOutOfRange { pov: 3, users: 2 });
        assert!(err.to_string().contains("point of view 3"));
    }
}
