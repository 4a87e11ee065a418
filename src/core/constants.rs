//! Protocol constants of the legacy lobby (LBS) and match (MCS) services.
//!
//! These values are fixed by the game binary and the replacement servers
//! and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// LBS FRAME LAYOUT
// =============================================================================

/// LBS header size (direction + category + command + body_len + seq + status).
pub const LBS_HEADER_SIZE: usize = 12;

/// LBS direction byte: server to client.
pub const LBS_DIR_SERVER_TO_CLIENT: u8 = 0x18;

/// LBS direction byte: client to server.
pub const LBS_DIR_CLIENT_TO_SERVER: u8 = 0x81;

/// LBS category byte: question.
pub const LBS_CATEGORY_QUESTION: u8 = 0x01;

/// LBS category byte: answer.
pub const LBS_CATEGORY_ANSWER: u8 = 0x02;

/// LBS category byte: notice.
pub const LBS_CATEGORY_NOTICE: u8 = 0x10;

/// LBS category byte: custom (emulator extension).
pub const LBS_CATEGORY_CUSTOM: u8 = 0xFF;

/// LBS status word: success.
pub const LBS_STATUS_SUCCESS: u32 = 0x00FF_FFFF;

/// LBS status word: error.
pub const LBS_STATUS_ERROR: u32 = 0xFFFF_FFFF;

// =============================================================================
// MCS FRAME LAYOUT
// =============================================================================

/// Magic prefix of the fixed-size connection-id frame.
pub const MCS_CONNECTION_ID_MAGIC: [u8; 2] = [0x82, 0x02];

/// Size of the connection-id frame.
pub const MCS_CONNECTION_ID_SIZE: usize = 20;

/// Smallest length-prefixed MCS frame.
pub const MCS_MIN_FRAME_SIZE: usize = 4;

/// Greeting the match server sends as soon as the stream opens.
pub const MCS_GREETING: [u8; 14] = [
    0x0e, 0x61, 0x00, 0x22, 0x10, 0x31, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
];

/// Size of the guest's first MCS write (carries the session id).
pub const MCS_FIRST_MESSAGE_SIZE: usize = 20;

/// Byte range of the session id inside the first MCS write.
pub const MCS_SESSION_ID_RANGE: std::ops::Range<usize> = 12..20;

/// Number of sender slots addressable by the 4-bit sender field.
pub const MCS_MAX_PLAYERS: usize = 4;

// =============================================================================
// UDP SESSION TIMING
// =============================================================================

/// Default UDP worker tick.
pub const UDP_TICK: Duration = Duration::from_millis(1);

/// Ticks between HelloServer retries.
pub const HELLO_INTERVAL_TICKS: u64 = 100;

/// Ticks between unconditional ping sends.
pub const PING_INTERVAL_TICKS: u64 = 100;

/// Pongs required to finish the latency test.
pub const PING_TEST_COUNT: u32 = 10;

/// Ticks between whole-batch retransmissions while idle.
pub const RETRANSMIT_INTERVAL_TICKS: u32 = 22;

/// Largest chunk of guest bytes packed into one battle sub-message.
pub const MAX_BATTLE_CHUNK: usize = 16 * 1024;

/// Default capacity of the outgoing accumulator.
pub const OUTGOING_CAPACITY: usize = 50;

/// Body bytes the pending batch may carry, leaving room under
/// [`RECV_BUFFER_SIZE`] for per-message and datagram framing.
pub const MAX_BATCH_BYTES: usize = 2 * MAX_BATTLE_CHUNK;

/// Timeout applied to every socket call.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for the lobby TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer large enough for any datagram.
pub const RECV_BUFFER_SIZE: usize = 65535;

// =============================================================================
// INPUT DELAY
// =============================================================================

/// Lag frames added on top of the RTT-derived delay.
pub const MAX_LAG_BASE: u8 = 4;

/// Milliseconds of round trip per extra frame of lag.
pub const MAX_LAG_RTT_PER_FRAME_MS: u32 = 16;

/// Lower bound of the derived max-lag.
pub const MAX_LAG_MIN: u8 = 5;

/// Upper bound of the derived max-lag (7-bit field in the game).
pub const MAX_LAG_MAX: u8 = 0x7f;

/// Default max-lag before any measurement.
pub const DEFAULT_MAX_LAG: u8 = 8;

// =============================================================================
// REPLAY
// =============================================================================

/// First battle log version that stores positions and teams directly.
pub const LOG_VERSION_POSITIONED: u32 = 20210802;

/// Battle log version written by this crate.
pub const LOG_VERSION_CURRENT: u32 = 20230426;

/// MCS version announced to the guest.
pub const MCS_PROTOCOL_VERSION: u8 = 10;

/// Round-start and load-end barrier grace window, in frames.
pub const KEY_FRAME_GRACE_FRAMES: u32 = 600;

// =============================================================================
// GUEST RPC
// =============================================================================

/// Guest request: open a socket.
pub const SOCK_OPEN: u32 = 1;

/// Guest request: close the socket.
pub const SOCK_CLOSE: u32 = 2;

/// Guest request: read from the socket.
pub const SOCK_READ: u32 = 3;

/// Guest request: write to the socket.
pub const SOCK_WRITE: u32 = 4;

/// Guest request: bytes available to read.
pub const SOCK_POLL: u32 = 5;
