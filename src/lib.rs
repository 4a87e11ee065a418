//! # gdxsv netcore
//!
//! Network relay core for an online-service emulator. A game binary that
//! expects a long-gone lobby and match server talks to a modern server, a
//! rollback peer, a recorded battle, or nothing at all, through one
//! emulated-socket contract.
//!
//! - **Wire**: LBS lobby frames and compact MCS match frames, with a
//!   stream framer that splits byte runs into whole frames
//! - **Reliability**: seq/ack over UDP with retransmission and dedup
//! - **Backends**: TCP lobby, UDP match, replay, rollback bridge
//! - **Dispatch**: exactly one live backend, driven by the guest's RPC record
//!
//! ## Feature Flags
//!
//! - `replay` (default): deterministic playback of battle logs
//! - `rollback` (default): rollback-netcode bridge (implies `replay`)
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, the [`Backend`] and [`GuestMemory`] traits
//! - [`wire`]: LBS and MCS codecs, framers, UDP datagrams
//! - [`sync`]: send buffer and receive filter of the reliability layer
//! - [`transport`]: sockets and ping timing
//! - [`backend`]: the backends
//! - [`replay`]: battle log files and game patches (requires `replay`)
//! - [`guest`], [`dispatcher`], [`context`]: the host-facing side
//! - [`config`]: TOML configuration
//!
//! ## Example Usage
//!
//! ```rust
//! use std::collections::HashMap;
//! use gdxsv_netcore::prelude::*;
//!
//! #[derive(Default)]
//! struct Ram(HashMap<u32, u8>);
//!
//! impl GuestMemory for Ram {
//!     fn read8(&self, addr: u32) -> u8 {
//!         self.0.get(&addr).copied().unwrap_or(0)
//!     }
//!     fn write8(&mut self, addr: u32, value: u8) {
//!         self.0.insert(addr, value);
//!     }
//! }
//!
//! let mut ctx = NetContext::new(RelayConfig::default());
//! let mut ram = Ram::default();
//!
//! // Once per frame:
//! if let Some(outcome) = ctx.handle_rpc(&mut ram, 0x0c30_0000) {
//!     println!("online: {}", outcome.online);
//! }
//! ctx.sync_patches(&mut ram);
//! assert_eq!(ctx.mode(), NetMode::Offline);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod wire;

pub mod sync;

pub mod transport;

pub mod backend;

// Battle logs (feature-gated)
#[cfg(feature = "replay")]
#[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
pub mod replay;

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod guest;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    pub use crate::backend::{NetShared, PlatformInfo, TcpBackend, UdpBackend};
    pub use crate::config::{RelayConfig, RelayConfigBuilder};
    pub use crate::context::NetContext;
    pub use crate::dispatcher::{BackendSlot, Dispatcher, NetMode, RpcOutcome};
    pub use crate::guest::{GdxRpc, RpcRequest};
    pub use crate::wire::{LbsCommand, LbsMessage, McsKind, McsMessage};

    #[cfg(feature = "replay")]
    pub use crate::backend::ReplayBackend;
    #[cfg(feature = "replay")]
    pub use crate::replay::{BattleLogFile, BattleLogUser};

    #[cfg(feature = "rollback")]
    pub use crate::backend::{P2pMatching, RollbackBackend, RollbackSession};
}

// Re-export commonly used items at crate root
pub use core::{Backend, GuestMemory, OpenTarget, RelayError};
pub use config::RelayConfig;
pub use context::NetContext;
pub use dispatcher::{Dispatcher, NetMode};
