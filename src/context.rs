//! Relay context owned by the embedding emulator.
//!
//! One `NetContext` lives from emulator start to shutdown and is reset on
//! every game reset. Nothing in the crate is process-global.

use std::sync::Arc;

use crate::backend::NetShared;
use crate::config::RelayConfig;
use crate::core::GuestMemory;
use crate::dispatcher::{Dispatcher, NetMode, RpcOutcome};

#[cfg(feature = "replay")]
use crate::core::ReplayResult;
#[cfg(feature = "replay")]
use crate::replay::BattleLogFile;

#[cfg(feature = "rollback")]
use crate::backend::{P2pMatching, RollbackSession};

/// Everything the relay needs across frames.
#[derive(Debug)]
pub struct NetContext {
    shared: Arc<NetShared>,
    dispatcher: Dispatcher,
}

impl NetContext {
    /// Offline context.
    pub fn new(config: RelayConfig) -> Self {
        let shared = Arc::new(NetShared::new(config.max_lag));
        tracing::info!(server = %config.server, disk = config.disk, "net context created");
        Self {
            dispatcher: Dispatcher::new(config, shared.clone()),
            shared,
        }
    }

    /// Tear down the active backend and clear the stop signal.
    ///
    /// Patches of the torn-down backend are restored on the next
    /// [`sync_patches`](Self::sync_patches).
    pub fn reset(&mut self) {
        self.dispatcher.reset();
        self.shared.take_end_request();
        self.shared.set_max_lag(self.dispatcher.config().max_lag);
    }

    /// Values shared with backends.
    pub fn shared(&self) -> &Arc<NetShared> {
        &self.shared
    }

    /// Current input delay.
    pub fn max_lag(&self) -> u8 {
        self.shared.max_lag()
    }

    /// Current mode.
    pub fn mode(&self) -> NetMode {
        self.dispatcher.mode()
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The dispatcher, mutably.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Configuration in use.
    pub fn config(&self) -> &RelayConfig {
        self.dispatcher.config()
    }

    /// Serve the guest RPC record at `addr`.
    pub fn handle_rpc(&mut self, mem: &mut dyn GuestMemory, addr: u32) -> Option<RpcOutcome> {
        self.dispatcher.handle_rpc(mem, addr)
    }

    /// Apply or restore patches. Call once per frame.
    pub fn sync_patches(&mut self, mem: &mut dyn GuestMemory) {
        self.dispatcher.sync_patches(mem);
    }

    /// Whether a backend asked the emulator to stop; consumes the request.
    pub fn take_end_request(&self) -> bool {
        self.shared.take_end_request()
    }

    /// Switch to replay mode.
    #[cfg(feature = "replay")]
    #[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
    pub fn start_replay(&mut self, log: BattleLogFile, pov: usize) -> ReplayResult<()> {
        self.dispatcher.start_replay(log, pov)
    }

    /// Load a battle log file and switch to replay mode.
    #[cfg(feature = "replay")]
    #[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
    pub fn start_replay_file(
        &mut self,
        path: impl AsRef<std::path::Path>,
        pov: usize,
    ) -> ReplayResult<()> {
        let log = BattleLogFile::load(path)?;
        self.start_replay(log, pov)
    }

    /// Switch to rollback mode.
    #[cfg(feature = "rollback")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rollback")))]
    pub fn start_rollback(
        &mut self,
        matching: P2pMatching,
        session: Box<dyn RollbackSession>,
    ) -> ReplayResult<()> {
        self.dispatcher.start_rollback(matching, session)
    }
}

impl Drop for NetContext {
    fn drop(&mut self) {
        self.dispatcher.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_offline() {
        let ctx = NetContext::new(RelayConfig::default());
        assert_eq!(ctx.mode(), NetMode::Offline);
        assert_eq!(ctx.max_lag(), 8);
        assert!(!ctx.take_end_request());
    }

    #[test]
    fn test_reset_clears_stop_and_lag() {
        let mut ctx = NetContext::new(RelayConfig::default());
        ctx.shared().request_end();
        ctx.shared().set_max_lag(20);
        ctx.reset();
        assert!(!ctx.take_end_request());
        assert_eq!(ctx.max_lag(), 8);
    }

    #[cfg(feature = "replay")]
    #[test]
    fn test_missing_replay_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = NetContext::new(RelayConfig::default());
        assert!(ctx.start_replay_file(dir.path().join("none.replay"), 0).is_err());
        assert_eq!(ctx.mode(), NetMode::Offline);
    }
}
