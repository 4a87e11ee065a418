//! Network mode and the single live backend.
//!
//! ```text
//!   guest RPC ──► Dispatcher ──► BackendSlot
//!                    │              ├─ Offline
//!                    │              ├─ Tcp       (NetMode::Lbs)
//!                    │              ├─ Udp       (NetMode::McsUdp)
//!                    │              ├─ Replay    (NetMode::Replay)
//!                    │              └─ Rollback  (NetMode::RollbackTest)
//!                    └─ retired slot: restores its patches on the next sync
//! ```
//!
//! Switching mode resets the outgoing backend before the next one becomes
//! active. Live modes are chosen by the guest's own `SOCK_OPEN`; replay and
//! rollback are chosen by the host and then answer every open themselves.

use std::fmt;
use std::sync::Arc;

use crate::backend::{NetShared, PlatformInfo, TcpBackend, UdpBackend};
use crate::config::RelayConfig;
use crate::core::{Backend, GuestMemory, OpenTarget, RECV_BUFFER_SIZE, ServiceKind};
use crate::guest::{GdxRpc, RpcRequest};
use crate::wire::LbsMessage;

#[cfg(feature = "replay")]
use crate::backend::ReplayBackend;
#[cfg(feature = "replay")]
use crate::core::ReplayResult;
#[cfg(feature = "replay")]
use crate::replay::BattleLogFile;

#[cfg(feature = "rollback")]
use crate::backend::{P2pMatching, RollbackBackend, RollbackSession};

/// Shared predicate applied to lobby frames before they reach the guest.
pub type SharedLbsFilter = Arc<dyn Fn(&LbsMessage) -> bool + Send + Sync>;

/// Shared callback invoked with every lobby frame.
pub type SharedLbsObserver = Arc<dyn Fn(&LbsMessage) + Send + Sync>;

/// Which backend serves the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetMode {
    /// No backend; every call is a no-op.
    #[default]
    Offline,
    /// Live lobby over TCP.
    Lbs,
    /// Live match over reliable UDP.
    McsUdp,
    /// Playback of a recorded battle.
    Replay,
    /// Rollback netcode session.
    RollbackTest,
}

impl fmt::Display for NetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetMode::Offline => "offline",
            NetMode::Lbs => "lbs",
            NetMode::McsUdp => "mcs_udp",
            NetMode::Replay => "replay",
            NetMode::RollbackTest => "rollback",
        };
        f.write_str(name)
    }
}

/// The one backend instance held by the dispatcher.
#[derive(Debug, Default)]
pub enum BackendSlot {
    /// Nothing.
    #[default]
    Offline,
    /// Lobby relay.
    Tcp(TcpBackend),
    /// Match relay.
    Udp(UdpBackend),
    /// Recorded battle.
    #[cfg(feature = "replay")]
    #[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
    Replay(ReplayBackend),
    /// Rollback bridge.
    #[cfg(feature = "rollback")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rollback")))]
    Rollback(RollbackBackend),
}

impl BackendSlot {
    /// The backend behind the slot, if any.
    pub fn as_backend(&mut self) -> Option<&mut dyn Backend> {
        match self {
            BackendSlot::Offline => None,
            BackendSlot::Tcp(b) => Some(b),
            BackendSlot::Udp(b) => Some(b),
            #[cfg(feature = "replay")]
            BackendSlot::Replay(b) => Some(b),
            #[cfg(feature = "rollback")]
            BackendSlot::Rollback(b) => Some(b),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            BackendSlot::Offline => false,
            BackendSlot::Tcp(b) => b.is_open(),
            BackendSlot::Udp(b) => b.is_open(),
            #[cfg(feature = "replay")]
            BackendSlot::Replay(b) => b.is_open(),
            #[cfg(feature = "rollback")]
            BackendSlot::Rollback(b) => b.is_open(),
        }
    }
}

/// Result of one served guest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOutcome {
    /// Value written to the response word.
    pub response: u32,
    /// Whether a socket is open afterwards; the host mirrors it to the guest.
    pub online: bool,
}

/// Routes emulated-socket calls to the active backend.
pub struct Dispatcher {
    config: RelayConfig,
    shared: Arc<NetShared>,
    mode: NetMode,
    backend: BackendSlot,
    /// Previous backends, kept until their patches are restored.
    retired: Vec<BackendSlot>,
    filter: Option<SharedLbsFilter>,
    observer: Option<SharedLbsObserver>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("backend", &self.backend)
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl Dispatcher {
    /// Offline dispatcher.
    pub fn new(config: RelayConfig, shared: Arc<NetShared>) -> Self {
        Self {
            config,
            shared,
            mode: NetMode::Offline,
            backend: BackendSlot::Offline,
            retired: Vec::new(),
            filter: None,
            observer: None,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> NetMode {
        self.mode
    }

    /// Whether the active backend has an open socket.
    pub fn is_online(&self) -> bool {
        self.backend.is_open()
    }

    /// Configuration in use.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Active backend slot.
    pub fn backend(&self) -> &BackendSlot {
        &self.backend
    }

    /// Filter lobby frames on every future lobby connection.
    pub fn set_lbs_filter(&mut self, filter: SharedLbsFilter) {
        self.filter = Some(filter);
    }

    /// Observe lobby frames on every future lobby connection.
    pub fn set_lbs_observer(&mut self, observer: SharedLbsObserver) {
        self.observer = Some(observer);
    }

    fn switch(&mut self, mode: NetMode, backend: BackendSlot) {
        let mut old = std::mem::replace(&mut self.backend, backend);
        if let Some(b) = old.as_backend() {
            b.reset();
        }
        if !matches!(old, BackendSlot::Offline) {
            self.retired.push(old);
        }
        if self.mode != mode {
            tracing::info!(from = %self.mode, to = %mode, "net mode switch");
        }
        self.mode = mode;
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo::new()
            .with("cpu", std::env::consts::ARCH)
            .with("os", std::env::consts::OS)
            .with("version", env!("CARGO_PKG_VERSION"))
            .with("disk", self.config.disk)
            .with("maxlag", self.shared.max_lag())
    }

    fn lobby_backend(&self) -> TcpBackend {
        let mut tcp = TcpBackend::with_timeouts(
            self.config.connect_timeout(),
            self.config.socket_timeout(),
        );
        tcp.set_platform_info(self.platform_info());
        if let Some(filter) = self.filter.clone() {
            tcp.set_filter(Box::new(move |m: &LbsMessage| filter(m)));
        }
        if let Some(observer) = self.observer.clone() {
            tcp.set_observer(Box::new(move |m: &LbsMessage| observer(m)));
        }
        tcp
    }

    /// Guest `SOCK_OPEN`.
    ///
    /// The previous live backend is torn down before the new one connects.
    /// Live connects that fail leave the dispatcher offline.
    pub fn on_sock_open(&mut self, target: &OpenTarget) -> bool {
        if matches!(self.mode, NetMode::Replay | NetMode::RollbackTest) {
            return self
                .backend
                .as_backend()
                .is_some_and(|b| b.open(target));
        }

        self.switch(NetMode::Offline, BackendSlot::Offline);
        let (mode, mut slot) = match target.service {
            ServiceKind::Lobby => (NetMode::Lbs, BackendSlot::Tcp(self.lobby_backend())),
            ServiceKind::Match => (
                NetMode::McsUdp,
                BackendSlot::Udp(UdpBackend::new(
                    self.shared.clone(),
                    self.config.worker_options(),
                )),
            ),
        };
        let opened = slot.as_backend().is_some_and(|b| b.open(target));
        if opened {
            self.switch(mode, slot);
        } else {
            tracing::warn!(%target, "open failed, staying offline");
        }
        opened
    }

    /// Guest `SOCK_CLOSE`.
    pub fn on_sock_close(&mut self) {
        if let Some(b) = self.backend.as_backend() {
            b.close();
        }
    }

    /// Guest `SOCK_WRITE`.
    pub fn on_sock_write(&mut self, data: &[u8]) -> usize {
        self.backend.as_backend().map_or(0, |b| b.on_write(data))
    }

    /// Guest `SOCK_READ`.
    pub fn on_sock_read(&mut self, buf: &mut [u8]) -> usize {
        self.backend.as_backend().map_or(0, |b| b.on_read(buf))
    }

    /// Guest `SOCK_POLL`.
    pub fn on_sock_poll(&mut self) -> usize {
        self.backend.as_backend().map_or(0, |b| b.on_poll())
    }

    /// Apply or restore backend patches. Call once per frame.
    pub fn sync_patches(&mut self, mem: &mut dyn GuestMemory) {
        for mut retired in self.retired.drain(..) {
            if let Some(b) = retired.as_backend() {
                b.sync_patches(mem);
            }
        }
        if let Some(b) = self.backend.as_backend() {
            b.sync_patches(mem);
        }
    }

    /// Tear down the active backend and go offline.
    pub fn reset(&mut self) {
        self.switch(NetMode::Offline, BackendSlot::Offline);
    }

    /// Play `log` from player `pov`'s seat.
    #[cfg(feature = "replay")]
    #[cfg_attr(docsrs, doc(cfg(feature = "replay")))]
    pub fn start_replay(&mut self, log: BattleLogFile, pov: usize) -> ReplayResult<()> {
        let mut replay =
            ReplayBackend::new(self.shared.clone(), self.config.disk, self.config.hide_names);
        replay.start(log, pov)?;
        self.switch(NetMode::Replay, BackendSlot::Replay(replay));
        Ok(())
    }

    /// Bridge the guest to a rollback `session` for `matching`.
    #[cfg(feature = "rollback")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rollback")))]
    pub fn start_rollback(
        &mut self,
        matching: P2pMatching,
        session: Box<dyn RollbackSession>,
    ) -> ReplayResult<()> {
        let mut rollback = RollbackBackend::new(
            self.shared.clone(),
            self.config.disk,
            self.config.replay_dir.clone(),
            self.config.key_frame_grace_frames,
        );
        rollback.prepare(matching, session)?;
        self.switch(NetMode::RollbackTest, BackendSlot::Rollback(rollback));
        Ok(())
    }

    /// Serve the guest RPC record at `addr`, if a request is pending.
    pub fn handle_rpc(&mut self, mem: &mut dyn GuestMemory, addr: u32) -> Option<RpcOutcome> {
        let rpc = GdxRpc::read(mem, addr);
        if !rpc.is_pending() {
            return None;
        }

        let response = match rpc.decode() {
            RpcRequest::Open { to_lobby, ip, port } => {
                let target = if to_lobby {
                    OpenTarget::lobby(self.config.server.clone(), port)
                } else {
                    OpenTarget::match_server(ip.to_string(), port)
                };
                u32::from(self.on_sock_open(&target))
            }
            RpcRequest::Close => {
                self.on_sock_close();
                0
            }
            RpcRequest::Read { addr: dst, len } => {
                let mut buf = vec![0u8; (len as usize).min(RECV_BUFFER_SIZE)];
                let n = self.on_sock_read(&mut buf);
                mem.write_bytes(dst, &buf[..n.min(buf.len())]);
                n as u32
            }
            RpcRequest::Write { addr: src, len } => {
                let mut buf = vec![0u8; (len as usize).min(RECV_BUFFER_SIZE)];
                mem.read_bytes(src, &mut buf);
                self.on_sock_write(&buf) as u32
            }
            RpcRequest::Poll => self.on_sock_poll() as u32,
            RpcRequest::Unknown(code) => {
                tracing::warn!(code, "unknown guest rpc request");
                0
            }
        };
        GdxRpc::complete(mem, addr, response);
        Some(RpcOutcome {
            response,
            online: self.is_online(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SOCK_OPEN, SOCK_POLL, SOCK_WRITE};
    use crate::wire::LbsCommand;
    use std::collections::HashMap;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    const RPC: u32 = 0x0c30_0000;

    #[derive(Default)]
    struct Ram(HashMap<u32, u8>);

    impl GuestMemory for Ram {
        fn read8(&self, addr: u32) -> u8 {
            self.0.get(&addr).copied().unwrap_or(0)
        }

        fn write8(&mut self, addr: u32, value: u8) {
            self.0.insert(addr, value);
        }
    }

    fn dispatcher(server: &str) -> Dispatcher {
        let config = RelayConfig {
            server: server.to_string(),
            connect_timeout_ms: 500,
            ..RelayConfig::default()
        };
        Dispatcher::new(config, Arc::new(NetShared::default()))
    }

    #[test]
    fn test_offline_calls_are_noops() {
        let mut d = dispatcher("127.0.0.1");
        assert_eq!(d.mode(), NetMode::Offline);
        assert_eq!(d.on_sock_write(&[1, 2, 3]), 0);
        assert_eq!(d.on_sock_read(&mut [0u8; 8]), 0);
        assert_eq!(d.on_sock_poll(), 0);
        d.on_sock_close();
        assert!(!d.is_online());
    }

    #[test]
    fn test_idle_record_is_ignored() {
        let mut d = dispatcher("127.0.0.1");
        let mut mem = Ram::default();
        assert!(d.handle_rpc(&mut mem, RPC).is_none());
    }

    #[test]
    fn test_failed_lobby_connect_stays_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut d = dispatcher("127.0.0.1");
        let mut mem = Ram::default();
        GdxRpc {
            request: SOCK_OPEN,
            param1: 1,
            param3: port as u32,
            ..GdxRpc::default()
        }
        .write(&mut mem, RPC);
        let outcome = d.handle_rpc(&mut mem, RPC).unwrap();
        assert_eq!(outcome, RpcOutcome { response: 0, online: false });
        assert_eq!(d.mode(), NetMode::Offline);
        assert_eq!(mem.read32(RPC), 0);
    }

    #[test]
    fn test_lobby_open_sends_platform_info_and_forwards_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut got = Vec::new();
            let mut buf = [0u8; 512];
            while let Ok(n) = conn.read(&mut buf) {
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            got
        });

        let mut d = dispatcher("127.0.0.1");
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = seen.clone();
        d.set_lbs_observer(Arc::new(move |_: &LbsMessage| {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));

        let mut mem = Ram::default();
        GdxRpc {
            request: SOCK_OPEN,
            param1: 1,
            param3: port as u32,
            ..GdxRpc::default()
        }
        .write(&mut mem, RPC);
        let outcome = d.handle_rpc(&mut mem, RPC).unwrap();
        assert_eq!(outcome, RpcOutcome { response: 1, online: true });
        assert_eq!(d.mode(), NetMode::Lbs);

        let question = LbsMessage::cl_question(LbsCommand::ASK_MCS_VERSION)
            .encode()
            .unwrap();
        mem.write_bytes(0x0c40_0000, &question);
        GdxRpc {
            request: SOCK_WRITE,
            param1: 0x0c40_0000,
            param2: question.len() as u32,
            ..GdxRpc::default()
        }
        .write(&mut mem, RPC);
        assert_eq!(d.handle_rpc(&mut mem, RPC).unwrap().response, question.len() as u32);

        d.reset();
        assert_eq!(d.mode(), NetMode::Offline);
        assert!(!d.is_online());

        let got = server.join().unwrap();
        let mut framer = crate::wire::LbsFramer::new();
        framer.write(&got);
        let frames = framer.drain_frames();
        assert_eq!(frames[0].command, LbsCommand::PLATFORM_INFO);
        let text = frames[0].reader().read_string().unwrap();
        assert!(text.contains("disk=2\n"));
        assert!(text.contains("maxlag=8\n"));
        assert_eq!(frames[1].command, LbsCommand::ASK_MCS_VERSION);
    }

    #[test]
    fn test_reopen_closes_old_connection_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut first, _) = listener.accept().unwrap();
            let (_second, _) = listener.accept().unwrap();
            // The old connection must already be at EOF once the new one is up.
            first.set_nonblocking(true).unwrap();
            let mut buf = [0u8; 512];
            loop {
                match first.read(&mut buf) {
                    Ok(0) => return true,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                    Err(_) => return true,
                }
            }
        });

        let mut d = dispatcher("127.0.0.1");
        let target = OpenTarget::lobby("127.0.0.1", port);
        assert!(d.on_sock_open(&target));
        assert!(d.on_sock_open(&target));
        assert_eq!(d.mode(), NetMode::Lbs);
        assert!(d.is_online());
        assert!(server.join().unwrap());
        d.reset();
    }

    #[test]
    fn test_unknown_request_clears_record() {
        let mut d = dispatcher("127.0.0.1");
        let mut mem = Ram::default();
        GdxRpc {
            request: 77,
            ..GdxRpc::default()
        }
        .write(&mut mem, RPC);
        assert_eq!(d.handle_rpc(&mut mem, RPC).unwrap().response, 0);
        assert_eq!(mem.read32(RPC), 0);

        GdxRpc {
            request: SOCK_POLL,
            ..GdxRpc::default()
        }
        .write(&mut mem, RPC);
        assert_eq!(d.handle_rpc(&mut mem, RPC).unwrap().response, 0);
    }

    #[cfg(feature = "replay")]
    mod replay_mode {
        use super::*;
        use crate::core::LOG_VERSION_CURRENT;
        use crate::replay::BattleLogUser;

        fn log() -> BattleLogFile {
            BattleLogFile {
                log_file_version: LOG_VERSION_CURRENT,
                game_disk: "dc2".into(),
                battle_code: "0000001".into(),
                users: vec![
                    BattleLogUser {
                        user_id: "AAA".into(),
                        pos: 1,
                        team: 1,
                        ..Default::default()
                    },
                    BattleLogUser {
                        user_id: "BBB".into(),
                        pos: 2,
                        team: 2,
                        ..Default::default()
                    },
                ],
                inputs: vec![1, 2],
                ..Default::default()
            }
        }

        #[test]
        fn test_replay_answers_opens_without_network() {
            let mut d = dispatcher("unreachable.invalid");
            d.start_replay(log(), 0).unwrap();
            assert_eq!(d.mode(), NetMode::Replay);
            assert!(d.on_sock_open(&OpenTarget::lobby("unreachable.invalid", 3333)));
            assert!(d.is_online());
            assert_eq!(d.mode(), NetMode::Replay);
        }

        #[test]
        fn test_bad_pov_keeps_mode() {
            let mut d = dispatcher("127.0.0.1");
            assert!(d.start_replay(log(), 5).is_err());
            assert_eq!(d.mode(), NetMode::Offline);
        }

        #[test]
        fn test_reset_restores_patches_on_next_sync() {
            let mut d = dispatcher("127.0.0.1");
            let mut mem = Ram::default();
            d.start_replay(log(), 0).unwrap();
            assert!(d.on_sock_open(&OpenTarget::lobby("x", 3333)));
            d.on_sock_close();
            assert!(d.on_sock_open(&OpenTarget::match_server("127.0.0.1", 3333)));
            d.sync_patches(&mut mem);
            // Disk 2 key-push patch.
            assert_eq!(mem.read8(0x0c3a_bb90), 1);

            d.reset();
            d.sync_patches(&mut mem);
            assert_eq!(mem.read8(0x0c3a_bb90), 2);
        }
    }
}
