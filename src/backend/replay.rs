//! Deterministic playback of a recorded battle.
//!
//! No network I/O happens here. Lobby questions are answered from the log
//! through a [`ScriptedLobby`], and every MCS message the guest sends in
//! battle is answered with messages synthesized from the log.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use super::NetShared;
use super::lobby::{BattleRoster, LobbyEvent, PlayerInfo, ScriptedLobby};
use crate::core::{Backend, GuestMemory, MCS_GREETING, OpenTarget, ReplayError, ReplayResult, ServiceKind};
use crate::replay::{BattleLogFile, PatchSet, key_push_patch};
use crate::wire::{McsFramer, McsKind, McsMessage};

/// Loopback match server announced to the guest.
const REPLAY_MCS_ADDRESS: ([u8; 4], u16) = ([127, 0, 0, 1], 3333);

/// Lag published while key inputs are answered.
const KEY_INPUT_LAG: u8 = 0;

/// Lag published when a round starts.
const ROUND_START_LAG: u8 = 1;

/// Playback progress. Ordered: the lobby phase precedes the match phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReplayState {
    /// No log loaded.
    #[default]
    None,
    /// Log loaded, waiting for the guest.
    Start,
    /// Answering lobby questions.
    LbsStartBattleFlow,
    /// Guest logged out of the lobby, match socket not open yet.
    McsWaitJoin,
    /// Match socket open, waiting for the connection id.
    McsSessionExchange,
    /// Replaying inputs.
    McsInBattle,
    /// Inputs exhausted or socket closed.
    End,
}

struct LogRoster<'a> {
    log: &'a BattleLogFile,
    pov: usize,
    hide_names: bool,
}

impl BattleRoster for LogRoster<'_> {
    fn player_count(&self) -> u8 {
        self.log.users.len() as u8
    }

    fn own_slot(&self) -> u8 {
        self.pov as u8
    }

    fn player_info(&self, pos: u8) -> PlayerInfo {
        let info = match self.log.users.get(usize::from(pos.saturating_sub(1))) {
            Some(user) => PlayerInfo::from_user(user),
            None => PlayerInfo::dummy(pos),
        };
        if self.hide_names { info.hidden(pos) } else { info }
    }

    fn rule_data(&self) -> &[u8] {
        &self.log.rule_bin
    }

    fn battle_code(&self) -> &str {
        &self.log.battle_code
    }

    fn mcs_address(&self) -> ([u8; 4], u16) {
        REPLAY_MCS_ADDRESS
    }
}

/// Replay backend.
#[derive(Debug)]
pub struct ReplayBackend {
    shared: Arc<NetShared>,
    disk: u8,
    hide_names: bool,
    state: ReplayState,
    log: BattleLogFile,
    pov: usize,
    round_starts: Vec<usize>,
    key_cursor: usize,
    lobby: ScriptedLobby,
    mcs: McsFramer,
    recv_buf: VecDeque<u8>,
    recv_delay: u32,
    patches: PatchSet,
}

impl ReplayBackend {
    /// Idle backend for game `disk`.
    pub fn new(shared: Arc<NetShared>, disk: u8, hide_names: bool) -> Self {
        Self {
            shared,
            disk,
            hide_names,
            state: ReplayState::None,
            log: BattleLogFile::default(),
            pov: 0,
            round_starts: Vec::new(),
            key_cursor: 0,
            lobby: ScriptedLobby::new(),
            mcs: McsFramer::new(),
            recv_buf: VecDeque::new(),
            recv_delay: 0,
            patches: PatchSet::default(),
        }
    }

    /// Load `log` and watch it from player `pov`'s seat.
    pub fn start(&mut self, mut log: BattleLogFile, pov: usize) -> ReplayResult<()> {
        self.reset();
        if pov >= log.users.len() {
            return Err(ReplayError::PovOutOfRange {
                pov,
                users: log.users.len(),
            });
        }
        self.round_starts = log.prepare()?;

        let mut patches = log.patches.clone();
        patches.extend(key_push_patch(self.disk));
        self.patches = PatchSet::new(patches);
        self.log = log;
        self.pov = pov;
        self.key_cursor = 0;
        self.state = ReplayState::Start;
        self.shared.set_max_lag(KEY_INPUT_LAG);
        tracing::info!(battle_code = %self.log.battle_code, pov, "replay start");
        Ok(())
    }

    /// Load a log file and start it.
    pub fn start_file(&mut self, path: impl AsRef<Path>, pov: usize) -> ReplayResult<()> {
        let log = BattleLogFile::load(path)?;
        self.start(log, pov)
    }

    /// Current state.
    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Whether inputs are being replayed.
    pub fn is_replaying(&self) -> bool {
        self.state == ReplayState::McsInBattle
    }

    /// Index of the next input to replay.
    pub fn key_cursor(&self) -> usize {
        self.key_cursor
    }

    /// The loaded log.
    pub fn log(&self) -> &BattleLogFile {
        &self.log
    }

    fn in_lobby(&self) -> bool {
        self.state <= ReplayState::LbsStartBattleFlow
    }

    fn process_lbs(&mut self) {
        if self.state == ReplayState::Start {
            ScriptedLobby::ready_battle(&mut self.recv_buf);
            self.recv_delay = 1;
            self.state = ReplayState::LbsStartBattleFlow;
        }

        let roster = LogRoster {
            log: &self.log,
            pov: self.pov,
            hide_names: self.hide_names,
        };
        if let Some(event) = self.lobby.answer_next(&roster, &mut self.recv_buf) {
            if event == LobbyEvent::Logout {
                tracing::info!("replay lobby logout");
                self.state = ReplayState::McsWaitJoin;
            }
            self.recv_delay = 1;
        }
    }

    /// Queue `kind` from every other player.
    fn echo_others(&mut self, kind: McsKind, edit: impl Fn(&mut McsMessage)) {
        for p in 0..self.log.users.len() {
            if p == self.pov {
                continue;
            }
            if let Some(mut msg) = McsMessage::create(kind, p as u8) {
                edit(&mut msg);
                self.recv_buf.extend(msg.body);
            }
        }
    }

    fn process_mcs(&mut self, msg: McsMessage) {
        let me = self.pov as u8;
        match msg.kind() {
            McsKind::ConnectionId => {
                tracing::info!("replay in battle");
                self.state = ReplayState::McsInBattle;
            }
            McsKind::Intro => self.echo_others(McsKind::Intro, |_| {}),
            McsKind::IntroReturn => self.echo_others(McsKind::IntroReturn, |_| {}),
            McsKind::Ping => {
                let count = msg.ping_count().unwrap_or(0);
                self.echo_others(McsKind::Pong, |pong| {
                    pong.set_pong_to(me).set_pong_count(count);
                });
            }
            McsKind::Pong | McsKind::Force => {}
            McsKind::Start => {
                let next = self.round_starts.partition_point(|&i| i < self.key_cursor);
                if let Some(&start) = self.round_starts.get(next) {
                    tracing::info!(from = self.key_cursor, to = start, "key cursor jumps to round start");
                    self.key_cursor = start;
                }
                self.shared.set_max_lag(ROUND_START_LAG);
                self.echo_others(McsKind::Start, |_| {});
            }
            McsKind::KeyInput => self.answer_key_input(),
            McsKind::LoadEnd => {
                self.echo_others(McsKind::LoadStart, |_| {});
                self.echo_others(McsKind::LoadEnd, |_| {});
            }
            other => {
                tracing::warn!(kind = %other, hex = %msg.to_hex(), "unhandled mcs message");
            }
        }
    }

    fn answer_key_input(&mut self) {
        self.shared.set_max_lag(KEY_INPUT_LAG);
        let Some(&inputs) = self.log.inputs.get(self.key_cursor) else {
            return;
        };
        for p in 0..self.log.users.len() {
            let key = (inputs >> (p * 16)) as u16;
            if let Some(mut msg) = McsMessage::create(McsKind::KeyInput, p as u8) {
                msg.set_first_key(key);
                self.recv_buf.extend(msg.body);
            }
        }
        self.key_cursor += 1;
        if self.key_cursor == self.log.inputs.len() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.state != ReplayState::End {
            tracing::info!(inputs = self.log.inputs.len(), "replay finished");
            self.state = ReplayState::End;
            self.patches.deactivate();
            self.shared.request_end();
        }
    }
}

impl Backend for ReplayBackend {
    fn open(&mut self, target: &OpenTarget) -> bool {
        if self.state == ReplayState::None {
            tracing::warn!(%target, "replay open without a log");
            return false;
        }
        if target.service == ServiceKind::Match {
            self.recv_buf.clear();
            self.recv_buf.extend(MCS_GREETING);
            self.mcs.clear();
            self.state = ReplayState::McsSessionExchange;
            self.patches.activate();
        }
        tracing::info!(%target, state = ?self.state, "replay open");
        true
    }

    fn close(&mut self) {
        // The guest closes the lobby socket before joining the match.
        if self.state <= ReplayState::McsWaitJoin {
            return;
        }
        if self.state != ReplayState::End {
            self.log.disconnection_summary().log();
        }
        self.patches.deactivate();
        self.state = ReplayState::End;
    }

    fn on_write(&mut self, data: &[u8]) -> usize {
        if self.in_lobby() {
            self.lobby.write(data);
            self.process_lbs();
        } else if self.state >= ReplayState::McsSessionExchange {
            self.mcs.write(data);
            while let Some(msg) = self.mcs.try_extract_frame() {
                self.process_mcs(msg);
            }
        }
        data.len()
    }

    fn on_read(&mut self, buf: &mut [u8]) -> usize {
        if self.in_lobby() {
            self.process_lbs();
        }
        let n = buf.len().min(self.recv_buf.len());
        for (dst, src) in buf.iter_mut().zip(self.recv_buf.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn on_poll(&mut self) -> usize {
        if self.in_lobby() {
            self.process_lbs();
        }
        if self.recv_delay > 0 {
            self.recv_delay -= 1;
            return 0;
        }
        self.recv_buf.len()
    }

    fn reset(&mut self) {
        self.patches.deactivate();
        self.state = ReplayState::None;
        self.lobby.clear();
        self.mcs.clear();
        self.log = BattleLogFile::default();
        self.round_starts.clear();
        self.recv_buf.clear();
        self.recv_delay = 0;
        self.pov = 0;
        self.key_cursor = 0;
    }

    fn is_open(&self) -> bool {
        !matches!(self.state, ReplayState::None | ReplayState::End)
    }

    fn sync_patches(&mut self, mem: &mut dyn GuestMemory) {
        self.patches.sync(mem);
    }
}
