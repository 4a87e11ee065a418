//! Bridge from the guest's MCS traffic to a rollback-netcode session.
//!
//! The peer session itself is a black box behind [`RollbackSession`]. This
//! backend answers the guest locally, feeds it every player's pad input for
//! the frame being simulated, and holds round starts and load ends behind a
//! [`KeyFrameBarrier`] so all peers enter them on the same session frame.
//!
//! ```text
//! guest StartMsg / LoadEndMsg at frame f
//!   -> broadcast (phase, f) to peers, arm barrier(phase, f)
//!   -> every peer reported (phase, f') with f <= f' <= f + grace  => release
//!   -> f_now - f > grace without release                          => expire
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::NetShared;
use super::lobby::{BattleRoster, DUMMY_RULE_DATA, LobbyEvent, PlayerInfo, ScriptedLobby};
use crate::core::{
    Backend, GuestMemory, LOG_VERSION_CURRENT, MCS_GREETING, MCS_MAX_PLAYERS, OpenTarget,
    ReplayError, ReplayResult, ServiceKind,
};
use crate::replay::{BattleLogFile, BattleLogUser, GamePatch, PatchSet, key_push_patch};
use crate::wire::{McsFramer, McsKind, McsMessage};

/// Close reason: the guest closed the match socket.
pub const REASON_CLOSE: &str = "close";

/// Close reason: a peer dropped out or missed a key frame.
pub const REASON_PLAYER_DISCONNECTED: &str = "player_disconnected";

/// Close reason: the peer session never became active.
pub const REASON_SESSION_START_FAILURE: &str = "session_start_failure";

/// Match server address announced to the guest; never dialed.
const ROLLBACK_MCS_ADDRESS: ([u8; 4], u16) = ([255, 255, 255, 255], 255);

/// Black-box rollback peer session.
///
/// Implementations wrap a rollback-netcode library. Every call is made from
/// the emulation thread.
pub trait RollbackSession: Send {
    /// Frame currently being simulated.
    fn current_frame(&self) -> i32;

    /// Whether frames are being re-simulated after a misprediction.
    fn rollbacking(&self) -> bool;

    /// Whether the session was established with every peer.
    fn is_active(&self) -> bool;

    /// Whether `peer` is still connected.
    fn is_connected(&self, peer: usize) -> bool;

    /// Pad input of `player` for the current frame, in MCS key encoding.
    fn input(&self, player: usize) -> u16;

    /// Tell every peer this one reached `phase` at `frame`.
    fn broadcast_key_frame(&mut self, phase: KeyPhase, frame: i32);

    /// Latest key frame reported by `peer`, this peer included.
    fn key_frame(&self, peer: usize) -> Option<(KeyPhase, i32)>;

    /// Tear the session down.
    fn stop(&mut self);
}

/// Timing-sensitive phase held behind the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    /// A round is starting.
    RoundStart,
    /// Stage loading finished.
    LoadEnd,
}

/// Result of polling a [`KeyFrameBarrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierStatus {
    /// Nothing armed.
    Idle,
    /// Armed, some peer has not reported yet.
    Waiting,
    /// Every peer reported; the phase may begin.
    Released(KeyPhase),
    /// The grace window passed without every report.
    Expired(KeyPhase),
}

/// Barrier that holds a phase until every peer reached the same key frame.
#[derive(Debug, Clone)]
pub struct KeyFrameBarrier {
    armed: Option<(KeyPhase, i32)>,
    grace: i32,
}

impl KeyFrameBarrier {
    /// Barrier accepting reports within `grace_frames` of the armed frame.
    pub fn new(grace_frames: u32) -> Self {
        Self {
            armed: None,
            grace: i32::try_from(grace_frames).unwrap_or(i32::MAX),
        }
    }

    /// Hold `phase` at `frame`. Re-arming the same phase keeps the first frame.
    pub fn arm(&mut self, phase: KeyPhase, frame: i32) {
        match self.armed {
            Some((armed, _)) if armed == phase => {}
            _ => self.armed = Some((phase, frame)),
        }
    }

    /// Armed phase and frame.
    pub fn armed(&self) -> Option<(KeyPhase, i32)> {
        self.armed
    }

    /// Disarm.
    pub fn clear(&mut self) {
        self.armed = None;
    }

    /// Check peer reports at session frame `now`.
    ///
    /// A report counts only for the armed phase and only from the armed
    /// frame onwards; older reports belong to an earlier round.
    pub fn poll(
        &mut self,
        now: i32,
        reports: impl IntoIterator<Item = Option<(KeyPhase, i32)>>,
    ) -> BarrierStatus {
        let Some((phase, frame)) = self.armed else {
            return BarrierStatus::Idle;
        };
        let grace = self.grace;
        let all_in = reports.into_iter().all(|r| {
            r.is_some_and(|(p, f)| p == phase && f >= frame && f.saturating_sub(frame) <= grace)
        });
        if all_in {
            self.armed = None;
            return BarrierStatus::Released(phase);
        }
        if now.saturating_sub(frame) > grace {
            self.armed = None;
            return BarrierStatus::Expired(phase);
        }
        BarrierStatus::Waiting
    }
}

/// A peer offered by the matchmaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    /// Service user id.
    pub user_id: String,
    /// Peer index in the session.
    pub peer_id: u8,
    /// Team, 1 or 2.
    pub team: u8,
    /// Address the peer listens on.
    pub ip: String,
    /// Port the peer listens on.
    pub port: u16,
}

/// Matchmaking result a rollback battle starts from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pMatching {
    /// Battle code.
    pub battle_code: String,
    /// This peer's index.
    pub peer_id: u8,
    /// Session id shared by the peers.
    pub session_id: u32,
    /// Players in the battle.
    pub player_count: u8,
    /// Every peer, this one included.
    pub candidates: Vec<PeerCandidate>,
    /// Rule bytes; empty means the built-in rules.
    pub rule_bin: Vec<u8>,
    /// Recorded users by slot; missing slots get placeholder pilots.
    pub users: Vec<BattleLogUser>,
    /// Patches kept in place during the battle.
    pub patches: Vec<GamePatch>,
}

impl P2pMatching {
    /// Matching for a loopback test among `players` local instances.
    pub fn local_test(me: u8, players: u8) -> Self {
        let mut rule_bin = DUMMY_RULE_DATA.to_vec();
        rule_bin[6..10].copy_from_slice(&[1, 0, 1, 0]);
        Self {
            battle_code: "0123456".into(),
            peer_id: me,
            session_id: 12345,
            player_count: players,
            candidates: (0..players)
                .map(|i| PeerCandidate {
                    user_id: i.to_string(),
                    peer_id: i,
                    team: i / 2 + 1,
                    ip: "127.0.0.1".into(),
                    port: 20010 + u16::from(i),
                })
                .collect(),
            rule_bin,
            ..Default::default()
        }
    }
}

impl BattleRoster for P2pMatching {
    fn player_count(&self) -> u8 {
        self.player_count
    }

    fn own_slot(&self) -> u8 {
        self.peer_id
    }

    fn player_info(&self, pos: u8) -> PlayerInfo {
        self.users
            .get(usize::from(pos.saturating_sub(1)))
            .map_or_else(|| PlayerInfo::dummy(pos), PlayerInfo::from_user)
    }

    fn rule_data(&self) -> &[u8] {
        if self.rule_bin.is_empty() {
            &DUMMY_RULE_DATA
        } else {
            &self.rule_bin
        }
    }

    fn battle_code(&self) -> &str {
        &self.battle_code
    }

    fn mcs_address(&self) -> ([u8; 4], u16) {
        ROLLBACK_MCS_ADDRESS
    }
}

/// Rollback backend progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RollbackState {
    /// Nothing prepared.
    #[default]
    None,
    /// Matching and session handed over, waiting for the guest.
    Ready,
    /// Answering lobby questions.
    LbsStartBattleFlow,
    /// Guest logged out of the lobby.
    McsWaitJoin,
    /// Match socket open, waiting for the connection id.
    McsSessionExchange,
    /// Battle running on the peer session.
    McsInBattle,
    /// Battle over, socket not closed yet.
    End,
    /// Socket closed, log saved.
    Closed,
}

/// Rollback backend.
pub struct RollbackBackend {
    shared: Arc<NetShared>,
    disk: u8,
    replay_dir: Option<PathBuf>,
    state: RollbackState,
    matching: P2pMatching,
    session: Option<Box<dyn RollbackSession>>,
    lobby: ScriptedLobby,
    mcs: McsFramer,
    recv_buf: VecDeque<u8>,
    recv_delay: u32,
    barrier: KeyFrameBarrier,
    input_log: Vec<(i32, u64)>,
    close_reason: Option<String>,
    patches: PatchSet,
    start_at: i64,
}

impl fmt::Debug for RollbackBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackBackend")
            .field("state", &self.state)
            .field("battle_code", &self.matching.battle_code)
            .field("peer_id", &self.matching.peer_id)
            .field("inputs", &self.input_log.len())
            .field("close_reason", &self.close_reason)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

impl RollbackBackend {
    /// Idle backend.
    ///
    /// Finished battles are saved under `replay_dir` when one is given.
    pub fn new(shared: Arc<NetShared>, disk: u8, replay_dir: Option<PathBuf>, grace_frames: u32) -> Self {
        Self {
            shared,
            disk,
            replay_dir,
            state: RollbackState::None,
            matching: P2pMatching::default(),
            session: None,
            lobby: ScriptedLobby::new(),
            mcs: McsFramer::new(),
            recv_buf: VecDeque::new(),
            recv_delay: 0,
            barrier: KeyFrameBarrier::new(grace_frames),
            input_log: Vec::new(),
            close_reason: None,
            patches: PatchSet::default(),
            start_at: 0,
        }
    }

    /// Hand over the matching result and its peer session.
    ///
    /// Fails when the matching names more players than a battle seats or
    /// places this peer outside them.
    pub fn prepare(
        &mut self,
        matching: P2pMatching,
        session: Box<dyn RollbackSession>,
    ) -> ReplayResult<()> {
        self.reset();
        let players = usize::from(matching.player_count);
        if players == 0 || players > MCS_MAX_PLAYERS {
            return Err(ReplayError::Invalid(format!(
                "player count {players} outside 1..={MCS_MAX_PLAYERS}"
            )));
        }
        if matching.peer_id >= matching.player_count {
            return Err(ReplayError::Invalid(format!(
                "peer id {} outside {players} players",
                matching.peer_id
            )));
        }
        let mut patches = matching.patches.clone();
        patches.extend(key_push_patch(self.disk));
        self.patches = PatchSet::new(patches);
        tracing::info!(
            battle_code = %matching.battle_code,
            peer_id = matching.peer_id,
            players = matching.player_count,
            "rollback prepared"
        );
        self.matching = matching;
        self.session = Some(session);
        self.start_at = unix_now();
        self.state = RollbackState::Ready;
        self.shared.set_max_lag(0);
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> RollbackState {
        self.state
    }

    /// First recorded close reason.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// `(frame, packed inputs)` for every simulated key frame.
    pub fn input_log(&self) -> &[(i32, u64)] {
        &self.input_log
    }

    /// The matching in use.
    pub fn matching(&self) -> &P2pMatching {
        &self.matching
    }

    fn set_close_reason(&mut self, reason: &str) {
        if self.close_reason.is_none() {
            tracing::info!(reason, "rollback close reason");
            self.close_reason = Some(reason.to_string());
        }
    }

    fn in_lobby(&self) -> bool {
        self.state <= RollbackState::LbsStartBattleFlow
    }

    fn frame(&self) -> i32 {
        self.session.as_ref().map_or(0, |s| s.current_frame())
    }

    fn rollbacking(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.rollbacking())
    }

    fn process_lbs(&mut self) {
        if self.state == RollbackState::Ready {
            ScriptedLobby::ready_battle(&mut self.recv_buf);
            self.recv_delay = 1;
            self.state = RollbackState::LbsStartBattleFlow;
        }
        if let Some(event) = self.lobby.answer_next(&self.matching, &mut self.recv_buf) {
            if event == LobbyEvent::Logout {
                self.state = RollbackState::McsWaitJoin;
            }
            self.recv_delay = 1;
        }
    }

    fn echo_others(&mut self, kind: McsKind, edit: impl Fn(&mut McsMessage)) {
        for p in 0..self.matching.player_count {
            if p == self.matching.peer_id {
                continue;
            }
            if let Some(mut msg) = McsMessage::create(kind, p) {
                edit(&mut msg);
                self.recv_buf.extend(msg.body);
            }
        }
    }

    fn enter_key_phase(&mut self, phase: KeyPhase) {
        let frame = self.frame();
        self.barrier.arm(phase, frame);
        if !self.rollbacking()
            && let Some(session) = self.session.as_mut()
        {
            session.broadcast_key_frame(phase, frame);
            tracing::info!(?phase, frame, "key frame broadcast");
        }
    }

    fn process_mcs(&mut self, msg: McsMessage) {
        let me = self.matching.peer_id;
        match msg.kind() {
            McsKind::ConnectionId => {
                if self.session.as_ref().is_some_and(|s| s.is_active()) {
                    tracing::info!("rollback in battle");
                    self.state = RollbackState::McsInBattle;
                } else {
                    tracing::warn!("rollback session is not active");
                    self.set_close_reason(REASON_SESSION_START_FAILURE);
                    self.state = RollbackState::End;
                }
            }
            McsKind::Intro => self.echo_others(McsKind::Intro, |_| {}),
            McsKind::IntroReturn => self.echo_others(McsKind::IntroReturn, |_| {}),
            McsKind::Ping => {
                let count = msg.ping_count().unwrap_or(0);
                self.echo_others(McsKind::Pong, |pong| {
                    pong.set_pong_to(me).set_pong_count(count);
                });
            }
            McsKind::Start => self.enter_key_phase(KeyPhase::RoundStart),
            McsKind::LoadEnd => {
                self.echo_others(McsKind::LoadStart, |_| {});
                self.enter_key_phase(KeyPhase::LoadEnd);
            }
            McsKind::KeyInput => self.answer_key_input(),
            other => tracing::debug!(kind = %other, "rollback ignores mcs message"),
        }
    }

    fn answer_key_input(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let frame = session.current_frame();
        let mut packed = 0u64;
        for p in 0..self.matching.player_count {
            let input = session.input(usize::from(p));
            if let Some(mut msg) = McsMessage::create(McsKind::KeyInput, p) {
                msg.set_first_key(input);
                self.recv_buf.extend(msg.body);
            }
            packed |= u64::from(input) << (u32::from(p) * 16);
        }
        while self.input_log.last().is_some_and(|&(f, _)| frame <= f) {
            self.input_log.pop();
        }
        self.input_log.push((frame, packed));
    }

    /// Per-read battle housekeeping: peer liveness and the key-frame barrier.
    fn step_battle(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let players = usize::from(self.matching.player_count);
        if let Some(peer) = (0..players).find(|&p| !session.is_connected(p)) {
            tracing::warn!(peer, "peer disconnected");
            self.set_close_reason(REASON_PLAYER_DISCONNECTED);
            self.barrier.clear();
            self.state = RollbackState::End;
            return;
        }

        let now = session.current_frame();
        let reports: Vec<Option<(KeyPhase, i32)>> =
            (0..players).map(|p| session.key_frame(p)).collect();
        match self.barrier.poll(now, reports) {
            BarrierStatus::Idle | BarrierStatus::Waiting => {}
            BarrierStatus::Released(phase) => {
                tracing::info!(?phase, frame = now, "key frame joined");
                match phase {
                    KeyPhase::RoundStart => self.echo_others(McsKind::Start, |_| {}),
                    KeyPhase::LoadEnd => self.echo_others(McsKind::LoadEnd, |_| {}),
                }
            }
            BarrierStatus::Expired(phase) => {
                tracing::warn!(?phase, frame = now, "key frame barrier expired");
                self.set_close_reason(REASON_PLAYER_DISCONNECTED);
                self.state = RollbackState::End;
            }
        }
    }

    /// Write the input log as a battle log under the replay directory.
    ///
    /// Returns the written path, or `None` when there is nothing to save or
    /// nowhere to save it.
    pub fn save_replay(&self) -> ReplayResult<Option<PathBuf>> {
        let Some(dir) = self.replay_dir.as_ref() else {
            return Ok(None);
        };
        if self.matching.battle_code.is_empty() || self.input_log.is_empty() {
            return Ok(None);
        }
        let log = BattleLogFile {
            log_file_version: LOG_VERSION_CURRENT,
            game_disk: format!("dc{}", self.disk),
            battle_code: self.matching.battle_code.clone(),
            rule_bin: self.matching.rule_data().to_vec(),
            users: self.matching.users.clone(),
            battle_data: Vec::new(),
            inputs: self.input_log.iter().map(|&(_, i)| i).collect(),
            patches: self.matching.patches.clone(),
            start_at: self.start_at,
            end_at: unix_now(),
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.replay", self.matching.battle_code));
        log.save(&path)?;
        tracing::info!(path = %path.display(), inputs = log.inputs.len(), "replay saved");
        Ok(Some(path))
    }
}

impl Backend for RollbackBackend {
    fn open(&mut self, target: &OpenTarget) -> bool {
        if self.state == RollbackState::None {
            tracing::warn!(%target, "rollback open without a matching");
            return false;
        }
        if target.service == ServiceKind::Match {
            self.recv_buf.clear();
            self.recv_buf.extend(MCS_GREETING);
            self.mcs.clear();
            self.state = RollbackState::McsSessionExchange;
            self.shared.set_max_lag(0);
            self.patches.activate();
        }
        tracing::info!(%target, state = ?self.state, "rollback open");
        true
    }

    fn close(&mut self) {
        // The guest closes the lobby socket before joining the match.
        if self.state <= RollbackState::McsWaitJoin || self.state == RollbackState::Closed {
            return;
        }
        self.set_close_reason(REASON_CLOSE);
        if let Some(session) = self.session.as_mut() {
            session.stop();
        }
        self.patches.deactivate();
        if let Err(e) = self.save_replay() {
            tracing::error!(error = %e, "replay not saved");
        }
        self.state = RollbackState::Closed;
    }

    fn on_write(&mut self, data: &[u8]) -> usize {
        if self.in_lobby() {
            self.lobby.write(data);
            self.process_lbs();
        } else if matches!(
            self.state,
            RollbackState::McsSessionExchange | RollbackState::McsInBattle
        ) {
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
        } else if self.state == RollbackState::McsInBattle {
            self.step_battle();
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
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
        self.patches.deactivate();
        self.state = RollbackState::None;
        self.matching = P2pMatching::default();
        self.lobby.clear();
        self.mcs.clear();
        self.recv_buf.clear();
        self.recv_delay = 0;
        self.barrier.clear();
        self.input_log.clear();
        self.close_reason = None;
        self.start_at = 0;
    }

    fn is_open(&self) -> bool {
        !matches!(
            self.state,
            RollbackState::None | RollbackState::End | RollbackState::Closed
        )
    }

    fn sync_patches(&mut self, mem: &mut dyn GuestMemory) {
        self.patches.sync(mem);
    }
}
