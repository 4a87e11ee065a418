//! Battle log file.
//!
//! A log holds everything needed to play a battle back without a server:
//! the players, the rule bytes, the captured MCS traffic, and the packed
//! per-frame inputs derived from it.
//!
//! ```text
//! inputs[frame]: u64
//! +------------+------------+------------+------------+
//! | player 3   | player 2   | player 1   | player 0   |
//! | bits 48-63 | bits 32-47 | bits 16-31 | bits 0-15  |
//! +------------+------------+------------+------------+
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::patch::GamePatch;
use crate::core::{LOG_VERSION_POSITIONED, MCS_MAX_PLAYERS, ReplayError, ReplayResult};
use crate::wire::{McsFramer, McsKind, McsMessage};

/// Highest grade restored for legacy logs.
const LEGACY_MAX_GRADE: u32 = 14;

/// Wins per grade step in legacy logs.
const LEGACY_WINS_PER_GRADE: u32 = 100;

/// A player recorded in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleLogUser {
    /// Service user id.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Name as the guest renders it (Shift-JIS).
    pub user_name_sjis: Vec<u8>,
    /// Opaque pilot parameters.
    pub game_param: Vec<u8>,
    /// Battles played.
    pub battle_count: u32,
    /// Battles won.
    pub win_count: u32,
    /// Battles lost.
    pub lose_count: u32,
    /// Rank.
    pub grade: u32,
    /// Team, 1 or 2.
    pub team: u32,
    /// Slot, 1-based.
    pub pos: u32,
}

impl BattleLogUser {
    /// Battles that ended in a draw.
    pub fn draw_count(&self) -> u32 {
        self.battle_count
            .saturating_sub(self.win_count)
            .saturating_sub(self.lose_count)
    }
}

/// A chunk of MCS bytes captured from one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleLogMessage {
    /// Sender.
    pub user_id: String,
    /// Zero or more framed MCS messages.
    pub body: Vec<u8>,
    /// Relay sequence number.
    pub seq: u32,
}

/// A recorded battle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleLogFile {
    /// Format version (a date).
    pub log_file_version: u32,
    /// `dc1` or `dc2`.
    pub game_disk: String,
    /// Battle code issued by the lobby.
    pub battle_code: String,
    /// Rule bytes answered to the guest.
    pub rule_bin: Vec<u8>,
    /// Players, ordered by slot.
    pub users: Vec<BattleLogUser>,
    /// Captured traffic.
    pub battle_data: Vec<BattleLogMessage>,
    /// Packed per-frame inputs.
    pub inputs: Vec<u64>,
    /// Patches active during the battle.
    pub patches: Vec<GamePatch>,
    /// Unix seconds.
    pub start_at: i64,
    /// Unix seconds.
    pub end_at: i64,
}

/// Per-user line of a disconnection summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    /// User id.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Key input messages sent.
    pub key_count: usize,
    /// Index of the last force message after the last key input, 0 if none.
    pub last_force_index: usize,
}

/// Who stopped sending inputs first, and whether it looks like a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectionSummary {
    /// One row per user.
    pub rows: Vec<SummaryRow>,
    /// Index of the user detected as disconnected.
    pub disconnected: Option<usize>,
}

impl DisconnectionSummary {
    /// Emit the summary to the log.
    pub fn log(&self) {
        tracing::info!("== disconnection summary ==");
        for row in &self.rows {
            tracing::info!(
                key_count = row.key_count,
                last_force = row.last_force_index,
                user_id = %row.user_id,
                name = %row.user_name,
                "summary row"
            );
        }
        if let Some(row) = self.disconnected.and_then(|i| self.rows.get(i)) {
            tracing::warn!(user_id = %row.user_id, name = %row.user_name, key_count = row.key_count, "disconnected player detected");
        }
    }
}

impl BattleLogFile {
    /// Decode a log.
    pub fn from_bytes(bytes: &[u8]) -> ReplayResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Encode the log.
    pub fn to_bytes(&self) -> ReplayResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Read and decode a log file.
    pub fn load(path: impl AsRef<Path>) -> ReplayResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    /// Encode and write the log.
    pub fn save(&self, path: impl AsRef<Path>) -> ReplayResult<()> {
        std::fs::write(path.as_ref(), self.to_bytes()?)?;
        Ok(())
    }

    /// Decode every captured MCS message in order.
    ///
    /// Chunks are fed through one framer, so a message split across two
    /// chunks is still recovered.
    pub fn messages(&self) -> Vec<McsMessage> {
        let mut framer = McsFramer::new();
        let mut out = Vec::new();
        for data in &self.battle_data {
            framer.write(&data.body);
            out.extend(framer.drain_frames());
        }
        out
    }

    /// Make the log playable: fix legacy records and derive inputs.
    ///
    /// Returns the input index at which each round starts.
    pub fn prepare(&mut self) -> ReplayResult<Vec<usize>> {
        if self.users.is_empty() {
            return Err(ReplayError::Invalid("no users".into()));
        }
        if self.users.len() > MCS_MAX_PLAYERS {
            return Err(ReplayError::Invalid(format!(
                "{} users, at most {MCS_MAX_PLAYERS}",
                self.users.len()
            )));
        }
        if self.log_file_version < LOG_VERSION_POSITIONED {
            self.restore_positions();
        }
        let mut round_starts = Vec::new();
        if self.inputs.is_empty() && !self.battle_data.is_empty() {
            tracing::info!("converting inputs");
            round_starts = self.extract_inputs();
            self.disconnection_summary().log();
        }
        tracing::info!(
            game_disk = %self.game_disk,
            users = self.users.len(),
            patches = self.patches.len(),
            inputs = self.inputs.len(),
            ?round_starts,
            "battle log ready"
        );
        Ok(round_starts)
    }

    /// Rebuild slot, team, grade and display name for logs that predate
    /// positioned users, then sort users by slot.
    ///
    /// A user's slot is the sender nibble of the first ping they sent.
    pub fn restore_positions(&mut self) {
        let mut positions: HashMap<String, u8> = HashMap::new();
        for data in &self.battle_data {
            if positions.len() == self.users.len() {
                break;
            }
            if positions.contains_key(&data.user_id) {
                continue;
            }
            let mut framer = McsFramer::new();
            framer.write(&data.body);
            while let Some(msg) = framer.try_extract_frame() {
                if msg.kind() == McsKind::Ping {
                    positions.insert(data.user_id.clone(), msg.sender());
                    break;
                }
            }
        }

        for user in &mut self.users {
            let pos = u32::from(positions.get(&user.user_id).copied().unwrap_or(0));
            user.pos = pos + 1;
            user.team = 1 + pos / 2;
            user.grade = LEGACY_MAX_GRADE.min(user.win_count / LEGACY_WINS_PER_GRADE);
            user.user_name_sjis = user.user_id.clone().into_bytes();
        }
        self.users.sort_by_key(|u| u.pos);
    }

    /// Pack captured key inputs into [`inputs`](Self::inputs).
    ///
    /// Inputs are grouped per player into rounds at every start message and
    /// each round is cut to the shortest player. Returns round start indexes.
    pub fn extract_inputs(&mut self) -> Vec<usize> {
        let players = self.users.len();
        let mut rounds: Vec<Vec<Vec<u16>>> = vec![Vec::new(); players];

        for msg in self.messages() {
            let p = usize::from(msg.sender());
            let Some(player) = rounds.get_mut(p) else {
                continue;
            };
            match msg.kind() {
                McsKind::Start => player.push(Vec::new()),
                McsKind::KeyInput => {
                    if let (Some(round), Some(key)) = (player.last_mut(), msg.first_key()) {
                        round.push(key);
                    }
                }
                _ => {}
            }
        }

        let mut round_starts = Vec::new();
        let round_count = rounds.first().map_or(0, Vec::len);
        for round in 0..round_count {
            let frames = rounds
                .iter()
                .map(|r| r.get(round).map_or(0, Vec::len))
                .min()
                .unwrap_or(0);
            round_starts.push(self.inputs.len());
            for t in 0..frames {
                let packed = rounds.iter().enumerate().fold(0u64, |acc, (p, r)| {
                    acc | u64::from(r[round][t]) << (p * 16)
                });
                self.inputs.push(packed);
            }
        }
        round_starts
    }

    /// Find the player whose inputs ended first without a force message.
    pub fn disconnection_summary(&self) -> DisconnectionSummary {
        let players = self.users.len();
        let mut key_count = vec![0usize; players];
        let mut last_force = vec![0usize; players];

        for (i, msg) in self.messages().iter().enumerate() {
            let p = usize::from(msg.sender());
            if p >= players {
                continue;
            }
            match msg.kind() {
                McsKind::KeyInput => {
                    key_count[p] += 1;
                    last_force[p] = 0;
                }
                McsKind::Force => last_force[p] = i,
                _ => {}
            }
        }

        let rows = self
            .users
            .iter()
            .enumerate()
            .map(|(i, u)| SummaryRow {
                user_id: u.user_id.clone(),
                user_name: u.user_name.clone(),
                key_count: key_count[i],
                last_force_index: last_force[i],
            })
            .collect();

        let min = key_count.iter().copied().min();
        let max = key_count.iter().copied().max();
        let mut disconnected = None;
        if let (Some(min), Some(max)) = (min, max)
            && min != max
            && let Some(i) = key_count.iter().position(|&c| c == min)
        {
            let no_force = last_force[i] == 0;
            let others_forced = last_force.iter().filter(|&&f| f == 0).count() == 1;
            if no_force && others_forced {
                disconnected = Some(i);
            }
        }

        DisconnectionSummary { rows, disconnected }
    }
}
