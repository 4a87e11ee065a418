//! Scripted lobby for backends that run without a live server.
//!
//! Replay and rollback sessions already know who is in the battle, so the
//! guest's lobby questions are answered locally from a [`BattleRoster`].

use std::collections::VecDeque;

use crate::core::{LBS_STATUS_ERROR, MCS_MAX_PLAYERS, MCS_PROTOCOL_VERSION};
use crate::replay::BattleLogUser;
use crate::wire::{LbsCommand, LbsFramer, LbsMessage};

/// Pilot parameters used when a slot has no recorded user.
const DUMMY_GAME_PARAM: [u8; 33] = [
    0x00, 0x00, 0x01, 0x00, 0x03, 0x00, 0x02, 0x00, 0x05, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x83, 0x76, 0x83, 0x8c, 0x83, 0x43, 0x83, 0x84, 0x81, 0x5b, 0x82, 0x50, 0x00, 0x00, 0x00, 0x00,
    0x07,
];

/// Rule bytes used when the session carries none.
pub const DUMMY_RULE_DATA: [u8; 37] = [
    0x03, 0x02, 0x03, 0x00, 0x00, 0x01, 0x58, 0x02, 0x58, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x3f, 0xff, 0xff, 0xff, 0x3f, 0x00, 0x00, 0xff, 0x01, 0xff, 0xff, 0xff, 0x3f,
    0xff, 0xff, 0xff, 0x3f, 0x00,
];

/// Offset of the pilot name inside the game parameters.
const PILOT_NAME_OFFSET: usize = 16;

/// Pilot name bytes written by [`PlayerInfo::hidden`]: `ＰＩＬＯＴ０` in
/// Shift-JIS, then the slot digit and a fixed tail.
const HIDDEN_PILOT_NAME: [u8; 13] = [
    0x82, 0x6F, 0x82, 0x68, 0x82, 0x6B, 0x82, 0x6E, 0x82, 0x73, 0x82, 0x4F, 0x82,
];
const HIDDEN_PILOT_TAIL: [u8; 3] = [0x01, 0x01, 0x07];

/// One slot as the guest sees it in a player-info answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerInfo {
    /// Service user id.
    pub user_id: String,
    /// Shift-JIS display name.
    pub name_sjis: Vec<u8>,
    /// Opaque pilot parameters.
    pub game_param: Vec<u8>,
    /// Rank.
    pub grade: u16,
    /// Wins.
    pub win: u16,
    /// Losses.
    pub lose: u16,
    /// Draws.
    pub draw: u16,
    /// Team, 1 or 2.
    pub team: u16,
}

impl PlayerInfo {
    /// Info for a recorded user.
    pub fn from_user(user: &BattleLogUser) -> Self {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        Self {
            user_id: user.user_id.clone(),
            name_sjis: user.user_name_sjis.clone(),
            game_param: user.game_param.clone(),
            grade: clamp(user.grade),
            win: clamp(user.win_count),
            lose: clamp(user.lose_count),
            draw: clamp(user.draw_count()),
            team: clamp(user.team),
        }
    }

    /// Placeholder for slot `pos` (1-based).
    pub fn dummy(pos: u8) -> Self {
        let mut game_param = DUMMY_GAME_PARAM.to_vec();
        game_param[PILOT_NAME_OFFSET] = b'0'.wrapping_add(pos);
        game_param[PILOT_NAME_OFFSET + 1] = 0;
        Self {
            user_id: format!("USER0{pos}"),
            name_sjis: format!("USER0{pos}").into_bytes(),
            game_param,
            grade: 1,
            team: 1 + u16::from(pos.saturating_sub(1)) / 2,
            ..Default::default()
        }
    }

    /// Same player with identity and record replaced by `USER0n`.
    pub fn hidden(mut self, pos: u8) -> Self {
        self.user_id = format!("USER0{pos}");
        self.name_sjis = self.user_id.clone().into_bytes();
        if self.game_param.len() >= PILOT_NAME_OFFSET {
            let end = self.game_param.len().min(PILOT_NAME_OFFSET + 17);
            let mut name = HIDDEN_PILOT_NAME.to_vec();
            name.push(0x4F_u8.wrapping_add(pos));
            name.extend_from_slice(&HIDDEN_PILOT_TAIL);
            self.game_param.splice(PILOT_NAME_OFFSET..end, name);
        }
        self.win = 0;
        self.lose = 0;
        self.draw = 0;
        self
    }
}

/// Battle facts a scripted lobby answers from.
pub trait BattleRoster {
    /// Players in the battle.
    fn player_count(&self) -> u8;

    /// The local player's slot, 0-based.
    fn own_slot(&self) -> u8;

    /// Player in slot `pos`, 1-based.
    fn player_info(&self, pos: u8) -> PlayerInfo;

    /// Rule bytes.
    fn rule_data(&self) -> &[u8];

    /// Battle code.
    fn battle_code(&self) -> &str;

    /// Match server address announced to the guest.
    fn mcs_address(&self) -> ([u8; 4], u16);
}

/// What a processed lobby frame means for the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyEvent {
    /// A question was consumed (answered or ignored).
    Handled,
    /// The guest logged out and will join the match server next.
    Logout,
}

/// Answers guest lobby traffic from a [`BattleRoster`].
#[derive(Debug, Default)]
pub struct ScriptedLobby {
    framer: LbsFramer,
}

impl ScriptedLobby {
    /// Empty lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written by the guest.
    pub fn write(&mut self, data: &[u8]) {
        self.framer.write(data);
    }

    /// Drop buffered guest bytes.
    pub fn clear(&mut self) {
        self.framer.clear();
    }

    /// Queue the ready-battle notice that starts the battle flow.
    pub fn ready_battle(out: &mut VecDeque<u8>) {
        push(out, &LbsMessage::sv_notice(LbsCommand::READY_BATTLE));
    }

    /// Answer the next complete guest frame into `out`.
    ///
    /// Returns `None` when no complete frame is buffered.
    pub fn answer_next(
        &mut self,
        roster: &dyn BattleRoster,
        out: &mut VecDeque<u8>,
    ) -> Option<LobbyEvent> {
        let question = self.framer.try_extract_frame()?;
        tracing::debug!(command = %question.command, "scripted lobby question");

        let answer = LbsMessage::sv_answer(&question);
        match question.command {
            LbsCommand::LOBBY_MATCHING_ENTRY => {
                push(out, &answer);
                Self::ready_battle(out);
            }
            LbsCommand::ASK_MATCHING_JOIN => push(out, &answer.write_u8(roster.player_count())),
            LbsCommand::ASK_PLAYER_SIDE => push(out, &answer.write_u8(roster.own_slot() + 1)),
            LbsCommand::ASK_PLAYER_INFO => {
                let pos = question.reader().read_u8().unwrap_or(1);
                if pos == 0 || usize::from(pos) > MCS_MAX_PLAYERS {
                    tracing::debug!(pos, "player info asked for an unknown slot");
                    push(out, &answer.with_status(LBS_STATUS_ERROR));
                    return Some(LobbyEvent::Handled);
                }
                let info = roster.player_info(pos);
                push(
                    out,
                    &answer
                        .write_u8(pos)
                        .write_string(&info.user_id)
                        .write_bytes(&info.name_sjis)
                        .write_bytes(&info.game_param)
                        .write_u16(info.grade)
                        .write_u16(info.win)
                        .write_u16(info.lose)
                        .write_u16(0)
                        .write_u16(info.draw)
                        .write_u16(0)
                        .write_u16(info.team)
                        .write_u16(0),
                );
            }
            LbsCommand::ASK_RULE_DATA => push(out, &answer.write_bytes(roster.rule_data())),
            LbsCommand::ASK_BATTLE_CODE => push(out, &answer.write_string(roster.battle_code())),
            LbsCommand::ASK_MCS_VERSION => push(out, &answer.write_u8(MCS_PROTOCOL_VERSION)),
            LbsCommand::ASK_MCS_ADDRESS => {
                let (ip, port) = roster.mcs_address();
                push(
                    out,
                    &answer
                        .write_u16(4)
                        .write_u8(ip[0])
                        .write_u8(ip[1])
                        .write_u8(ip[2])
                        .write_u8(ip[3])
                        .write_u16(2)
                        .write_u16(port),
                );
            }
            LbsCommand::LOGOUT => return Some(LobbyEvent::Logout),
            other => tracing::debug!(command = %other, "scripted lobby ignores command"),
        }
        Some(LobbyEvent::Handled)
    }
}

fn push(out: &mut VecDeque<u8>, msg: &LbsMessage) {
    match msg.encode() {
        Ok(bytes) => out.extend(bytes),
        Err(e) => tracing::warn!(command = %msg.command, error = %e, "answer not encodable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Category, Frame};

    struct Fixed;

    impl BattleRoster for Fixed {
        fn player_count(&self) -> u8 {
            2
        }
        fn own_slot(&self) -> u8 {
            1
        }
        fn player_info(&self, pos: u8) -> PlayerInfo {
            PlayerInfo::dummy(pos)
        }
        fn rule_data(&self) -> &[u8] {
            &DUMMY_RULE_DATA
        }
        fn battle_code(&self) -> &str {
            "0123456"
        }
        fn mcs_address(&self) -> ([u8; 4], u16) {
            ([127, 0, 0, 1], 3333)
        }
    }

    fn ask(lobby: &mut ScriptedLobby, q: LbsMessage) -> (Option<LobbyEvent>, Vec<LbsMessage>) {
        lobby.write(&q.encode().unwrap());
        let mut out = VecDeque::new();
        let ev = lobby.answer_next(&Fixed, &mut out);
        let bytes: Vec<u8> = out.into_iter().collect();
        let mut msgs = Vec::new();
        let mut rest = &bytes[..];
        while let Some((m, n)) = LbsMessage::try_decode(rest) {
            msgs.push(m);
            rest = &rest[n..];
        }
        assert!(rest.is_empty());
        (ev, msgs)
    }

    #[test]
    fn test_nothing_buffered() {
        let mut lobby = ScriptedLobby::new();
        let mut out = VecDeque::new();
        assert_eq!(lobby.answer_next(&Fixed, &mut out), None);
        assert!(out.is_empty());
    }

    #[test]
    fn test_matching_entry_answers_then_notices() {
        let mut lobby = ScriptedLobby::new();
        let q = LbsMessage::cl_question(LbsCommand::LOBBY_MATCHING_ENTRY).with_seq(7);
        let (ev, msgs) = ask(&mut lobby, q);
        assert_eq!(ev, Some(LobbyEvent::Handled));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].category, Category::Answer);
        assert_eq!(msgs[0].seq, 7);
        assert_eq!(msgs[1].category, Category::Notice);
        assert_eq!(msgs[1].command, LbsCommand::READY_BATTLE);
    }

    #[test]
    fn test_side_count_and_version() {
        let mut lobby = ScriptedLobby::new();
        let (_, msgs) = ask(&mut lobby, LbsMessage::cl_question(LbsCommand::ASK_PLAYER_SIDE));
        assert_eq!(msgs[0].body, vec![2]);
        let (_, msgs) = ask(&mut lobby, LbsMessage::cl_question(LbsCommand::ASK_MATCHING_JOIN));
        assert_eq!(msgs[0].body, vec![2]);
        let (_, msgs) = ask(&mut lobby, LbsMessage::cl_question(LbsCommand::ASK_MCS_VERSION));
        assert_eq!(msgs[0].body, vec![MCS_PROTOCOL_VERSION]);
    }

    #[test]
    fn test_player_info_layout() {
        let mut lobby = ScriptedLobby::new();
        let q = LbsMessage::cl_question(LbsCommand::ASK_PLAYER_INFO).write_u8(3);
        let (_, msgs) = ask(&mut lobby, q);
        let mut r = msgs[0].reader();
        assert_eq!(r.read_u8().unwrap(), 3);
        assert_eq!(r.read_string().unwrap(), "USER03");
        assert_eq!(r.read_bytes().unwrap(), b"USER03");
        let param = r.read_bytes().unwrap();
        assert_eq!(param.len(), DUMMY_GAME_PARAM.len());
        assert_eq!(param[PILOT_NAME_OFFSET], b'3');
        assert_eq!(r.read_u16().unwrap(), 1);
        for _ in 0..5 {
            assert_eq!(r.read_u16().unwrap(), 0);
        }
        assert_eq!(r.read_u16().unwrap(), 2);
        assert_eq!(r.read_u16().unwrap(), 0);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_player_info_out_of_range_slot() {
        let mut lobby = ScriptedLobby::new();
        for pos in [0u8, 5, 0xFF] {
            let q = LbsMessage::cl_question(LbsCommand::ASK_PLAYER_INFO).write_u8(pos);
            let (ev, msgs) = ask(&mut lobby, q);
            assert_eq!(ev, Some(LobbyEvent::Handled));
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].status, LBS_STATUS_ERROR);
            assert!(msgs[0].body.is_empty());
        }
    }

    #[test]
    fn test_placeholders_accept_any_slot() {
        let info = PlayerInfo::dummy(0xFF);
        assert_eq!(info.user_id, "USER0255");
        assert_eq!(info.game_param[PILOT_NAME_OFFSET], b'0'.wrapping_add(0xFF));
        let hidden = PlayerInfo::dummy(1).hidden(0xFF);
        assert_eq!(hidden.game_param[PILOT_NAME_OFFSET + HIDDEN_PILOT_NAME.len()], 0x4E);
    }

    #[test]
    fn test_mcs_address() {
        let mut lobby = ScriptedLobby::new();
        let (_, msgs) = ask(&mut lobby, LbsMessage::cl_question(LbsCommand::ASK_MCS_ADDRESS));
        assert_eq!(msgs[0].body, vec![0, 4, 127, 0, 0, 1, 0, 2, 0x0d, 0x05]);
    }

    #[test]
    fn test_logout_and_unknown() {
        let mut lobby = ScriptedLobby::new();
        let (ev, msgs) = ask(&mut lobby, LbsMessage::cl_question(LbsCommand::LOGOUT));
        assert_eq!(ev, Some(LobbyEvent::Logout));
        assert!(msgs.is_empty());
        let (ev, msgs) = ask(&mut lobby, LbsMessage::cl_question(LbsCommand::LINE_CHECK));
        assert_eq!(ev, Some(LobbyEvent::Handled));
        assert!(msgs.is_empty());
    }

    #[test]
    fn test_hidden_player() {
        let user = BattleLogUser {
            user_id: "real".into(),
            user_name_sjis: b"real".to_vec(),
            game_param: vec![0xAA; 40],
            win_count: 5,
            lose_count: 2,
            battle_count: 9,
            team: 2,
            ..Default::default()
        };
        let info = PlayerInfo::from_user(&user);
        assert_eq!(info.draw, 2);
        let hidden = info.hidden(2);
        assert_eq!(hidden.user_id, "USER02");
        assert_eq!(hidden.game_param.len(), 40);
        assert_eq!(&hidden.game_param[16..29], &HIDDEN_PILOT_NAME);
        assert_eq!(hidden.game_param[29], 0x51);
        assert_eq!(hidden.game_param[33], 0xAA);
        assert_eq!((hidden.win, hidden.lose, hidden.draw, hidden.team), (0, 0, 0, 2));
    }
}
