//! Recorded battles and the guest patches tied to them.

mod log;
mod patch;

pub use log::{BattleLogFile, BattleLogMessage, BattleLogUser, DisconnectionSummary, SummaryRow};
pub use patch::{GamePatch, PatchCode, PatchSet, key_push_patch};
