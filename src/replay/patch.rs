//! Online patches written into guest memory while a session is active.
//!
//! A patch is a list of `(size, address, original, changed)` edits. While a
//! replay or rollback session runs the changed values are kept in place;
//! when it ends the original values are written back exactly once.

use serde::{Deserialize, Serialize};

use crate::core::GuestMemory;

/// One memory edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCode {
    /// Width in bits: 8, 16 or 32.
    pub size: u32,
    /// Guest address.
    pub address: u32,
    /// Value restored when the session ends.
    pub original: u32,
    /// Value kept while the session runs.
    pub changed: u32,
}

impl PatchCode {
    /// Write `value` with this code's width. Unknown widths are ignored.
    fn write(&self, mem: &mut dyn GuestMemory, value: u32) {
        match self.size {
            8 => mem.write8(self.address, value as u8),
            16 => mem.write16(self.address, value as u16),
            32 => mem.write32(self.address, value),
            other => tracing::warn!(size = other, address = self.address, "unsupported patch width"),
        }
    }
}

/// A named group of edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePatch {
    /// Disk the patch targets (`dc1`, `dc2`).
    pub game_disk: String,
    /// Human readable name.
    pub name: String,
    /// Edits.
    pub codes: Vec<PatchCode>,
}

/// Patch that stops the guest from pushing key messages on its own, so the
/// backend answers every key frame. Addresses depend on the disk.
pub fn key_push_patch(disk: u8) -> Option<GamePatch> {
    let (push, mode) = match disk {
        1 => (0x8c05_8b7c, 0x0c31_0450),
        2 => (0x8c04_5f64, 0x0c3a_bb90),
        _ => return None,
    };
    Some(GamePatch {
        game_disk: format!("dc{disk}"),
        name: "skip-key-msg-push".into(),
        codes: vec![
            PatchCode {
                size: 16,
                address: push,
                original: 0x410b,
                changed: 9,
            },
            PatchCode {
                size: 8,
                address: mode,
                original: 2,
                changed: 1,
            },
        ],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PatchState {
    #[default]
    Idle,
    Active,
    RestorePending,
}

/// Patches owned by a session, synchronized with guest memory on demand.
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    patches: Vec<GamePatch>,
    state: PatchState,
}

impl PatchSet {
    /// Wrap `patches`; nothing is written until [`activate`](Self::activate).
    pub fn new(patches: Vec<GamePatch>) -> Self {
        Self {
            patches,
            state: PatchState::Idle,
        }
    }

    /// Patches in this set.
    pub fn patches(&self) -> &[GamePatch] {
        &self.patches
    }

    /// Keep changed values in memory from the next sync on.
    pub fn activate(&mut self) {
        self.state = PatchState::Active;
    }

    /// Restore original values on the next sync if they were applied.
    pub fn deactivate(&mut self) {
        if self.state == PatchState::Active {
            self.state = PatchState::RestorePending;
        }
    }

    /// Whether changed values are being kept in memory.
    pub fn is_active(&self) -> bool {
        self.state == PatchState::Active
    }

    /// Bring guest memory in line with the current state.
    pub fn sync(&mut self, mem: &mut dyn GuestMemory) {
        match self.state {
            PatchState::Idle => {}
            PatchState::Active => self.write_all(mem, |c| c.changed),
            PatchState::RestorePending => {
                self.write_all(mem, |c| c.original);
                tracing::debug!(patches = self.patches.len(), "patches restored");
                self.state = PatchState::Idle;
            }
        }
    }

    fn write_all(&self, mem: &mut dyn GuestMemory, value: impl Fn(&PatchCode) -> u32) {
        for code in self.patches.iter().flat_map(|p| &p.codes) {
            code.write(mem, value(code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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

    fn sample() -> GamePatch {
        GamePatch {
            game_disk: "dc2".into(),
            name: "sample".into(),
            codes: vec![
                PatchCode { size: 8, address: 0x100, original: 0x11, changed: 0x22 },
                PatchCode { size: 16, address: 0x200, original: 0x3344, changed: 0x5566 },
                PatchCode { size: 32, address: 0x300, original: 1, changed: 0xdead_beef },
            ],
        }
    }

    #[test]
    fn test_apply_and_restore_once() {
        let mut ram = Ram::default();
        let mut set = PatchSet::new(vec![sample()]);

        set.sync(&mut ram);
        assert_eq!(ram.read8(0x100), 0);

        set.activate();
        set.sync(&mut ram);
        assert_eq!(ram.read8(0x100), 0x22);
        assert_eq!(ram.read16(0x200), 0x5566);
        assert_eq!(ram.read32(0x300), 0xdead_beef);

        set.deactivate();
        set.sync(&mut ram);
        assert_eq!(ram.read8(0x100), 0x11);
        assert_eq!(ram.read16(0x200), 0x3344);
        assert_eq!(ram.read32(0x300), 1);

        // Restored values are not written again.
        ram.write8(0x100, 0x77);
        set.sync(&mut ram);
        assert_eq!(ram.read8(0x100), 0x77);
    }

    #[test]
    fn test_deactivate_without_activate_writes_nothing() {
        let mut ram = Ram::default();
        let mut set = PatchSet::new(vec![sample()]);
        set.deactivate();
        set.sync(&mut ram);
        assert!(ram.0.is_empty());
    }

    #[test]
    fn test_key_push_patch_per_disk() {
        let dc1 = key_push_patch(1).unwrap();
        assert_eq!(dc1.codes[0].address, 0x8c05_8b7c);
        let dc2 = key_push_patch(2).unwrap();
        assert_eq!(dc2.codes[1].address, 0x0c3a_bb90);
        assert!(key_push_patch(3).is_none());
    }
}
