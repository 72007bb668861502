//! The four-slot save-ring directory protocol (`current`/`next`/
//! `previous`/`deletion`) that publishes a new persistent index
//! snapshot atomically.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const CURRENT: &str = "current";
const NEXT: &str = "next";
const PREVIOUS: &str = "previous";
const DELETION: &str = "deletion";
const CHECKPOINT_MARKER: &str = ".checkpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardMode {
    DiscardAll,
    RollBack,
}

/// Owns one index's save-ring directory. Save operations are
/// serialized by the caller; this type adds no internal locking of
/// its own.
pub struct IndexState {
    base_dir: PathBuf,
}

impl IndexState {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(Error::Io)?;
        Ok(Self { base_dir })
    }

    fn slot_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn remove_slot(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// `prepare_save`: drop any stale `deletion`/`next` slot, then create
    /// a fresh empty `next`.
    pub fn prepare_save(&self) -> Result<()> {
        Self::remove_slot(&self.slot_path(DELETION))?;
        Self::remove_slot(&self.slot_path(NEXT))?;
        fs::create_dir_all(self.slot_path(NEXT)).map_err(Error::Io)
    }

    /// `write_component`: writes one named component into `next`.
    pub fn write_component(&self, name: &str, data: &[u8]) -> Result<()> {
        fs::write(self.slot_path(NEXT).join(name), data).map_err(Error::Io)
    }

    pub fn read_component(&self, slot_dir: &Path, name: &str) -> Result<Vec<u8>> {
        fs::read(slot_dir.join(name)).map_err(Error::Io)
    }

    /// The save-ring rename sequence, with an explicit undo path if
    /// the final rename fails partway through.
    pub fn commit_save(&self, checkpoint: bool) -> Result<()> {
        if checkpoint {
            fs::write(self.slot_path(NEXT).join(CHECKPOINT_MARKER), []).map_err(Error::Io)?;
        }

        let current = self.slot_path(CURRENT);
        let previous = self.slot_path(PREVIOUS);
        let next = self.slot_path(NEXT);
        let deletion = self.slot_path(DELETION);

        let had_current_and_previous = current.exists() && previous.exists();
        if had_current_and_previous {
            fs::rename(&previous, &deletion).map_err(Error::Io)?;
        }

        let had_current = current.exists();
        if had_current {
            fs::rename(&current, &previous).map_err(Error::Io)?;
        }

        if let Err(err) = fs::rename(&next, &current) {
            if had_current {
                let _ = fs::rename(&previous, &current);
            }
            if had_current_and_previous {
                let _ = fs::rename(&deletion, &previous);
            }
            return Err(Error::Io(err));
        }

        // Best-effort: absence of `deletion` after a successful commit is
        // not an error.
        let _ = fs::remove_dir_all(&deletion);
        Ok(())
    }

    /// `cleanup_save`: abort mid-preparation by discarding `next`.
    pub fn cleanup_save(&self) -> Result<()> {
        Self::remove_slot(&self.slot_path(NEXT))
    }

    /// `discard_saves`: always drops `next` and `current`; `DiscardAll`
    /// additionally drops `previous`, while `RollBack` instead restores
    /// `previous` into the now-empty `current` slot.
    pub fn discard_saves(&self, mode: DiscardMode) -> Result<()> {
        self.cleanup_save()?;
        Self::remove_slot(&self.slot_path(CURRENT))?;
        match mode {
            DiscardMode::DiscardAll => Self::remove_slot(&self.slot_path(PREVIOUS)),
            DiscardMode::RollBack => self.rollback_if_needed().map(|_| ()),
        }
    }

    /// If `current` is absent and `previous` exists, promotes `previous`
    /// to `current`. Returns whether a rollback happened.
    fn rollback_if_needed(&self) -> Result<bool> {
        let current = self.slot_path(CURRENT);
        let previous = self.slot_path(PREVIOUS);
        if !current.exists() && previous.exists() {
            fs::rename(&previous, &current).map_err(Error::Io)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// `load_state`: rolls back if needed, then returns the path to
    /// `current` and whether the last successful save was a checkpoint
    /// (meaning a higher layer needs to replay since the checkpoint).
    pub fn load_state(&self) -> Result<(PathBuf, bool)> {
        self.rollback_if_needed()?;
        let current = self.slot_path(CURRENT);
        if !current.exists() {
            return Err(Error::NoIndex(self.base_dir.display().to_string()));
        }
        let needs_replay = current.join(CHECKPOINT_MARKER).exists();
        Ok((current, needs_replay))
    }

    pub fn has_current(&self) -> bool {
        self.slot_path(CURRENT).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (tempfile::TempDir, IndexState) {
        let dir = tempfile::tempdir().unwrap();
        let state = IndexState::new(dir.path().join("state")).unwrap();
        (dir, state)
    }

    #[test]
    fn fresh_save_publishes_current() {
        let (_dir, state) = state();
        state.prepare_save().unwrap();
        state.write_component("geometry", b"abc").unwrap();
        state.commit_save(false).unwrap();

        let (current, needs_replay) = state.load_state().unwrap();
        assert!(!needs_replay);
        assert_eq!(state.read_component(&current, "geometry").unwrap(), b"abc");
    }

    #[test]
    fn second_save_rotates_previous_and_removes_deletion() {
        let (_dir, state) = state();
        state.prepare_save().unwrap();
        state.write_component("v", b"1").unwrap();
        state.commit_save(false).unwrap();

        state.prepare_save().unwrap();
        state.write_component("v", b"2").unwrap();
        state.commit_save(false).unwrap();

        let (current, _) = state.load_state().unwrap();
        assert_eq!(state.read_component(&current, "v").unwrap(), b"2");
        assert!(!dirs_exist(&state, DELETION));
        assert!(dirs_exist(&state, PREVIOUS));
    }

    fn dirs_exist(state: &IndexState, name: &str) -> bool {
        state.slot_path(name).exists()
    }

    #[test]
    fn p3_rollback_if_current_missing_but_previous_present() {
        let (_dir, state) = state();
        state.prepare_save().unwrap();
        state.write_component("v", b"1").unwrap();
        state.commit_save(false).unwrap();

        state.prepare_save().unwrap();
        state.write_component("v", b"2").unwrap();
        state.commit_save(false).unwrap();

        // Simulate a crash strictly between "rename current->previous"
        // and "rename next->current": remove current by hand.
        fs::remove_dir_all(state.slot_path(CURRENT)).unwrap();

        let (current, _) = state.load_state().unwrap();
        assert_eq!(state.read_component(&current, "v").unwrap(), b"1");
    }

    #[test]
    fn cleanup_save_discards_in_progress_next() {
        let (_dir, state) = state();
        state.prepare_save().unwrap();
        state.write_component("v", b"1").unwrap();
        state.cleanup_save().unwrap();
        assert!(!dirs_exist(&state, NEXT));
        assert!(state.load_state().is_err());
    }

    #[test]
    fn discard_all_removes_every_slot() {
        let (_dir, state) = state();
        state.prepare_save().unwrap();
        state.write_component("v", b"1").unwrap();
        state.commit_save(false).unwrap();

        state.discard_saves(DiscardMode::DiscardAll).unwrap();
        assert!(!dirs_exist(&state, CURRENT));
        assert!(!dirs_exist(&state, PREVIOUS));
    }

    #[test]
    fn checkpoint_marks_needs_replay() {
        let (_dir, state) = state();
        state.prepare_save().unwrap();
        state.write_component("v", b"1").unwrap();
        state.commit_save(true).unwrap();

        let (_current, needs_replay) = state.load_state().unwrap();
        assert!(needs_replay);
    }
}
