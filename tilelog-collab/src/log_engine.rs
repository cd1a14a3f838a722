//! The authoritative action log.
//!
//! Submissions are validated against the current state and either
//! committed with the next sequential id or rejected without a trace.
//! Undo works by replay: every undo group remembers the state right before
//! its first entry, and undoing the group rewinds to that checkpoint and
//! refolds everything after it, skipping entries of undone groups.
//!
//! The engine is synchronous and owns no I/O; the caller serializes access.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tilelog_core::entry::FIRST_AUTHORITATIVE_ID;
use tilelog_core::{reduce, Action, EntryId, LogEntry, State, ValidationError};

/// Why a submission was not committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("undo group {0} has already been undone")]
    GroupAlreadyUndone(String),
}

/// State right before the first entry of an undo group.
#[derive(Debug, Clone)]
pub struct UndoCheckpoint {
    pub undo_key: String,
    pub first_entry_id: EntryId,
    pub state_before_entry: State,
}

/// Outcome of an applied undo.
#[derive(Debug, Clone)]
pub struct UndoReport {
    pub undo_key: String,
    /// Id of the last log entry; replay does not append.
    pub final_entry_id: EntryId,
    pub final_state: State,
    /// Entries that no longer validated during replay and were left out.
    pub skipped: Vec<EntryId>,
}

pub struct LogEngine {
    log: Vec<LogEntry>,
    state: State,
    undone_keys: HashSet<String>,
    checkpoints: HashMap<String, UndoCheckpoint>,
}

impl LogEngine {
    pub fn new(initial: State) -> Self {
        Self {
            log: Vec::new(),
            state: initial,
            undone_keys: HashSet::new(),
            checkpoints: HashMap::new(),
        }
    }

    /// Validate `action` against the current state and commit it.
    ///
    /// On error nothing changes.
    pub fn submit(
        &mut self,
        action: Action,
        undo_key: Option<String>,
    ) -> Result<LogEntry, SubmitError> {
        if let Some(key) = &undo_key {
            if self.undone_keys.contains(key) {
                return Err(SubmitError::GroupAlreadyUndone(key.clone()));
            }
        }

        let next = reduce(&self.state, &action)?;
        let entry = LogEntry::new(self.next_entry_id(), action).with_undo_key(undo_key);

        if let Some(key) = &entry.undo_key {
            if !self.checkpoints.contains_key(key) {
                self.checkpoints.insert(
                    key.clone(),
                    UndoCheckpoint {
                        undo_key: key.clone(),
                        first_entry_id: entry.id,
                        state_before_entry: self.state.clone(),
                    },
                );
            }
        }

        self.state = next;
        self.log.push(entry.clone());
        Ok(entry)
    }

    /// Commit a batch of actions without undo keys, stopping at the first
    /// rejection. Returns the number committed.
    pub fn seed(&mut self, actions: impl IntoIterator<Item = Action>) -> Result<usize, SubmitError> {
        let mut committed = 0;
        for action in actions {
            self.submit(action, None)?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Roll back every entry tagged with `undo_key`.
    ///
    /// Returns `None` when the key is unknown or already undone; both are
    /// silent no-ops. Entries after the group that stop validating once
    /// the group is gone are dropped from the replayed state with a
    /// warning but stay in the log.
    pub fn request_undo(&mut self, undo_key: &str) -> Option<UndoReport> {
        if self.undone_keys.contains(undo_key) {
            log::debug!("Undo of {undo_key} ignored: already undone");
            return None;
        }
        let Some(checkpoint) = self.checkpoints.get(undo_key) else {
            log::debug!("Undo of {undo_key} ignored: no entries carry this key");
            return None;
        };

        let start = (checkpoint.first_entry_id - FIRST_AUTHORITATIVE_ID) as usize;
        let mut state = checkpoint.state_before_entry.clone();
        self.undone_keys.insert(undo_key.to_string());

        let mut skipped = Vec::new();
        for entry in &self.log[start..] {
            if let Some(key) = &entry.undo_key {
                if self.undone_keys.contains(key) {
                    continue;
                }
                // later groups must rewind to the state *after* this undo
                if let Some(later) = self.checkpoints.get_mut(key) {
                    if later.first_entry_id == entry.id {
                        later.state_before_entry = state.clone();
                    }
                }
            }
            match reduce(&state, &entry.action) {
                Ok(next) => state = next,
                Err(e) => {
                    log::warn!(
                        "Undo of {undo_key}: entry {} ({}) no longer applies: {e}",
                        entry.id,
                        entry.action.kind().as_str()
                    );
                    skipped.push(entry.id);
                }
            }
        }

        self.state = state;
        log::info!(
            "Undid group {undo_key}, replayed {} entries",
            self.log.len() - start
        );

        Some(UndoReport {
            undo_key: undo_key.to_string(),
            final_entry_id: self.last_entry_id(),
            final_state: self.state.clone(),
            skipped,
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Id of the newest entry, or 0 for an empty log.
    pub fn last_entry_id(&self) -> EntryId {
        self.log.last().map(|e| e.id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn is_undone(&self, undo_key: &str) -> bool {
        self.undone_keys.contains(undo_key)
    }

    pub fn checkpoint(&self, undo_key: &str) -> Option<&UndoCheckpoint> {
        self.checkpoints.get(undo_key)
    }

    /// Current `(last_entry_id, state)` pair for a joining client.
    pub fn snapshot(&self) -> (EntryId, State) {
        (self.last_entry_id(), self.state.clone())
    }

    fn next_entry_id(&self) -> EntryId {
        FIRST_AUTHORITATIVE_ID + self.log.len() as EntryId
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilelog_core::{Layer, Rectangle, World};

    fn engine() -> LogEngine {
        let ground = Layer::tiles(1, "ground", 4, 4, vec![0; 16]);
        let detail = Layer::tiles(2, "detail", 4, 4, vec![0; 16]);
        LogEngine::new(State::new(World::from_layers(vec![ground, detail], vec![])))
    }

    fn fill(layer: u32, x: i32, y: i32, w: u32, h: u32, tile: u32) -> Action {
        Action::FillRectangle {
            layer_ids: vec![layer],
            rectangle: Rectangle::new(x, y, w, h),
            tile_id: tile,
        }
    }

    fn tile(engine: &LogEngine, layer: u32, x: i32, y: i32) -> u32 {
        engine.state().world.layer(layer).unwrap().tile_at(x, y).unwrap()
    }

    #[test]
    fn test_ids_are_sequential_from_one() {
        let mut engine = engine();
        assert_eq!(engine.last_entry_id(), 0);
        let a = engine.submit(fill(1, 0, 0, 1, 1, 1), None).unwrap();
        let b = engine.submit(fill(1, 1, 0, 1, 1, 2), None).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(engine.last_entry_id(), 2);
    }

    #[test]
    fn test_rejection_leaves_no_trace() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 1), None).unwrap();
        let before = engine.state().clone();

        let err = engine.submit(fill(9, 0, 0, 1, 1, 1), None).unwrap_err();
        assert_eq!(err, SubmitError::Validation(ValidationError::UnknownLayer(9)));
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.state(), &before);

        // the id that was not used goes to the next success
        assert_eq!(engine.submit(fill(1, 0, 0, 1, 1, 2), None).unwrap().id, 2);
    }

    #[test]
    fn test_undo_restores_pre_group_state() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 4, 4, 1), None).unwrap();
        let before = engine.state().clone();

        let key = Some("g".to_string());
        engine.submit(fill(1, 0, 0, 2, 2, 5), key.clone()).unwrap();
        engine.submit(fill(2, 0, 0, 2, 2, 6), key.clone()).unwrap();
        assert_eq!(tile(&engine, 1, 0, 0), 5);

        let report = engine.request_undo("g").unwrap();
        assert_eq!(report.final_entry_id, 3);
        assert_eq!(report.final_state, before);
        assert_eq!(engine.state(), &before);
        assert!(report.skipped.is_empty());
        // the log keeps its entries
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_undo_keeps_later_unrelated_entries() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 5), Some("g".into())).unwrap();
        engine.submit(fill(2, 3, 3, 1, 1, 8), None).unwrap();
        engine.submit(fill(1, 1, 0, 1, 1, 5), Some("g".into())).unwrap();

        engine.request_undo("g").unwrap();
        assert_eq!(tile(&engine, 1, 0, 0), 0);
        assert_eq!(tile(&engine, 1, 1, 0), 0);
        assert_eq!(tile(&engine, 2, 3, 3), 8);
    }

    #[test]
    fn test_undo_is_idempotent_and_unknown_keys_ignored() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 5), Some("g".into())).unwrap();
        assert!(engine.request_undo("g").is_some());
        let after = engine.state().clone();

        assert!(engine.request_undo("g").is_none());
        assert!(engine.request_undo("never-used").is_none());
        assert_eq!(engine.state(), &after);
        assert!(engine.is_undone("g"));
    }

    #[test]
    fn test_submit_to_undone_group_rejected() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 5), Some("g".into())).unwrap();
        engine.request_undo("g").unwrap();
        assert_eq!(
            engine.submit(fill(1, 0, 0, 1, 1, 5), Some("g".into())).unwrap_err(),
            SubmitError::GroupAlreadyUndone("g".into())
        );
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_undo_skips_entries_that_no_longer_apply() {
        let mut engine = engine();
        engine.submit(Action::AddUser { user_id: "u".into() }, Some("join".into())).unwrap();
        engine
            .submit(
                Action::SetSelection { user_id: "u".into(), selection: Some(Rectangle::new(0, 0, 1, 1)) },
                None,
            )
            .unwrap();
        engine.submit(fill(1, 2, 2, 1, 1, 4), None).unwrap();

        let report = engine.request_undo("join").unwrap();
        assert_eq!(report.skipped, vec![2]);
        assert!(engine.state().user("u").is_none());
        assert_eq!(tile(&engine, 1, 2, 2), 4);
    }

    #[test]
    fn test_later_checkpoint_refreshed_by_earlier_undo() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 1), Some("a".into())).unwrap();
        engine.submit(fill(1, 1, 1, 1, 1, 2), Some("b".into())).unwrap();

        engine.request_undo("a").unwrap();
        let refreshed = engine.checkpoint("b").unwrap();
        assert_eq!(refreshed.first_entry_id, 2);
        assert_eq!(
            refreshed.state_before_entry.world.layer(1).unwrap().tile_at(0, 0),
            Some(0)
        );

        // undoing b must not bring a's tile back
        engine.request_undo("b").unwrap();
        assert_eq!(tile(&engine, 1, 0, 0), 0);
        assert_eq!(tile(&engine, 1, 1, 1), 0);
    }

    #[test]
    fn test_undoing_later_group_keeps_earlier_undo() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 1), Some("a".into())).unwrap();
        engine.submit(fill(1, 1, 1, 1, 1, 2), Some("b".into())).unwrap();
        engine.submit(fill(1, 2, 2, 1, 1, 3), Some("a".into())).unwrap();

        engine.request_undo("b").unwrap();
        assert_eq!(tile(&engine, 1, 0, 0), 1);
        assert_eq!(tile(&engine, 1, 2, 2), 3);

        engine.request_undo("a").unwrap();
        assert_eq!(tile(&engine, 1, 0, 0), 0);
        assert_eq!(tile(&engine, 1, 1, 1), 0);
        assert_eq!(tile(&engine, 1, 2, 2), 0);
    }

    #[test]
    fn test_disjoint_commits_commute() {
        let a = fill(1, 0, 0, 2, 2, 7);
        let b = fill(2, 2, 2, 2, 2, 9);

        let mut ab = engine();
        ab.submit(a.clone(), None).unwrap();
        ab.submit(b.clone(), None).unwrap();

        let mut ba = engine();
        ba.submit(b, None).unwrap();
        ba.submit(a, None).unwrap();

        assert_eq!(ab.state(), ba.state());
    }

    #[test]
    fn test_seed_stops_at_first_rejection() {
        let mut engine = engine();
        let result = engine.seed(vec![
            fill(1, 0, 0, 1, 1, 1),
            fill(42, 0, 0, 1, 1, 1),
            fill(1, 1, 0, 1, 1, 1),
        ]);
        assert!(matches!(result, Err(SubmitError::Validation(_))));
        assert_eq!(engine.len(), 1);

        let mut fresh = self::engine();
        assert_eq!(fresh.seed(vec![fill(1, 0, 0, 1, 1, 1)]).unwrap(), 1);
    }

    #[test]
    fn test_snapshot_pairs_id_and_state() {
        let mut engine = engine();
        engine.submit(fill(1, 0, 0, 1, 1, 3), None).unwrap();
        let (id, state) = engine.snapshot();
        assert_eq!(id, 1);
        assert_eq!(&state, engine.state());
    }
}
