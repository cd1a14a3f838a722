//! Client-side optimistic reconciliation.
//!
//! A client keeps three things:
//! - a baseline `(id, state)` pair from `InitialServer` or the last
//!   `ReportUndoServer`,
//! - the remote log of authoritative entries committed after the baseline,
//! - the local log of its own tentative entries not yet confirmed.
//!
//! The displayed state is `baseline ⊕ remote ⊕ local`. Folding
//! `baseline ⊕ remote` is cached by its last entry id, so the common case
//! only refolds the (short) local log. [`ClientEngine`] does no I/O:
//! outgoing messages collect in an outbox the transport drains.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;
use uuid::Uuid;

use tilelog_core::entry::FIRST_TENTATIVE_ID;
use tilelog_core::{reduce, Action, EntryId, LogEntry, State, UserId, World};

use crate::protocol::{ClientMessage, ServerMessage};

/// The server sent an entry out of order. Only a fresh `InitialServer`
/// can repair this.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("received entry {received} while already at entry {last}")]
pub struct DesyncError {
    pub last: EntryId,
    pub received: EntryId,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("an undo group is already open")]
    UndoGroupAlreadyOpen,
    #[error("no undo group is open")]
    NoOpenUndoGroup,
    #[error("cannot undo while an undo group is open")]
    UndoGroupOpen,
    #[error(transparent)]
    Desync(#[from] DesyncError),
}

/// A state together with the authoritative entry it reflects.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub last_entry_id: EntryId,
    pub state: State,
}

/// Tentative entries awaiting confirmation.
///
/// Confirmation of an entry can in principle race ahead of the entry
/// itself; removing an id that is not present records it, and the later
/// add of that id is dropped.
#[derive(Debug, Default)]
pub struct LocalLog {
    entries: Vec<LogEntry>,
    removed_early: HashSet<EntryId>,
}

impl LocalLog {
    /// Append an entry unless its removal already arrived.
    pub fn add(&mut self, entry: LogEntry) -> bool {
        if self.removed_early.remove(&entry.id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn remove(&mut self, id: EntryId) -> Option<LogEntry> {
        match self.entries.iter().position(|e| e.id == id) {
            Some(pos) => Some(self.entries.remove(pos)),
            None => {
                self.removed_early.insert(id);
                None
            }
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything, returning how many pending entries were lost.
    pub fn clear(&mut self) -> usize {
        let lost = self.entries.len();
        self.entries.clear();
        self.removed_early.clear();
        lost
    }
}

/// What handling one server message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Initialized { user_id: UserId },
    Applied,
    Rejected { entry_id: EntryId, error: String },
    UndoApplied { undo_key: String },
}

pub struct ClientEngine {
    user_id: Option<UserId>,
    baseline: Baseline,
    remote_log: Vec<LogEntry>,
    local_log: LocalLog,
    remote_cache: Baseline,
    cached_state: State,
    next_tentative_id: EntryId,
    open_undo_key: Option<String>,
    closed_undo_keys: Vec<String>,
    undone_keys: HashSet<String>,
    outbox: VecDeque<ClientMessage>,
    /// Entries dropped by a desync reset, reported at the next disconnect
    unreported_loss: usize,
}

impl Default for ClientEngine {
    fn default() -> Self {
        Self::new(State::new(World::empty(100, 100)))
    }
}

impl ClientEngine {
    /// Start disconnected, showing `placeholder` until `InitialServer`.
    pub fn new(placeholder: State) -> Self {
        let baseline = Baseline {
            last_entry_id: 0,
            state: placeholder,
        };
        Self {
            user_id: None,
            remote_cache: baseline.clone(),
            cached_state: baseline.state.clone(),
            baseline,
            remote_log: Vec::new(),
            local_log: LocalLog::default(),
            next_tentative_id: FIRST_TENTATIVE_ID,
            open_undo_key: None,
            closed_undo_keys: Vec::new(),
            undone_keys: HashSet::new(),
            outbox: VecDeque::new(),
            unreported_loss: 0,
        }
    }

    /// Apply one server message.
    pub fn handle(&mut self, msg: ServerMessage) -> Result<Update, DesyncError> {
        match msg {
            ServerMessage::Initial {
                initial_state,
                user_id,
                last_entry_id,
            } => {
                self.on_initial(initial_state, user_id.clone(), last_entry_id);
                Ok(Update::Initialized { user_id })
            }
            ServerMessage::Entry { entry } => {
                self.on_remote_entry(entry, None)?;
                Ok(Update::Applied)
            }
            ServerMessage::Remap { old_id, entry } => {
                self.on_remote_entry(entry, Some(old_id))?;
                Ok(Update::Applied)
            }
            ServerMessage::Reject { entry_id, error } => {
                self.on_rejected(entry_id, &error);
                Ok(Update::Rejected { entry_id, error })
            }
            ServerMessage::ReportUndo {
                undo_key,
                final_entry_id,
                final_state,
            } => {
                self.on_undo_reported(undo_key.clone(), final_entry_id, final_state)?;
                Ok(Update::UndoApplied { undo_key })
            }
        }
    }

    /// Reset to a fresh server snapshot. Returns the number of pending
    /// local entries discarded.
    pub fn on_initial(&mut self, state: State, user_id: UserId, last_entry_id: EntryId) -> usize {
        log::info!("Session started as {user_id} at entry {last_entry_id}");
        let lost = self.local_log.clear();
        self.user_id = Some(user_id);
        self.baseline = Baseline {
            last_entry_id,
            state,
        };
        self.remote_log.clear();
        self.remote_cache = self.baseline.clone();
        self.cached_state = self.baseline.state.clone();
        self.outbox.clear();
        lost
    }

    /// Append an authoritative entry; `remapped_from` is set when it
    /// confirms one of our own tentative entries.
    pub fn on_remote_entry(
        &mut self,
        entry: LogEntry,
        remapped_from: Option<EntryId>,
    ) -> Result<(), DesyncError> {
        let last = self.last_entry_id();
        if entry.id <= last {
            log::error!("Entry {} arrived after {last}, waiting for a fresh snapshot", entry.id);
            self.reset_for_resync();
            return Err(DesyncError {
                last,
                received: entry.id,
            });
        }

        if let Some(old_id) = remapped_from {
            if self.local_log.remove(old_id).is_none() {
                log::debug!("Remap of {old_id} arrived before the entry itself");
            }
        }
        self.remote_log.push(entry);
        self.refresh_remote_cache();
        self.refold_local();
        Ok(())
    }

    /// Drop a tentative entry the server refused.
    pub fn on_rejected(&mut self, entry_id: EntryId, error: &str) -> Option<LogEntry> {
        log::warn!("Server rejected entry {entry_id}: {error}");
        let removed = self.local_log.remove(entry_id);
        self.refold_local();
        removed
    }

    /// Adopt the post-undo state as the new baseline.
    pub fn on_undo_reported(
        &mut self,
        undo_key: String,
        final_entry_id: EntryId,
        final_state: State,
    ) -> Result<(), DesyncError> {
        let last = self.last_entry_id();
        if final_entry_id < last {
            log::error!("Undo report at {final_entry_id} arrived after {last}");
            self.reset_for_resync();
            return Err(DesyncError {
                last,
                received: final_entry_id,
            });
        }

        self.closed_undo_keys.retain(|k| k != &undo_key);
        self.undone_keys.insert(undo_key);
        self.baseline = Baseline {
            last_entry_id: final_entry_id,
            state: final_state,
        };
        self.remote_log.clear();
        self.remote_cache = self.baseline.clone();
        self.refold_local();
        Ok(())
    }

    /// The connection went away. Pending entries can no longer be
    /// confirmed and are dropped; returns how many, including any dropped
    /// by a desync earlier in the session.
    pub fn on_disconnected(&mut self) -> usize {
        self.user_id = None;
        self.outbox.clear();
        let dropped = self.local_log.clear();
        if dropped > 0 {
            log::warn!("Dropped {dropped} unconfirmed entries on disconnect");
        }
        self.cached_state = self.remote_cache.state.clone();
        dropped + std::mem::take(&mut self.unreported_loss)
    }

    /// Build an action for the current user, apply it optimistically and
    /// queue it for submission. Returns its tentative id.
    pub fn run_action<F>(&mut self, make_action: F) -> Result<EntryId, ClientError>
    where
        F: FnOnce(&UserId) -> Action,
    {
        let user_id = self.user_id.as_ref().ok_or(ClientError::NotConnected)?;
        let action = make_action(user_id);

        let entry = LogEntry::new(self.next_tentative_id, action)
            .with_undo_key(self.open_undo_key.clone());
        self.next_tentative_id -= 1;

        self.outbox.push_back(ClientMessage::Submit {
            entry: entry.clone(),
        });

        let id = entry.id;
        if self.local_log.add(entry) {
            // only the new entry needs folding on top of the cached state
            if let Some(entry) = self.local_log.entries().last() {
                match reduce(&self.cached_state, &entry.action) {
                    Ok(next) => self.cached_state = next,
                    Err(e) => log::warn!(
                        "Local {} rejected by reducer, awaiting server: {e}",
                        entry.action.kind().as_str()
                    ),
                }
            }
        }
        Ok(id)
    }

    /// Open an undo group; actions run while it is open share its key.
    pub fn start_undo_group(&mut self) -> Result<String, ClientError> {
        if self.open_undo_key.is_some() {
            return Err(ClientError::UndoGroupAlreadyOpen);
        }
        let key = Uuid::new_v4().to_string();
        self.open_undo_key = Some(key.clone());
        Ok(key)
    }

    pub fn end_undo_group(&mut self) -> Result<String, ClientError> {
        let key = self
            .open_undo_key
            .take()
            .ok_or(ClientError::NoOpenUndoGroup)?;
        self.closed_undo_keys.push(key.clone());
        Ok(key)
    }

    /// Request undo of the most recent closed group, if any.
    pub fn try_undo(&mut self) -> Result<Option<String>, ClientError> {
        if self.open_undo_key.is_some() {
            return Err(ClientError::UndoGroupOpen);
        }
        if self.user_id.is_none() {
            return Err(ClientError::NotConnected);
        }
        let Some(undo_key) = self.closed_undo_keys.pop() else {
            return Ok(None);
        };
        self.outbox.push_back(ClientMessage::RequestUndo {
            undo_key: undo_key.clone(),
        });
        Ok(Some(undo_key))
    }

    /// Drain queued outgoing messages in submission order.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        self.outbox.drain(..).collect()
    }

    /// The state to display.
    pub fn state(&self) -> &State {
        &self.cached_state
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn remote_log(&self) -> &[LogEntry] {
        &self.remote_log
    }

    pub fn local_log(&self) -> &LocalLog {
        &self.local_log
    }

    pub fn pending_len(&self) -> usize {
        self.local_log.len()
    }

    pub fn open_undo_key(&self) -> Option<&str> {
        self.open_undo_key.as_deref()
    }

    /// Closed groups that can still be undone, oldest first.
    pub fn undo_stack(&self) -> &[String] {
        &self.closed_undo_keys
    }

    /// Newest authoritative entry id known.
    pub fn last_entry_id(&self) -> EntryId {
        self.remote_log
            .last()
            .map(|e| e.id)
            .unwrap_or(self.baseline.last_entry_id)
    }

    fn reset_for_resync(&mut self) {
        self.unreported_loss = self.on_disconnected();
        self.remote_log.clear();
        self.remote_cache = self.baseline.clone();
        self.cached_state = self.baseline.state.clone();
    }

    /// Bring the `baseline ⊕ remote` cache up to the last remote entry.
    fn refresh_remote_cache(&mut self) {
        let target = self.last_entry_id();
        if self.remote_cache.last_entry_id == target {
            return;
        }

        let cached = self.remote_cache.last_entry_id;
        let resume_at = if cached == self.baseline.last_entry_id {
            Some(0)
        } else {
            self.remote_log
                .binary_search_by_key(&cached, |e| e.id)
                .ok()
                .map(|i| i + 1)
        };

        let (start, base) = match resume_at {
            Some(start) => (start, self.remote_cache.state.clone()),
            None => {
                log::debug!("Remote cache at {cached} is stale, refolding from baseline");
                (0, self.baseline.state.clone())
            }
        };

        self.remote_cache = Baseline {
            last_entry_id: target,
            state: fold(base, &self.remote_log[start..], &self.undone_keys),
        };
    }

    fn refold_local(&mut self) {
        self.cached_state = fold(
            self.remote_cache.state.clone(),
            self.local_log.entries(),
            &self.undone_keys,
        );
    }
}

/// Apply entries in order, skipping undone groups and entries the reducer
/// refuses.
fn fold(mut state: State, entries: &[LogEntry], undone_keys: &HashSet<String>) -> State {
    for entry in entries {
        if entry
            .undo_key
            .as_ref()
            .is_some_and(|key| undone_keys.contains(key))
        {
            continue;
        }
        match reduce(&state, &entry.action) {
            Ok(next) => state = next,
            Err(e) => log::warn!("Skipping entry {} while folding: {e}", entry.id),
        }
    }
    state
}
