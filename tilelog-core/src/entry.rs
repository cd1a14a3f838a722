//! Log entries and the id conventions shared by client and server.
//!
//! Authoritative ids are handed out by the server only: they start at
//! [`FIRST_AUTHORITATIVE_ID`] and grow by one per accepted entry.
//! Tentative ids live on a single client: they start at
//! [`FIRST_TENTATIVE_ID`] and shrink by one per local submission. The sign
//! ranges never overlap.

use serde::{Deserialize, Serialize};

use crate::Action;

pub type EntryId = i64;

pub const FIRST_AUTHORITATIVE_ID: EntryId = 1;
pub const FIRST_TENTATIVE_ID: EntryId = -1;

/// One committed or tentative action.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: EntryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_key: Option<String>,
    pub action: Action,
}

impl LogEntry {
    pub fn new(id: EntryId, action: Action) -> Self {
        Self {
            id,
            undo_key: None,
            action,
        }
    }

    pub fn with_undo_key(mut self, undo_key: Option<String>) -> Self {
        self.undo_key = undo_key;
        self
    }

    pub fn is_tentative(&self) -> bool {
        self.id < 0
    }

    pub fn is_authoritative(&self) -> bool {
        self.id >= FIRST_AUTHORITATIVE_ID
    }
}
