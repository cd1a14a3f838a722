//! JSON wire protocol between the log server and its clients.
//!
//! Every message is one WebSocket text frame holding a JSON object tagged
//! by `"type"`:
//! ```text
//! server → client   InitialServer | LogEntryServer | RemapEntryServer
//!                   | RejectEntryServer | ReportUndoServer
//! client → server   SubmitEntryClient | RequestUndoClient
//! ```
//! `InitialServer` is always the first message on a connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tilelog_core::{EntryId, LogEntry, State, UserId};

/// Messages sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Snapshot for a fresh connection, plus the user id assigned to it.
    #[serde(rename = "InitialServer")]
    Initial {
        initial_state: State,
        user_id: UserId,
        /// Authoritative id the snapshot reflects (0 for an empty log).
        #[serde(default)]
        last_entry_id: EntryId,
    },
    /// An entry committed by someone else.
    #[serde(rename = "LogEntryServer")]
    Entry { entry: LogEntry },
    /// One of the receiver's own submissions, now committed as `entry`.
    #[serde(rename = "RemapEntryServer")]
    Remap { old_id: EntryId, entry: LogEntry },
    /// One of the receiver's own submissions failed validation.
    #[serde(rename = "RejectEntryServer")]
    Reject { entry_id: EntryId, error: String },
    /// An undo group was rolled back; resynchronize from this pair.
    #[serde(rename = "ReportUndoServer")]
    ReportUndo {
        undo_key: String,
        final_entry_id: EntryId,
        final_state: State,
    },
}

/// Messages sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "SubmitEntryClient")]
    Submit { entry: LogEntry },
    #[serde(rename = "RequestUndoClient")]
    RequestUndo { undo_key: String },
}

impl ServerMessage {
    pub fn remap(old_id: EntryId, entry: LogEntry) -> Self {
        Self::Remap { old_id, entry }
    }

    pub fn reject(entry_id: EntryId, error: impl ToString) -> Self {
        Self::Reject {
            entry_id,
            error: error.to_string(),
        }
    }

    /// Wire name of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Initial { .. } => "InitialServer",
            Self::Entry { .. } => "LogEntryServer",
            Self::Remap { .. } => "RemapEntryServer",
            Self::Reject { .. } => "RejectEntryServer",
            Self::ReportUndo { .. } => "ReportUndoServer",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol and transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Client already started")]
    AlreadyStarted,
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::Transport(other.to_string()),
        }
    }
}
