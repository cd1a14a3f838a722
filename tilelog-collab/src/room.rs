//! The shared document: one [`LogEngine`] plus its [`BroadcastGroup`].
//!
//! A room is only ever touched under a single lock, so commit order and
//! broadcast order are the same thing, and a joining connection's snapshot
//! lines up exactly with the first envelope it will receive.

use std::sync::Arc;
use tokio::sync::broadcast;

use tilelog_core::{Action, EntryId, LogEntry, UserId};

use crate::broadcast::{BroadcastGroup, ConnectionId, Envelope, Target};
use crate::log_engine::{LogEngine, SubmitError, UndoReport};
use crate::protocol::ServerMessage;

/// What a new connection needs to start its session.
pub struct JoinedSession {
    pub user_id: UserId,
    /// Always the first message to send.
    pub initial: ServerMessage,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
    pub broadcast: Arc<BroadcastGroup>,
}

pub struct DocumentRoom {
    engine: LogEngine,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    pub fn new(engine: LogEngine, broadcast_capacity: usize) -> Self {
        Self {
            engine,
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    /// Subscribe a connection, commit its `AddUser` and snapshot the state.
    ///
    /// Everyone else receives the `AddUser` entry; the joiner gets it
    /// folded into its initial state instead.
    pub async fn join(
        &mut self,
        conn: ConnectionId,
        user_id: UserId,
    ) -> Result<JoinedSession, SubmitError> {
        let receiver = self.broadcast.add_peer(conn, user_id.clone()).await;

        let entry = match self.engine.submit(
            Action::AddUser {
                user_id: user_id.clone(),
            },
            None,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                self.broadcast.remove_peer(conn).await;
                return Err(e);
            }
        };
        self.send(Target::AllExcept(conn), &ServerMessage::Entry { entry });

        let (last_entry_id, initial_state) = self.engine.snapshot();
        log::info!("User {user_id} joined on connection {conn} at entry {last_entry_id}");

        Ok(JoinedSession {
            initial: ServerMessage::Initial {
                initial_state,
                user_id: user_id.clone(),
                last_entry_id,
            },
            user_id,
            receiver,
            broadcast: self.broadcast.clone(),
        })
    }

    /// Unsubscribe a connection and commit its `RemoveUser`.
    pub async fn leave(&mut self, conn: ConnectionId, user_id: &str) {
        self.broadcast.remove_peer(conn).await;
        match self.engine.submit(
            Action::RemoveUser {
                user_id: user_id.to_string(),
            },
            None,
        ) {
            Ok(entry) => {
                log::info!("User {user_id} left (entry {})", entry.id);
                self.send(Target::All, &ServerMessage::Entry { entry });
            }
            Err(e) => log::error!("Failed to commit removal of {user_id}: {e}"),
        }
    }

    /// Validate and commit a client's tentative entry.
    ///
    /// The submitter gets a remap carrying its tentative id, everyone else
    /// a plain entry. A rejection only goes back to the submitter.
    pub fn submit(
        &mut self,
        conn: ConnectionId,
        tentative: LogEntry,
    ) -> Result<LogEntry, SubmitError> {
        let tentative_id = tentative.id;
        match self.engine.submit(tentative.action, tentative.undo_key) {
            Ok(entry) => {
                log::debug!(
                    "Committed {} from connection {conn}: {tentative_id} -> {}",
                    entry.action.kind().as_str(),
                    entry.id
                );
                self.send(
                    Target::Only(conn),
                    &ServerMessage::remap(tentative_id, entry.clone()),
                );
                self.send(
                    Target::AllExcept(conn),
                    &ServerMessage::Entry {
                        entry: entry.clone(),
                    },
                );
                Ok(entry)
            }
            Err(e) => {
                log::warn!("Rejected entry {tentative_id} from connection {conn}: {e}");
                self.send(Target::Only(conn), &ServerMessage::reject(tentative_id, &e));
                Err(e)
            }
        }
    }

    /// Apply an undo request and report the result to every connection.
    pub fn request_undo(&mut self, undo_key: &str) -> Option<UndoReport> {
        let report = self.engine.request_undo(undo_key)?;
        self.send(
            Target::All,
            &ServerMessage::ReportUndo {
                undo_key: report.undo_key.clone(),
                final_entry_id: report.final_entry_id,
                final_state: report.final_state.clone(),
            },
        );
        Some(report)
    }

    pub fn engine(&self) -> &LogEngine {
        &self.engine
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn last_entry_id(&self) -> EntryId {
        self.engine.last_entry_id()
    }

    fn send(&self, target: Target, msg: &ServerMessage) {
        if let Err(e) = self.broadcast.send(target, msg) {
            log::error!("Failed to encode {}: {e}", msg.type_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilelog_core::{Layer, Rectangle, State, World};

    fn room() -> DocumentRoom {
        let world = World::from_layers(vec![Layer::tiles(1, "ground", 4, 4, vec![0; 16])], vec![]);
        DocumentRoom::new(LogEngine::new(State::new(world)), 64)
    }

    fn fill(tile: u32) -> Action {
        Action::FillRectangle {
            layer_ids: vec![1],
            rectangle: Rectangle::new(0, 0, 1, 1),
            tile_id: tile,
        }
    }

    fn next_for(
        rx: &mut broadcast::Receiver<Arc<Envelope>>,
        conn: ConnectionId,
    ) -> Option<ServerMessage> {
        while let Ok(envelope) = rx.try_recv() {
            if envelope.is_for(conn) {
                return Some(ServerMessage::decode(&envelope.payload).unwrap());
            }
        }
        None
    }

    #[tokio::test]
    async fn test_join_snapshot_contains_joiner() {
        let mut room = room();
        let session = room.join(1, "alice".into()).await.unwrap();
        match session.initial {
            ServerMessage::Initial { initial_state, user_id, last_entry_id } => {
                assert_eq!(user_id, "alice");
                assert_eq!(last_entry_id, 1);
                assert!(initial_state.user("alice").is_some());
            }
            other => panic!("Expected Initial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_announced_to_others_only() {
        let mut room = room();
        let mut alice = room.join(1, "alice".into()).await.unwrap();
        let mut bob = room.join(2, "bob".into()).await.unwrap();

        match next_for(&mut alice.receiver, 1) {
            Some(ServerMessage::Entry { entry }) => {
                assert_eq!(entry.id, 2);
                assert_eq!(entry.action, Action::AddUser { user_id: "bob".into() });
            }
            other => panic!("Expected AddUser entry, got {other:?}"),
        }
        assert!(next_for(&mut bob.receiver, 2).is_none());
    }

    #[tokio::test]
    async fn test_submit_remaps_for_sender_and_broadcasts_to_rest() {
        let mut room = room();
        let mut alice = room.join(1, "alice".into()).await.unwrap();
        let mut bob = room.join(2, "bob".into()).await.unwrap();
        next_for(&mut alice.receiver, 1);

        let committed = room.submit(1, LogEntry::new(-1, fill(3))).unwrap();
        assert_eq!(committed.id, 3);

        assert_eq!(
            next_for(&mut alice.receiver, 1),
            Some(ServerMessage::remap(-1, committed.clone()))
        );
        assert_eq!(
            next_for(&mut bob.receiver, 2),
            Some(ServerMessage::Entry { entry: committed })
        );
    }

    #[tokio::test]
    async fn test_rejection_only_reaches_submitter() {
        let mut room = room();
        let mut alice = room.join(1, "alice".into()).await.unwrap();
        let mut bob = room.join(2, "bob".into()).await.unwrap();
        next_for(&mut alice.receiver, 1);

        let bad = Action::FillRectangle {
            layer_ids: vec![7],
            rectangle: Rectangle::new(0, 0, 1, 1),
            tile_id: 1,
        };
        assert!(room.submit(1, LogEntry::new(-4, bad)).is_err());

        match next_for(&mut alice.receiver, 1) {
            Some(ServerMessage::Reject { entry_id, error }) => {
                assert_eq!(entry_id, -4);
                assert!(error.contains('7'));
            }
            other => panic!("Expected Reject, got {other:?}"),
        }
        assert!(next_for(&mut bob.receiver, 2).is_none());
        assert_eq!(room.last_entry_id(), 2);
    }

    #[tokio::test]
    async fn test_undo_reported_to_everyone() {
        let mut room = room();
        let mut alice = room.join(1, "alice".into()).await.unwrap();
        room.submit(1, LogEntry::new(-1, fill(5)).with_undo_key(Some("g".into())))
            .unwrap();
        next_for(&mut alice.receiver, 1);

        let report = room.request_undo("g").unwrap();
        match next_for(&mut alice.receiver, 1) {
            Some(ServerMessage::ReportUndo { undo_key, final_entry_id, final_state }) => {
                assert_eq!(undo_key, "g");
                assert_eq!(final_entry_id, report.final_entry_id);
                assert_eq!(final_state.world.layer(1).unwrap().tile_at(0, 0), Some(0));
            }
            other => panic!("Expected ReportUndo, got {other:?}"),
        }
        assert!(room.request_undo("g").is_none());
        assert!(next_for(&mut alice.receiver, 1).is_none());
    }

    #[tokio::test]
    async fn test_leave_commits_remove_user() {
        let mut room = room();
        let _alice = room.join(1, "alice".into()).await.unwrap();
        let mut bob = room.join(2, "bob".into()).await.unwrap();

        room.leave(1, "alice").await;
        assert!(room.engine().state().user("alice").is_none());
        assert_eq!(room.broadcast().peer_count().await, 1);
        assert_eq!(
            next_for(&mut bob.receiver, 2),
            Some(ServerMessage::Entry {
                entry: LogEntry::new(3, Action::RemoveUser { user_id: "alice".into() }),
            })
        );
    }
}
