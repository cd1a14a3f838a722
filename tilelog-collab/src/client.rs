//! WebSocket sync client.
//!
//! Wraps a [`ClientEngine`] with a connection supervisor:
//! - one session per WebSocket connection, starting at `InitialServer`
//! - automatic reconnect after `reconnect_delay`, with a fresh snapshot
//! - events for the application whenever the displayed state changes
//!
//! Unconfirmed entries do not survive a disconnect. Their count is
//! reported in [`SyncEvent::Disconnected`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tilelog_core::{Action, EntryId, State, UserId};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::reconcile::{ClientEngine, ClientError, Update};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Pause between a lost connection and the next attempt
    pub reconnect_delay: Duration,
    /// Events buffered for the application before new ones are dropped
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8088".to_string(),
            reconnect_delay: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// `InitialServer` received; the session belongs to `user_id`
    Connected { user_id: UserId },
    /// The displayed state may have changed
    StateChanged,
    /// The server refused one of our entries
    Rejected { entry_id: EntryId, error: String },
    /// An undo group was rolled back
    UndoApplied { undo_key: String },
    /// Entries arrived out of order; the session is being restarted
    Desynced,
    /// Connection lost; `lost_entries` unconfirmed edits were dropped
    Disconnected { lost_entries: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Desynced,
    Shutdown,
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,
    engine: Arc<Mutex<ClientEngine>>,
    state: Arc<RwLock<ConnectionState>>,

    /// Feeds the session's writer; unbounded so edits never wait on the network
    outgoing_tx: mpsc::UnboundedSender<ClientMessage>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<ClientMessage>>,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    shutdown_tx: watch::Sender<bool>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            engine: Arc::new(Mutex::new(ClientEngine::default())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
        }
    }

    pub fn with_url(server_url: impl Into<String>) -> Self {
        Self::new(ClientConfig {
            server_url: server_url.into(),
            ..ClientConfig::default()
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the first connection and start the supervisor.
    ///
    /// Later connection losses are retried in the background; only this
    /// first attempt reports failure to the caller.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let outgoing_rx = self.outgoing_rx.take().ok_or(ProtocolError::AlreadyStarted)?;
        *self.state.write().await = ConnectionState::Connecting;

        let ws = match connect_async(self.config.server_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.outgoing_rx = Some(outgoing_rx);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        log::info!("Connected to {}", self.config.server_url);

        let supervisor = Supervisor {
            url: self.config.server_url.clone(),
            reconnect_delay: self.config.reconnect_delay,
            engine: self.engine.clone(),
            state: self.state.clone(),
            event_tx: self.event_tx.clone(),
            outgoing_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            unreported_loss: 0,
        };
        tokio::spawn(supervisor.run(ws));
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Apply an action optimistically and submit it.
    ///
    /// `make_action` receives the session's user id.
    pub async fn run_action<F>(&self, make_action: F) -> Result<EntryId, ClientError>
    where
        F: FnOnce(&UserId) -> Action,
    {
        let mut engine = self.engine.lock().await;
        let id = engine.run_action(make_action)?;
        self.flush(&mut engine);
        Ok(id)
    }

    pub async fn start_undo_group(&self) -> Result<String, ClientError> {
        self.engine.lock().await.start_undo_group()
    }

    pub async fn end_undo_group(&self) -> Result<String, ClientError> {
        self.engine.lock().await.end_undo_group()
    }

    /// Ask the server to undo the most recent closed group.
    pub async fn try_undo(&self) -> Result<Option<String>, ClientError> {
        let mut engine = self.engine.lock().await;
        let key = engine.try_undo()?;
        self.flush(&mut engine);
        Ok(key)
    }

    /// Snapshot of the displayed state.
    pub async fn state(&self) -> State {
        self.engine.lock().await.state().clone()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.engine.lock().await.user_id().cloned()
    }

    /// Number of our entries the server has not answered yet.
    pub async fn pending_len(&self) -> usize {
        self.engine.lock().await.pending_len()
    }

    pub async fn last_entry_id(&self) -> EntryId {
        self.engine.lock().await.last_entry_id()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn engine(&self) -> &Arc<Mutex<ClientEngine>> {
        &self.engine
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    fn flush(&self, engine: &mut ClientEngine) {
        for msg in engine.take_outgoing() {
            if self.outgoing_tx.send(msg).is_err() {
                log::debug!("Client stopped, dropping outgoing message");
            }
        }
    }
}

/// Background task owning the connection.
struct Supervisor {
    url: String,
    reconnect_delay: Duration,
    engine: Arc<Mutex<ClientEngine>>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SyncEvent>,
    outgoing_rx: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: watch::Receiver<bool>,
    /// Lost entries from `Disconnected` events the queue had no room for
    unreported_loss: usize,
}

impl Supervisor {
    async fn run(mut self, first: WsStream) {
        let mut next = Some(first);
        loop {
            let ws = match next.take() {
                Some(ws) => ws,
                None => {
                    *self.state.write().await = ConnectionState::Reconnecting;
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                    match connect_async(self.url.as_str()).await {
                        Ok((ws, _)) => {
                            log::info!("Reconnected to {}", self.url);
                            ws
                        }
                        Err(e) => {
                            log::info!("Reconnect to {} failed: {e}", self.url);
                            continue;
                        }
                    }
                }
            };

            let end = self.run_session(ws).await;
            let lost = self.engine.lock().await.on_disconnected();
            *self.state.write().await = ConnectionState::Disconnected;
            self.report_disconnect(lost);

            if end == SessionEnd::Shutdown {
                break;
            }
            log::info!("Session ended ({end:?}), reconnecting");
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut writer, mut reader) = ws.split();

        // subscribing marks a disconnect made before `connect` as seen
        if *self.shutdown_rx.borrow() {
            let _ = writer.send(Message::Close(None)).await;
            return SessionEnd::Shutdown;
        }

        // whatever is still queued was addressed to the previous session
        while self.outgoing_rx.try_recv().is_ok() {}

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(end) = self.dispatch(text.as_str()).await {
                                let _ = writer.send(Message::Close(None)).await;
                                return end;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", self.url);
                            return SessionEnd::Closed;
                        }
                        _ => {}
                    }
                }

                out = self.outgoing_rx.recv() => {
                    let Some(msg) = out else {
                        return SessionEnd::Shutdown;
                    };
                    let text = match msg.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Failed to encode outgoing message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        log::warn!("Failed to send to {}: {e}", self.url);
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }

    /// Feed one server message to the engine; `Some` ends the session.
    async fn dispatch(&self, text: &str) -> Option<SessionEnd> {
        let msg = match ServerMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode server message: {e}");
                return None;
            }
        };

        let update = self.engine.lock().await.handle(msg);
        match update {
            Ok(Update::Initialized { user_id }) => {
                *self.state.write().await = ConnectionState::Connected;
                self.emit(SyncEvent::Connected { user_id });
                self.emit(SyncEvent::StateChanged);
            }
            Ok(Update::Applied) => self.emit(SyncEvent::StateChanged),
            Ok(Update::Rejected { entry_id, error }) => {
                self.emit(SyncEvent::Rejected { entry_id, error });
                self.emit(SyncEvent::StateChanged);
            }
            Ok(Update::UndoApplied { undo_key }) => {
                self.emit(SyncEvent::UndoApplied { undo_key });
                self.emit(SyncEvent::StateChanged);
            }
            Err(e) => {
                log::warn!("Desynchronized from {}: {e}", self.url);
                self.emit(SyncEvent::Desynced);
                return Some(SessionEnd::Desynced);
            }
        }
        None
    }

    /// Queue `Disconnected`; a count that cannot be delivered now is
    /// added to the next one.
    fn report_disconnect(&mut self, lost: usize) {
        let lost_entries = lost + self.unreported_loss;
        match self.event_tx.try_send(SyncEvent::Disconnected { lost_entries }) {
            Ok(()) => self.unreported_loss = 0,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Event queue full, {lost_entries} lost entries not reported yet");
                self.unreported_loss = lost_entries;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if lost_entries > 0 {
                    log::warn!("Nobody listening, {lost_entries} lost entries unreported");
                }
                self.unreported_loss = 0;
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::debug!("Event queue full, dropping {event:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilelog_core::Rectangle;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:8088");
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_client_creation() {
        let client = SyncClient::with_url("ws://localhost:9090");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::with_url("ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.user_id().await, None);
        assert_eq!(client.pending_len().await, 0);
        assert_eq!(client.last_entry_id().await, 0);
    }

    #[tokio::test]
    async fn test_actions_refused_before_session() {
        let client = SyncClient::with_url("ws://localhost:9090");
        let result = client
            .run_action(|_| Action::FillRectangle {
                layer_ids: vec![1],
                rectangle: Rectangle::new(0, 0, 1, 1),
                tile_id: 1,
            })
            .await;
        assert_eq!(result, Err(ClientError::NotConnected));
        assert_eq!(client.try_undo().await, Err(ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_undo_groups_work_offline() {
        let client = SyncClient::with_url("ws://localhost:9090");
        let key = client.start_undo_group().await.unwrap();
        assert_eq!(client.end_undo_group().await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut client = SyncClient::with_url("ws://127.0.0.1:1");
        let result = client.connect().await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        // the failed attempt does not consume the client
        assert!(matches!(client.connect().await, Err(ProtocolError::Transport(_))));
    }

    #[tokio::test]
    async fn test_lost_entry_count_survives_full_event_queue() {
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let (_outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor {
            url: "ws://localhost:9090".to_string(),
            reconnect_delay: Duration::from_millis(10),
            engine: Arc::new(Mutex::new(ClientEngine::default())),
            state: Arc::new(RwLock::new(ConnectionState::Connected)),
            event_tx,
            outgoing_rx,
            shutdown_rx,
            unreported_loss: 0,
        };

        supervisor.emit(SyncEvent::StateChanged);
        supervisor.report_disconnect(2);
        assert_eq!(event_rx.recv().await, Some(SyncEvent::StateChanged));

        supervisor.report_disconnect(1);
        assert_eq!(
            event_rx.recv().await,
            Some(SyncEvent::Disconnected { lost_entries: 3 })
        );
        assert_eq!(supervisor.unreported_loss, 0);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::with_url("ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
