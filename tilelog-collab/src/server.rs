//! WebSocket log server for the shared document.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentRoom ── LogEngine (validate, commit, undo)
//! Client B ──┘        │
//!                     └── BroadcastGroup (one ordered channel)
//!                               │
//!                    ┌──────────┼───────────┐
//!                    ▼          ▼           ▼
//!                 Client A   Client B    Client C
//! ```
//!
//! Every connection is assigned a fresh user id, receives `InitialServer`
//! and then forwards the envelopes addressed to it. Validation, commit and
//! fan-out of one submission all happen under the room lock.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tilelog_core::{Action, EntryId, Layer, State, World};

use crate::broadcast::{BroadcastStats, ConnectionId};
use crate::log_engine::{LogEngine, SubmitError};
use crate::protocol::ClientMessage;
use crate::room::{DocumentRoom, JoinedSession};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Envelopes buffered per connection before it is dropped as lagging
    pub broadcast_capacity: usize,
    /// Initial world as JSON (None = empty 100x100 map)
    pub world_path: Option<PathBuf>,
    /// JSON array of actions committed before accepting connections
    pub seed_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8088".to_string(),
            broadcast_capacity: 1024,
            world_path: None,
            seed_path: None,
        }
    }
}

impl ServerConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `TILELOG_BIND` (or `PORT`),
    /// `TILELOG_BROADCAST_CAPACITY`, `TILELOG_WORLD` and `TILELOG_SEED`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("TILELOG_BIND") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        if let Some(raw) = lookup("TILELOG_BROADCAST_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
                _ => log::warn!(
                    "Ignoring TILELOG_BROADCAST_CAPACITY={raw}, using {}",
                    config.broadcast_capacity
                ),
            }
        }

        config.world_path = lookup("TILELOG_WORLD").map(PathBuf::from);
        config.seed_path = lookup("TILELOG_SEED").map(PathBuf::from);
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub committed_entries: u64,
    pub rejected_entries: u64,
    pub undos_applied: u64,
    pub lagged_connections: u64,
}

/// Startup failures.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("seed action rejected: {0}")]
    Seed(#[from] SubmitError),
}

/// The map a server starts from when no world file is configured.
pub fn default_world() -> World {
    let mut world = World::empty(100, 100);
    world
        .layers
        .push(Layer::tiles(1, "Ground", 100, 100, vec![0; 100 * 100]));
    world.nextlayerid = 2;
    world
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, BootstrapError> {
    let text = std::fs::read_to_string(path).map_err(|source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| BootstrapError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    room: Arc<Mutex<DocumentRoom>>,
    stats: Arc<RwLock<ServerStats>>,
    next_connection_id: Arc<AtomicU64>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, engine: LogEngine) -> Self {
        let room = DocumentRoom::new(engine, config.broadcast_capacity);
        Self {
            config,
            room: Arc::new(Mutex::new(room)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create with default configuration and the default world.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            LogEngine::new(State::new(default_world())),
        )
    }

    /// Load the configured world and commit the seed actions.
    ///
    /// A seed action that fails validation aborts startup.
    pub fn bootstrap(config: ServerConfig) -> Result<Self, BootstrapError> {
        let world = match &config.world_path {
            Some(path) => {
                let world: World = read_json(path)?;
                log::info!(
                    "Loaded world {}x{} with {} layers from {}",
                    world.width,
                    world.height,
                    world.layers.len(),
                    path.display()
                );
                world
            }
            None => default_world(),
        };

        let mut engine = LogEngine::new(State::new(world));
        if let Some(path) = &config.seed_path {
            let actions: Vec<Action> = read_json(path)?;
            let committed = engine.seed(actions)?;
            log::info!("Committed {committed} seed actions from {}", path.display());
        }

        Ok(Self::new(config, engine))
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let room = self.room.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, conn, room, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to `RemoveUser`.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn: ConnectionId,
        room: Arc<Mutex<DocumentRoom>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        let user_id = Uuid::new_v4().to_string();
        let session = room.lock().await.join(conn, user_id.clone()).await?;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::run_session(ws_stream, addr, conn, session, &room, &stats).await;

        room.lock().await.leave(conn, &user_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn run_session(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        conn: ConnectionId,
        session: JoinedSession,
        room: &Arc<Mutex<DocumentRoom>>,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let JoinedSession {
            initial,
            mut receiver,
            broadcast,
            ..
        } = session;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender.send(Message::Text(initial.encode()?.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_client_message(text.as_str(), addr, conn, room, stats).await;
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => Self::handle_client_message(text, addr, conn, room, stats).await,
                            Err(e) => log::warn!("Non UTF-8 binary frame from {addr}: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                envelope = receiver.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            if envelope.is_for(conn) {
                                ws_sender.send(Message::Text(envelope.payload.to_string().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // the client can only recover through a fresh InitialServer
                            log::warn!("Connection {conn} from {addr} lagged by {n} messages, closing");
                            broadcast.record_dropped(n);
                            stats.write().await.lagged_connections += 1;
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_client_message(
        text: &str,
        addr: SocketAddr,
        conn: ConnectionId,
        room: &Arc<Mutex<DocumentRoom>>,
        stats: &Arc<RwLock<ServerStats>>,
    ) {
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {addr}: {e}");
                return;
            }
        };
        stats.write().await.total_messages += 1;

        match msg {
            ClientMessage::Submit { entry } => {
                let committed = room.lock().await.submit(conn, entry).is_ok();
                let mut s = stats.write().await;
                if committed {
                    s.committed_entries += 1;
                } else {
                    s.rejected_entries += 1;
                }
            }
            ClientMessage::RequestUndo { undo_key } => {
                if room.lock().await.request_undo(&undo_key).is_some() {
                    stats.write().await.undos_applied += 1;
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Fan-out counters of the document's broadcast group.
    pub async fn broadcast_stats(&self) -> BroadcastStats {
        let broadcast = self.room.lock().await.broadcast().clone();
        broadcast.stats().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Current `(last_entry_id, state)` of the authoritative log.
    pub async fn snapshot(&self) -> (EntryId, State) {
        self.room.lock().await.engine().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8088");
        assert_eq!(config.broadcast_capacity, 1024);
        assert!(config.world_path.is_none());
        assert!(config.seed_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TILELOG_BIND", "0.0.0.0:9999"),
            ("PORT", "1234"),
            ("TILELOG_BROADCAST_CAPACITY", "64"),
            ("TILELOG_WORLD", "/tmp/world.json"),
        ]));
        assert_eq!(config.bind_addr, "0.0.0.0:9999");
        assert_eq!(config.broadcast_capacity, 64);
        assert_eq!(config.world_path, Some(PathBuf::from("/tmp/world.json")));
        assert!(config.seed_path.is_none());
    }

    #[test]
    fn test_config_port_fallback_and_bad_capacity() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "1234"),
            ("TILELOG_BROADCAST_CAPACITY", "lots"),
        ]));
        assert_eq!(config.bind_addr, "0.0.0.0:1234");
        assert_eq!(config.broadcast_capacity, 1024);
    }

    #[test]
    fn test_default_world_has_ground_layer() {
        let world = default_world();
        assert_eq!((world.width, world.height), (100, 100));
        let ground = world.grid_layer(1).unwrap();
        assert_eq!(ground.name, "Ground");
        assert_eq!(ground.grid().unwrap().data.len(), 10_000);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8088");
        let (last, state) = server.snapshot().await;
        assert_eq!(last, 0);
        assert!(state.users.is_empty());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.committed_entries, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_with_world_and_seed() {
        let dir = tempfile::tempdir().unwrap();
        let world_path = dir.path().join("world.json");
        let seed_path = dir.path().join("seed.json");

        let world = World::from_layers(vec![Layer::tiles(3, "base", 2, 2, vec![0; 4])], vec![]);
        std::fs::write(&world_path, world.to_json().unwrap()).unwrap();
        let mut seed = std::fs::File::create(&seed_path).unwrap();
        write!(
            seed,
            r#"[{{"type":"FillRectangle","layerIds":[3],"rectangle":{{"x":0,"y":0,"width":2,"height":1}},"tileId":4}}]"#
        )
        .unwrap();

        let config = ServerConfig {
            world_path: Some(world_path),
            seed_path: Some(seed_path),
            ..ServerConfig::default()
        };
        let server = SyncServer::bootstrap(config).unwrap();
        let (last, state) = server.snapshot().await;
        assert_eq!(last, 1);
        let layer = state.world.layer(3).unwrap();
        assert_eq!(layer.tile_at(1, 0), Some(4));
        assert_eq!(layer.tile_at(1, 1), Some(0));
    }

    #[test]
    fn test_bootstrap_rejected_seed_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("seed.json");
        std::fs::write(&seed_path, r#"[{"type":"SetLayerVisibility","layerId":77,"visibility":false}]"#)
            .unwrap();

        let config = ServerConfig {
            seed_path: Some(seed_path),
            ..ServerConfig::default()
        };
        assert!(matches!(
            SyncServer::bootstrap(config),
            Err(BootstrapError::Seed(_))
        ));
    }

    #[test]
    fn test_bootstrap_missing_world_file() {
        let config = ServerConfig {
            world_path: Some(PathBuf::from("/definitely/not/here.json")),
            ..ServerConfig::default()
        };
        assert!(matches!(
            SyncServer::bootstrap(config),
            Err(BootstrapError::Io { .. })
        ));
    }
}
