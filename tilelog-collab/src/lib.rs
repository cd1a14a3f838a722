//! # tilelog-collab — server-ordered action log and client reconciliation
//!
//! The server owns the one true sequence of actions. Clients apply their
//! own edits immediately and reconcile once the server has ordered them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄────────────────► │ SyncServer   │
//! │ (per user)   │     JSON frames    │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ ClientEngine │                    │ LogEngine    │
//! │ (optimistic) │                    │ (authority)  │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (ordered)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`log_engine`] — validate, commit, undo by replay
//! - [`broadcast`] — ordered fan-out with per-connection addressing
//! - [`room`] — engine and broadcast under one lock
//! - [`server`] — WebSocket server and bootstrap
//! - [`reconcile`] — client-side optimistic merge
//! - [`client`] — WebSocket client with reconnect

pub mod broadcast;
pub mod client;
pub mod log_engine;
pub mod protocol;
pub mod reconcile;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Envelope, Target};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use log_engine::{LogEngine, SubmitError, UndoCheckpoint, UndoReport};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use reconcile::{Baseline, ClientEngine, ClientError, DesyncError, LocalLog, Update};
pub use room::{DocumentRoom, JoinedSession};
pub use server::{default_world, BootstrapError, ServerConfig, ServerStats, SyncServer};
