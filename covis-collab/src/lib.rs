//! # covis-collab: scene synchronization server for Covis
//!
//! Keeps every connected client eventually consistent on a shared scene of
//! containers and syncables. Clients push partial updates; the server merges
//! them into authoritative state and relays them to everyone else.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer   │
//! │ (per user)  │     Binary Proto    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │ one Session per connection
//!                                     ┌──────┴───────┐
//!                                     │   SyncHub    │
//!                                     ├──────────────┤
//!                                     │ SceneStore   │  mutex, merge, index
//!                                     │ Registry     │  fan-out except sender
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`store`]: Container store and syncable index
//! - [`registry`]: Subscriber channels and broadcast-except-sender
//! - [`session`]: Per-connection state machine and shared hub
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod protocol;
pub mod store;
pub mod registry;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use store::{SceneStore, StoreEntry, StoreError};
pub use registry::{BroadcastStats, SubscriberRegistry};
pub use session::{
    BroadcastOrdering, CloseReason, Disposition, Session, SessionError, SessionState, SyncHub,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
