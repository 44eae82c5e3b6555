//! # tandem-collab: real-time collaborative text synchronization
//!
//! Server and client halves of an operational-transformation sync protocol
//! over WebSockets, built on the operation model of `tandem-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer         │
//! │ (per user)  │     Binary Proto    │  SessionCoordinator│
//! └──────┬──────┘                     └─────────┬──────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────┐                     ┌──────────────────┐
//! │ClientDocument│                     │ DocumentRegistry │
//! │ (local OT)   │                     │ Document + rooms │
//! └──────────────┘                     └────────┬─────────┘
//!                                               │
//!                                      ┌────────┴────────┐
//!                                      │ Persistence     │
//!                                      │ memory | RocksDB│
//!                                      └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: authoritative text, revision counter and history
//! - [`registry`]: open documents, ownership leases, eviction
//! - [`session`]: client sessions, catch-up, sweeps and draining
//! - [`broadcast`]: per-document fan-out with bounded delivery queues
//! - [`presence`]: throttled cursor and selection sharing
//! - [`protocol`]: binary wire protocol (bincode)
//! - [`server`]: WebSocket sync server
//! - [`client`]: client state machine and WebSocket client
//! - [`health`]: liveness, readiness and drain endpoints
//! - [`storage`]: snapshot and operation-log persistence

pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod health;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Delivery, DeliveryQueue};
pub use client::{ClientDocument, ClientState, ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig, SyncConfig};
pub use document::{AcceptedOp, Document, DocumentId, Snapshot};
pub use error::SyncError;
pub use health::{HealthReport, Readiness};
pub use presence::{PresenceRoom, PresenceUpdate};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
pub use registry::{DocumentRegistry, DocumentRoom};
pub use server::{ServerStats, SyncServer};
pub use session::{Attachment, ClientSession, DeliveryMode, InitialState, SessionCoordinator};
pub use storage::{MemoryStore, Persistence, StoreError, StoredDocument};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksStore, StoreConfig};
