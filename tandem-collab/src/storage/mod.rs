//! Persistence collaborator for document snapshots and accepted operations.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append_operation   ┌──────────────────────┐
//! │ DocumentRegistry │ ──────────────────► │ dyn Persistence      │
//! │ (in-memory rooms)│  save_snapshot      │  MemoryStore         │
//! └────────┬─────────┘                     │  RocksStore (feature)│
//!          │ first attach: acquire + load  └──────────────────────┘
//!          ▼
//!   Document::restore(snapshot, operations)
//! ```
//!
//! The store never interprets document text; it keeps the latest snapshot,
//! the operations accepted after it, and one ownership lease per document.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use tandem_core::Revision;
use thiserror::Error;
use uuid::Uuid;

use crate::document::{AcceptedOp, DocumentId, Snapshot};

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, StoreConfig};

/// What the store holds for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub snapshot: Snapshot,
    /// Operations accepted after `snapshot.revision`, in revision order
    pub operations: Vec<AcceptedOp>,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// Another instance holds the ownership lease.
    #[error("lease on {document} held by {owner}")]
    LeaseHeld { document: DocumentId, owner: Uuid },
    #[error("out of order append to {document}: expected revision {expected}, got {actual}")]
    OutOfOrder {
        document: DocumentId,
        expected: Revision,
        actual: Revision,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home of documents that leave memory.
///
/// Implementations are shared across connection tasks and must be cheap to
/// call from async code.
pub trait Persistence: Send + Sync {
    /// Claim authoritative ownership of `document` for instance `owner`.
    ///
    /// Re-acquiring an own lease succeeds; a lease held by another instance
    /// fails with [`StoreError::LeaseHeld`].
    fn acquire(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError>;

    /// Give up ownership. Releasing a lease not held by `owner` is a no-op.
    fn release(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError>;

    /// Latest snapshot plus the operations logged after it.
    fn load(&self, document: &DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    /// Store a snapshot and drop logged operations it covers.
    fn save_snapshot(&self, document: &DocumentId, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Log one accepted operation.
    fn append_operation(&self, op: &AcceptedOp) -> Result<(), StoreError>;

    /// Logged operations with revision greater than `after`.
    fn operations_since(
        &self,
        document: &DocumentId,
        after: Revision,
    ) -> Result<Vec<AcceptedOp>, StoreError>;
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
