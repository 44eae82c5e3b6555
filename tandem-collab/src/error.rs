use tandem_core::{ClientId, OtError, Revision};
use thiserror::Error;
use uuid::Uuid;

use crate::document::DocumentId;
use crate::protocol::{ErrorKind, ProtocolError};
use crate::storage::StoreError;

/// Errors surfaced by the synchronization core.
///
/// Every variant except [`SyncError::PersistenceUnavailable`] and
/// [`SyncError::OwnershipConflict`] is local to the session that caused it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed edit, rejected before touching document state.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] OtError),

    /// The client referenced a revision the server cannot rebase from.
    #[error("stale reference: base revision {base}, document at revision {current}")]
    StaleReference { base: Revision, current: Revision },

    #[error("no session attached for {0}")]
    SessionNotFound(ClientId),

    #[error("document {0} is not loaded on this instance")]
    DocumentNotFound(DocumentId),

    #[error("instance at capacity ({limit} sessions)")]
    CapacityExceeded { limit: usize },

    #[error("instance is draining and refuses new sessions")]
    Draining,

    #[error("delivery queue of {client} overflowed, {missed} operations skipped")]
    DeliveryOverflow { client: ClientId, missed: u64 },

    /// Fatal: a document had to leave memory but could not be made durable.
    #[error("persistence unavailable for document {document}: {source}")]
    PersistenceUnavailable {
        document: DocumentId,
        #[source]
        source: StoreError,
    },

    /// Fatal: another instance holds authoritative state for the document.
    #[error("document {document} is owned by instance {owner}")]
    OwnershipConflict { document: DocumentId, owner: Uuid },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Conditions that indicate a broken deployment rather than a bad client.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::PersistenceUnavailable { .. } | SyncError::OwnershipConflict { .. }
        )
    }

    /// Whether the affected session must be brought back with a catch-up or snapshot.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SyncError::StaleReference { .. }
                | SyncError::DeliveryOverflow { .. }
                | SyncError::InvalidOperation(_)
        )
    }

    /// Wire representation sent back to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            SyncError::StaleReference { .. } => ErrorKind::StaleReference,
            SyncError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            SyncError::DocumentNotFound(_) => ErrorKind::DocumentNotFound,
            SyncError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            SyncError::Draining => ErrorKind::Draining,
            SyncError::DeliveryOverflow { .. } => ErrorKind::DeliveryOverflow,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::PersistenceUnavailable { .. }
            | SyncError::OwnershipConflict { .. }
            | SyncError::Store(_)
            | SyncError::Io(_) => ErrorKind::Internal,
        }
    }
}
