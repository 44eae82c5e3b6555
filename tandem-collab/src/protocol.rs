//! Binary protocol between sync clients and the server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! client                                   server
//!   │ Join{doc, client, last_known} ──────►  │
//!   │ ◄────────────── Snapshot | CatchUp     │
//!   │ ◄────────────── PresenceSnapshot       │
//!   │ Edit{base_revision, operation} ─────►  │
//!   │ ◄──── Accepted (own) / Remote (others) │
//!   │ Ack{revision} ──────────────────────►  │
//! ```

use serde::{Deserialize, Serialize};
use tandem_core::{ClientId, Operation, Revision, Selection};
use thiserror::Error;

use crate::document::{AcceptedOp, DocumentId};
use crate::presence::PresenceUpdate;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Attach to a document. `last_known_revision` is the last revision the
    /// client has applied, or `None` on a first visit.
    Join {
        document_id: DocumentId,
        client_id: ClientId,
        last_known_revision: Option<Revision>,
    },
    Edit {
        base_revision: Revision,
        operation: Operation,
    },
    Ack { revision: Revision },
    Presence { selection: Option<Selection> },
    Leave,
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full document state; replaces whatever the client holds.
    Snapshot { text: String, revision: Revision },
    /// Missed operations in revision order, oldest first.
    CatchUp {
        operations: Vec<AcceptedOp>,
        revision: Revision,
    },
    /// The client's own edit, as applied.
    Accepted {
        revision: Revision,
        operation: Operation,
    },
    /// Another client's edit, as applied.
    Remote {
        revision: Revision,
        operation: Operation,
    },
    PresenceSnapshot { peers: Vec<PresenceUpdate> },
    Presence {
        client_id: ClientId,
        selection: Option<Selection>,
    },
    Error { kind: ErrorKind, message: String },
    Pong,
}

/// Error classes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorKind {
    InvalidOperation = 1,
    StaleReference = 2,
    SessionNotFound = 3,
    DocumentNotFound = 4,
    CapacityExceeded = 5,
    Draining = 6,
    DeliveryOverflow = 7,
    Protocol = 8,
    Internal = 9,
}

impl ServerMessage {
    /// Wire form of an accepted operation, depending on who submitted it.
    pub fn for_recipient(op: &AcceptedOp, recipient: ClientId) -> Self {
        if op.operation.client_id == recipient {
            ServerMessage::Accepted {
                revision: op.revision,
                operation: op.operation.clone(),
            }
        } else {
            ServerMessage::Remote {
                revision: op.revision,
                operation: op.operation.clone(),
            }
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

/// Serialize a message to its binary wire format.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserialize a message from its binary wire format.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
