//! Authoritative document state: text, revision counter and history.
//!
//! ```text
//!  history_start                      revision
//!        │                               │
//!        ▼                               ▼
//!   ─────┼───┬───┬───┬───────────────┬───┤
//!        │ 1 │ 2 │ 3 │      ...      │ n │   AcceptedOp, revision = start + i + 1
//!   ─────┴───┴───┴───┴───────────────┴───┘
//! ```
//!
//! An operation based on revision `b` (with `history_start <= b <= revision`)
//! is rebased against every entry after `b` and appended as revision + 1.
//! The type is plain data; callers serialize access to it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tandem_core::{transform_against, ClientId, Operation, Revision};

use crate::error::SyncError;

/// Identifier of a document; also its routing key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An operation as it was applied to the authoritative document.
///
/// `operation.revision` is the state it was applied to, so it always equals
/// `revision - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedOp {
    pub document_id: DocumentId,
    /// Revision produced by applying the operation
    pub revision: Revision,
    pub operation: Operation,
}

impl AcceptedOp {
    pub fn client_id(&self) -> ClientId {
        self.operation.client_id
    }
}

/// Full document state at a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
    pub revision: Revision,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            revision: 0,
        }
    }
}

/// The single authoritative copy of one document.
#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    text: String,
    /// Length of `text` in chars
    len: usize,
    revision: Revision,
    history: VecDeque<Arc<AcceptedOp>>,
    max_history: usize,
}

impl Document {
    /// An empty document at revision 0.
    pub fn new(id: DocumentId, max_history: usize) -> Self {
        Self::from_snapshot(id, Snapshot::empty(), max_history)
    }

    /// A document resumed from a snapshot; history starts at the snapshot.
    pub fn from_snapshot(id: DocumentId, snapshot: Snapshot, max_history: usize) -> Self {
        Self {
            id,
            len: snapshot.text.chars().count(),
            text: snapshot.text,
            revision: snapshot.revision,
            history: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    /// Resume from a snapshot and replay the operations logged after it.
    ///
    /// Operations at or below the snapshot revision are skipped; a gap in the
    /// remaining sequence or an operation that does not fit is an error.
    pub fn restore<I>(
        id: DocumentId,
        snapshot: Snapshot,
        operations: I,
        max_history: usize,
    ) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = AcceptedOp>,
    {
        let mut doc = Self::from_snapshot(id, snapshot, max_history);
        for accepted in operations {
            if accepted.revision <= doc.revision {
                continue;
            }
            if accepted.revision != doc.revision + 1 {
                return Err(SyncError::StaleReference {
                    base: accepted.revision - 1,
                    current: doc.revision,
                });
            }
            doc.text = accepted.operation.apply(&doc.text)?;
            doc.len = accepted.operation.target_len();
            doc.push(accepted.operation.with_revision(doc.revision));
        }
        Ok(doc)
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Current length in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Oldest revision an operation may still be based on.
    pub fn history_start(&self) -> Revision {
        self.revision - self.history.len() as Revision
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            text: self.text.clone(),
            revision: self.revision,
        }
    }

    /// Accept an operation composed against `op.revision`.
    ///
    /// The operation is rebased over every history entry after its base
    /// revision, validated, applied, and appended as the next revision.
    /// Nothing changes when an error is returned.
    pub fn submit(&mut self, op: Operation) -> Result<Arc<AcceptedOp>, SyncError> {
        let base = op.revision;
        if base > self.revision || base < self.history_start() {
            return Err(SyncError::StaleReference {
                base,
                current: self.revision,
            });
        }

        let skip = (base - self.history_start()) as usize;
        let base_len = self
            .history
            .get(skip)
            .map_or(self.len, |entry| entry.operation.base_len());
        op.validate(base_len)?;

        let rebased = transform_against(
            &op,
            self.history.iter().skip(skip).map(|entry| &entry.operation),
        )?;
        let text = rebased.apply(&self.text)?;

        self.text = text;
        self.len = rebased.target_len();
        Ok(self.push(rebased.with_revision(self.revision)))
    }

    fn push(&mut self, operation: Operation) -> Arc<AcceptedOp> {
        self.revision += 1;
        let accepted = Arc::new(AcceptedOp {
            document_id: self.id.clone(),
            revision: self.revision,
            operation,
        });
        self.history.push_back(accepted.clone());
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        accepted
    }

    /// Operations with revision greater than `after`, oldest first.
    ///
    /// `None` when `after` is ahead of the document or older than the
    /// retained history.
    pub fn operations_since(&self, after: Revision) -> Option<Vec<Arc<AcceptedOp>>> {
        if after > self.revision || after < self.history_start() {
            return None;
        }
        let skip = (after - self.history_start()) as usize;
        Some(self.history.iter().skip(skip).cloned().collect())
    }

    /// Drop history entries at or below `floor`, then keep at most `max_len`.
    ///
    /// Returns the number of entries removed.
    pub fn truncate_history(&mut self, floor: Revision, max_len: usize) -> usize {
        let before = self.history.len();
        while let Some(front) = self.history.front() {
            if front.revision <= floor || self.history.len() > max_len {
                self.history.pop_front();
            } else {
                break;
            }
        }
        before - self.history.len()
    }
}
