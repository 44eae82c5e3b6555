//! In-process persistence, used when no storage path is configured.
//!
//! Snapshots are kept LZ4-compressed as they would be on disk so that the
//! encode path is exercised the same way.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tandem_core::Revision;
use uuid::Uuid;

use super::{decode, encode, Persistence, StoreError, StoredDocument};
use crate::document::{AcceptedOp, DocumentId, Snapshot};

#[derive(Default)]
struct Entry {
    /// bincode + LZ4
    snapshot: Option<Vec<u8>>,
    snapshot_revision: Revision,
    operations: BTreeMap<Revision, AcceptedOp>,
}

#[derive(Default)]
struct State {
    documents: HashMap<DocumentId, Entry>,
    leases: HashMap<DocumentId, Uuid>,
}

/// Persistence backed by process memory.
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
    snapshots_saved: AtomicU64,
    operations_appended: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            snapshots_saved: AtomicU64::new(0),
            operations_appended: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn snapshots_saved(&self) -> u64 {
        self.snapshots_saved.load(Ordering::Relaxed)
    }

    pub fn operations_appended(&self) -> u64 {
        self.operations_appended.load(Ordering::Relaxed)
    }

    /// Current lease holder of a document.
    pub fn lease_owner(&self, document: &DocumentId) -> Option<Uuid> {
        self.state.lock().leases.get(document).copied()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }
}

impl Persistence for MemoryStore {
    fn acquire(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock();
        match state.leases.get(document) {
            Some(holder) if *holder != owner => Err(StoreError::LeaseHeld {
                document: document.clone(),
                owner: *holder,
            }),
            _ => {
                state.leases.insert(document.clone(), owner);
                Ok(())
            }
        }
    }

    fn release(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock();
        if state.leases.get(document) == Some(&owner) {
            state.leases.remove(document);
        }
        Ok(())
    }

    fn load(&self, document: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.check()?;
        let state = self.state.lock();
        let Some(entry) = state.documents.get(document) else {
            return Ok(None);
        };

        let snapshot = match &entry.snapshot {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                decode(&bytes)?
            }
            None => Snapshot::empty(),
        };
        Ok(Some(StoredDocument {
            snapshot,
            operations: entry.operations.values().cloned().collect(),
        }))
    }

    fn save_snapshot(&self, document: &DocumentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check()?;
        let compressed = lz4_flex::compress_prepend_size(&encode(snapshot)?);

        let mut state = self.state.lock();
        let entry = state.documents.entry(document.clone()).or_default();
        if snapshot.revision < entry.snapshot_revision {
            return Ok(());
        }
        entry.snapshot = Some(compressed);
        entry.snapshot_revision = snapshot.revision;
        entry.operations = entry.operations.split_off(&(snapshot.revision + 1));
        self.snapshots_saved.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn append_operation(&self, op: &AcceptedOp) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock();
        let entry = state.documents.entry(op.document_id.clone()).or_default();

        let expected = entry
            .operations
            .keys()
            .next_back()
            .copied()
            .unwrap_or(entry.snapshot_revision)
            + 1;
        if op.revision != expected {
            return Err(StoreError::OutOfOrder {
                document: op.document_id.clone(),
                expected,
                actual: op.revision,
            });
        }
        entry.operations.insert(op.revision, op.clone());
        self.operations_appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn operations_since(
        &self,
        document: &DocumentId,
        after: Revision,
    ) -> Result<Vec<AcceptedOp>, StoreError> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .documents
            .get(document)
            .map(|entry| entry.operations.range(after + 1..).map(|(_, op)| op.clone()).collect())
            .unwrap_or_default())
    }
}
