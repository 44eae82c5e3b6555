//! Resident documents of this instance.
//!
//! ```text
//! DocumentRegistry ── RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>
//!                              │
//!              ┌───────────────┼────────────────────┐
//!              ▼               ▼                    ▼
//!        Mutex<Document>  BroadcastGroup      PresenceRoom
//!        (one writer)     (ordered fan-out)   (own lock)
//! ```
//!
//! The map lock is only held for lookups and inserts. Each document is its
//! own serialization domain: an edit locks exactly one `Document`, rebases,
//! applies, publishes and logs it, then releases. Rooms of different
//! documents never contend.

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tandem_core::{Operation, Revision};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::config::SyncConfig;
use crate::document::{AcceptedOp, Document, DocumentId};
use crate::error::SyncError;
use crate::presence::PresenceRoom;
use crate::storage::{Persistence, StoreError};

/// One resident document with its delivery and presence channels.
pub struct DocumentRoom {
    id: DocumentId,
    document: Mutex<Document>,
    broadcast: BroadcastGroup,
    presence: PresenceRoom,
    sessions: AtomicUsize,
    idle_since: SyncMutex<Option<Instant>>,
    /// Mirrors the document revision for lock-free reads
    head: AtomicU64,
    /// Revision of the last snapshot pushed to persistence
    durable: AtomicU64,
    /// The operation log lost an entry; the next write must be a snapshot
    log_broken: AtomicBool,
    evicted: AtomicBool,
}

impl DocumentRoom {
    fn new(document: Document, durable: Revision, config: &SyncConfig) -> Self {
        Self {
            id: document.id().clone(),
            head: AtomicU64::new(document.revision()),
            document: Mutex::new(document),
            broadcast: BroadcastGroup::new(config.delivery_capacity),
            presence: PresenceRoom::new(
                config.presence_interval,
                config.presence_timeout,
                config.delivery_capacity,
            ),
            sessions: AtomicUsize::new(0),
            idle_since: SyncMutex::new(Some(Instant::now())),
            durable: AtomicU64::new(durable),
            log_broken: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Enter the document's serialization domain.
    pub async fn lock(&self) -> MutexGuard<'_, Document> {
        self.document.lock().await
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    /// Current revision, read without locking.
    pub fn revision(&self) -> Revision {
        self.head.load(Ordering::Acquire)
    }

    pub fn durable_revision(&self) -> Revision {
        self.durable.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    /// True once the room left the registry; attaching to it is pointless.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn session_attached(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
        *self.idle_since.lock() = None;
    }

    /// Returns true when this was the last session.
    pub(crate) fn session_detached(&self, now: Instant) -> bool {
        let previous = self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let last = previous <= 1;
        if last {
            *self.idle_since.lock() = Some(now);
        }
        last
    }

    fn idle_since(&self) -> Option<Instant> {
        *self.idle_since.lock()
    }
}

/// Outcome of an eviction pass.
#[derive(Debug, Default)]
pub struct EvictionReport {
    pub evicted: Vec<DocumentId>,
    /// Fatal failures; the affected rooms stay resident
    pub failures: Vec<SyncError>,
}

/// Every document this instance is authoritative for.
pub struct DocumentRegistry {
    instance_id: Uuid,
    config: SyncConfig,
    store: Arc<dyn Persistence>,
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
}

impl DocumentRegistry {
    pub fn new(config: SyncConfig, store: Arc<dyn Persistence>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            config,
            store,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Identity used for ownership leases.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The resident room of a document, loading it from persistence first.
    pub async fn open(&self, id: &DocumentId) -> Result<Arc<DocumentRoom>, SyncError> {
        if let Some(room) = self.rooms.read().await.get(id) {
            return Ok(room.clone());
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(id) {
            return Ok(room.clone());
        }

        self.store
            .acquire(id, self.instance_id)
            .map_err(|e| self.ownership_error(id, e))?;

        let (document, durable) = match self.store.load(id)? {
            Some(stored) => {
                let durable = stored.snapshot.revision;
                let restored = Document::restore(
                    id.clone(),
                    stored.snapshot,
                    stored.operations,
                    self.config.max_history,
                )?;
                log::info!(
                    "Loaded document {id} at revision {} (snapshot {durable})",
                    restored.revision()
                );
                (restored, durable)
            }
            None => {
                log::info!("Created document {id}");
                (Document::new(id.clone(), self.config.max_history), 0)
            }
        };

        let room = Arc::new(DocumentRoom::new(document, durable, &self.config));
        rooms.insert(id.clone(), room.clone());
        Ok(room)
    }

    fn ownership_error(&self, id: &DocumentId, err: StoreError) -> SyncError {
        match err {
            StoreError::LeaseHeld { owner, .. } => {
                log::error!(
                    "Document {id} is owned by instance {owner}; refusing to load a second authoritative copy"
                );
                SyncError::OwnershipConflict {
                    document: id.clone(),
                    owner,
                }
            }
            other => SyncError::Store(other),
        }
    }

    pub async fn get(&self, id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn rooms(&self) -> Vec<Arc<DocumentRoom>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn document_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Accept an operation on a room.
    ///
    /// Inside the document lock: rebase and apply, shift presence, publish
    /// to every delivery queue, log to persistence. Socket writes happen
    /// later in each connection task.
    pub async fn apply(
        &self,
        room: &DocumentRoom,
        operation: Operation,
    ) -> Result<Arc<AcceptedOp>, SyncError> {
        let mut document = room.lock().await;
        let accepted = document.submit(operation)?;
        room.head.store(accepted.revision, Ordering::Release);

        room.presence.transform(&accepted);
        let receivers = room.broadcast.publish(accepted.clone());
        log::debug!(
            "{} applied {} as revision {} ({receivers} receivers)",
            room.id,
            accepted.client_id(),
            accepted.revision
        );

        self.record(room, &document, &accepted);
        Ok(accepted)
    }

    /// Log an accepted operation; push a snapshot when one is due.
    fn record(&self, room: &DocumentRoom, document: &Document, accepted: &AcceptedOp) {
        let due = accepted.revision - room.durable_revision() >= self.config.snapshot_interval.max(1);
        if due || room.log_broken.load(Ordering::Acquire) {
            match self.save_snapshot(room, document) {
                Ok(()) => room.log_broken.store(false, Ordering::Release),
                Err(e) => {
                    log::warn!("Snapshot of {} at revision {} failed: {e}", room.id, accepted.revision);
                    room.log_broken.store(true, Ordering::Release);
                }
            }
            return;
        }

        if let Err(e) = self.store.append_operation(accepted) {
            log::warn!("Logging revision {} of {} failed: {e}", accepted.revision, room.id);
            room.log_broken.store(true, Ordering::Release);
        }
    }

    fn save_snapshot(&self, room: &DocumentRoom, document: &Document) -> Result<(), StoreError> {
        self.store.save_snapshot(&room.id, &document.snapshot())?;
        room.durable.store(document.revision(), Ordering::Release);
        Ok(())
    }

    /// Push a snapshot of a room if it has unsaved revisions.
    pub async fn persist(&self, room: &DocumentRoom) -> Result<(), SyncError> {
        let document = room.lock().await;
        if document.revision() == room.durable_revision() && !room.log_broken.load(Ordering::Acquire) {
            return Ok(());
        }
        self.save_snapshot(room, &document)?;
        room.log_broken.store(false, Ordering::Release);
        Ok(())
    }

    /// Drop history no session can need any more.
    ///
    /// Entries at or below `floor` go, but the newest `catch_up_threshold`
    /// revisions stay so reconnecting sessions can still catch up.
    pub async fn trim_history(&self, room: &DocumentRoom, floor: Revision) -> usize {
        let mut document = room.lock().await;
        let keep_from = document
            .revision()
            .saturating_sub(self.config.catch_up_threshold);
        document.truncate_history(floor.min(keep_from), self.config.max_history)
    }

    /// Evict rooms that have had no session for the grace period.
    ///
    /// A room is only removed once its state is durable. When no snapshot
    /// can be stored the room stays resident and the failure is fatal.
    pub async fn evict_idle(&self, now: Instant) -> EvictionReport {
        let mut report = EvictionReport::default();
        let candidates: Vec<Arc<DocumentRoom>> = self
            .rooms()
            .await
            .into_iter()
            .filter(|room| {
                room.session_count() == 0
                    && room
                        .idle_since()
                        .is_some_and(|since| now.saturating_duration_since(since) >= self.config.eviction_grace)
            })
            .collect();

        for room in candidates {
            if let Err(e) = self.persist(&room).await {
                let fatal = SyncError::PersistenceUnavailable {
                    document: room.id.clone(),
                    source: match e {
                        SyncError::Store(source) => source,
                        other => StoreError::Unavailable(other.to_string()),
                    },
                };
                log::error!("Cannot evict {}: {fatal}", room.id);
                report.failures.push(fatal);
                continue;
            }

            let mut rooms = self.rooms.write().await;
            // A session may have arrived while the snapshot was written.
            let Ok(document) = room.document.try_lock() else {
                continue;
            };
            if room.session_count() > 0 || document.revision() != room.durable_revision() {
                continue;
            }
            room.evicted.store(true, Ordering::Release);
            rooms.remove(&room.id);
            drop(document);

            // Released under the map lock: a concurrent `open` re-acquires
            // only after the lease is gone.
            if let Err(e) = self.store.release(&room.id, self.instance_id) {
                log::warn!("Releasing lease of {} failed: {e}", room.id);
            }
            drop(rooms);
            log::info!("Evicted idle document {}", room.id);
            report.evicted.push(room.id.clone());
        }

        report
    }

    /// Persist every room and give up all leases.
    pub async fn shutdown(&self) -> Vec<SyncError> {
        let mut failures = Vec::new();
        let mut resident = self.rooms.write().await;
        let rooms: Vec<Arc<DocumentRoom>> = resident.drain().map(|(_, r)| r).collect();
        for room in rooms {
            room.evicted.store(true, Ordering::Release);
            match self.persist(&room).await {
                Ok(()) => {
                    if let Err(e) = self.store.release(&room.id, self.instance_id) {
                        log::warn!("Releasing lease of {} failed: {e}", room.id);
                    }
                }
                Err(e) => {
                    log::error!("Document {} could not be saved on shutdown: {e}", room.id);
                    failures.push(e);
                }
            }
        }
        drop(resident);
        failures
    }

    /// Operations after `after` read back from the persisted log.
    ///
    /// Serves sessions older than the in-memory history. `None` unless the
    /// log holds every revision from `after + 1` to `head`.
    pub fn logged_operations(
        &self,
        id: &DocumentId,
        after: Revision,
        head: Revision,
    ) -> Option<Vec<Arc<AcceptedOp>>> {
        let operations = match self.store.operations_since(id, after) {
            Ok(operations) => operations,
            Err(e) => {
                log::warn!("Reading the log of {id} after {after} failed: {e}");
                return None;
            }
        };
        let complete = operations.len() as u64 == head.saturating_sub(after)
            && operations.iter().zip(after + 1..).all(|(op, rev)| op.revision == rev);
        complete.then(|| operations.into_iter().map(Arc::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Snapshot;
    use crate::storage::{MemoryStore, StoredDocument};
    use std::time::Duration;
    use tandem_core::ClientId;

    fn config() -> SyncConfig {
        SyncConfig {
            snapshot_interval: 3,
            eviction_grace: Duration::from_secs(10),
            ..SyncConfig::default()
        }
    }

    fn registry(store: Arc<MemoryStore>) -> DocumentRegistry {
        DocumentRegistry::new(config(), store)
    }

    async fn type_chars(registry: &DocumentRegistry, room: &DocumentRoom, n: usize) {
        for _ in 0..n {
            let rev = room.revision();
            let len = room.lock().await.len();
            registry
                .apply(room, Operation::insert_at(ClientId(1), rev, len, len, "a"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = DocumentId::new("doc1");
        let a = registry.open(&id).await.unwrap();
        let b = registry.open(&id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_apply_publishes_and_logs() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let room = registry.open(&DocumentId::new("doc1")).await.unwrap();
        let mut queue = room.broadcast().subscribe(ClientId(2), 0);

        type_chars(&registry, &room, 2).await;
        assert_eq!(room.revision(), 2);
        assert_eq!(store.operations_appended(), 2);
        assert!(matches!(queue.try_next(), Some(crate::broadcast::Delivery::Op(op)) if op.revision == 1));

        // Third revision reaches the snapshot interval.
        type_chars(&registry, &room, 1).await;
        assert_eq!(store.snapshots_saved(), 1);
        assert_eq!(room.durable_revision(), 3);
    }

    #[tokio::test]
    async fn test_reload_after_eviction() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let id = DocumentId::new("doc1");
        let room = registry.open(&id).await.unwrap();
        type_chars(&registry, &room, 5).await;

        let later = Instant::now() + Duration::from_secs(11);
        let report = registry.evict_idle(later).await;
        assert_eq!(report.evicted, vec![id.clone()]);
        assert!(room.is_evicted());
        assert_eq!(store.lease_owner(&id), None);

        let reloaded = registry.open(&id).await.unwrap();
        assert_eq!(reloaded.revision(), 5);
        assert_eq!(reloaded.lock().await.text(), "aaaaa");
    }

    /// Store whose next `release` blocks until the test lets it finish.
    struct SlowReleaseStore {
        inner: MemoryStore,
        armed: AtomicBool,
        entered: SyncMutex<std::sync::mpsc::Sender<()>>,
        resume: SyncMutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Persistence for SlowReleaseStore {
        fn acquire(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError> {
            self.inner.acquire(document, owner)
        }

        fn release(&self, document: &DocumentId, owner: Uuid) -> Result<(), StoreError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                let _ = self.entered.lock().send(());
                let _ = self.resume.lock().recv();
            }
            self.inner.release(document, owner)
        }

        fn load(&self, document: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.load(document)
        }

        fn save_snapshot(&self, document: &DocumentId, snapshot: &Snapshot) -> Result<(), StoreError> {
            self.inner.save_snapshot(document, snapshot)
        }

        fn append_operation(&self, op: &AcceptedOp) -> Result<(), StoreError> {
            self.inner.append_operation(op)
        }

        fn operations_since(
            &self,
            document: &DocumentId,
            after: Revision,
        ) -> Result<Vec<AcceptedOp>, StoreError> {
            self.inner.operations_since(document, after)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reopen_during_eviction_keeps_lease() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel();
        let store = Arc::new(SlowReleaseStore {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
            entered: SyncMutex::new(entered_tx),
            resume: SyncMutex::new(resume_rx),
        });
        let registry = Arc::new(DocumentRegistry::new(config(), store.clone()));
        let id = DocumentId::new("doc1");
        let room = registry.open(&id).await.unwrap();
        type_chars(&registry, &room, 1).await;

        store.armed.store(true, Ordering::SeqCst);
        let evicting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.evict_idle(Instant::now() + Duration::from_secs(11)).await }
        });
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let reopening = tokio::spawn({
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.open(&id).await.map(|room| room.revision()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reopening.is_finished());

        resume_tx.send(()).unwrap();
        assert_eq!(evicting.await.unwrap().evicted, vec![id.clone()]);
        assert_eq!(reopening.await.unwrap().unwrap(), 1);

        assert_eq!(store.inner.lease_owner(&id), Some(registry.instance_id()));
        let other = DocumentRegistry::new(config(), store.clone());
        assert!(matches!(
            other.open(&id).await,
            Err(SyncError::OwnershipConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_logged_operations_need_complete_log() {
        let store = Arc::new(MemoryStore::new());
        let registry = DocumentRegistry::new(
            SyncConfig { snapshot_interval: 4, ..SyncConfig::default() },
            store.clone(),
        );
        let id = DocumentId::new("doc1");
        let room = registry.open(&id).await.unwrap();
        type_chars(&registry, &room, 6).await;

        // Revisions 5 and 6 follow the snapshot at 4.
        let logged = registry.logged_operations(&id, 4, 6).unwrap();
        let revisions: Vec<_> = logged.iter().map(|op| op.revision).collect();
        assert_eq!(revisions, vec![5, 6]);
        assert!(registry.logged_operations(&id, 6, 6).unwrap().is_empty());
        // Compacted into the snapshot.
        assert!(registry.logged_operations(&id, 2, 6).is_none());
    }

    #[tokio::test]
    async fn test_eviction_waits_for_grace_and_sessions() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let room = registry.open(&DocumentId::new("doc1")).await.unwrap();
        assert!(registry.evict_idle(Instant::now()).await.evicted.is_empty());

        room.session_attached();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(registry.evict_idle(later).await.evicted.is_empty());

        assert!(room.session_detached(Instant::now()));
        assert_eq!(registry.evict_idle(later).await.evicted.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_without_persistence_is_fatal_and_keeps_room() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let id = DocumentId::new("doc1");
        let room = registry.open(&id).await.unwrap();
        type_chars(&registry, &room, 1).await;

        store.set_available(false);
        let report = registry.evict_idle(Instant::now() + Duration::from_secs(11)).await;
        assert!(report.evicted.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].is_fatal());
        assert!(registry.get(&id).await.is_some());
        assert!(!room.is_evicted());
    }

    #[tokio::test]
    async fn test_foreign_lease_is_ownership_conflict() {
        let store = Arc::new(MemoryStore::new());
        let other_instance = Uuid::new_v4();
        let id = DocumentId::new("doc1");
        store.acquire(&id, other_instance).unwrap();

        let registry = registry(store);
        let err = registry.open(&id).await.err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, SyncError::OwnershipConflict { owner, .. } if owner == other_instance));
    }

    #[tokio::test]
    async fn test_log_outage_recovers_with_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let registry = DocumentRegistry::new(
            SyncConfig { snapshot_interval: 100, ..SyncConfig::default() },
            store.clone(),
        );
        let id = DocumentId::new("doc1");
        let room = registry.open(&id).await.unwrap();
        type_chars(&registry, &room, 1).await;

        store.set_available(false);
        type_chars(&registry, &room, 1).await;
        store.set_available(true);
        type_chars(&registry, &room, 1).await;

        let stored = store.load(&id).unwrap().unwrap();
        assert_eq!(stored.snapshot.revision, 3);
        assert_eq!(stored.snapshot.text, "aaa");
    }

    #[tokio::test]
    async fn test_trim_history_keeps_catch_up_window() {
        let registry = DocumentRegistry::new(
            SyncConfig { catch_up_threshold: 4, ..SyncConfig::default() },
            Arc::new(MemoryStore::new()),
        );
        let room = registry.open(&DocumentId::new("doc1")).await.unwrap();
        type_chars(&registry, &room, 10).await;

        assert_eq!(registry.trim_history(&room, 9).await, 6);
        assert_eq!(room.lock().await.history_start(), 6);
    }

    #[tokio::test]
    async fn test_shutdown_persists_everything() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let id = DocumentId::new("doc1");
        let room = registry.open(&id).await.unwrap();
        type_chars(&registry, &room, 2).await;

        assert!(registry.shutdown().await.is_empty());
        assert_eq!(registry.document_count().await, 0);
        assert_eq!(store.load(&id).unwrap().unwrap().snapshot.revision, 2);
    }
}
