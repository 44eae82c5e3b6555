//! Session coordinator: which client is attached to which document.
//!
//! A session is created by [`SessionCoordinator::attach`] and destroyed by
//! [`detach`](SessionCoordinator::detach), by idle expiry, or by the same
//! client attaching again. Destroying a session drops its delivery queue
//! with whatever it still buffered.
//!
//! Attach reads the initial state and subscribes to the broadcast channel
//! under the document lock, so the first queued revision is exactly the one
//! after the initial state.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tandem_core::{ClientId, Operation, Revision, Selection};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::broadcast::DeliveryQueue;
use crate::config::SyncConfig;
use crate::document::{AcceptedOp, Document, DocumentId, Snapshot};
use crate::error::SyncError;
use crate::health::Readiness;
use crate::presence::PresenceUpdate;
use crate::registry::{DocumentRegistry, DocumentRoom};

const OPEN_ATTEMPTS: usize = 3;

/// How a session's delivery stream currently behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryMode {
    Live,
    /// Lost revisions; waiting for a catch-up or snapshot
    Resync,
}

/// Bookkeeping of one attached client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    pub client_id: ClientId,
    pub session_id: Uuid,
    pub document_id: DocumentId,
    pub last_ack: Revision,
    pub last_delivered: Revision,
    pub mode: DeliveryMode,
    pub last_seen: Instant,
}

struct SessionEntry {
    session: ClientSession,
    room: Arc<DocumentRoom>,
    /// Fired when the session is replaced or expired
    kick: Option<oneshot::Sender<()>>,
}

/// State handed to a client when it (re)joins or resyncs.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialState {
    Snapshot(Snapshot),
    /// Operations after the client's revision, oldest first
    CatchUp {
        operations: Vec<Arc<AcceptedOp>>,
        revision: Revision,
    },
}

impl InitialState {
    pub fn revision(&self) -> Revision {
        match self {
            InitialState::Snapshot(snapshot) => snapshot.revision,
            InitialState::CatchUp { revision, .. } => *revision,
        }
    }
}

/// Everything a connection needs after attaching.
pub struct Attachment {
    pub session_id: Uuid,
    pub initial: InitialState,
    pub presence: Vec<PresenceUpdate>,
    pub queue: DeliveryQueue,
    pub presence_rx: broadcast::Receiver<PresenceUpdate>,
    /// Resolves when this session is replaced or expired
    pub superseded: oneshot::Receiver<()>,
}

impl Attachment {
    /// Revision the client is at once it has applied `initial`.
    pub fn revision(&self) -> Revision {
        self.initial.revision()
    }
}

/// Result of a sweep pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired_sessions: Vec<ClientId>,
    pub expired_presence: usize,
    pub trimmed_history: usize,
    pub evicted_documents: Vec<DocumentId>,
    /// Fatal persistence failures met while evicting
    pub failures: Vec<SyncError>,
}

/// Tracks sessions and routes their operations to documents.
pub struct SessionCoordinator {
    config: SyncConfig,
    registry: Arc<DocumentRegistry>,
    sessions: Mutex<HashMap<ClientId, SessionEntry>>,
    draining: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(registry: Arc<DocumentRegistry>) -> Self {
        Self {
            config: registry.config().clone(),
            registry,
            sessions: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Attach a client to a document.
    ///
    /// `last_known` is the last revision the client holds. A gap of at most
    /// `catch_up_threshold` revisions still covered by history is replayed;
    /// anything else gets a fresh snapshot. Attaching an already attached
    /// client replaces its previous session.
    pub async fn attach(
        &self,
        client_id: ClientId,
        document_id: &DocumentId,
        last_known: Option<Revision>,
    ) -> Result<Attachment, SyncError> {
        if self.is_draining() {
            return Err(SyncError::Draining);
        }
        {
            let sessions = self.sessions.lock();
            if sessions.len() >= self.config.max_sessions && !sessions.contains_key(&client_id) {
                return Err(SyncError::CapacityExceeded {
                    limit: self.config.max_sessions,
                });
            }
        }

        let mut attempts = 0;
        let (room, initial, queue, presence, presence_rx) = loop {
            attempts += 1;
            let room = self.registry.open(document_id).await?;
            let document = room.lock().await;
            if room.is_evicted() {
                drop(document);
                if attempts >= OPEN_ATTEMPTS {
                    return Err(SyncError::DocumentNotFound(document_id.clone()));
                }
                continue;
            }

            let initial = self.initial_state(&document, last_known);
            let queue = room.broadcast().subscribe(client_id, document.revision());
            let presence_rx = room.presence().subscribe();
            let presence = room.presence().snapshot();
            room.session_attached();
            drop(document);
            break (room, initial, queue, presence, presence_rx);
        };

        let session_id = Uuid::new_v4();
        let (kick, superseded) = oneshot::channel();
        let revision = initial.revision();
        let entry = SessionEntry {
            session: ClientSession {
                client_id,
                session_id,
                document_id: document_id.clone(),
                last_ack: last_known.filter(|k| *k <= revision).unwrap_or(0),
                last_delivered: revision,
                mode: DeliveryMode::Live,
                last_seen: Instant::now(),
            },
            room,
            kick: Some(kick),
        };

        let replaced = {
            let mut sessions = self.sessions.lock();
            // Concurrent attaches may have filled the last slot meanwhile.
            if sessions.len() >= self.config.max_sessions && !sessions.contains_key(&client_id) {
                drop(sessions);
                entry.room.session_detached(Instant::now());
                return Err(SyncError::CapacityExceeded {
                    limit: self.config.max_sessions,
                });
            }
            sessions.insert(client_id, entry)
        };
        if let Some(old) = replaced {
            log::info!("{client_id} re-attached, replacing session {}", old.session.session_id);
            let room = old.room.clone();
            if self.retire(client_id, old, Some(document_id), Instant::now()) {
                self.persist_last(&room).await;
            }
        }

        log::info!(
            "{client_id} attached to {document_id} at revision {revision} ({})",
            match &initial {
                InitialState::Snapshot(_) => "snapshot".to_string(),
                InitialState::CatchUp { operations, .. } => format!("catch-up of {}", operations.len()),
            }
        );

        Ok(Attachment {
            session_id,
            initial,
            presence,
            queue,
            presence_rx,
            superseded,
        })
    }

    fn initial_state(&self, document: &Document, last_known: Option<Revision>) -> InitialState {
        let current = document.revision();
        let replay = last_known
            .filter(|known| *known <= current && current - known <= self.config.catch_up_threshold)
            .and_then(|known| {
                document
                    .operations_since(known)
                    .or_else(|| self.registry.logged_operations(document.id(), known, current))
            });
        match replay {
            Some(operations) => InitialState::CatchUp {
                operations,
                revision: current,
            },
            None => InitialState::Snapshot(document.snapshot()),
        }
    }

    /// Release the bookkeeping of a session that is gone.
    ///
    /// Returns true when it was the last session of its document.
    fn retire(
        &self,
        client_id: ClientId,
        mut old: SessionEntry,
        kept_document: Option<&DocumentId>,
        now: Instant,
    ) -> bool {
        if let Some(kick) = old.kick.take() {
            let _ = kick.send(());
        }
        if kept_document != Some(&old.session.document_id) {
            old.room.presence().remove(client_id);
        }
        old.room.session_detached(now)
    }

    /// Snapshot a document its last session just left.
    async fn persist_last(&self, room: &DocumentRoom) {
        if let Err(e) = self.registry.persist(room).await {
            log::warn!("Snapshot of {} on last detach failed: {e}", room.id());
        }
    }

    /// Detach a client. Operations it already submitted stay applied.
    pub async fn detach(&self, client_id: ClientId) -> Result<ClientSession, SyncError> {
        let entry = self
            .sessions
            .lock()
            .remove(&client_id)
            .ok_or(SyncError::SessionNotFound(client_id))?;
        Ok(self.finish_detach(client_id, entry).await)
    }

    /// Detach only if `session_id` is still the client's current session.
    pub async fn detach_session(&self, client_id: ClientId, session_id: Uuid) -> Option<ClientSession> {
        let entry = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&client_id) {
                Some(entry) if entry.session.session_id == session_id => sessions.remove(&client_id),
                _ => None,
            }
        }?;
        Some(self.finish_detach(client_id, entry).await)
    }

    async fn finish_detach(&self, client_id: ClientId, mut entry: SessionEntry) -> ClientSession {
        entry.kick.take();
        entry.room.presence().remove(client_id);
        let last = entry.room.session_detached(Instant::now());
        log::info!("{client_id} detached from {}", entry.session.document_id);

        if last {
            self.persist_last(&entry.room).await;
        }
        entry.session
    }

    fn room_of(&self, client_id: ClientId) -> Result<Arc<DocumentRoom>, SyncError> {
        self.sessions
            .lock()
            .get(&client_id)
            .map(|entry| entry.room.clone())
            .ok_or(SyncError::SessionNotFound(client_id))
    }

    /// Submit an edit composed against `base_revision`.
    ///
    /// The operation is attributed to `client_id` whatever it claims.
    pub async fn submit(
        &self,
        client_id: ClientId,
        base_revision: Revision,
        operation: Operation,
    ) -> Result<Arc<AcceptedOp>, SyncError> {
        let room = self.room_of(client_id)?;
        let mut operation = operation.with_revision(base_revision);
        operation.client_id = client_id;

        match self.registry.apply(&room, operation).await {
            Ok(accepted) => {
                self.touch(client_id, Instant::now());
                Ok(accepted)
            }
            Err(e) => {
                log::warn!("Rejected edit from {client_id} on {}: {e}", room.id());
                if e.requires_resync() {
                    self.set_mode(client_id, DeliveryMode::Resync);
                }
                Err(e)
            }
        }
    }

    /// Record that a client has applied everything up to `revision`.
    ///
    /// Acks never move backwards; acks beyond the document are ignored.
    pub fn record_ack(&self, client_id: ClientId, revision: Revision) -> Result<Revision, SyncError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&client_id)
            .ok_or(SyncError::SessionNotFound(client_id))?;
        if revision <= entry.room.revision() && revision > entry.session.last_ack {
            entry.session.last_ack = revision;
        }
        entry.session.last_seen = Instant::now();
        Ok(entry.session.last_ack)
    }

    /// Best-effort presence update; never touches the document lock.
    pub fn update_presence(
        &self,
        client_id: ClientId,
        selection: Option<Selection>,
    ) -> Result<bool, SyncError> {
        let room = self.room_of(client_id)?;
        Ok(room.presence().update(client_id, selection))
    }

    /// State that brings a lagging session from `after` to the head revision.
    pub async fn catch_up(&self, client_id: ClientId, after: Revision) -> Result<InitialState, SyncError> {
        let room = self.room_of(client_id)?;
        self.set_mode(client_id, DeliveryMode::Resync);
        let document = room.lock().await;
        let state = self.initial_state(&document, Some(after));
        log::debug!(
            "{client_id} resyncs from {after} to {} on {}",
            state.revision(),
            room.id()
        );
        Ok(state)
    }

    /// Full document state for a client whose local state can no longer be
    /// trusted, e.g. after one of its edits was rejected.
    pub async fn snapshot(&self, client_id: ClientId) -> Result<Snapshot, SyncError> {
        let room = self.room_of(client_id)?;
        self.set_mode(client_id, DeliveryMode::Resync);
        let snapshot = room.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Back to live delivery after a resync.
    pub fn mark_live(&self, client_id: ClientId, revision: Revision) {
        if let Some(entry) = self.sessions.lock().get_mut(&client_id) {
            entry.session.mode = DeliveryMode::Live;
            entry.session.last_delivered = entry.session.last_delivered.max(revision);
        }
    }

    /// Note that `revision` was written to the client's socket.
    pub fn record_delivered(&self, client_id: ClientId, revision: Revision) {
        if let Some(entry) = self.sessions.lock().get_mut(&client_id) {
            entry.session.last_delivered = entry.session.last_delivered.max(revision);
        }
    }

    fn set_mode(&self, client_id: ClientId, mode: DeliveryMode) {
        if let Some(entry) = self.sessions.lock().get_mut(&client_id) {
            entry.session.mode = mode;
        }
    }

    /// Keep a session and its presence alive.
    pub fn touch(&self, client_id: ClientId, now: Instant) {
        if let Some(entry) = self.sessions.lock().get_mut(&client_id) {
            entry.session.last_seen = now;
            entry.room.presence().touch(client_id, now);
        }
    }

    pub fn session(&self, client_id: ClientId) -> Option<ClientSession> {
        self.sessions.lock().get(&client_id).map(|e| e.session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Expire idle sessions and presence, trim history, evict idle documents.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        let expired: Vec<(ClientId, SessionEntry)> = {
            let mut sessions = self.sessions.lock();
            let idle: Vec<ClientId> = sessions
                .iter()
                .filter(|(_, e)| {
                    now.saturating_duration_since(e.session.last_seen) > self.config.idle_session_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            idle.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (client_id, entry) in expired {
            log::info!("Session of {client_id} on {} expired", entry.session.document_id);
            let room = entry.room.clone();
            if self.retire(client_id, entry, None, now) {
                self.persist_last(&room).await;
            }
            report.expired_sessions.push(client_id);
        }

        let mut min_acks: HashMap<DocumentId, Revision> = HashMap::new();
        for entry in self.sessions.lock().values() {
            min_acks
                .entry(entry.session.document_id.clone())
                .and_modify(|ack| *ack = (*ack).min(entry.session.last_ack))
                .or_insert(entry.session.last_ack);
        }

        for room in self.registry.rooms().await {
            room.presence().flush_at(now);
            report.expired_presence += room.presence().expire(now).len();
            let floor = min_acks.get(room.id()).copied().unwrap_or_else(|| room.revision());
            report.trimmed_history += self.registry.trim_history(&room, floor).await;
        }

        let eviction = self.registry.evict_idle(now).await;
        report.evicted_documents = eviction.evicted;
        report.failures = eviction.failures;
        report
    }

    /// Refuse new attaches; existing sessions continue.
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            log::info!("Draining: new sessions are refused");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn readiness(&self) -> Readiness {
        if self.is_draining() {
            Readiness::Draining
        } else if self.session_count() >= self.config.max_sessions {
            Readiness::AtCapacity
        } else {
            Readiness::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Delivery;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn coordinator(config: SyncConfig) -> SessionCoordinator {
        let registry = DocumentRegistry::new(config, Arc::new(MemoryStore::new()));
        SessionCoordinator::new(Arc::new(registry))
    }

    fn doc1() -> DocumentId {
        DocumentId::new("doc1")
    }

    #[tokio::test]
    async fn test_first_attach_gets_snapshot() {
        let coord = coordinator(SyncConfig::default());
        let attachment = coord.attach(A, &doc1(), None).await.unwrap();
        assert_eq!(attachment.initial, InitialState::Snapshot(Snapshot::empty()));
        assert_eq!(attachment.revision(), 0);
        assert_eq!(coord.session_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_converge() {
        let coord = coordinator(SyncConfig::default());
        let mut a = coord.attach(A, &doc1(), None).await.unwrap();
        let mut b = coord.attach(B, &doc1(), None).await.unwrap();

        let first = coord
            .submit(A, 0, Operation::insert_at(A, 0, 0, 0, "hello"))
            .await
            .unwrap();
        let second = coord
            .submit(B, 0, Operation::insert_at(B, 0, 0, 0, "world"))
            .await
            .unwrap();
        assert_eq!((first.revision, second.revision), (1, 2));

        for queue in [&mut a.queue, &mut b.queue] {
            let mut text = String::new();
            while let Some(Delivery::Op(op)) = queue.try_next() {
                text = op.operation.apply(&text).unwrap();
            }
            assert_eq!(text, "helloworld");
        }
    }

    #[tokio::test]
    async fn test_submit_is_attributed_to_session_client() {
        let coord = coordinator(SyncConfig::default());
        coord.attach(B, &doc1(), None).await.unwrap();
        let accepted = coord
            .submit(B, 0, Operation::insert_at(ClientId(99), 7, 0, 0, "x"))
            .await
            .unwrap();
        assert_eq!(accepted.client_id(), B);
        assert_eq!(accepted.operation.revision, 0);
    }

    #[tokio::test]
    async fn test_reconnect_within_threshold_replays_missed_revisions() {
        let coord = coordinator(SyncConfig::default());
        coord.attach(A, &doc1(), None).await.unwrap();
        coord.attach(B, &doc1(), None).await.unwrap();
        for rev in 0..3 {
            coord
                .submit(A, rev, Operation::insert_at(A, rev, rev as usize, 0, "a"))
                .await
                .unwrap();
        }
        assert_eq!(coord.record_ack(B, 3).unwrap(), 3);
        coord.detach(B).await.unwrap();

        for rev in 3..6 {
            coord
                .submit(A, rev, Operation::insert_at(A, rev, rev as usize, 0, "a"))
                .await
                .unwrap();
        }

        let attachment = coord.attach(B, &doc1(), Some(3)).await.unwrap();
        match attachment.initial {
            InitialState::CatchUp { operations, revision } => {
                let revisions: Vec<_> = operations.iter().map(|op| op.revision).collect();
                assert_eq!(revisions, vec![4, 5, 6]);
                assert_eq!(revision, 6);
            }
            other => panic!("expected catch-up, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gap_beyond_threshold_gets_snapshot() {
        let coord = coordinator(SyncConfig {
            catch_up_threshold: 2,
            ..SyncConfig::default()
        });
        coord.attach(A, &doc1(), None).await.unwrap();
        for rev in 0..5 {
            coord
                .submit(A, rev, Operation::insert_at(A, rev, rev as usize, 0, "a"))
                .await
                .unwrap();
        }

        let near = coord.attach(B, &doc1(), Some(3)).await.unwrap();
        assert!(matches!(near.initial, InitialState::CatchUp { ref operations, .. } if operations.len() == 2));

        let far = coord.attach(B, &doc1(), Some(1)).await.unwrap();
        assert_eq!(
            far.initial,
            InitialState::Snapshot(Snapshot { text: "aaaaa".into(), revision: 5 })
        );

        // A client claiming to be ahead is resynced with a snapshot too.
        let ahead = coord.attach(B, &doc1(), Some(40)).await.unwrap();
        assert!(matches!(ahead.initial, InitialState::Snapshot(_)));
    }

    #[tokio::test]
    async fn test_detached_client_is_rejected() {
        let coord = coordinator(SyncConfig::default());
        coord.attach(A, &doc1(), None).await.unwrap();
        coord.detach(A).await.unwrap();

        let err = coord
            .submit(A, 0, Operation::insert_at(A, 0, 0, 0, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionNotFound(A)));
        assert!(matches!(coord.record_ack(A, 1), Err(SyncError::SessionNotFound(A))));
        assert!(matches!(coord.detach(A).await, Err(SyncError::SessionNotFound(A))));
    }

    #[tokio::test]
    async fn test_record_ack_is_monotonic_and_bounded() {
        let coord = coordinator(SyncConfig::default());
        coord.attach(A, &doc1(), None).await.unwrap();
        for rev in 0..4 {
            coord
                .submit(A, rev, Operation::insert_at(A, rev, rev as usize, 0, "a"))
                .await
                .unwrap();
        }
        assert_eq!(coord.record_ack(A, 3).unwrap(), 3);
        assert_eq!(coord.record_ack(A, 2).unwrap(), 3);
        assert_eq!(coord.record_ack(A, 9).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_submit_marks_resync() {
        let coord = coordinator(SyncConfig::default());
        coord.attach(A, &doc1(), None).await.unwrap();
        let err = coord
            .submit(A, 5, Operation::insert_at(A, 5, 0, 0, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StaleReference { base: 5, current: 0 }));
        assert_eq!(coord.session(A).unwrap().mode, DeliveryMode::Resync);

        let state = coord.catch_up(A, 0).await.unwrap();
        coord.mark_live(A, state.revision());
        assert_eq!(coord.session(A).unwrap().mode, DeliveryMode::Live);

        let snapshot = coord.snapshot(A).await.unwrap();
        assert_eq!(snapshot, Snapshot::empty());
        assert_eq!(coord.session(A).unwrap().mode, DeliveryMode::Resync);
    }

    #[tokio::test]
    async fn test_reattach_supersedes_old_session() {
        let coord = coordinator(SyncConfig::default());
        let old = coord.attach(A, &doc1(), None).await.unwrap();
        let new = coord.attach(A, &doc1(), None).await.unwrap();
        assert_ne!(old.session_id, new.session_id);
        assert!(old.superseded.await.is_ok());
        assert_eq!(coord.session_count(), 1);

        // The stale connection's cleanup leaves the new session alone.
        assert!(coord.detach_session(A, old.session_id).await.is_none());
        assert!(coord.session(A).is_some());

        let room = coord.registry().get(&doc1()).await.unwrap();
        assert_eq!(room.session_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_and_draining() {
        let coord = coordinator(SyncConfig {
            max_sessions: 1,
            ..SyncConfig::default()
        });
        coord.attach(A, &doc1(), None).await.unwrap();
        assert_eq!(coord.readiness(), Readiness::AtCapacity);
        assert!(matches!(
            coord.attach(B, &doc1(), None).await.err(),
            Some(SyncError::CapacityExceeded { limit: 1 })
        ));
        // Re-attaching an existing client does not need a free slot.
        assert!(coord.attach(A, &doc1(), None).await.is_ok());

        coord.begin_drain();
        assert_eq!(coord.readiness(), Readiness::Draining);
        assert!(matches!(coord.attach(A, &doc1(), None).await.err(), Some(SyncError::Draining)));
        // Existing sessions keep working.
        assert!(coord.submit(A, 0, Operation::insert_at(A, 0, 0, 0, "x")).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attaches_respect_capacity() {
        let coord = Arc::new(coordinator(SyncConfig {
            max_sessions: 4,
            ..SyncConfig::default()
        }));
        let attaches: Vec<_> = (0..32)
            .map(|id| {
                let coord = coord.clone();
                tokio::spawn(async move { coord.attach(ClientId(id), &doc1(), None).await.is_ok() })
            })
            .collect();

        let mut attached = 0;
        for attach in attaches {
            if attach.await.unwrap() {
                attached += 1;
            }
        }
        assert_eq!(attached, 4);
        assert_eq!(coord.session_count(), 4);
        let room = coord.registry().get(&doc1()).await.unwrap();
        assert_eq!(room.session_count(), 4);
    }

    #[tokio::test]
    async fn test_catch_up_past_memory_history_uses_log() {
        let coord = coordinator(SyncConfig {
            max_history: 2,
            snapshot_interval: 100,
            ..SyncConfig::default()
        });
        coord.attach(A, &doc1(), None).await.unwrap();
        for rev in 0..6 {
            coord
                .submit(A, rev, Operation::insert_at(A, rev, rev as usize, 0, "a"))
                .await
                .unwrap();
        }

        let attachment = coord.attach(B, &doc1(), Some(1)).await.unwrap();
        match attachment.initial {
            InitialState::CatchUp { operations, revision } => {
                let revisions: Vec<_> = operations.iter().map(|op| op.revision).collect();
                assert_eq!(revisions, vec![2, 3, 4, 5, 6]);
                assert_eq!(revision, 6);
            }
            other => panic!("expected catch-up, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_last_session_pushes_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let registry = DocumentRegistry::new(
            SyncConfig {
                idle_session_timeout: Duration::from_secs(5),
                eviction_grace: Duration::from_secs(600),
                snapshot_interval: 100,
                ..SyncConfig::default()
            },
            store.clone(),
        );
        let coord = SessionCoordinator::new(Arc::new(registry));
        coord.attach(A, &doc1(), None).await.unwrap();
        coord
            .submit(A, 0, Operation::insert_at(A, 0, 0, 0, "x"))
            .await
            .unwrap();
        assert_eq!(store.snapshots_saved(), 0);

        let report = coord.sweep(Instant::now() + Duration::from_secs(6)).await;
        assert_eq!(report.expired_sessions, vec![A]);
        assert!(report.evicted_documents.is_empty());
        assert_eq!(store.snapshots_saved(), 1);
        let room = coord.registry().get(&doc1()).await.unwrap();
        assert_eq!(room.durable_revision(), 1);
    }

    #[tokio::test]
    async fn test_presence_is_shared_and_cleared_on_detach() {
        let coord = coordinator(SyncConfig::default());
        coord.attach(A, &doc1(), None).await.unwrap();
        assert!(coord.update_presence(A, Some(Selection::caret(0))).unwrap());

        let mut b = coord.attach(B, &doc1(), None).await.unwrap();
        assert_eq!(b.presence.len(), 1);

        coord.detach(A).await.unwrap();
        let update = b.presence_rx.recv().await.unwrap();
        assert_eq!(update, PresenceUpdate { client_id: A, selection: None });
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_sessions_and_evicts() {
        let coord = coordinator(SyncConfig {
            idle_session_timeout: Duration::from_secs(5),
            eviction_grace: Duration::from_secs(5),
            ..SyncConfig::default()
        });
        let attachment = coord.attach(A, &doc1(), None).await.unwrap();
        coord
            .submit(A, 0, Operation::insert_at(A, 0, 0, 0, "x"))
            .await
            .unwrap();

        let report = coord.sweep(Instant::now() + Duration::from_secs(6)).await;
        assert_eq!(report.expired_sessions, vec![A]);
        assert!(attachment.superseded.await.is_ok());

        let report = coord.sweep(Instant::now() + Duration::from_secs(20)).await;
        assert_eq!(report.evicted_documents, vec![doc1()]);
        assert_eq!(coord.registry().document_count().await, 0);

        // The document comes back from persistence.
        let back = coord.attach(A, &doc1(), Some(1)).await.unwrap();
        assert_eq!(back.revision(), 1);
    }
}
