//! Persistence across instances: restart recovery, ownership leases and
//! store outages, driven through the session coordinator.

use std::sync::Arc;
use tandem_collab::config::SyncConfig;
use tandem_collab::document::DocumentId;
use tandem_collab::error::SyncError;
use tandem_collab::registry::DocumentRegistry;
use tandem_collab::session::{InitialState, SessionCoordinator};
use tandem_collab::storage::{MemoryStore, Persistence};
use tandem_core::{ClientId, Operation};

const A: ClientId = ClientId(1);

fn instance(store: Arc<dyn Persistence>, config: SyncConfig) -> SessionCoordinator {
    SessionCoordinator::new(Arc::new(DocumentRegistry::new(config, store)))
}

fn doc1() -> DocumentId {
    DocumentId::new("doc1")
}

async fn type_text(coord: &SessionCoordinator, text: &str) {
    for ch in text.chars() {
        let room = coord.registry().get(&doc1()).await.unwrap();
        let rev = room.revision();
        let len = room.lock().await.len();
        coord
            .submit(A, rev, Operation::insert_at(A, rev, len, len, &ch.to_string()))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_document_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig {
        snapshot_interval: 4,
        ..SyncConfig::default()
    };

    let first = instance(store.clone(), config.clone());
    first.attach(A, &doc1(), None).await.unwrap();
    type_text(&first, "persisted").await;
    // Snapshots at 4 and 8, revision 9 only in the operation log.
    assert_eq!(store.snapshots_saved(), 2);
    drop(first);

    // The dropped instance never released its lease.
    let stale_owner = store.lease_owner(&doc1()).unwrap();
    store.release(&doc1(), stale_owner).unwrap();

    let second = instance(store.clone(), config);
    let attachment = second.attach(A, &doc1(), None).await.unwrap();
    match attachment.initial {
        InitialState::Snapshot(snapshot) => {
            assert_eq!(snapshot.text, "persisted");
            assert_eq!(snapshot.revision, 9);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_after_restart_catches_up_from_log() {
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig {
        snapshot_interval: 100,
        ..SyncConfig::default()
    };

    let first = instance(store.clone(), config.clone());
    first.attach(A, &doc1(), None).await.unwrap();
    type_text(&first, "abcdef").await;
    assert!(first.registry().shutdown().await.is_empty());

    let second = instance(store.clone(), config);
    let attachment = second.attach(ClientId(2), &doc1(), Some(6)).await.unwrap();
    assert_eq!(attachment.initial, InitialState::CatchUp { operations: vec![], revision: 6 });
}

#[tokio::test]
async fn test_second_instance_cannot_own_document() {
    let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
    let first = instance(store.clone(), SyncConfig::default());
    let second = instance(store, SyncConfig::default());

    first.attach(A, &doc1(), None).await.unwrap();
    let err = second.attach(ClientId(2), &doc1(), None).await.err().unwrap();
    match err {
        SyncError::OwnershipConflict { document, owner } => {
            assert_eq!(document, doc1());
            assert_eq!(owner, first.registry().instance_id());
        }
        other => panic!("expected ownership conflict, got {other:?}"),
    }
    assert!(err_is_fatal(&second, &doc1()).await);

    // Once the owner shuts down the document can move.
    assert!(first.registry().shutdown().await.is_empty());
    assert!(second.attach(ClientId(2), &doc1(), None).await.is_ok());
}

async fn err_is_fatal(coord: &SessionCoordinator, id: &DocumentId) -> bool {
    match coord.registry().open(id).await {
        Err(e) => e.is_fatal(),
        Ok(_) => false,
    }
}

#[tokio::test]
async fn test_edits_continue_through_store_outage() {
    let store = Arc::new(MemoryStore::new());
    let coord = instance(store.clone(), SyncConfig::default());
    coord.attach(A, &doc1(), None).await.unwrap();
    type_text(&coord, "ab").await;

    store.set_available(false);
    type_text(&coord, "cd").await;
    assert_eq!(store.operations_appended(), 2);

    store.set_available(true);
    type_text(&coord, "e").await;
    // The broken log is repaired with a snapshot.
    assert_eq!(store.snapshots_saved(), 1);
    let stored = store.load(&doc1()).unwrap().unwrap();
    assert_eq!(stored.snapshot.text, "abcde");
    assert!(stored.operations.is_empty());
}

#[cfg(feature = "rocksdb")]
#[tokio::test]
async fn test_rocksdb_restart() {
    use tandem_collab::storage::{RocksStore, StoreConfig};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let config = SyncConfig {
        snapshot_interval: 3,
        ..SyncConfig::default()
    };

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
        let coord = instance(store, config.clone());
        coord.attach(A, &doc1(), None).await.unwrap();
        type_text(&coord, "rocks").await;
        assert!(coord.registry().shutdown().await.is_empty());
    }

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
    let coord = instance(store, config);
    let attachment = coord.attach(A, &doc1(), None).await.unwrap();
    assert_eq!(attachment.revision(), 5);
    match attachment.initial {
        InitialState::Snapshot(snapshot) => assert_eq!(snapshot.text, "rocks"),
        other => panic!("expected snapshot, got {other:?}"),
    }
}
