//! Cursor and selection awareness of the sessions attached to a document.
//!
//! Presence is soft state. It lives beside the document, never inside it:
//! its own lock, its own broadcast channel, never persisted, never touched
//! by the operation-apply path except to shift cursors after an edit.
//!
//! ```text
//! update(client, sel)
//!       │  rate-limited per client
//!       ├── too soon ──► stored as pending, sent by flush()
//!       ▼
//! broadcast::Sender<PresenceUpdate> ──► every session of the document
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_core::{ClientId, Selection};
use tokio::sync::broadcast;

use crate::document::AcceptedOp;

/// Presence of one client as seen by others. `selection: None` means the
/// client left or cleared its cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub client_id: ClientId,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    selection: Option<Selection>,
    last_seen: Instant,
    last_broadcast: Option<Instant>,
    /// A throttled update is waiting for `flush`
    pending: bool,
}

/// Presence records of one document.
pub struct PresenceRoom {
    records: Mutex<HashMap<ClientId, PresenceRecord>>,
    sender: broadcast::Sender<PresenceUpdate>,
    interval: Duration,
    timeout: Duration,
}

impl PresenceRoom {
    /// `interval` spaces broadcasts per client; `timeout` expires silent clients.
    pub fn new(interval: Duration, timeout: Duration, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            records: Mutex::new(HashMap::new()),
            sender,
            interval,
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.sender.subscribe()
    }

    /// Record a client's selection, broadcasting it unless throttled.
    ///
    /// Returns true when the update went out immediately.
    pub fn update(&self, client_id: ClientId, selection: Option<Selection>) -> bool {
        self.update_at(client_id, selection, Instant::now())
    }

    pub fn update_at(&self, client_id: ClientId, selection: Option<Selection>, now: Instant) -> bool {
        let mut records = self.records.lock();
        let record = records.entry(client_id).or_insert(PresenceRecord {
            selection: None,
            last_seen: now,
            last_broadcast: None,
            pending: false,
        });
        record.selection = selection;
        record.last_seen = now;

        let due = record
            .last_broadcast
            .is_none_or(|at| now.duration_since(at) >= self.interval);
        if !due {
            record.pending = true;
            log::trace!("presence of {client_id} throttled");
            return false;
        }

        record.last_broadcast = Some(now);
        record.pending = false;
        let _ = self.sender.send(PresenceUpdate { client_id, selection });
        true
    }

    /// Broadcast throttled updates whose interval has elapsed.
    pub fn flush_at(&self, now: Instant) -> usize {
        let mut records = self.records.lock();
        let mut sent = 0;
        for (client_id, record) in records.iter_mut() {
            let due = record
                .last_broadcast
                .is_none_or(|at| now.duration_since(at) >= self.interval);
            if record.pending && due {
                record.pending = false;
                record.last_broadcast = Some(now);
                let _ = self.sender.send(PresenceUpdate {
                    client_id: *client_id,
                    selection: record.selection,
                });
                sent += 1;
            }
        }
        sent
    }

    /// Keep a client's record alive without changing it.
    pub fn touch(&self, client_id: ClientId, now: Instant) {
        if let Some(record) = self.records.lock().get_mut(&client_id) {
            record.last_seen = now;
        }
    }

    /// Drop a client's record and tell the others it is gone.
    pub fn remove(&self, client_id: ClientId) -> bool {
        let removed = self.records.lock().remove(&client_id).is_some();
        if removed {
            let _ = self.sender.send(PresenceUpdate {
                client_id,
                selection: None,
            });
        }
        removed
    }

    /// Remove every record silent for longer than the timeout.
    pub fn expire(&self, now: Instant) -> Vec<ClientId> {
        let expired: Vec<ClientId> = {
            let mut records = self.records.lock();
            let stale: Vec<ClientId> = records
                .iter()
                .filter(|(_, r)| now.saturating_duration_since(r.last_seen) > self.timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                records.remove(id);
            }
            stale
        };

        for client_id in &expired {
            log::trace!("presence of {client_id} expired");
            let _ = self.sender.send(PresenceUpdate {
                client_id: *client_id,
                selection: None,
            });
        }
        expired
    }

    /// Shift every stored selection through an accepted operation.
    pub fn transform(&self, accepted: &AcceptedOp) {
        let mut records = self.records.lock();
        for record in records.values_mut() {
            if let Some(selection) = record.selection.as_mut() {
                *selection = selection.transform(&accepted.operation);
            }
        }
    }

    /// Current selections, ordered by client id.
    pub fn snapshot(&self) -> Vec<PresenceUpdate> {
        let records = self.records.lock();
        let mut peers: Vec<PresenceUpdate> = records
            .iter()
            .filter(|(_, r)| r.selection.is_some())
            .map(|(id, r)| PresenceUpdate {
                client_id: *id,
                selection: r.selection,
            })
            .collect();
        peers.sort_by_key(|p| p.client_id);
        peers
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
