//! Fan-out of accepted operations to every session of a document.
//!
//! One tokio broadcast channel per document; each session holds a receiver
//! that buffers up to `capacity` operations. Publishing never blocks, so it
//! may happen while the document lock is held, which makes channel order
//! equal to revision order.
//!
//! ```text
//!  Document ── publish(rev n) ──► [ broadcast channel ]
//!                                   │        │        │
//!                                   ▼        ▼        ▼
//!                              DeliveryQueue (one per session)
//!                               skips <= last_delivered
//!                               lag or gap ──► Delivery::Resync
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_core::{ClientId, Revision};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::document::AcceptedOp;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Sessions forced into resync because their queue overflowed
    pub overflows: u64,
    /// Already delivered revisions skipped on receipt
    pub duplicates_skipped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters shared by a group and its queues.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    overflows: AtomicU64,
    duplicates_skipped: AtomicU64,
}

/// The broadcast channel of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<AcceptedOp>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds the number of operations buffered per session.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Open a delivery queue for a session whose state is at revision `after`.
    ///
    /// Only operations published after this call are received, so callers
    /// subscribe and read the document state under the same lock.
    pub fn subscribe(&self, client_id: ClientId, after: Revision) -> DeliveryQueue {
        DeliveryQueue {
            client_id,
            receiver: self.sender.subscribe(),
            last_delivered: after,
            stats: self.stats.clone(),
        }
    }

    /// Enqueue an accepted operation for every subscriber.
    ///
    /// Returns the number of queues it was enqueued on.
    pub fn publish(&self, op: Arc<AcceptedOp>) -> usize {
        let count = self.sender.send(op).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            overflows: self.stats.overflows.load(Ordering::Relaxed),
            duplicates_skipped: self.stats.duplicates_skipped.load(Ordering::Relaxed),
            active_subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Outcome of waiting on a [`DeliveryQueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The next revision, in order.
    Op(Arc<AcceptedOp>),
    /// The queue lost operations; the session must be replayed from
    /// `last_delivered` before it continues.
    Resync {
        last_delivered: Revision,
        missed: u64,
    },
    /// The document left memory.
    Closed,
}

/// Bounded, ordered, idempotent delivery queue of one session.
pub struct DeliveryQueue {
    client_id: ClientId,
    receiver: broadcast::Receiver<Arc<AcceptedOp>>,
    last_delivered: Revision,
    stats: Arc<AtomicBroadcastStats>,
}

impl DeliveryQueue {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn last_delivered(&self) -> Revision {
        self.last_delivered
    }

    /// Record that the session is known to hold revision `revision`.
    ///
    /// Used after a catch-up or snapshot; queued operations up to it become
    /// duplicates.
    pub fn advance_to(&mut self, revision: Revision) {
        self.last_delivered = self.last_delivered.max(revision);
    }

    /// Wait for the next deliverable revision.
    pub async fn next(&mut self) -> Delivery {
        loop {
            let received = self.receiver.recv().await;
            if let Some(delivery) = self.accept(received) {
                return delivery;
            }
        }
    }

    /// Like [`next`](Self::next) but returns `None` instead of waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        loop {
            let received = match self.receiver.try_recv() {
                Ok(op) => Ok(op),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => Err(RecvError::Lagged(n)),
                Err(TryRecvError::Closed) => Err(RecvError::Closed),
            };
            if let Some(delivery) = self.accept(received) {
                return Some(delivery);
            }
        }
    }

    fn accept(&mut self, received: Result<Arc<AcceptedOp>, RecvError>) -> Option<Delivery> {
        match received {
            Ok(op) if op.revision <= self.last_delivered => {
                self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(op) if op.revision == self.last_delivered + 1 => {
                self.last_delivered = op.revision;
                Some(Delivery::Op(op))
            }
            Ok(op) => {
                log::warn!(
                    "{} saw revision {} after {}, forcing resync",
                    self.client_id,
                    op.revision,
                    self.last_delivered
                );
                Some(Delivery::Resync {
                    last_delivered: self.last_delivered,
                    missed: op.revision - self.last_delivered - 1,
                })
            }
            Err(RecvError::Lagged(missed)) => {
                self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "delivery queue of {} overflowed by {missed}, forcing resync",
                    self.client_id
                );
                Some(Delivery::Resync {
                    last_delivered: self.last_delivered,
                    missed,
                })
            }
            Err(RecvError::Closed) => Some(Delivery::Closed),
        }
    }
}
