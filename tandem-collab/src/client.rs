//! WebSocket sync client.
//!
//! Two layers:
//! - [`ClientDocument`] is the synchronous client-side state machine: local
//!   text, the revision it is based on, at most one operation in flight and
//!   one buffered behind it.
//! - [`SyncClient`] drives a `ClientDocument` over a WebSocket connection and
//!   reports what happens through [`SyncEvent`]s.
//!
//! ```text
//!                 local edit                     local edit
//! Synchronized ─────────────► AwaitingConfirm ─────────────► AwaitingWithBuffer
//!      ▲                           │    ▲                           │
//!      └──────── Accepted ─────────┘    └───────── Accepted ────────┘
//! ```
//!
//! Local edits made while disconnected are kept in the same state machine
//! and sent once the server has caught the client up.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tandem_core::{transform, ClientId, Operation, Revision, Selection};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::document::{AcceptedOp, DocumentId};
use crate::error::SyncError;
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where the client stands with respect to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Synchronized,
    /// One operation sent, not yet confirmed
    AwaitingConfirm(Operation),
    /// One operation in flight and local edits composed behind it
    AwaitingWithBuffer(Operation, Operation),
}

/// Client-side copy of a document.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    client_id: ClientId,
    text: String,
    len: usize,
    revision: Revision,
    synced: bool,
    state: ClientState,
    selection: Option<Selection>,
}

impl ClientDocument {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            text: String::new(),
            len: 0,
            revision: 0,
            synced: false,
            state: ClientState::Synchronized,
            selection: None,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Last server revision folded into the local text.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Revision to announce on (re)join; `None` before the first sync.
    pub fn last_known_revision(&self) -> Option<Revision> {
        self.synced.then_some(self.revision)
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn has_pending(&self) -> bool {
        !matches!(self.state, ClientState::Synchronized)
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection.map(|s| s.clamp(self.len));
    }

    fn set_text(&mut self, text: String) {
        self.len = text.chars().count();
        self.text = text;
    }

    /// Insert `text` at character offset `pos`.
    pub fn insert(&mut self, pos: usize, text: &str) -> Result<Option<ClientMessage>, SyncError> {
        let op = Operation::insert_at(self.client_id, self.revision, self.len, pos.min(self.len), text);
        self.apply_local(op)
    }

    /// Delete the characters in `start..end`.
    pub fn delete(&mut self, start: usize, end: usize) -> Result<Option<ClientMessage>, SyncError> {
        let end = end.min(self.len);
        let op = Operation::delete_range(self.client_id, self.revision, self.len, start.min(end), end);
        self.apply_local(op)
    }

    /// Apply a local edit. Returns the message to send, if the edit can go
    /// out right away.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<ClientMessage>, SyncError> {
        let mut op = op.with_revision(self.revision);
        op.client_id = self.client_id;
        let text = op.apply(&self.text)?;
        self.set_text(text);
        self.selection = self.selection.map(|s| s.transform(&op));

        let (state, outgoing) = match std::mem::replace(&mut self.state, ClientState::Synchronized) {
            ClientState::Synchronized => {
                let msg = ClientMessage::Edit {
                    base_revision: self.revision,
                    operation: op.clone(),
                };
                (ClientState::AwaitingConfirm(op), Some(msg))
            }
            ClientState::AwaitingConfirm(outstanding) => (ClientState::AwaitingWithBuffer(outstanding, op), None),
            ClientState::AwaitingWithBuffer(outstanding, buffer) => {
                let buffer = buffer.compose(&op)?;
                (ClientState::AwaitingWithBuffer(outstanding, buffer), None)
            }
        };
        self.state = state;
        Ok(outgoing)
    }

    /// Fold in another client's operation accepted as `revision`.
    ///
    /// Returns the operation as applied to the local text, or `None` for a
    /// revision already seen.
    pub fn apply_remote(&mut self, revision: Revision, op: &Operation) -> Result<Option<Operation>, SyncError> {
        if revision <= self.revision {
            return Ok(None);
        }
        if revision != self.revision + 1 {
            return Err(ProtocolError::UnexpectedMessage("revision gap").into());
        }

        let (state, local) = match std::mem::replace(&mut self.state, ClientState::Synchronized) {
            ClientState::Synchronized => (ClientState::Synchronized, op.clone()),
            ClientState::AwaitingConfirm(outstanding) => {
                let (outstanding, op) = transform(&outstanding, op)?;
                (ClientState::AwaitingConfirm(outstanding), op)
            }
            ClientState::AwaitingWithBuffer(outstanding, buffer) => {
                let (outstanding, op) = transform(&outstanding, op)?;
                let (buffer, op) = transform(&buffer, &op)?;
                (ClientState::AwaitingWithBuffer(outstanding, buffer), op)
            }
        };
        let text = local.apply(&self.text)?;
        self.set_text(text);
        self.selection = self.selection.map(|s| s.transform(&local));
        self.state = state;
        self.revision = revision;
        Ok(Some(local))
    }

    /// The in-flight operation was accepted as `revision`. Returns the
    /// buffered edit to send next, if any.
    pub fn apply_ack(&mut self, revision: Revision) -> Result<Option<ClientMessage>, SyncError> {
        if revision <= self.revision {
            return Ok(None);
        }
        let (state, outgoing) = match std::mem::replace(&mut self.state, ClientState::Synchronized) {
            ClientState::Synchronized => {
                return Err(ProtocolError::UnexpectedMessage("confirmation without pending edit").into());
            }
            ClientState::AwaitingConfirm(_) => (ClientState::Synchronized, None),
            ClientState::AwaitingWithBuffer(_, buffer) => {
                let buffer = buffer.with_revision(revision);
                let msg = ClientMessage::Edit {
                    base_revision: revision,
                    operation: buffer.clone(),
                };
                (ClientState::AwaitingConfirm(buffer), Some(msg))
            }
        };
        self.state = state;
        self.revision = revision;
        Ok(outgoing)
    }

    /// Replace everything with a server snapshot. Returns how many pending
    /// local operations were dropped.
    pub fn reset(&mut self, text: String, revision: Revision) -> usize {
        let dropped = match std::mem::replace(&mut self.state, ClientState::Synchronized) {
            ClientState::Synchronized => 0,
            ClientState::AwaitingConfirm(_) => 1,
            ClientState::AwaitingWithBuffer(..) => 2,
        };
        if dropped > 0 {
            log::warn!("{} dropped {dropped} pending edits on snapshot at {revision}", self.client_id);
        }
        self.set_text(text);
        self.selection = self.selection.map(|s| s.clamp(self.len));
        self.revision = revision;
        self.synced = true;
        dropped
    }

    /// Replay operations missed while away, then hand back the edit that
    /// still has to reach the server.
    ///
    /// An operation of our own in the replay is the confirmation of the
    /// edit that was in flight when the connection dropped.
    pub fn catch_up(&mut self, operations: &[AcceptedOp], revision: Revision) -> Result<Option<ClientMessage>, SyncError> {
        for accepted in operations {
            if accepted.client_id() == self.client_id && self.has_pending() {
                self.apply_ack(accepted.revision)?;
            } else {
                self.apply_remote(accepted.revision, &accepted.operation)?;
            }
        }
        if self.revision != revision {
            return Err(ProtocolError::UnexpectedMessage("catch-up does not reach its revision").into());
        }
        self.synced = true;

        Ok(self.in_flight().map(|op| ClientMessage::Edit {
            base_revision: self.revision,
            operation: op.with_revision(self.revision),
        }))
    }

    /// Rebase the in-flight operation onto the current revision.
    fn in_flight(&mut self) -> Option<Operation> {
        let revision = self.revision;
        match &mut self.state {
            ClientState::Synchronized => None,
            ClientState::AwaitingConfirm(op) | ClientState::AwaitingWithBuffer(op, _) => {
                *op = op.clone().with_revision(revision);
                Some(op.clone())
            }
        }
    }

    /// Apply one server message. Returns the events it produced and the
    /// messages to send back.
    pub fn handle(&mut self, msg: ServerMessage) -> Result<(Vec<SyncEvent>, Vec<ClientMessage>), SyncError> {
        let mut events = Vec::new();
        let mut outgoing = Vec::new();
        match msg {
            ServerMessage::Snapshot { text, revision } => {
                let discarded = self.reset(text, revision);
                events.push(SyncEvent::Synced { revision, discarded });
                outgoing.push(ClientMessage::Ack { revision });
            }
            ServerMessage::CatchUp { operations, revision } => {
                let resend = self.catch_up(&operations, revision)?;
                events.push(SyncEvent::Synced { revision, discarded: 0 });
                outgoing.push(ClientMessage::Ack { revision });
                outgoing.extend(resend);
            }
            ServerMessage::Accepted { revision, .. } => {
                let next = self.apply_ack(revision)?;
                events.push(SyncEvent::Confirmed { revision });
                outgoing.push(ClientMessage::Ack { revision });
                outgoing.extend(next);
            }
            ServerMessage::Remote { revision, operation } => {
                if let Some(applied) = self.apply_remote(revision, &operation)? {
                    events.push(SyncEvent::RemoteEdit {
                        revision,
                        operation: applied,
                    });
                    outgoing.push(ClientMessage::Ack { revision });
                }
            }
            ServerMessage::PresenceSnapshot { peers } => {
                events.extend(peers.into_iter().map(|peer| SyncEvent::Presence {
                    client_id: peer.client_id,
                    selection: peer.selection,
                }));
            }
            ServerMessage::Presence { client_id, selection } => {
                events.push(SyncEvent::Presence { client_id, selection });
            }
            ServerMessage::Error { kind, message } => {
                events.push(SyncEvent::Error { kind, message });
            }
            ServerMessage::Pong => events.push(SyncEvent::Pong),
        }
        Ok((events, outgoing))
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Local state now matches the server at `revision`
    Synced { revision: Revision, discarded: usize },
    /// Our own edit was accepted
    Confirmed { revision: Revision },
    /// Another client's edit, as applied to the local text
    RemoteEdit { revision: Revision, operation: Operation },
    Presence {
        client_id: ClientId,
        selection: Option<Selection>,
    },
    Error { kind: ErrorKind, message: String },
    Pong,
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server and keeps a
/// [`ClientDocument`] in step with it.
pub struct SyncClient {
    client_id: ClientId,
    document_id: DocumentId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    document: Arc<Mutex<ClientDocument>>,
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(client_id: ClientId, document_id: DocumentId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id,
            document_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            document: Arc::new(Mutex::new(ClientDocument::new(client_id))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document.
    ///
    /// Spawns a writer and a reader task. A client that synced before joins
    /// with its last known revision and gets caught up.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
                if matches!(msg, ClientMessage::Leave) {
                    let _ = ws_writer.close().await;
                    break;
                }
            }
        });

        let join = ClientMessage::Join {
            document_id: self.document_id.clone(),
            client_id: self.client_id,
            last_known_revision: self.document.lock().last_known_revision(),
        };
        out_tx.send(join).await.map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let document = self.document.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let server_msg = match ServerMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("{client_id} got an undecodable frame: {e}");
                        continue;
                    }
                };

                let handled = document.lock().handle(server_msg);
                match handled {
                    Ok((events, outgoing)) => {
                        for msg in outgoing {
                            if out_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        for event in events {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Err(e) => {
                        // Local state no longer matches the server; rejoin to resync.
                        log::warn!("{client_id} lost sync: {e}");
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), SyncError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        if let Some(tx) = &self.outgoing_tx {
            tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Insert text locally and send it when possible.
    pub async fn insert(&self, pos: usize, text: &str) -> Result<(), SyncError> {
        let outgoing = self.document.lock().insert(pos, text)?;
        match outgoing {
            Some(msg) => self.send(msg).await,
            None => Ok(()),
        }
    }

    /// Delete `start..end` locally and send it when possible.
    pub async fn delete(&self, start: usize, end: usize) -> Result<(), SyncError> {
        let outgoing = self.document.lock().delete(start, end)?;
        match outgoing {
            Some(msg) => self.send(msg).await,
            None => Ok(()),
        }
    }

    /// Publish the local selection. Dropped while offline.
    pub async fn set_selection(&self, selection: Option<Selection>) -> Result<(), SyncError> {
        let selection = {
            let mut document = self.document.lock();
            document.set_selection(selection);
            document.selection()
        };
        self.send(ClientMessage::Presence { selection }).await
    }

    pub async fn send_ping(&self) -> Result<(), SyncError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), SyncError> {
        self.send(ClientMessage::Leave).await?;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn text(&self) -> String {
        self.document.lock().text().to_string()
    }

    pub fn revision(&self) -> Revision {
        self.document.lock().revision()
    }

    pub fn has_pending(&self) -> bool {
        self.document.lock().has_pending()
    }
}
