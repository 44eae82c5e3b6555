//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Document (text, revision, history)
//!            ├── SessionCoordinator┤
//! Client B ──┘         │           ├── BroadcastGroup ──► per-session DeliveryQueue
//!                      │           └── PresenceRoom
//!                      ▼
//!               DocumentRegistry ── Persistence (memory | RocksDB)
//! ```
//!
//! One task per connection. The first frame must be a `Join`; afterwards the
//! task multiplexes client frames, the session's delivery queue, presence
//! updates and the supersede signal.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{ClientId, Revision};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::broadcast::Delivery;
use crate::config::ServerConfig;
use crate::error::SyncError;
use crate::health;
use crate::document::DocumentId;
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
use crate::registry::DocumentRegistry;
use crate::session::{InitialState, SessionCoordinator};
use crate::storage::{MemoryStore, Persistence};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// How long a fresh connection may take to send its `Join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub edits_accepted: u64,
    pub edits_rejected: u64,
    pub resyncs: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the configured persistence.
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let store = open_store(&config)?;
        Ok(Self::with_store(config, store))
    }

    /// Create a server on top of an existing persistence backend.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Persistence>) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.sync.clone(), store));
        Self {
            config,
            coordinator: Arc::new(SessionCoordinator::new(registry)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration, in-memory persistence.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.coordinator.registry().document_count().await;
        stats
    }

    /// Bind the configured addresses and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let health_listener = TcpListener::bind(&self.config.health_addr).await?;
        log::info!(
            "Sync server listening on {} (health on {})",
            self.config.bind_addr,
            self.config.health_addr
        );
        self.serve(listener, Some(health_listener), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    ///
    /// On shutdown the instance starts draining, stops accepting and
    /// snapshots every open document.
    pub async fn serve<F>(
        &self,
        listener: TcpListener,
        health_listener: Option<TcpListener>,
        shutdown: F,
    ) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        let health_task = health_listener.map(|listener| {
            let app = health::router(self.coordinator.clone());
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    log::error!("Health endpoint failed: {e}");
                }
            })
        });
        let maintenance = tokio::spawn(maintenance_loop(self.coordinator.clone()));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let coordinator = self.coordinator.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, coordinator, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        self.coordinator.begin_drain();
        maintenance.abort();
        if let Some(task) = health_task {
            task.abort();
        }
        let failures = self.coordinator.registry().shutdown().await;
        for failure in &failures {
            log::error!("Final snapshot failed: {failure}");
        }
        log::info!("Sync server stopped");
        Ok(())
    }
}

fn open_store(config: &ServerConfig) -> Result<Arc<dyn Persistence>, SyncError> {
    match &config.storage_path {
        None => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb")]
        Some(path) => {
            let store = crate::storage::RocksStore::open(crate::storage::StoreConfig {
                path: path.clone(),
                ..crate::storage::StoreConfig::default()
            })?;
            log::info!("Opened document store at {}", path.display());
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "rocksdb"))]
        Some(path) => Err(SyncError::Store(crate::storage::StoreError::Unavailable(format!(
            "storage path {} configured but built without the rocksdb feature",
            path.display()
        )))),
    }
}

/// Periodic sweep plus presence flushing at the presence interval.
async fn maintenance_loop(coordinator: Arc<SessionCoordinator>) {
    let floor = Duration::from_millis(1);
    let mut sweep = tokio::time::interval(coordinator.config().sweep_interval.max(floor));
    let mut presence = tokio::time::interval(coordinator.config().presence_interval.max(floor));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    presence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let report = coordinator.sweep(Instant::now()).await;
                for failure in &report.failures {
                    log::error!("Sweep: {failure}");
                }
                if !report.expired_sessions.is_empty() || !report.evicted_documents.is_empty() {
                    log::info!(
                        "Sweep: {} sessions expired, {} documents evicted, {} history entries trimmed",
                        report.expired_sessions.len(),
                        report.evicted_documents.len(),
                        report.trimmed_history
                    );
                }
            }
            _ = presence.tick() => {
                let now = Instant::now();
                for room in coordinator.registry().rooms().await {
                    room.presence().flush_at(now);
                }
            }
        }
    }
}

async fn send(sink: &mut WsSink, stats: &RwLock<ServerStats>, msg: &ServerMessage) -> ConnResult {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    stats.write().await.messages_sent += 1;
    Ok(())
}

async fn send_error(sink: &mut WsSink, stats: &RwLock<ServerStats>, error: &SyncError) -> ConnResult {
    send(sink, stats, &error_message(error)).await
}

fn error_message(error: &SyncError) -> ServerMessage {
    ServerMessage::Error {
        kind: error.kind(),
        message: error.to_string(),
    }
}

/// Bring a session whose delivery queue lost revisions back in step.
///
/// Yields the revision the session is at afterwards and the messages to
/// send: the overflow error, then a catch-up or snapshot.
async fn resync_messages(
    coordinator: &SessionCoordinator,
    client_id: ClientId,
    last_delivered: Revision,
    missed: u64,
) -> Result<(Revision, [ServerMessage; 2]), SyncError> {
    let state = coordinator.catch_up(client_id, last_delivered).await?;
    let overflow = SyncError::DeliveryOverflow {
        client: client_id,
        missed,
    };
    Ok((state.revision(), [error_message(&overflow), initial_message(state)]))
}

/// First frame of a connection, which must be a `Join`.
///
/// `None` means nothing arrived within [`JOIN_TIMEOUT`].
fn parse_join(
    received: Option<Option<Result<Message, WsError>>>,
) -> Result<(DocumentId, ClientId, Option<Revision>), ProtocolError> {
    let frame = match received {
        None => return Err(ProtocolError::Timeout),
        Some(None) | Some(Some(Err(_))) | Some(Some(Ok(Message::Close(_)))) => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Some(Some(Ok(frame))) => frame,
    };
    let Message::Binary(data) = frame else {
        return Err(ProtocolError::UnexpectedMessage("expected a binary Join frame"));
    };
    match ClientMessage::decode(&data)? {
        ClientMessage::Join {
            document_id,
            client_id,
            last_known_revision,
        } => Ok((document_id, client_id, last_known_revision)),
        _ => Err(ProtocolError::UnexpectedMessage("expected Join as first message")),
    }
}

fn initial_message(initial: InitialState) -> ServerMessage {
    match initial {
        InitialState::Snapshot(snapshot) => ServerMessage::Snapshot {
            text: snapshot.text,
            revision: snapshot.revision,
        },
        InitialState::CatchUp { operations, revision } => ServerMessage::CatchUp {
            operations: operations.iter().map(|op| op.as_ref().clone()).collect(),
            revision,
        },
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    coordinator: Arc<SessionCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
) -> ConnResult {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let first = tokio::time::timeout(JOIN_TIMEOUT, ws_receiver.next()).await.ok();
    let (document_id, client_id, last_known_revision) = match parse_join(first) {
        Ok(join) => join,
        Err(e) => {
            log::debug!("{addr} did not join: {e}");
            let _ = send_error(&mut ws_sender, &stats, &SyncError::Protocol(e)).await;
            stats.write().await.active_connections -= 1;
            return Ok(());
        }
    };
    stats.write().await.messages_received += 1;

    let attachment = match coordinator.attach(client_id, &document_id, last_known_revision).await {
        Ok(attachment) => attachment,
        Err(e) => {
            log::warn!("{client_id} could not join {document_id}: {e}");
            let _ = send_error(&mut ws_sender, &stats, &e).await;
            stats.write().await.active_connections -= 1;
            return Ok(());
        }
    };
    let session_id = attachment.session_id;

    let result = run_session(client_id, attachment, &coordinator, &stats, &mut ws_sender, &mut ws_receiver).await;

    coordinator.detach_session(client_id, session_id).await;
    stats.write().await.active_connections -= 1;
    log::info!("Connection of {client_id} from {addr} closed");
    result
}

async fn run_session(
    client_id: ClientId,
    attachment: crate::session::Attachment,
    coordinator: &SessionCoordinator,
    stats: &RwLock<ServerStats>,
    ws_sender: &mut WsSink,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> ConnResult {
    let crate::session::Attachment {
        initial,
        presence,
        mut queue,
        mut presence_rx,
        mut superseded,
        ..
    } = attachment;

    let revision = initial.revision();
    send(ws_sender, stats, &initial_message(initial)).await?;
    send(ws_sender, stats, &ServerMessage::PresenceSnapshot { peers: presence }).await?;
    coordinator.record_delivered(client_id, revision);

    let mut presence_open = true;
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {client_id}: {e}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                stats.write().await.messages_received += 1;
                coordinator.touch(client_id, Instant::now());

                let msg = match ClientMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Undecodable frame from {client_id}: {e}");
                        send_error(ws_sender, stats, &SyncError::Protocol(e)).await?;
                        continue;
                    }
                };

                match msg {
                    ClientMessage::Edit { base_revision, operation } => {
                        match coordinator.submit(client_id, base_revision, operation).await {
                            Ok(_) => stats.write().await.edits_accepted += 1,
                            Err(SyncError::SessionNotFound(_)) => break,
                            Err(e) => {
                                stats.write().await.edits_rejected += 1;
                                send_error(ws_sender, stats, &e).await?;
                                if e.requires_resync() {
                                    let snapshot = match coordinator.snapshot(client_id).await {
                                        Ok(snapshot) => snapshot,
                                        Err(SyncError::SessionNotFound(_)) => break,
                                        Err(e) => return Err(e.into()),
                                    };
                                    let revision = snapshot.revision;
                                    send(ws_sender, stats, &initial_message(InitialState::Snapshot(snapshot))).await?;
                                    queue.advance_to(revision);
                                    coordinator.mark_live(client_id, revision);
                                    stats.write().await.resyncs += 1;
                                }
                                if e.is_fatal() {
                                    break;
                                }
                            }
                        }
                    }
                    ClientMessage::Ack { revision } => {
                        if coordinator.record_ack(client_id, revision).is_err() {
                            break;
                        }
                    }
                    ClientMessage::Presence { selection } => {
                        if coordinator.update_presence(client_id, selection).is_err() {
                            break;
                        }
                    }
                    ClientMessage::Ping => send(ws_sender, stats, &ServerMessage::Pong).await?,
                    ClientMessage::Leave => break,
                    ClientMessage::Join { .. } => {
                        let msg = ServerMessage::Error {
                            kind: ErrorKind::Protocol,
                            message: "already joined".into(),
                        };
                        send(ws_sender, stats, &msg).await?;
                    }
                }
            }

            delivery = queue.next() => {
                match delivery {
                    Delivery::Op(op) => {
                        send(ws_sender, stats, &ServerMessage::for_recipient(&op, client_id)).await?;
                        coordinator.record_delivered(client_id, op.revision);
                    }
                    Delivery::Resync { last_delivered, missed } => {
                        log::info!("{client_id} missed {missed} revisions after {last_delivered}, resyncing");
                        let (revision, messages) =
                            match resync_messages(coordinator, client_id, last_delivered, missed).await {
                                Ok(resync) => resync,
                                Err(SyncError::SessionNotFound(_)) => break,
                                Err(e) => return Err(e.into()),
                            };
                        for msg in &messages {
                            send(ws_sender, stats, msg).await?;
                        }
                        queue.advance_to(revision);
                        coordinator.mark_live(client_id, revision);
                        stats.write().await.resyncs += 1;
                    }
                    Delivery::Closed => break,
                }
            }

            update = presence_rx.recv(), if presence_open => {
                match update {
                    Ok(update) if update.client_id != client_id => {
                        let msg = ServerMessage::Presence {
                            client_id: update.client_id,
                            selection: update.selection,
                        };
                        send(ws_sender, stats, &msg).await?;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => log::debug!("{client_id} skipped {n} presence updates"),
                    Err(RecvError::Closed) => presence_open = false,
                }
            }

            _ = &mut superseded => {
                log::info!("Session of {client_id} superseded or expired");
                break;
            }
        }
    }
    Ok(())
}
