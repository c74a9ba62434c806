//! WebSocket sync client: one replica of one document.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Local edits as whole-text replacements, diffed into operations
//! - Automatic ack handling, buffering and resync on desynchronization

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::engine::OperationEngine;
use crate::error::SyncError;
use crate::protocol::{
    decode_server_update, encode_client_update, ClientUpdate, DocId, ProtocolError, Snapshot, WireEvent,
};
use crate::replica::ReplicaSession;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Our own update was confirmed at this log index
    Acknowledged { revision: u64 },
    /// Another replica's update was applied at this log index
    RemoteUpdate { revision: u64 },
    /// A broadcast arrived out of order; a resync was requested
    Desynchronized { expected: u64, received: u64 },
    /// Local state was replaced by a snapshot
    Resynced { revision: u64, lost_edits: bool },
}

/// Errors returned by [`SyncClient`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Sync(SyncError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<SyncError> for ClientError {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

type Outgoing = mpsc::Sender<String>;

/// How long [`SyncClient::connect`] waits for the document's current state.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// The sync client.
///
/// Owns a [`ReplicaSession`] shared between the caller and the reader task.
/// Outgoing frames are queued while the session lock is held, so the server
/// sees updates in the order the session produced them.
pub struct SyncClient<E: OperationEngine> {
    /// Document we're editing
    doc_id: DocId,

    /// Server URL
    server_url: String,

    replica: Arc<Mutex<ReplicaSession<E>>>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<Outgoing>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl<E: OperationEngine> SyncClient<E> {
    pub fn new(engine: E, doc_id: impl Into<DocId>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            doc_id: doc_id.into(),
            server_url: server_url.into(),
            replica: Arc::new(Mutex::new(ReplicaSession::new(engine))),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and open the document.
    ///
    /// Returns once the server's snapshot of the document has been loaded,
    /// so edits made afterwards build on the authoritative text.
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        send_event(&out_tx, WireEvent::OpenDocument(self.doc_id.clone())).await?;
        let opened = tokio::time::timeout(OPEN_TIMEOUT, initial_snapshot(&mut ws_reader))
            .await
            .unwrap_or(Err(ProtocolError::ConnectionClosed));
        let snapshot = match opened {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Failed to open doc {} on {}: {e}", self.doc_id, self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        log::debug!("Loaded doc {} at revision {}", self.doc_id, snapshot.revision);
        self.replica.lock().await.resync(snapshot.state, snapshot.revision);

        // The reader only holds a weak sender, so dropping ours closes the socket.
        let weak_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);
        log::info!("Connected to {} on doc {}", self.server_url, self.doc_id);

        // Reader task: feed broadcasts and snapshots into the replica
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let doc_id = self.doc_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Some(out_tx) = weak_tx.upgrade() else { break };
                        let result = match WireEvent::decode(text.as_str()) {
                            Ok(event) => handle_server_event(event, &doc_id, &replica, &out_tx, &event_tx).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            log::warn!("Ignoring server frame on doc {doc_id}: {e}");
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
            log::info!("Disconnected from doc {doc_id}");
        });

        Ok(())
    }

    /// Replace the local text with `new_text` and submit the difference.
    pub async fn update(&self, new_text: &str) -> Result<(), ClientError> {
        let tx = match (&self.outgoing_tx, self.connection_state().await) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => return Err(ProtocolError::ConnectionClosed.into()),
        };

        let mut replica = self.replica.lock().await;
        if let Some(update) = replica.handle_text(new_text)? {
            send_update(tx, &self.doc_id, &update).await?;
        }
        Ok(())
    }

    /// Ask the server for a fresh snapshot of the document.
    pub async fn request_resync(&self) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => send_event(tx, WireEvent::Resync(self.doc_id.clone())).await,
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. Unacknowledged edits stay in the local text.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Current local text.
    pub async fn current(&self) -> String {
        self.replica.lock().await.state().to_string()
    }

    pub async fn revision(&self) -> u64 {
        self.replica.lock().await.revision()
    }

    /// No local edit is waiting for acknowledgement.
    pub async fn is_synchronized(&self) -> bool {
        self.replica.lock().await.is_synchronized()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

async fn handle_server_event<E: OperationEngine>(
    event: WireEvent,
    doc_id: &str,
    replica: &Mutex<ReplicaSession<E>>,
    out_tx: &Outgoing,
    event_tx: &mpsc::Sender<SyncEvent>,
) -> Result<(), ProtocolError> {
    match event {
        WireEvent::ServerUpdate(payload) => {
            let broadcast = decode_server_update::<E::Op>(&payload)?;
            let revision = broadcast.revision;
            let mut replica = replica.lock().await;
            let own = broadcast.source.is_some() && broadcast.source == replica.in_flight();

            match replica.handle_broadcast(broadcast) {
                Ok(follow_up) => {
                    emit(
                        event_tx,
                        if own {
                            SyncEvent::Acknowledged { revision }
                        } else {
                            SyncEvent::RemoteUpdate { revision }
                        },
                    );
                    if let Some(update) = follow_up {
                        send_update(out_tx, doc_id, &update).await?;
                    }
                }
                Err(SyncError::NeedsResync) => {
                    log::debug!("Skipping revision {revision} on doc {doc_id} while awaiting snapshot");
                }
                Err(e) => {
                    log::warn!("Doc {doc_id} lost sync at revision {revision}: {e}");
                    if let SyncError::Desynchronized { expected, received } = e {
                        emit(event_tx, SyncEvent::Desynchronized { expected, received });
                    }
                    send_event(out_tx, WireEvent::Resync(doc_id.to_string())).await?;
                }
            }
            Ok(())
        }
        WireEvent::Snapshot(payload) => {
            let snapshot = Snapshot::decode(&payload)?;
            let lost_edits = replica.lock().await.resync(snapshot.state, snapshot.revision);
            emit(event_tx, SyncEvent::Resynced { revision: snapshot.revision, lost_edits });
            Ok(())
        }
        other => Err(ProtocolError::UnexpectedEvent(other.name())),
    }
}

/// Wait for the snapshot that answers `open document`.
async fn initial_snapshot<S>(reader: &mut S) -> Result<Snapshot, ProtocolError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match WireEvent::decode(text.as_str())? {
                    WireEvent::Snapshot(payload) => Snapshot::decode(&payload),
                    other => Err(ProtocolError::UnexpectedEvent(other.name())),
                };
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed)
}

async fn send_event(tx: &Outgoing, event: WireEvent) -> Result<(), ProtocolError> {
    let frame = event.encode()?;
    tx.send(frame).await.map_err(|_| ProtocolError::ConnectionClosed)
}

async fn send_update<Op: serde::Serialize>(
    tx: &Outgoing,
    doc_id: &str,
    update: &ClientUpdate<Op>,
) -> Result<(), ProtocolError> {
    send_event(tx, WireEvent::ClientUpdate(encode_client_update(doc_id, update)?)).await
}

/// Events are dropped when the application is not draining them.
fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    let _ = tx.try_send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TextEngine;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new(TextEngine, "DOC0", "ws://127.0.0.1:9643");
        assert_eq!(client.doc_id(), "DOC0");
        assert_eq!(client.server_url(), "ws://127.0.0.1:9643");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mut client = SyncClient::new(TextEngine, "DOC0", "ws://127.0.0.1:9643");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.current().await, "");
        assert_eq!(client.revision().await, 0);
        assert!(client.is_synchronized().await);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_update_requires_connection() {
        let client = SyncClient::new(TextEngine, "DOC0", "ws://127.0.0.1:9643");
        let err = client.update("lorem").await.unwrap_err();
        assert_eq!(err, ClientError::Protocol(ProtocolError::ConnectionClosed));
        assert_eq!(client.current().await, "");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(TextEngine, "DOC0", format!("ws://127.0.0.1:{port}"));
        assert_eq!(client.connect().await.unwrap_err(), ProtocolError::ConnectionClosed);
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_snapshot_event_resets_replica() {
        let replica = Mutex::new(ReplicaSession::new(TextEngine));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let snapshot = Snapshot { doc_id: "DOC0".into(), state: "lorem".into(), revision: 3 };
        let event = WireEvent::Snapshot(snapshot.encode().unwrap());
        handle_server_event(event, "DOC0", &replica, &out_tx, &event_tx).await.unwrap();

        assert_eq!(replica.lock().await.state(), "lorem");
        assert_eq!(event_rx.recv().await, Some(SyncEvent::Resynced { revision: 3, lost_edits: false }));
    }

    #[tokio::test]
    async fn test_initial_snapshot_skips_control_frames() {
        let snapshot = Snapshot { doc_id: "DOC0".into(), state: "lorem".into(), revision: 2 };
        let frames: Vec<Result<Message, tungstenite::Error>> = vec![
            Ok(Message::Ping(Default::default())),
            Ok(Message::text(WireEvent::Snapshot(snapshot.encode().unwrap()).encode().unwrap())),
        ];
        let mut reader = futures_util::stream::iter(frames);
        assert_eq!(initial_snapshot(&mut reader).await.unwrap(), snapshot);

        let mut closed = futures_util::stream::iter(Vec::<Result<Message, tungstenite::Error>>::new());
        assert_eq!(initial_snapshot(&mut closed).await.unwrap_err(), ProtocolError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_gap_requests_resync_once() {
        use crate::engine::TextOp;
        use crate::protocol::{encode_server_update, ServerBroadcast};

        let replica = Mutex::new(ReplicaSession::new(TextEngine));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (event_tx, _event_rx) = mpsc::channel(8);

        let gap = ServerBroadcast { operation: TextOp::insert(0, "x"), revision: 2, source: None };
        let frame = || WireEvent::ServerUpdate(encode_server_update(&gap).unwrap());
        handle_server_event(frame(), "DOC0", &replica, &out_tx, &event_tx).await.unwrap();
        handle_server_event(frame(), "DOC0", &replica, &out_tx, &event_tx).await.unwrap();

        let sent = WireEvent::decode(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent, WireEvent::Resync("DOC0".into()));
        assert!(out_rx.try_recv().is_err());
    }
}
