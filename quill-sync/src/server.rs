//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──► conn task ──┐                      ┌──► outbox A ──► conn task ──► Client A
//!                          ├──► Hub ─ RoomRegistry ┤
//! Client B ──► conn task ──┘   (one task)         └──► outbox B ──► conn task ──► Client B
//! ```
//!
//! Every connection task decodes text frames into [`WireEvent`]s and forwards
//! them to the hub. Broadcasts come back through the connection's outbox and
//! are written to the socket in queue order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::engine::OperationEngine;
use crate::hub::{Hub, HubEvent, HubHandle};
use crate::protocol::{encode_server_update, ConnectionId, ProtocolError, WireEvent};
use crate::registry::Outbound;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Text frames larger than this are dropped
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9643".to_string(),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

/// The sync server.
pub struct SyncServer<E: OperationEngine> {
    config: ServerConfig,
    engine: E,
    stats: Arc<RwLock<ServerStats>>,
}

impl<E: OperationEngine> SyncServer<E> {
    pub fn new(engine: E, config: ServerConfig) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(engine: E) -> Self {
        Self::new(engine, ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (hub, handle) = Hub::new(self.engine.clone());
        tokio::spawn(hub.run());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = handle.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: HubHandle<E::Op>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let conn: ConnectionId = Uuid::new_v4();
        log::info!("WebSocket connection {conn} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        hub.send(HubEvent::Connect { conn, outbox });

        let result = Self::pump(ws_stream, conn, addr, &hub, outbox_rx, &stats, &config).await;

        hub.send(HubEvent::Disconnect { conn });
        stats.write().await.active_connections -= 1;
        result
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        conn: ConnectionId,
        addr: SocketAddr,
        hub: &HubHandle<E::Op>,
        mut outbox_rx: mpsc::UnboundedReceiver<Outbound<E::Op>>,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            if text.len() > config.max_frame_bytes {
                                stats.write().await.rejected_frames += 1;
                                log::warn!("Dropping {} byte frame from {addr}", text.len());
                                continue;
                            }
                            match WireEvent::decode(text.as_str()).and_then(|event| hub_event(conn, event)) {
                                Ok(event) => {
                                    if !hub.send(event) {
                                        log::error!("Hub is gone; closing {addr}");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    stats.write().await.rejected_frames += 1;
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing message queued by the registry
                out = outbox_rx.recv() => {
                    match out {
                        Some(msg) => {
                            let frame = outbound_frame(msg)?;
                            ws_sender.send(Message::text(frame)).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Map a decoded client frame to the hub event it triggers.
fn hub_event<Op>(conn: ConnectionId, event: WireEvent) -> Result<HubEvent<Op>, ProtocolError> {
    match event {
        WireEvent::OpenDocument(doc_id) => Ok(HubEvent::OpenDocument { conn, doc_id }),
        WireEvent::ClientUpdate(payload) => Ok(HubEvent::ClientUpdate { conn, payload }),
        WireEvent::Resync(doc_id) => Ok(HubEvent::Resync { conn, doc_id }),
        other => Err(ProtocolError::UnexpectedEvent(other.name())),
    }
}

/// Encode a registry message as a text frame.
fn outbound_frame<Op: serde::Serialize>(msg: Outbound<Op>) -> Result<String, ProtocolError> {
    let event = match msg {
        Outbound::ServerUpdate { broadcast, .. } => WireEvent::ServerUpdate(encode_server_update(&broadcast)?),
        Outbound::Snapshot(snapshot) => WireEvent::Snapshot(snapshot.encode()?),
    };
    event.encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{TextEngine, TextOp};
    use crate::protocol::{decode_server_update, ServerBroadcast, Snapshot};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9643");
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults(TextEngine);
        assert_eq!(server.bind_addr(), "127.0.0.1:9643");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults(TextEngine);
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_frames, 0);
    }

    #[test]
    fn test_hub_event_rejects_server_events() {
        let conn = Uuid::new_v4();
        let event: Result<HubEvent<TextOp>, _> = hub_event(conn, WireEvent::ServerUpdate("{}".into()));
        assert_eq!(event.unwrap_err(), ProtocolError::UnexpectedEvent("server update"));

        let event: HubEvent<TextOp> = hub_event(conn, WireEvent::OpenDocument("DOC0".into())).unwrap();
        assert!(matches!(event, HubEvent::OpenDocument { doc_id, .. } if doc_id == "DOC0"));
    }

    #[test]
    fn test_outbound_frame_shapes() {
        let broadcast = ServerBroadcast { operation: TextOp::insert(0, "x"), revision: 4, source: None };
        let frame = outbound_frame(Outbound::ServerUpdate { doc_id: "DOC0".into(), broadcast: broadcast.clone() }).unwrap();
        match WireEvent::decode(&frame).unwrap() {
            WireEvent::ServerUpdate(payload) => {
                assert_eq!(decode_server_update::<TextOp>(&payload).unwrap(), broadcast);
            }
            other => panic!("Expected server update, got {other:?}"),
        }

        let snapshot = Snapshot { doc_id: "DOC0".into(), state: "abc".into(), revision: 2 };
        let frame = outbound_frame::<TextOp>(Outbound::Snapshot(snapshot.clone())).unwrap();
        assert_eq!(WireEvent::decode(&frame).unwrap(), WireEvent::Snapshot(snapshot.encode().unwrap()));
    }
}
