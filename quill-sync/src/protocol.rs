//! Wire schema for document-scoped sync messages.
//!
//! Every WebSocket text frame carries one [`WireEvent`]:
//! ```text
//! { "event": "open document", "data": "<docId>" }
//! { "event": "client update", "data": "{\"docId\":…,\"update\":{…}}" }
//! { "event": "server update", "data": "{\"operation\":…,\"revision\":…}" }
//! { "event": "resync",        "data": "<docId>" }
//! { "event": "snapshot",      "data": "{\"docId\":…,\"state\":…,\"revision\":…}" }
//! ```
//!
//! Update payloads are themselves JSON strings, so a malformed payload can be
//! rejected without losing the frame that carried it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Document identifier as chosen by clients.
pub type DocId = String;

/// Server-assigned identifier of one connection.
pub type ConnectionId = Uuid;

/// An edit a replica believes applies on top of `base_revision` log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUpdate<Op> {
    pub operation: Op,
    pub base_revision: u64,
    /// Echoed back as [`ServerBroadcast::source`] so the sender can spot its ack.
    /// Payloads without one get a fresh id.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
}

/// An authoritative operation stored at log index `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerBroadcast<Op> {
    pub operation: Op,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Uuid>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientUpdatePacket<Op> {
    doc_id: DocId,
    update: ClientUpdate<Op>,
}

/// Full document state sent to a replica that lost track of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub doc_id: DocId,
    pub state: String,
    pub revision: u64,
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WireEvent {
    #[serde(rename = "open document")]
    OpenDocument(DocId),
    #[serde(rename = "client update")]
    ClientUpdate(String),
    #[serde(rename = "server update")]
    ServerUpdate(String),
    #[serde(rename = "resync")]
    Resync(DocId),
    #[serde(rename = "snapshot")]
    Snapshot(String),
}

impl WireEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenDocument(_) => "open document",
            Self::ClientUpdate(_) => "client update",
            Self::ServerUpdate(_) => "server update",
            Self::Resync(_) => "resync",
            Self::Snapshot(_) => "snapshot",
        }
    }
}

pub fn encode_client_update<Op: Serialize>(
    doc_id: &str,
    update: &ClientUpdate<Op>,
) -> Result<String, ProtocolError> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Borrowed<'a, Op> {
        doc_id: &'a str,
        update: &'a ClientUpdate<Op>,
    }
    serde_json::to_string(&Borrowed { doc_id, update })
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub fn decode_client_update<Op: DeserializeOwned>(
    payload: &str,
) -> Result<(DocId, ClientUpdate<Op>), ProtocolError> {
    let packet: ClientUpdatePacket<Op> = serde_json::from_str(payload)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok((packet.doc_id, packet.update))
}

pub fn encode_server_update<Op: Serialize>(
    broadcast: &ServerBroadcast<Op>,
) -> Result<String, ProtocolError> {
    serde_json::to_string(broadcast).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub fn decode_server_update<Op: DeserializeOwned>(
    payload: &str,
) -> Result<ServerBroadcast<Op>, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

impl Snapshot {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedEvent(&'static str),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedEvent(name) => write!(f, "Unexpected event: {name}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
