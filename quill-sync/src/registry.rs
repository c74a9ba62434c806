//! Room registry: maps document ids to authority sessions and subscribers.
//!
//! ```text
//!            ┌──────────── RoomRegistry ─────────────┐
//! update ──► │ doc_id ─► Room { AuthoritySession,    │
//!            │                  subscribers }        │
//!            │                     │ broadcast       │
//!            │        ┌────────────┼────────────┐    │
//!            │        ▼            ▼            ▼    │
//!            │     outbox A     outbox B     outbox C│
//!            └───────────────────────────────────────┘
//! ```
//!
//! The registry is single-owner state: every method takes `&mut self` and
//! runs to completion, so one document's broadcasts are pushed to every
//! outbox in the same order. Outboxes are unbounded FIFO channels; a lagging
//! connection never loses a broadcast.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;

use crate::authority::AuthoritySession;
use crate::engine::OperationEngine;
use crate::error::SyncError;
use crate::protocol::{ClientUpdate, ConnectionId, DocId, ServerBroadcast, Snapshot};

/// A message queued for delivery to one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound<Op> {
    ServerUpdate {
        doc_id: DocId,
        broadcast: ServerBroadcast<Op>,
    },
    Snapshot(Snapshot),
}

pub type Outbox<Op> = mpsc::UnboundedSender<Outbound<Op>>;

/// Statistics for monitoring registry health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub updates_applied: u64,
    pub updates_dropped: u64,
    pub updates_rejected: u64,
    pub messages_delivered: u64,
    pub messages_undeliverable: u64,
}

/// One document plus the connections subscribed to it.
struct Room<E: OperationEngine> {
    authority: AuthoritySession<E>,
    subscribers: BTreeSet<ConnectionId>,
}

pub struct RoomRegistry<E: OperationEngine> {
    engine: E,
    rooms: HashMap<DocId, Room<E>>,
    outboxes: HashMap<ConnectionId, Outbox<E::Op>>,
    stats: RegistryStats,
}

impl<E: OperationEngine> RoomRegistry<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            rooms: HashMap::new(),
            outboxes: HashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    fn room(&mut self, doc_id: &str) -> &mut Room<E> {
        if !self.rooms.contains_key(doc_id) {
            log::info!("Creating document {doc_id}");
        }
        let engine = &self.engine;
        self.rooms.entry(doc_id.to_string()).or_insert_with(|| Room {
            authority: AuthoritySession::new(engine.clone(), doc_id),
            subscribers: BTreeSet::new(),
        })
    }

    /// Register where a connection's messages should go.
    pub fn connect(&mut self, conn: ConnectionId, outbox: Outbox<E::Op>) {
        if self.outboxes.insert(conn, outbox).is_some() {
            log::debug!("Connection {conn} replaced its outbox");
        }
    }

    /// Subscribe `conn` to `doc_id`, creating the document if needed.
    pub fn join(&mut self, conn: ConnectionId, doc_id: &str) {
        if self.room(doc_id).subscribers.insert(conn) {
            log::info!("Connection {conn} joined doc {doc_id}");
        }
    }

    /// Join `doc_id` and send `conn` the current state to start from.
    ///
    /// The snapshot is queued before any later broadcast, so the joiner sees
    /// the log continue exactly where the snapshot ends.
    pub fn open(&mut self, conn: ConnectionId, doc_id: &str) {
        self.join(conn, doc_id);
        let snapshot = self.snapshot(doc_id);
        log::debug!("Opening doc {doc_id} for {conn} at revision {}", snapshot.revision);
        self.deliver(conn, Outbound::Snapshot(snapshot));
    }

    pub fn leave(&mut self, conn: ConnectionId, doc_id: &str) -> bool {
        self.rooms
            .get_mut(doc_id)
            .is_some_and(|room| room.subscribers.remove(&conn))
    }

    /// Forget a connection and all of its subscriptions.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.outboxes.remove(&conn);
        for room in self.rooms.values_mut() {
            room.subscribers.remove(&conn);
        }
        log::info!("Connection {conn} disconnected");
    }

    /// Hand an update to the document's authority and fan out the result.
    ///
    /// Every subscriber, the submitter included, receives the broadcast.
    /// `Ok(None)` means the update was a no-op and nothing was sent.
    pub fn submit_update(
        &mut self,
        doc_id: &str,
        update: ClientUpdate<E::Op>,
    ) -> Result<Option<ServerBroadcast<E::Op>>, SyncError> {
        let room = self.room(doc_id);
        let result = room.authority.handle_update(update);
        let subscribers: Vec<ConnectionId> = room.subscribers.iter().copied().collect();

        let broadcast = match result {
            Ok(Some(broadcast)) => broadcast,
            Ok(None) => {
                self.stats.updates_dropped += 1;
                return Ok(None);
            }
            Err(e) => {
                self.stats.updates_rejected += 1;
                log::warn!("Rejected update for doc {doc_id}: {e}");
                return Err(e);
            }
        };

        self.stats.updates_applied += 1;
        for conn in subscribers {
            self.deliver(
                conn,
                Outbound::ServerUpdate {
                    doc_id: doc_id.to_string(),
                    broadcast: broadcast.clone(),
                },
            );
        }
        Ok(Some(broadcast))
    }

    /// Send the full document state to one connection.
    pub fn resync(&mut self, conn: ConnectionId, doc_id: &str) {
        let snapshot = self.snapshot(doc_id);
        log::info!("Resyncing connection {conn} on doc {doc_id} at revision {}", snapshot.revision);
        self.deliver(conn, Outbound::Snapshot(snapshot));
    }

    pub fn snapshot(&mut self, doc_id: &str) -> Snapshot {
        let authority = &self.room(doc_id).authority;
        Snapshot {
            doc_id: doc_id.to_string(),
            state: authority.state().to_string(),
            revision: authority.revision(),
        }
    }

    fn deliver(&mut self, conn: ConnectionId, msg: Outbound<E::Op>) {
        match self.outboxes.get(&conn) {
            Some(outbox) if outbox.send(msg).is_ok() => self.stats.messages_delivered += 1,
            _ => {
                self.stats.messages_undeliverable += 1;
                log::debug!("Connection {conn} has no open outbox; message dropped");
            }
        }
    }

    pub fn authority(&self, doc_id: &str) -> Option<&AuthoritySession<E>> {
        self.rooms.get(doc_id).map(|room| &room.authority)
    }

    pub fn subscribers(&self, doc_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(doc_id)
            .map(|room| room.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn documents(&self) -> Vec<DocId> {
        self.rooms.keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}
