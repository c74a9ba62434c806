//! Single-threaded event dispatcher in front of the [`RoomRegistry`].
//!
//! Connection tasks never touch documents directly. They push [`HubEvent`]s
//! into one inbound queue; the hub handles each event to completion before
//! taking the next, which is what makes per-document broadcast order total.

use tokio::sync::mpsc;

use crate::engine::OperationEngine;
use crate::protocol::{decode_client_update, ConnectionId, DocId};
use crate::registry::{Outbox, RegistryStats, RoomRegistry};

/// Inbound events, one per decoded frame or connection lifecycle change.
#[derive(Debug)]
pub enum HubEvent<Op> {
    Connect { conn: ConnectionId, outbox: Outbox<Op> },
    OpenDocument { conn: ConnectionId, doc_id: DocId },
    /// Raw `client update` payload; decoded by the hub.
    ClientUpdate { conn: ConnectionId, payload: String },
    Resync { conn: ConnectionId, doc_id: DocId },
    Disconnect { conn: ConnectionId },
}

/// Cheap cloneable sender used by connection tasks.
pub struct HubHandle<Op> {
    tx: mpsc::UnboundedSender<HubEvent<Op>>,
}

impl<Op> Clone for HubHandle<Op> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<Op> HubHandle<Op> {
    /// Queue an event. Returns `false` once the hub has shut down.
    pub fn send(&self, event: HubEvent<Op>) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Counters for events the hub could not act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub events: u64,
    pub malformed: u64,
}

pub struct Hub<E: OperationEngine> {
    registry: RoomRegistry<E>,
    inbound: mpsc::UnboundedReceiver<HubEvent<E::Op>>,
    stats: HubStats,
}

impl<E: OperationEngine> Hub<E> {
    pub fn new(engine: E) -> (Self, HubHandle<E::Op>) {
        let (tx, inbound) = mpsc::unbounded_channel();
        let hub = Self {
            registry: RoomRegistry::new(engine),
            inbound,
            stats: HubStats::default(),
        };
        (hub, HubHandle { tx })
    }

    /// Process events until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) -> Self {
        while let Some(event) = self.inbound.recv().await {
            self.dispatch(event);
        }
        log::info!("Hub stopped after {} events", self.stats.events);
        self
    }

    /// Handle queued events without waiting for more.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbound.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    pub fn dispatch(&mut self, event: HubEvent<E::Op>) {
        self.stats.events += 1;
        match event {
            HubEvent::Connect { conn, outbox } => self.registry.connect(conn, outbox),
            HubEvent::OpenDocument { conn, doc_id } => self.registry.open(conn, &doc_id),
            HubEvent::ClientUpdate { conn, payload } => {
                let (doc_id, update) = match decode_client_update::<E::Op>(&payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        self.stats.malformed += 1;
                        log::warn!("Dropping malformed client update from {conn}: {e}");
                        return;
                    }
                };
                // Rejections are logged by the registry. The submitter is
                // stuck waiting for an ack that will never come, so reset it.
                if self.registry.submit_update(&doc_id, update).is_err() {
                    self.registry.resync(conn, &doc_id);
                }
            }
            HubEvent::Resync { conn, doc_id } => self.registry.resync(conn, &doc_id),
            HubEvent::Disconnect { conn } => self.registry.disconnect(conn),
        }
    }

    pub fn registry(&self) -> &RoomRegistry<E> {
        &self.registry
    }

    pub fn registry_stats(&self) -> &RegistryStats {
        self.registry.stats()
    }

    pub fn stats(&self) -> &HubStats {
        &self.stats
    }
}
