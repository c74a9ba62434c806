//! One editor's view of a shared document.
//!
//! A replica keeps at most one update in flight. Edits made while waiting for
//! its acknowledgement are composed into a buffer that is submitted once the
//! in-flight update is confirmed (or turns out to be redundant).
//!
//! ```text
//!              edit                    edit
//! Synchronized ────► AwaitingConfirm ────► AwaitingWithBuffer
//!      ▲                │      ▲                 │
//!      └──── ack ───────┘      └────── ack ──────┘ (buffer sent)
//! ```
//!
//! Foreign broadcasts are rebased over the pending edits before they touch the
//! local text, and the pending edits are rebased over the broadcast in turn.

use uuid::Uuid;

use crate::engine::{OperationEngine, Side};
use crate::error::SyncError;
use crate::protocol::{ClientUpdate, ServerBroadcast};

#[derive(Debug, Clone)]
enum Outstanding<Op> {
    Synchronized,
    AwaitingConfirm { id: Uuid, op: Op },
    AwaitingWithBuffer { id: Uuid, op: Op, buffer: Op },
}

/// Local document state plus unacknowledged edits.
pub struct ReplicaSession<E: OperationEngine> {
    engine: E,
    state: String,
    /// Log entries applied so far; the revision the next broadcast must carry.
    revision: u64,
    outstanding: Outstanding<E::Op>,
    desynchronized: bool,
}

impl<E: OperationEngine> ReplicaSession<E> {
    /// A replica of a fresh, empty document.
    pub fn new(engine: E) -> Self {
        Self::from_snapshot(engine, String::new(), 0)
    }

    /// A replica that starts from a known authoritative state.
    pub fn from_snapshot(engine: E, state: String, revision: u64) -> Self {
        Self {
            engine,
            state,
            revision,
            outstanding: Outstanding::Synchronized,
            desynchronized: false,
        }
    }

    /// Diff `new_text` against the local text and feed the result to
    /// [`handle_edit`](Self::handle_edit).
    pub fn handle_text(&mut self, new_text: &str) -> Result<Option<ClientUpdate<E::Op>>, SyncError> {
        match self.engine.infer_ops(&self.state, new_text) {
            Some(op) => self.handle_edit(op),
            None => Ok(None),
        }
    }

    /// Record a local edit.
    ///
    /// Returns an update to submit when nothing else is in flight. An empty
    /// edit, or one buffered behind an in-flight update, yields `None`.
    pub fn handle_edit(&mut self, op: E::Op) -> Result<Option<ClientUpdate<E::Op>>, SyncError> {
        if self.desynchronized {
            return Err(SyncError::NeedsResync);
        }
        if self.engine.is_noop(&op) {
            return Ok(None);
        }
        self.state = self.engine.apply(&self.state, &op)?;

        let (outstanding, update) = match std::mem::replace(&mut self.outstanding, Outstanding::Synchronized) {
            Outstanding::Synchronized => {
                let update = self.submit(op.clone());
                (Outstanding::AwaitingConfirm { id: update.id, op }, Some(update))
            }
            Outstanding::AwaitingConfirm { id, op: in_flight } => (
                Outstanding::AwaitingWithBuffer { id, op: in_flight, buffer: op },
                None,
            ),
            Outstanding::AwaitingWithBuffer { id, op: in_flight, buffer } => {
                let buffer = self.engine.compose(&buffer, &op);
                (Outstanding::AwaitingWithBuffer { id, op: in_flight, buffer }, None)
            }
        };
        self.outstanding = outstanding;
        Ok(update)
    }

    /// Apply the next authoritative operation.
    ///
    /// Broadcasts must arrive in revision order with no gaps; anything else
    /// marks the session desynchronized until [`resync`](Self::resync).
    /// Returns the buffered edits as a new update when they become sendable.
    pub fn handle_broadcast(
        &mut self,
        broadcast: ServerBroadcast<E::Op>,
    ) -> Result<Option<ClientUpdate<E::Op>>, SyncError> {
        if self.desynchronized {
            return Err(SyncError::NeedsResync);
        }
        if broadcast.revision != self.revision {
            self.desynchronized = true;
            log::warn!(
                "Replica expected revision {}, got {}; needs resync",
                self.revision,
                broadcast.revision
            );
            return Err(SyncError::Desynchronized {
                expected: self.revision,
                received: broadcast.revision,
            });
        }

        let outstanding = std::mem::replace(&mut self.outstanding, Outstanding::Synchronized);
        let is_ack = matches!(
            (&outstanding, broadcast.source),
            (Outstanding::AwaitingConfirm { id, .. } | Outstanding::AwaitingWithBuffer { id, .. }, Some(source))
                if *id == source
        );

        let (outstanding, update) = if is_ack {
            self.revision += 1;
            match outstanding {
                Outstanding::AwaitingWithBuffer { buffer, .. } => {
                    let update = self.submit(buffer.clone());
                    (Outstanding::AwaitingConfirm { id: update.id, op: buffer }, Some(update))
                }
                _ => (Outstanding::Synchronized, None),
            }
        } else {
            match self.apply_foreign(broadcast.operation, outstanding) {
                Ok(next) => next,
                Err(e) => {
                    self.desynchronized = true;
                    return Err(e);
                }
            }
        };

        self.outstanding = outstanding;
        Ok(update)
    }

    /// Rebase a foreign operation over the pending edits and apply it.
    fn apply_foreign(
        &mut self,
        op: E::Op,
        outstanding: Outstanding<E::Op>,
    ) -> Result<(Outstanding<E::Op>, Option<ClientUpdate<E::Op>>), SyncError> {
        let e = &self.engine;
        let (op, next) = match outstanding {
            Outstanding::Synchronized => (op, Outstanding::Synchronized),
            Outstanding::AwaitingConfirm { id, op: in_flight } => {
                let rebased = e.transform(&op, &in_flight, Side::Left);
                let in_flight = e.transform(&in_flight, &op, Side::Right);
                (rebased, Outstanding::AwaitingConfirm { id, op: in_flight })
            }
            Outstanding::AwaitingWithBuffer { id, op: in_flight, buffer } => {
                let over_flight = e.transform(&op, &in_flight, Side::Left);
                let in_flight = e.transform(&in_flight, &op, Side::Right);
                let rebased = e.transform(&over_flight, &buffer, Side::Left);
                let buffer = e.transform(&buffer, &over_flight, Side::Right);
                (rebased, Outstanding::AwaitingWithBuffer { id, op: in_flight, buffer })
            }
        };

        self.state = self.engine.apply(&self.state, &op)?;
        self.revision += 1;

        // The authority rebases the in-flight update over the same broadcasts,
        // so once it is a no-op here it will be dropped there too and no ack
        // will ever arrive for it.
        Ok(match next {
            Outstanding::AwaitingConfirm { id, op } if self.engine.is_noop(&op) => {
                log::debug!("In-flight update {id} became a no-op");
                (Outstanding::Synchronized, None)
            }
            Outstanding::AwaitingWithBuffer { id, op, buffer } if self.engine.is_noop(&op) => {
                log::debug!("In-flight update {id} became a no-op; sending buffer");
                if self.engine.is_noop(&buffer) {
                    (Outstanding::Synchronized, None)
                } else {
                    let update = self.submit(buffer.clone());
                    (Outstanding::AwaitingConfirm { id: update.id, op: buffer }, Some(update))
                }
            }
            Outstanding::AwaitingWithBuffer { id, op, buffer } if self.engine.is_noop(&buffer) => {
                (Outstanding::AwaitingConfirm { id, op }, None)
            }
            other => (other, None),
        })
    }

    fn submit(&self, op: E::Op) -> ClientUpdate<E::Op> {
        ClientUpdate {
            operation: op,
            base_revision: self.revision,
            id: Uuid::new_v4(),
        }
    }

    /// Reset to an authoritative snapshot, discarding unacknowledged edits.
    ///
    /// Returns `true` if local edits were lost.
    pub fn resync(&mut self, state: String, revision: u64) -> bool {
        let lost = !matches!(self.outstanding, Outstanding::Synchronized);
        if lost {
            log::warn!("Resync to revision {revision} discards unacknowledged local edits");
        }
        self.state = state;
        self.revision = revision;
        self.outstanding = Outstanding::Synchronized;
        self.desynchronized = false;
        lost
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// Count of authoritative log entries reflected in the local text.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Id of the update awaiting acknowledgement, if any.
    pub fn in_flight(&self) -> Option<Uuid> {
        match &self.outstanding {
            Outstanding::Synchronized => None,
            Outstanding::AwaitingConfirm { id, .. } | Outstanding::AwaitingWithBuffer { id, .. } => Some(*id),
        }
    }

    /// No local edit is waiting for acknowledgement.
    pub fn is_synchronized(&self) -> bool {
        matches!(self.outstanding, Outstanding::Synchronized)
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }
}
