//! Authoritative document state: one session per document id.
//!
//! The authority turns concurrently submitted [`ClientUpdate`]s into a single
//! gap-free revision sequence. An update made against an older revision is
//! rebased across every log entry recorded since, with the log winning
//! insert ties.

use crate::engine::{OperationEngine, Side};
use crate::error::SyncError;
use crate::protocol::{ClientUpdate, DocId, ServerBroadcast};

/// Text plus the append-only operation log that produced it.
#[derive(Debug, Clone)]
pub struct Document<Op> {
    pub id: DocId,
    pub state: String,
    pub log: Vec<Op>,
}

impl<Op> Document<Op> {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            state: String::new(),
            log: Vec::new(),
        }
    }

    /// Number of log entries, which is also the next revision to assign.
    pub fn revision(&self) -> u64 {
        self.log.len() as u64
    }
}

/// Owns and mutates exactly one [`Document`].
pub struct AuthoritySession<E: OperationEngine> {
    engine: E,
    doc: Document<E::Op>,
}

impl<E: OperationEngine> AuthoritySession<E> {
    pub fn new(engine: E, doc_id: impl Into<DocId>) -> Self {
        Self {
            engine,
            doc: Document::new(doc_id),
        }
    }

    /// Rebase, apply and record one client update.
    ///
    /// Returns `Ok(None)` when the update has no effect once rebased; the
    /// revision counter does not move in that case.
    pub fn handle_update(
        &mut self,
        update: ClientUpdate<E::Op>,
    ) -> Result<Option<ServerBroadcast<E::Op>>, SyncError> {
        let head = self.doc.revision();
        if update.base_revision > head {
            return Err(SyncError::RevisionOutOfRange {
                base: update.base_revision,
                head,
            });
        }

        let mut op = update.operation;
        for concurrent in &self.doc.log[update.base_revision as usize..] {
            op = self.engine.transform(&op, concurrent, Side::Right);
        }

        if self.engine.is_noop(&op) {
            log::debug!(
                "Update {} on doc {} is a no-op at revision {head}",
                update.id,
                self.doc.id
            );
            return Ok(None);
        }

        self.doc.state = self.engine.apply(&self.doc.state, &op)?;
        self.doc.log.push(op.clone());

        log::trace!(
            "Doc {} revision {head} from update {} (base {})",
            self.doc.id,
            update.id,
            update.base_revision
        );

        Ok(Some(ServerBroadcast {
            operation: op,
            revision: head,
            source: Some(update.id),
        }))
    }

    /// Rebuild the text by applying the whole log to the empty document.
    pub fn replay(&self) -> Result<String, SyncError> {
        self.doc
            .log
            .iter()
            .try_fold(String::new(), |state, op| self.engine.apply(&state, op))
    }

    pub fn document(&self) -> &Document<E::Op> {
        &self.doc
    }

    pub fn state(&self) -> &str {
        &self.doc.state
    }

    pub fn revision(&self) -> u64 {
        self.doc.revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{TextEngine, TextOp};
    use uuid::Uuid;

    fn update(op: TextOp, base_revision: u64) -> ClientUpdate<TextOp> {
        ClientUpdate { operation: op, base_revision, id: Uuid::new_v4() }
    }

    #[test]
    fn test_first_update_gets_revision_zero() {
        let mut authority = AuthoritySession::new(TextEngine, "doc");
        let u = update(TextOp::insert(0, "lorem"), 0);
        let id = u.id;

        let broadcast = authority.handle_update(u).unwrap().unwrap();
        assert_eq!(broadcast.revision, 0);
        assert_eq!(broadcast.source, Some(id));
        assert_eq!(authority.state(), "lorem");
        assert_eq!(authority.revision(), 1);
    }

    #[test]
    fn test_stale_update_is_rebased() {
        let mut authority = AuthoritySession::new(TextEngine, "doc");
        authority.handle_update(update(TextOp::insert(0, "lorem ipsum"), 0)).unwrap();

        // Both made against revision 1.
        authority.handle_update(update(TextOp::insert(5, " dolor"), 1)).unwrap();
        let late = authority
            .handle_update(update(TextOp::delete(5, 6), 1))
            .unwrap()
            .unwrap();

        assert_eq!(late.revision, 2);
        assert_eq!(authority.state(), "lorem dolor");
        assert_eq!(authority.replay().unwrap(), authority.state());
    }

    #[test]
    fn test_noop_does_not_advance_revision() {
        let mut authority = AuthoritySession::new(TextEngine, "doc");
        authority.handle_update(update(TextOp::insert(0, "abc"), 0)).unwrap();
        authority.handle_update(update(TextOp::delete(1, 1), 1)).unwrap();

        // Same delete, concurrent with the first one: nothing left to do.
        let result = authority.handle_update(update(TextOp::delete(1, 1), 1)).unwrap();
        assert!(result.is_none());
        assert_eq!(authority.revision(), 2);

        assert!(authority.handle_update(update(TextOp::default(), 2)).unwrap().is_none());
        assert_eq!(authority.revision(), 2);
    }

    #[test]
    fn test_future_base_revision_rejected() {
        let mut authority = AuthoritySession::new(TextEngine, "doc");
        let err = authority.handle_update(update(TextOp::insert(0, "x"), 3)).unwrap_err();
        assert_eq!(err, SyncError::RevisionOutOfRange { base: 3, head: 0 });
    }

    #[test]
    fn test_invalid_operation_leaves_document_untouched() {
        let mut authority = AuthoritySession::new(TextEngine, "doc");
        authority.handle_update(update(TextOp::insert(0, "ab"), 0)).unwrap();

        let err = authority.handle_update(update(TextOp::delete(0, 10), 1)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert_eq!(authority.state(), "ab");
        assert_eq!(authority.revision(), 1);
    }

    #[test]
    fn test_revisions_have_no_gaps() {
        let mut authority = AuthoritySession::new(TextEngine, "doc");
        let revisions: Vec<u64> = (0..10)
            .filter_map(|i| {
                // Every update claims base 0, so each is rebased over the rest.
                authority
                    .handle_update(update(TextOp::insert(0, i.to_string()), 0))
                    .unwrap()
            })
            .map(|b| b.revision)
            .collect();
        assert_eq!(revisions, (0..10).collect::<Vec<_>>());
        assert_eq!(authority.document().log.len(), 10);
    }
}
