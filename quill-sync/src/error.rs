//! Logical synchronization errors.
//!
//! Wire-level failures live in [`crate::protocol::ProtocolError`]; this type
//! covers everything that goes wrong after a message has been decoded.

/// Errors raised by authority and replica sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A replica received a broadcast out of sequence (gap or repeat).
    Desynchronized { expected: u64, received: u64 },
    /// The replica was desynchronized earlier and has not been resynced.
    NeedsResync,
    /// A client update claims a base revision the document never reached.
    RevisionOutOfRange { base: u64, head: u64 },
    /// The operation does not fit the text it was applied to.
    InvalidOperation(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Desynchronized { expected, received } => write!(
                f,
                "Desynchronized: expected revision {expected}, received {received}"
            ),
            Self::NeedsResync => write!(f, "Session is desynchronized and needs a resync"),
            Self::RevisionOutOfRange { base, head } => {
                write!(f, "Base revision {base} is beyond document head {head}")
            }
            Self::InvalidOperation(e) => write!(f, "Invalid operation: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SyncError::Desynchronized { expected: 3, received: 5 };
        assert_eq!(err.to_string(), "Desynchronized: expected revision 3, received 5");

        let err = SyncError::RevisionOutOfRange { base: 9, head: 2 };
        assert!(err.to_string().contains("beyond document head 2"));
    }
}
