//! Error types for the synchronization engine.
//!
//! Codec and dispatcher errors are local: they are collected per batch and
//! logged, never allowed to abort the rest of a delta. Only document import
//! surfaces an error to the user, as a single readable message.

use thiserror::Error;

/// Errors raised by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A compound key could not be split into valid path segments.
    #[error("Malformed key path '{key}': {reason}")]
    MalformedPath { key: String, reason: String },

    /// A chunk left the chunker larger than the remote store accepts.
    #[error("Delta batch too large: {keys} keys and {deletions} deletions (limit {limit})")]
    OversizeBatch {
        keys: usize,
        deletions: usize,
        limit: usize,
    },

    /// The remote store rejected or failed to transmit a submission.
    #[error("Remote submission failed: {0}")]
    RemoteSubmission(String),

    /// An imported board document is unusable.
    #[error("{0}")]
    SnapshotParse(String),

    /// Clients still disagreed with the expected world when time ran out.
    #[error("Clients did not converge: expected {expected} pieces, saw {counts:?}")]
    NotConverged { expected: usize, counts: Vec<usize> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub(crate) fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::MalformedPath {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_path_display() {
        let err = SyncError::malformed("pieces||x", "empty segment");
        let text = err.to_string();
        assert!(text.contains("pieces||x"));
        assert!(text.contains("empty segment"));
    }

    #[test]
    fn test_oversize_display() {
        let err = SyncError::OversizeBatch {
            keys: 20,
            deletions: 3,
            limit: 15,
        };
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("15"));
    }

    #[test]
    fn test_snapshot_message_is_verbatim() {
        let err = SyncError::SnapshotParse("The provided file does not contain valid board game data.".into());
        assert_eq!(
            err.to_string(),
            "The provided file does not contain valid board game data."
        );
    }
}
