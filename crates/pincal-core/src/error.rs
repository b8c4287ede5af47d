//! Error types for Pin Calendar

use std::sync::Arc;

use thiserror::Error;

/// Main error type for Pin Calendar operations
#[derive(Error, Debug)]
pub enum PincalError {
    /// Document is neither in memory nor in storage, and no network is attached
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Document was requested from connected peers, but never arrived
    #[error("Document unavailable: {0}")]
    DocumentUnavailable(String),

    /// A document ID string could not be parsed
    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    /// The document was written by a newer schema than this reader understands
    #[error("Unsupported {kind} document schema version: {version}")]
    UnsupportedSchemaVersion {
        /// Document kind ("local", "shared")
        kind: &'static str,
        /// Highest version present in the envelope
        version: u32,
    },

    /// The versioned envelope contains no usable version
    #[error("No {0} document found")]
    MissingDocument(&'static str),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid invitation hash
    #[error("Invalid invitation: {0}")]
    InvalidInvitation(String),

    /// The other end of a channel went away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Shared coordinator initialization failed; every waiter sees the same cause
    #[error("Coordinator initialization failed: {0}")]
    Initialization(#[source] Arc<PincalError>),

    /// The coordinator reported an initialization failure to a tab
    #[error("Coordinator rejected the tab: {0}")]
    Rejected(String),

    /// Peer transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type alias using PincalError
pub type PincalResult<T> = Result<T, PincalError>;

impl From<automerge::AutomergeError> for PincalError {
    fn from(err: automerge::AutomergeError) -> Self {
        PincalError::Automerge(err.to_string())
    }
}

impl From<serde_json::Error> for PincalError {
    fn from(err: serde_json::Error) -> Self {
        PincalError::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for PincalError {
    fn from(err: postcard::Error) -> Self {
        PincalError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PincalError::DocumentNotFound("2Bq4x".to_string());
        assert_eq!(format!("{}", err), "Document not found: 2Bq4x");
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = PincalError::UnsupportedSchemaVersion {
            kind: "local",
            version: 3,
        };
        assert_eq!(
            format!("{}", err),
            "Unsupported local document schema version: 3"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PincalError = io_err.into();
        assert!(matches!(err, PincalError::Io(_)));
    }

    #[test]
    fn test_initialization_keeps_source() {
        use std::error::Error as _;

        let cause = Arc::new(PincalError::MissingDocument("local"));
        let err = PincalError::Initialization(cause);
        assert!(err.source().is_some());
    }
}
