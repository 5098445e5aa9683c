//! # Store Errors
//!
//! Unified error surface for the document store. Validation errors are
//! reported without side effects; backend I/O errors bubble from the exact
//! operation that failed.

use thiserror::Error;

/// Result type for store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Document store errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    // Unknown-name errors
    #[error("Unknown document type: {0}")]
    UnknownDocumentType(String),

    #[error("Unknown document ID: {0}")]
    UnknownDocumentId(String),

    #[error("Unknown attachment ID: {0}")]
    UnknownAttachmentId(String),

    #[error("Unknown association: {0}")]
    UnknownAssociation(String),

    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    #[error("Unknown cache value name: {0}")]
    UnknownCacheValueName(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Unknown selector: {0}")]
    UnknownSelector(String),

    // Registration errors
    #[error("Association {0} already registered with different document types")]
    MismatchedAssociationTypes(String),

    // Value errors
    #[error("Wrong value type: expected {expected}, found {found}")]
    WrongValueType {
        expected: &'static str,
        found: &'static str,
    },

    // Batch errors
    #[error("Operation not allowed inside a batch: {0}")]
    IllegalInBatch(&'static str),

    // I/O and encoding
    #[error("Backend I/O error: {0}")]
    BackendIo(String),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::BackendIo(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_name() {
        let err = StorageError::UnknownCollection("positives".to_string());
        assert!(err.to_string().contains("positives"));

        let err = StorageError::WrongValueType {
            expected: "u32",
            found: "string",
        };
        assert!(err.to_string().contains("u32"));
        assert!(err.to_string().contains("string"));
    }
}
