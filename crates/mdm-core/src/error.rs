use crate::types::{GoldenId, LinkKey, ResourceRef};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, MdmError>;

#[derive(Debug, Error)]
pub enum MdmError {
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage operation error: {0}")]
    StorageOperation(#[from] redb::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Golden record not found: {0}")]
    GoldenNotFound(GoldenId),

    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceRef),

    #[error("Link not found: {0}")]
    LinkNotFound(LinkKey),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Review item already resolved: {0}")]
    AlreadyResolved(LinkKey),

    #[error("Repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error("Timed out after {waited:?} waiting for entity locks {entities:?}")]
    LockTimeout { entities: Vec<Uuid>, waited: Duration },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Coarse classification callers use to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    AlreadyResolved,
    RepositoryUnavailable,
    Cancelled,
    Storage,
}

impl MdmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MdmError::GoldenNotFound(_)
            | MdmError::ResourceNotFound(_)
            | MdmError::LinkNotFound(_) => ErrorKind::NotFound,
            MdmError::InvalidInput(_) | MdmError::Validation(_) => ErrorKind::InvalidInput,
            MdmError::Conflict(_) | MdmError::LockTimeout { .. } => ErrorKind::Conflict,
            MdmError::AlreadyResolved(_) => ErrorKind::AlreadyResolved,
            MdmError::RepositoryUnavailable(_)
            | MdmError::Storage(_)
            | MdmError::Database(_)
            | MdmError::Transaction(_)
            | MdmError::Commit(_)
            | MdmError::StorageOperation(_) => ErrorKind::RepositoryUnavailable,
            MdmError::Cancelled(_) => ErrorKind::Cancelled,
            MdmError::Table(_) | MdmError::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller may re-drive the same call (with backoff).
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MdmError::LockTimeout { .. } | MdmError::Cancelled(_)
        ) || self.kind() == ErrorKind::RepositoryUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let key = LinkKey::new(Uuid::now_v7(), Uuid::now_v7());
        assert_eq!(MdmError::LinkNotFound(key).kind(), ErrorKind::NotFound);
        assert_eq!(MdmError::AlreadyResolved(key).kind(), ErrorKind::AlreadyResolved);
        assert!(!MdmError::AlreadyResolved(key).is_retryable());
        assert!(MdmError::RepositoryUnavailable("timeout".into()).is_retryable());
        assert!(MdmError::LockTimeout {
            entities: vec![key.golden],
            waited: Duration::from_millis(5),
        }
        .is_retryable());
        assert!(!MdmError::InvalidInput("missing birth_date".into()).is_retryable());
    }
}
