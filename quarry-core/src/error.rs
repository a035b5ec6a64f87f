//! Error types for quarry

use std::io;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transaction commit conflict")]
    CommitConflict,

    #[error("Transaction is no longer usable: {0}")]
    TransactionClosed(String),

    #[error("Lock failed: {0}")]
    LockFailed(String),

    /// The lock heartbeat detected that ownership was lost, or a closed
    /// resource was used again.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("Agility context is already closed")]
    AgilityContextClosed,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unexpected EOF: {0}")]
    UnexpectedEof(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Partition metadata not found for timestamp {0}")]
    PartitionNotFound(i64),

    /// Fatal breach of a persisted invariant. Never swallowed, never retried.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An error raised once and re-surfaced to every waiter of a shared
    /// initialization.
    #[error("{0}")]
    Shared(Arc<Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the enclosing transaction.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::CommitConflict => true,
            Error::LockFailed(_) => true,
            Error::Shared(inner) => inner.is_retriable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
