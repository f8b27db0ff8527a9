//! Custom error types for the replication tool.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),

    #[error("snapshot creation failed: {0}")]
    SnapshotFailed(String),

    #[error("lock journal is corrupt: {0}")]
    CorruptJournal(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("interrupted by signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
