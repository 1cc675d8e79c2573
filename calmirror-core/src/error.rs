//! Error types for calmirror.

use thiserror::Error;

use crate::service::ServiceError;

/// Errors that can abort a mirror run (or part of it).
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Calendar service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Sync state error: {0}")]
    State(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Run cancelled")]
    Cancelled,
}

/// Result type alias for calmirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;
