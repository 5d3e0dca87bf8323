//! Error types for tsvault

use thiserror::Error;

/// Result type alias for tsvault operations
pub type Result<T> = std::result::Result<T, TsError>;

/// tsvault error types
#[derive(Error, Debug)]
pub enum TsError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec could not encode its input
    #[error("Encode error: {0}")]
    Encode(String),

    /// Compressed data is malformed, truncated or does not match its count
    #[error("Decode error: {0}")]
    Decode(String),

    /// Series ID unknown to the index
    #[error("Series not found: {0}")]
    NotFound(u64),

    /// Underlying key-value store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Write-ahead log append, flush or replay failure
    #[error("WAL error: {0}")]
    Wal(String),

    /// Query text is not a valid series selector
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid configuration rejected at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller cancelled the request before it started
    #[error("Request cancelled")]
    Cancelled,

    /// Caller deadline passed before the request started
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Component already closed
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl TsError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TsError::Io(_) | TsError::Store(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, TsError::Decode(_))
    }
}

impl From<serde_json::Error> for TsError {
    fn from(e: serde_json::Error) -> Self {
        TsError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for TsError {
    fn from(e: bincode::Error) -> Self {
        TsError::Serialization(e.to_string())
    }
}
