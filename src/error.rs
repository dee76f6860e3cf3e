//! Error types for context, cache and file store operations.

use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the backbone. Nothing is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty host list, malformed host string, or an invalid setting.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A cache or file operation ran with no open context on this thread.
    #[error("no active resource context on this thread")]
    NoActiveContext,

    /// A handle was requested from a context that has already been exited.
    #[error("resource context is closed")]
    ContextClosed,

    /// Failed to establish or use a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation exceeded the configured socket timeout.
    #[error("operation timed out")]
    Timeout,

    /// No record with the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// An atomic batch was rejected before it was sent, or one of its steps
    /// failed.
    #[error("batch failed: {0}")]
    BatchFailure(String),

    /// A string could not be parsed as a file identifier.
    #[error("invalid file id: {0}")]
    InvalidId(String),

    /// The cache server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The cache server sent something we could not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stored chunks do not reassemble into the recorded content.
    #[error("corrupted file {id}: {reason}")]
    Corrupted { id: String, reason: String },

    /// Compressed content could not be restored.
    #[error("decompression failed: {0}")]
    Compression(String),

    /// Local filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Document store query failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Metadata could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classify a socket error. Timeouts become [`Error::Timeout`], everything
    /// else is a connection failure.
    pub(crate) fn from_socket(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Connection(err.to_string()),
        }
    }
}
