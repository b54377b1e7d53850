//! Error types for a3s-sse

use thiserror::Error;

/// Errors that can occur while routing or streaming events
#[derive(Debug, Error)]
pub enum SseError {
    /// The topic id is not registered
    #[error("Topic not found: {0}")]
    NotFound(String),

    /// The topic has been shut down
    #[error("Topic closed: {0}")]
    Closed(String),

    /// Write attempted on a connection that has been closed
    #[error("Event stream closed")]
    StreamClosed,

    /// The underlying transport cannot stream (no flush support)
    #[error("Streaming unsupported: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SseError {
    /// Whether this error means the target has gone away and the caller
    /// should stop its loop
    pub fn is_closed(&self) -> bool {
        matches!(self, SseError::Closed(_) | SseError::StreamClosed)
    }
}

/// Result type alias for SSE operations
pub type Result<T> = std::result::Result<T, SseError>;
