//! Structured error types for the sprites SDK
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations.

use thiserror::Error;

/// All possible errors returned by the sprites SDK
#[derive(Error, Debug)]
pub enum SpriteError {
    /// Malformed stream frame (empty buffer or unknown stream tag)
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// The remote side violated the streaming protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// An operation was started on a connection that cannot accept it
    /// (already busy, already connected, or closed)
    #[error("Operation conflict: {0}")]
    OperationConflict(&'static str),

    /// WebSocket transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket or I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No inbound activity within the keepalive window
    #[error("Keepalive timeout: no activity for {0:?}")]
    KeepaliveTimeout(std::time::Duration),

    /// Attach handshake did not receive session_info in time
    #[error("Attach timed out waiting for session_info")]
    AttachTimeout,

    /// The connection pool was closed while the caller was waiting
    #[error("Connection pool closed")]
    PoolClosed,

    /// Server-reported operation failure (op.error envelope)
    #[error("{0}")]
    RemoteOperation(String),

    /// Non-2xx response from the Sprites API
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience Result type using SpriteError
pub type Result<T> = std::result::Result<T, SpriteError>;
