// Workspace-wide error type. Every crate returns `splitnn_types::Result`.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    // ── Codec ─────────────────────────────────────────────────────────────

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    // ── Preprocessing ─────────────────────────────────────────────────────

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // ── Sessions ──────────────────────────────────────────────────────────

    #[error("no session loaded")]
    NoSessionLoaded,

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    // ── Transport ─────────────────────────────────────────────────────────

    #[error("an exchange is already in flight on this connection")]
    ExchangeBusy,

    #[error("exchange timed out after {0:?}")]
    ExchangeTimeout(Duration),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("connection closed")]
    ConnectionClosed,

    // ── Ambient ───────────────────────────────────────────────────────────

    #[error("model fetch failed: {0}")]
    Fetch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SplitError>;
