//! Physical duplex stream seam.
//!
//! A [`Connector`] opens a [`DuplexStream`]; the connection task in
//! [`crate::connection`] owns the stream and drives it. Implementations:
//! [`crate::tcp`] (newline-delimited frames) and [`crate::memory`]
//! (in-process channel pair).

use std::io;

use async_trait::async_trait;

// ── Frames ────────────────────────────────────────────────────────────────────

/// A binary container assembled from one or more parts, read as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    content_type: String,
    parts: Vec<Vec<u8>>,
}

impl Blob {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            parts: Vec::new(),
        }
    }

    pub fn with_part(mut self, part: impl Into<Vec<u8>>) -> Self {
        self.parts.push(part.into());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.parts.concat()
    }
}

/// One message unit on the physical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Blob(Blob),
}

impl Frame {
    /// Normalize any frame shape to text. Binary forms are UTF-8 decoded;
    /// invalid sequences become U+FFFD like a browser `TextDecoder`.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Binary(bytes) => String::from_utf8(bytes)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
            Self::Blob(blob) => String::from_utf8_lossy(&blob.to_bytes()).into_owned(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
            Self::Blob(blob) => blob.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Inbound event from a physical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(Frame),
    /// Non-fatal transport error. The stream decides whether a close follows.
    Error(String),
    /// The remote side closed the stream.
    Closed { reason: Option<String> },
}

// ── Traits ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait DuplexStream: Send {
    async fn send(&mut self, frame: Frame) -> io::Result<()>;

    /// Next inbound event; `None` once the stream has ended.
    ///
    /// Must be cancel-safe: the connection task polls it inside `select!`.
    async fn next_event(&mut self) -> Option<StreamEvent>;

    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to `address`. Returning `Ok` completes the handshake.
    async fn connect(&self, address: &str) -> io::Result<Box<dyn DuplexStream>>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
