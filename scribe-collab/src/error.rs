//! Error types for the collaboration layer.
//!
//! None of these reach the document view: session and cursor paths log
//! them and skip the offending update or broadcast.

use thiserror::Error;

/// Failures of the persistent server connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no access credential available")]
    MissingCredential,

    #[error("invalid server url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport requires a running tokio runtime")]
    NoRuntime,
}

/// Wire-level encode/decode failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("malformed `{event}` payload: {reason}")]
    Malformed { event: String, reason: String },

    #[error("unexpected event `{0}`")]
    UnexpectedEvent(String),
}

/// Rejected position-addressed document mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("position {position} outside document of size {size}")]
    OutOfRange { position: usize, size: usize },

    #[error("range {from}..{to} is not inside a single text block")]
    CrossesBlocks { from: usize, to: usize },

    #[error("position {0} is not inside a text block")]
    NotInTextBlock(usize),

    #[error("editor rejected the change: {0}")]
    Rejected(String),
}

/// Failures of the development relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept: {0}")]
    Accept(#[from] std::io::Error),
}
