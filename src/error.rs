// src/error.rs

//! Error types shared by every layer of the store model
//!
//! A cache miss is not an error: lookups return `Ok(None)`. Cancellation
//! has its own variant so callers can tell it apart from a failure before
//! looking at anything else.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the cache, the sources and the model
#[derive(Error, Debug)]
pub enum Error {
    /// The operation was aborted through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Daemon or network unreachable, or a non-success HTTP status
    #[error("transport error: {0}")]
    Transport(String),

    /// A response did not have the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Image bytes could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// The package daemon rejected a request
    #[error("daemon error ({status}): {message}")]
    Daemon {
        /// HTTP status reported by the daemon
        status: u16,
        /// Machine readable error kind, when the daemon supplied one
        kind: Option<String>,
        /// Human readable message
        message: String,
    },

    /// An install or remove is already running for this app
    #[error("operation already in progress for {0}")]
    AlreadyInProgress(String),

    /// Cache database failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on a socket or file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A client or store could not be created
    #[error("initialization error: {0}")]
    InitError(String),
}

impl Error {
    /// True when the error represents a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a transport error with a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// An equivalent error of the same variant
    ///
    /// Used to hand one failure to several waiters. Wrapped library errors
    /// keep their message but not their inner detail.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Error::Cancelled => Error::Cancelled,
            Error::Transport(msg) => Error::Transport(msg.clone()),
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::Decode(msg) => Error::Decode(msg.clone()),
            Error::Daemon {
                status,
                kind,
                message,
            } => Error::Daemon {
                status: *status,
                kind: kind.clone(),
                message: message.clone(),
            },
            Error::AlreadyInProgress(name) => Error::AlreadyInProgress(name.clone()),
            Error::Database(e) => {
                Error::Database(rusqlite::Error::ToSqlConversionFailure(e.to_string().into()))
            }
            Error::Serialization(e) => {
                Error::Serialization(<serde_json::Error as serde::de::Error>::custom(e))
            }
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Config(msg) => Error::Config(msg.clone()),
            Error::InitError(msg) => Error::InitError(msg.clone()),
        }
    }
}
