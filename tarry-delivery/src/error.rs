//! Typed error handling for delayed delivery.
//!
//! Errors distinguish between:
//! - Structural destination problems (queue not found) - never retried
//! - Shutdown (cancellation) - never reported as a failure
//! - Everything else - retried, counted, and eventually dead-lettered

use tarry_common::{HeaderError, TransactionError};
use tarry_store::StoreError;
use thiserror::Error;

/// Failures raised by the transport collaborators.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination does not exist, so no retry can succeed.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The transport could not accept the operation right now.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// A message could not be understood by the transport.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The transport was used before being initialised.
    #[error("Transport not initialised: {0}")]
    NotInitialized(String),

    /// The operation was abandoned because the host is shutting down.
    #[error("Transport operation cancelled")]
    Cancelled,
}

/// Top-level delayed delivery error type.
#[derive(Debug, Error)]
pub enum DelayedDeliveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Header error: {0}")]
    Headers(#[from] HeaderError),

    /// A timeout request arrived without a required header.
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// The due-time header could not be parsed.
    #[error("Invalid due time {value:?}: {source}")]
    InvalidDueTime {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// A component was used before `init` was called.
    #[error("Not initialised: {0}")]
    NotInitialized(&'static str),

    /// `init` was called twice.
    #[error("Already initialised: {0}")]
    AlreadyInitialized(&'static str),

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Shutdown interrupted the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl DelayedDeliveryError {
    /// Returns `true` if this error only reflects shutdown.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::Transport(TransportError::Cancelled) => true,
            Self::Store(store) => store.is_cancelled(),
            _ => false,
        }
    }

    /// Returns `true` if the destination is structurally invalid.
    #[must_use]
    pub const fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::Transport(TransportError::QueueNotFound(_)))
    }

    /// Short, stable classification used in failure headers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Transport(TransportError::QueueNotFound(_)) => "transport.queue-not-found",
            Self::Transport(_) => "transport",
            Self::Transaction(_) => "transaction",
            Self::Headers(_) => "headers",
            Self::MissingHeader(_) => "request.missing-header",
            Self::InvalidDueTime { .. } => "request.invalid-due-time",
            Self::NotInitialized(_) | Self::AlreadyInitialized(_) => "lifecycle",
            Self::Task(_) => "task",
            Self::Cancelled => "cancelled",
        }
    }
}
