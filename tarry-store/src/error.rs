//! Error types for the tarry-store crate.

use tarry_common::{TransactionError, TransactionMode};
use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was used before `initialize` was called.
    #[error("Store has not been initialised")]
    NotInitialized,

    /// `initialize` was called again for a different owner.
    #[error("Store already initialised for {0}")]
    AlreadyInitialized(String),

    /// The backend cannot honour the requested transaction mode.
    #[error("Transaction mode {0:?} is not supported by this store")]
    UnsupportedTransactionMode(TransactionMode),

    /// The configured capacity has been reached.
    #[error("Store capacity exceeded: {len}/{capacity} messages")]
    CapacityExceeded { len: usize, capacity: usize },

    /// The enclosing transaction rejected the operation.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// The backing storage is temporarily unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The operation was abandoned because the host is shutting down.
    #[error("Store operation cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns `true` if this error only reflects shutdown.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
