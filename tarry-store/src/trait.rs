use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tarry_common::{Transaction, TransactionMode};

use crate::DelayedMessage;

/// Durable storage for messages that are not yet due
///
/// Every operation runs inside the caller's [`Transaction`]: writes are staged
/// and only become durable when that transaction commits. Implementations
/// must keep `fetch_next_due_timeout` and `remove` safe under concurrent
/// callers; in particular, a record fetched by one transaction must not be
/// handed to another fetch until the first transaction completes.
#[async_trait]
pub trait DelayedMessageStore: Send + Sync + std::fmt::Debug {
    /// One-time setup for the owning endpoint
    ///
    /// # Errors
    /// If the store cannot support `mode`, or was already set up for a
    /// different owner
    async fn initialize(&self, owner: &str, mode: TransactionMode) -> crate::Result<()>;

    /// The due time of the earliest message not currently being dispatched
    async fn next(&self, transaction: &Transaction) -> crate::Result<Option<DateTime<Utc>>>;

    /// Durably persist a message
    ///
    /// Storing a `message_id` that is already present is a no-op.
    async fn store(&self, message: DelayedMessage, transaction: &Transaction)
    -> crate::Result<()>;

    /// Delete a message by identity
    ///
    /// Returns `false` if it was already gone.
    async fn remove(
        &self,
        message: &DelayedMessage,
        transaction: &Transaction,
    ) -> crate::Result<bool>;

    /// Increment the retry counter of a message
    ///
    /// Returns `false` if it was already gone.
    async fn increment_failure_count(
        &self,
        message: &DelayedMessage,
        transaction: &Transaction,
    ) -> crate::Result<bool>;

    /// The earliest message due at or before `at`, locked to `transaction`
    async fn fetch_next_due_timeout(
        &self,
        at: DateTime<Utc>,
        transaction: &Transaction,
    ) -> crate::Result<Option<DelayedMessage>>;
}
