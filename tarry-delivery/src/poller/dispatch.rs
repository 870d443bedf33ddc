use std::sync::Arc;

use tarry_common::{Transaction, headers, tracing};
use tarry_store::DelayedMessage;

use super::{SOURCE, Shared};
use crate::{error::DelayedDeliveryError, faults, transport::OutgoingMessage};

impl Shared {
    /// Dispatch one fetched message, resolving any failure at message level
    ///
    /// The fetch lock is held while a failure is counted, then released
    /// before the loop is woken to retry. Only errors from failure handling
    /// itself are returned; the loop is not woken for those, so the message
    /// waits for a regular poll.
    pub(super) async fn handle_due_message(
        &self,
        message: DelayedMessage,
        fetch: Transaction,
    ) -> Result<(), DelayedDeliveryError> {
        let dispatched = self.dispatch_and_remove(&message, &fetch).await;
        let (error, held) = match dispatched {
            Ok(()) => match fetch.commit().await {
                Ok(()) => {
                    self.dispatch_breaker.success();
                    tracing::debug!(
                        message_id = %message.message_id,
                        destination = %message.destination,
                        "Dispatched delayed message"
                    );
                    return Ok(());
                }
                Err(e) => (DelayedDeliveryError::from(e), None),
            },
            Err(e) => (e, Some(fetch)),
        };

        if error.is_cancelled() {
            return Ok(());
        }

        let result = if error.is_queue_not_found() {
            tracing::warn!(
                message_id = %message.message_id,
                destination = %message.destination,
                error = %error,
                "Delayed message destination does not exist, moving to error queue"
            );
            let moved = self.try_send_to_error_queue(&message, &error).await;
            if let Err(e) = &moved
                && !e.is_cancelled()
            {
                self.dispatch_breaker.failure(e, &self.token).await;
            }
            moved
        } else {
            self.handle_failure(message, error).await
        };

        drop(held);

        match result {
            Ok(()) => {
                self.waker.wake();
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send `message` to its destination and stage its removal under `fetch`
    ///
    /// The removal only becomes durable if the dispatch scope commits and
    /// the caller then commits `fetch`.
    async fn dispatch_and_remove(
        &self,
        message: &DelayedMessage,
        fetch: &Transaction,
    ) -> Result<(), DelayedDeliveryError> {
        let scope = Transaction::scope(Some(fetch), self.scope);

        self.dispatcher
            .dispatch_delayed_message(
                &message.message_id,
                &message.headers,
                &message.body,
                &message.destination,
                &scope,
            )
            .await?;

        if !self.store.remove(message, fetch).await? {
            tracing::debug!(
                message_id = %message.message_id,
                "Delayed message was already removed from the store"
            );
        }

        scope.commit().await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        mut message: DelayedMessage,
        error: DelayedDeliveryError,
    ) -> Result<(), DelayedDeliveryError> {
        tracing::warn!(
            message_id = %message.message_id,
            destination = %message.destination,
            retries = message.number_of_retries,
            error = %error,
            "Failed to dispatch delayed message"
        );

        let incremented = self.increment_failure_count(&message).await;
        self.dispatch_breaker.failure(&error, &self.token).await;

        if !incremented? {
            tracing::debug!(
                message_id = %message.message_id,
                "Delayed message was removed before its failure could be counted"
            );
            return Ok(());
        }

        message.number_of_retries = message.number_of_retries.saturating_add(1);
        if message.number_of_retries > self.settings.number_of_retries {
            tracing::warn!(
                message_id = %message.message_id,
                retries = message.number_of_retries,
                "Delayed message exceeded its retry budget, moving to error queue"
            );
            return self.try_send_to_error_queue(&message, &error).await;
        }

        Ok(())
    }

    /// Count a failure in its own transaction, independent of the dispatch
    async fn increment_failure_count(
        &self,
        message: &DelayedMessage,
    ) -> Result<bool, DelayedDeliveryError> {
        let transaction = Transaction::begin();
        let incremented = self
            .store
            .increment_failure_count(message, &transaction)
            .await?;
        transaction.commit().await?;
        Ok(incremented)
    }

    /// Last-resort forwarding of `message` to the error queue
    ///
    /// Removal happens first and is idempotent: if the message is already
    /// gone it has been handled elsewhere and nothing is sent.
    async fn try_send_to_error_queue(
        &self,
        message: &DelayedMessage,
        error: &DelayedDeliveryError,
    ) -> Result<(), DelayedDeliveryError> {
        if self.token.is_cancelled() {
            return Ok(());
        }

        let transaction = Transaction::begin();
        if !self.store.remove(message, &transaction).await? {
            tracing::debug!(
                message_id = %message.message_id,
                "Delayed message already removed, skipping error queue"
            );
            return Ok(());
        }

        let mut headers = headers::decode(&message.headers)?;
        faults::stamp(
            &mut headers,
            error,
            SOURCE,
            &self.timeouts_queue,
            &self.settings.fault_metadata,
        );

        self.dispatcher
            .dispatch(
                vec![OutgoingMessage {
                    message_id: message.message_id.clone(),
                    headers,
                    body: Arc::clone(&message.body),
                    destination: self.error_queue.clone(),
                }],
                &transaction,
            )
            .await?;
        transaction.commit().await?;

        tracing::warn!(
            message_id = %message.message_id,
            error_queue = %self.error_queue,
            "Moved delayed message to error queue"
        );
        Ok(())
    }
}
