//! Ingress for timeout requests
//!
//! A timeout request is a transport message carrying two control headers:
//! the final destination and an RFC 3339 due time. Requests that are already
//! due are dispatched straight away. Everything else is stored and the poller
//! is signalled once the store commits.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tarry_common::{
    Enlistment, ScopeOption, Transaction, TransactionError, headers, headers::names, internal,
    tracing,
};
use tarry_store::{DelayedMessage, DelayedMessageStore};
use tokio_util::sync::CancellationToken;

use crate::{
    circuit_breaker::{CriticalErrorHandler, RepeatedFailuresOverTimeCircuitBreaker},
    error::DelayedDeliveryError,
    faults,
    poller::{DueDelayedMessagePoller, PollerWaker},
    settings::DelayedDeliverySettings,
    transport::{
        Dispatcher, ErrorContext, ErrorHandleResult, MessageContext, MessageHandler, MessagePump,
        OutgoingMessage, PumpSettings,
    },
};

const SOURCE: &str = "tarry.delivery.pump";

/// Bridges a transport message pump to the delayed delivery pipeline
pub struct DelayedDeliveryPump {
    pump: Box<dyn MessagePump>,
    poller: Arc<DueDelayedMessagePoller>,
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: DelayedDeliverySettings,
    token: CancellationToken,
    timeouts_queue: Option<String>,
}

impl fmt::Debug for DelayedDeliveryPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedDeliveryPump")
            .field("poller", &self.poller)
            .field("timeouts_queue", &self.timeouts_queue)
            .finish_non_exhaustive()
    }
}

impl DelayedDeliveryPump {
    #[must_use]
    pub fn new(
        pump: Box<dyn MessagePump>,
        store: Arc<dyn DelayedMessageStore>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: DelayedDeliverySettings,
    ) -> Self {
        let poller = Arc::new(DueDelayedMessagePoller::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            settings.clone(),
        ));

        Self {
            pump,
            poller,
            store,
            dispatcher,
            settings,
            token: CancellationToken::new(),
            timeouts_queue: None,
        }
    }

    /// Initialise the store and poller, and point the pump at the timeouts queue
    ///
    /// The pump receives from `<input_queue>.<timeouts_queue_suffix>` rather
    /// than `settings.input_queue`, and hands every message to this
    /// component's own handler.
    ///
    /// # Errors
    /// If the store rejects the transaction mode, the pump cannot receive
    /// from the timeouts queue, or this was already initialised.
    pub async fn init(
        &mut self,
        on_critical: CriticalErrorHandler,
        settings: PumpSettings,
    ) -> Result<(), DelayedDeliveryError> {
        if self.timeouts_queue.is_some() {
            return Err(DelayedDeliveryError::AlreadyInitialized(
                "delayed delivery pump",
            ));
        }

        let timeouts_queue = self.settings.timeouts_queue(&settings.input_queue);
        internal!(
            "Initialising delayed delivery for {} on {timeouts_queue}",
            settings.input_queue
        );

        self.store
            .initialize(&settings.input_queue, settings.transaction_mode)
            .await?;
        self.poller.init(
            &on_critical,
            settings.transaction_mode,
            settings.error_queue.clone(),
            timeouts_queue.clone(),
        )?;

        let handler = Arc::new(TimeoutRequestHandler {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            number_of_retries: self.settings.number_of_retries,
            fault_metadata: self.settings.fault_metadata.clone(),
            scope: ScopeOption::for_mode(settings.transaction_mode),
            error_queue: settings.error_queue.clone(),
            timeouts_queue: timeouts_queue.clone(),
            store_breaker: RepeatedFailuresOverTimeCircuitBreaker::new(
                "store",
                "Failed to store delayed message",
                self.settings.store_breaker_window(),
                self.settings.delay_after_failure(),
                on_critical,
            ),
            waker: self.poller.waker(),
            token: self.token.clone(),
        });

        self.pump
            .init(
                handler,
                PumpSettings {
                    input_queue: timeouts_queue.clone(),
                    ..settings
                },
            )
            .await?;

        self.timeouts_queue = Some(timeouts_queue);
        Ok(())
    }

    /// Start the poller, then the pump
    ///
    /// # Errors
    /// If called before `init` or after a previous `start`.
    pub fn start(&self) -> Result<(), DelayedDeliveryError> {
        self.poller.start()?;
        self.pump.start()?;
        internal!("Delayed delivery started");
        Ok(())
    }

    /// Stop the pump, then the poller
    ///
    /// No new timeout requests are accepted while the poller drains.
    pub async fn stop(&self) {
        self.token.cancel();
        self.pump.stop().await;
        self.poller.stop().await;
        internal!("Delayed delivery stopped");
    }

    #[must_use]
    pub fn poller(&self) -> &DueDelayedMessagePoller {
        &self.poller
    }

    /// Queue timeout requests are received from, once initialised
    #[must_use]
    pub fn timeouts_queue(&self) -> Option<&str> {
        self.timeouts_queue.as_deref()
    }
}

/// Signals the poller once the storing transaction has committed
struct SignalOnCommit {
    waker: PollerWaker,
    due: DateTime<Utc>,
}

#[async_trait]
impl Enlistment for SignalOnCommit {
    async fn commit(&self) -> Result<(), TransactionError> {
        self.waker.signal(self.due);
        Ok(())
    }

    fn rollback(&self) {}
}

struct TimeoutRequestHandler {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: Arc<dyn Dispatcher>,
    number_of_retries: u32,
    fault_metadata: BTreeMap<String, String>,
    scope: ScopeOption,
    error_queue: String,
    timeouts_queue: String,
    store_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    waker: PollerWaker,
    token: CancellationToken,
}

impl TimeoutRequestHandler {
    async fn store_for_later(
        &self,
        message: DelayedMessage,
        transaction: &Transaction,
    ) -> Result<(), DelayedDeliveryError> {
        let due = message.time;
        let scope = Transaction::scope(Some(transaction), self.scope);

        self.store.store(message, &scope).await?;
        scope.enlist(SignalOnCommit {
            waker: self.waker.clone(),
            due,
        })?;
        scope.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for TimeoutRequestHandler {
    async fn on_message(&self, context: MessageContext) -> Result<(), DelayedDeliveryError> {
        let MessageContext {
            message,
            transaction,
        } = context;
        let mut headers = message.headers;

        let destination = headers
            .remove(names::DELAY_DESTINATION)
            .ok_or(DelayedDeliveryError::MissingHeader(names::DELAY_DESTINATION))?;
        let raw_due = headers
            .remove(names::DELAY_DUE)
            .ok_or(DelayedDeliveryError::MissingHeader(names::DELAY_DUE))?;
        let due = DateTime::parse_from_rfc3339(&raw_due)
            .map_err(|source| DelayedDeliveryError::InvalidDueTime {
                value: raw_due.clone(),
                source,
            })?
            .with_timezone(&Utc);

        if Utc::now() >= due {
            let scope = Transaction::scope(Some(&transaction), self.scope);
            self.dispatcher
                .dispatch(
                    vec![OutgoingMessage {
                        message_id: message.message_id.clone(),
                        headers,
                        body: message.body,
                        destination,
                    }],
                    &scope,
                )
                .await?;
            scope.commit().await?;

            tracing::debug!(
                message_id = %message.message_id,
                due = %due,
                "Timeout request already due, dispatched directly"
            );
            return Ok(());
        }

        let delayed = DelayedMessage::new(
            message.message_id,
            destination,
            due,
            headers::encode(&headers)?,
            message.body,
        );
        let message_id = delayed.message_id.clone();

        match self.store_for_later(delayed, &transaction).await {
            Ok(()) => {
                self.store_breaker.success();
                tracing::debug!(message_id = %message_id, due = %due, "Stored delayed message");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(DelayedDeliveryError::Cancelled),
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Failed to store delayed message");
                self.store_breaker.failure(&e, &self.token).await;
                Err(e)
            }
        }
    }

    async fn on_error(
        &self,
        context: ErrorContext,
    ) -> Result<ErrorHandleResult, DelayedDeliveryError> {
        let ErrorContext {
            message,
            error,
            immediate_processing_failures,
            transaction,
        } = context;

        if error.is_cancelled() || immediate_processing_failures < self.number_of_retries {
            return Ok(ErrorHandleResult::RetryRequired);
        }

        let mut headers = message.headers;
        faults::stamp(
            &mut headers,
            &error,
            SOURCE,
            &self.timeouts_queue,
            &self.fault_metadata,
        );

        let scope = Transaction::scope(Some(&transaction), self.scope);
        self.dispatcher
            .dispatch(
                vec![OutgoingMessage {
                    message_id: message.message_id.clone(),
                    headers,
                    body: message.body,
                    destination: self.error_queue.clone(),
                }],
                &scope,
            )
            .await?;
        scope.commit().await?;

        tracing::warn!(
            message_id = %message.message_id,
            failures = immediate_processing_failures,
            error = %error,
            "Timeout request moved to error queue"
        );
        Ok(ErrorHandleResult::Handled)
    }
}
