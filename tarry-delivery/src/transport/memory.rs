//! Loopback transport backed by in-process queues
//!
//! Queues must be created before use; sending to an unknown queue fails with
//! [`TransportError::QueueNotFound`]. Sends are staged in the caller's
//! transaction and become visible to receivers only once it commits.

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tarry_common::{Enlistment, Transaction, TransactionError, headers, internal, tracing};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{
    Dispatcher, ErrorContext, ErrorHandleResult, IncomingMessage, MessageContext, MessageHandler,
    MessagePump, OutgoingMessage, PumpSettings,
};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct Queue {
    messages: Mutex<VecDeque<IncomingMessage>>,
    notify: Notify,
}

impl Queue {
    fn push_back(&self, message: IncomingMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: IncomingMessage) {
        self.messages.lock().push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<IncomingMessage> {
        let message = self.messages.lock().pop_front();
        if message.is_some() {
            self.notify.notify_waiters();
        }
        message
    }

    fn len(&self) -> usize {
        self.messages.lock().len()
    }

    async fn receive(&self) -> IncomingMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.pop() {
                return message;
            }
            notified.await;
        }
    }
}

/// In-process transport with named queues
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    queues: Arc<DashMap<String, Arc<Queue>>>,
}

struct StagedSend {
    sends: Mutex<Vec<(Arc<Queue>, IncomingMessage)>>,
}

#[async_trait]
impl Enlistment for StagedSend {
    async fn commit(&self) -> Result<(), TransactionError> {
        for (queue, message) in std::mem::take(&mut *self.sends.lock()) {
            queue.push_back(message);
        }
        Ok(())
    }

    fn rollback(&self) {
        self.sends.lock().clear();
    }
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` if it does not already exist
    pub fn create_queue(&self, name: impl Into<String>) {
        self.queues.entry(name.into()).or_default();
    }

    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, TransportError> {
        self.queues
            .get(name)
            .map(|queue| Arc::clone(queue.value()))
            .ok_or_else(|| TransportError::QueueNotFound(name.to_string()))
    }

    /// Send outside of any transaction
    ///
    /// # Errors
    /// If the destination queue does not exist.
    pub fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let queue = self.queue(&message.destination)?;
        queue.push_back(IncomingMessage {
            message_id: message.message_id,
            headers: message.headers,
            body: message.body,
        });
        Ok(())
    }

    /// Wait for the next message on `queue`
    ///
    /// # Errors
    /// If the queue does not exist.
    pub async fn receive(&self, queue: &str) -> Result<IncomingMessage, TransportError> {
        let queue = self.queue(queue)?;
        Ok(queue.receive().await)
    }

    /// Number of committed messages waiting on `queue`
    #[must_use]
    pub fn len(&self, queue: &str) -> usize {
        self.queue(queue).map_or(0, |queue| queue.len())
    }

    /// Remove and return everything waiting on `queue`
    #[must_use]
    pub fn drain(&self, queue: &str) -> Vec<IncomingMessage> {
        self.queue(queue).map_or_else(
            |_| Vec::new(),
            |queue| {
                let drained: Vec<_> = queue.messages.lock().drain(..).collect();
                queue.notify.notify_waiters();
                drained
            },
        )
    }

    /// Wait until `queue` holds exactly `expected` messages
    ///
    /// # Errors
    /// If the queue does not exist or the timeout elapses first.
    pub async fn wait_for_len(
        &self,
        queue_name: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let queue = self.queue(queue_name)?;
        tokio::time::timeout(timeout, async {
            loop {
                let notified = queue.notify.notified();
                if queue.len() == expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| {
            TransportError::Unavailable(format!(
                "Timeout waiting for {expected} messages on {queue_name} (have {})",
                queue.len()
            ))
        })
    }

    /// A pump receiving from this transport
    #[must_use]
    pub fn pump(&self) -> InMemoryMessagePump {
        InMemoryMessagePump::new(self.clone())
    }

    fn stage(
        &self,
        sends: Vec<(Arc<Queue>, IncomingMessage)>,
        transaction: &Transaction,
    ) -> Result<(), TransportError> {
        transaction
            .enlist(StagedSend {
                sends: Mutex::new(sends),
            })
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Dispatcher for InMemoryTransport {
    async fn dispatch_delayed_message(
        &self,
        message_id: &str,
        headers: &[u8],
        body: &[u8],
        destination: &str,
        transaction: &Transaction,
    ) -> Result<(), TransportError> {
        let queue = self.queue(destination)?;
        let headers =
            headers::decode(headers).map_err(|e| TransportError::Malformed(e.to_string()))?;

        let message = IncomingMessage {
            message_id: message_id.to_string(),
            headers,
            body: Arc::from(body),
        };
        self.stage(vec![(queue, message)], transaction)
    }

    async fn dispatch(
        &self,
        messages: Vec<OutgoingMessage>,
        transaction: &Transaction,
    ) -> Result<(), TransportError> {
        let sends = messages
            .into_iter()
            .map(|message| {
                let queue = self.queue(&message.destination)?;
                Ok((
                    queue,
                    IncomingMessage {
                        message_id: message.message_id,
                        headers: message.headers,
                        body: message.body,
                    },
                ))
            })
            .collect::<Result<Vec<_>, TransportError>>()?;

        self.stage(sends, transaction)
    }
}

struct Receiver {
    handler: Arc<dyn MessageHandler>,
    settings: PumpSettings,
}

/// Receives from one [`InMemoryTransport`] queue
pub struct InMemoryMessagePump {
    transport: InMemoryTransport,
    receiver: Option<Arc<Receiver>>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for InMemoryMessagePump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMessagePump")
            .field(
                "input_queue",
                &self.receiver.as_ref().map(|r| &r.settings.input_queue),
            )
            .field("running", &self.handle.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl InMemoryMessagePump {
    #[must_use]
    pub fn new(transport: InMemoryTransport) -> Self {
        Self {
            transport,
            receiver: None,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MessagePump for InMemoryMessagePump {
    async fn init(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        settings: PumpSettings,
    ) -> Result<(), TransportError> {
        self.transport.queue(&settings.input_queue)?;
        self.receiver = Some(Arc::new(Receiver { handler, settings }));
        Ok(())
    }

    fn start(&self) -> Result<(), TransportError> {
        let Some(receiver) = &self.receiver else {
            return Err(TransportError::NotInitialized(
                "Message pump not initialised. Call init() first.".to_string(),
            ));
        };

        let queue = self.transport.queue(&receiver.settings.input_queue)?;
        let receiver = Arc::clone(receiver);
        let token = self.token.clone();

        internal!("Receiving from {}", receiver.settings.input_queue);
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = token.cancelled() => break,
                    message = queue.receive() => message,
                };
                receiver.process(&queue, message).await;
            }
            internal!("Stopped receiving from {}", receiver.settings.input_queue);
        });

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Message pump task failed");
        }
    }
}

impl Receiver {
    async fn process(&self, queue: &Queue, message: IncomingMessage) {
        let mut failures = 0u32;

        loop {
            let inbound = Transaction::begin();
            let context = MessageContext {
                message: message.clone(),
                transaction: inbound.join(),
            };

            let error = match self.handler.on_message(context).await {
                Ok(()) => {
                    if let Err(e) = inbound.commit().await {
                        tracing::warn!(message_id = %message.message_id, error = %e, "Receive commit failed, requeueing");
                        queue.push_back(message);
                    }
                    return;
                }
                Err(e) if e.is_cancelled() => {
                    inbound.rollback();
                    queue.push_front(message);
                    return;
                }
                Err(e) => {
                    inbound.rollback();
                    e
                }
            };

            failures = failures.saturating_add(1);
            tracing::debug!(
                message_id = %message.message_id,
                failures,
                error = %error,
                "Message processing failed"
            );

            let error_transaction = Transaction::begin();
            let context = ErrorContext {
                message: message.clone(),
                error,
                immediate_processing_failures: failures,
                transaction: error_transaction.join(),
            };

            match self.handler.on_error(context).await {
                Ok(ErrorHandleResult::RetryRequired) => {}
                Ok(ErrorHandleResult::Handled) => {
                    if let Err(e) = error_transaction.commit().await {
                        tracing::warn!(message_id = %message.message_id, error = %e, "Error handling commit failed, requeueing");
                        queue.push_back(message);
                    }
                    return;
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::error!(message_id = %message.message_id, error = %e, "Error handling failed, requeueing");
                    }
                    queue.push_back(message);
                    return;
                }
            }
        }
    }
}
