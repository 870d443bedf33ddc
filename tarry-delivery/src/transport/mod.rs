//! Contracts between the delayed delivery pipeline and the message transport
//!
//! The pipeline never touches a broker directly. It receives timeout requests
//! through a [`MessagePump`], hands them to a [`MessageHandler`], and sends
//! through a [`Dispatcher`]. All three take an explicit [`Transaction`] so
//! sends can be made atomic with the receive that caused them.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tarry_common::{Headers, Transaction, TransactionMode, headers::names};

use crate::error::{DelayedDeliveryError, TransportError};

pub use memory::{InMemoryMessagePump, InMemoryTransport};

/// A message received from a transport queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Arc<[u8]>,
}

/// A message to be sent to `destination`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Arc<[u8]>,
    pub destination: String,
}

impl OutgoingMessage {
    #[must_use]
    pub fn from_incoming(message: IncomingMessage, destination: impl Into<String>) -> Self {
        Self {
            message_id: message.message_id,
            headers: message.headers,
            body: message.body,
            destination: destination.into(),
        }
    }

    /// Turn this message into a timeout request for `timeouts_queue`
    ///
    /// The original destination and `due` travel as delay headers and are
    /// restored when the request is handled.
    #[must_use]
    pub fn defer(mut self, timeouts_queue: impl Into<String>, due: DateTime<Utc>) -> Self {
        let destination = std::mem::replace(&mut self.destination, timeouts_queue.into());
        self.headers
            .insert(names::DELAY_DESTINATION.to_string(), destination);
        self.headers.insert(
            names::DELAY_DUE.to_string(),
            due.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        self
    }
}

/// Sends messages into the transport
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send a stored delayed message to its final destination
    ///
    /// `headers` is the serialised header blob kept in the store.
    ///
    /// # Errors
    /// [`TransportError::QueueNotFound`] if `destination` does not exist, any
    /// other variant if the send could not be staged.
    async fn dispatch_delayed_message(
        &self,
        message_id: &str,
        headers: &[u8],
        body: &[u8],
        destination: &str,
        transaction: &Transaction,
    ) -> Result<(), TransportError>;

    /// Send a batch of already-decoded messages
    ///
    /// # Errors
    /// As for [`Dispatcher::dispatch_delayed_message`].
    async fn dispatch(
        &self,
        messages: Vec<OutgoingMessage>,
        transaction: &Transaction,
    ) -> Result<(), TransportError>;
}

/// Inbound delivery of a single message to a handler
#[derive(Debug)]
pub struct MessageContext {
    pub message: IncomingMessage,
    /// Receive transaction. Handlers join or replace it per the scope option.
    pub transaction: Transaction,
}

/// A message whose processing failed
#[derive(Debug)]
pub struct ErrorContext {
    pub message: IncomingMessage,
    pub error: DelayedDeliveryError,
    /// Consecutive failures of this message on this pump
    pub immediate_processing_failures: u32,
    pub transaction: Transaction,
}

/// Outcome of [`MessageHandler::on_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The pump should deliver the message again
    RetryRequired,
    /// The handler dealt with the message; consume it
    Handled,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one received message
    ///
    /// # Errors
    /// Any error rolls back the receive. Cancellation errors requeue the
    /// message without calling [`MessageHandler::on_error`].
    async fn on_message(&self, context: MessageContext) -> Result<(), DelayedDeliveryError>;

    /// Decide what to do with a message whose processing failed
    ///
    /// # Errors
    /// An error leaves the message on the queue for a later attempt.
    async fn on_error(
        &self,
        context: ErrorContext,
    ) -> Result<ErrorHandleResult, DelayedDeliveryError>;
}

/// How a pump should receive
#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub input_queue: String,
    pub error_queue: String,
    pub transaction_mode: TransactionMode,
}

/// Receives messages from one queue and feeds them to a handler
#[async_trait]
pub trait MessagePump: Send + Sync {
    /// # Errors
    /// If the pump cannot receive from `settings.input_queue`.
    async fn init(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        settings: PumpSettings,
    ) -> Result<(), TransportError>;

    /// Begin receiving without blocking the caller
    ///
    /// # Errors
    /// If called before `init`.
    fn start(&self) -> Result<(), TransportError>;

    /// Stop receiving, waiting for in-flight messages to finish
    async fn stop(&self);
}
