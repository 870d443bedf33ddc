//! Store-backed delayed delivery
//!
//! This crate provides:
//! - [`DelayedDeliveryPump`]: receives timeout requests and either dispatches
//!   them immediately or stores them for later
//! - [`DueDelayedMessagePoller`]: dispatches stored messages as they fall due
//! - Failure circuit breakers escalating sustained failures to the host
//! - Transport contracts and an in-memory loopback transport

pub mod circuit_breaker;
mod error;
mod faults;
pub mod poller;
mod pump;
mod settings;
pub mod transport;

pub use circuit_breaker::{
    CriticalError, CriticalErrorHandler, FailureRateCircuitBreaker,
    RepeatedFailuresOverTimeCircuitBreaker,
};
pub use error::{DelayedDeliveryError, TransportError};
pub use poller::{DueDelayedMessagePoller, MAX_OUTSTANDING_DISPATCHES, PollerWaker};
pub use pump::DelayedDeliveryPump;
pub use settings::DelayedDeliverySettings;
pub use transport::{
    Dispatcher, ErrorContext, ErrorHandleResult, InMemoryMessagePump, InMemoryTransport,
    IncomingMessage, MessageContext, MessageHandler, MessagePump, OutgoingMessage, PumpSettings,
};
