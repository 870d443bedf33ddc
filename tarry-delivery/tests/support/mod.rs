//! Shared fixtures for delayed delivery integration tests
#![allow(dead_code)] // Test utility module - not all helpers used in every test

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tarry_common::Transaction;
use tarry_delivery::{
    CriticalError, CriticalErrorHandler, DelayedDeliverySettings, Dispatcher, InMemoryTransport,
    OutgoingMessage, TransportError,
};
use tarry_store::{DelayedMessage, DelayedMessageStore};
use tokio::sync::Semaphore;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Collects every critical error raised by a breaker
#[derive(Clone, Default)]
pub struct CriticalErrors(Arc<Mutex<Vec<CriticalError>>>);

impl CriticalErrors {
    pub fn handler(&self) -> CriticalErrorHandler {
        let errors = Arc::clone(&self.0);
        Arc::new(move |error| errors.lock().push(error))
    }

    pub fn breakers(&self) -> Vec<String> {
        self.0.lock().iter().map(|e| e.breaker.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Settings with no failure back-off so tests run at full speed
pub fn fast_settings() -> DelayedDeliverySettings {
    DelayedDeliverySettings {
        delay_after_failure_ms: 0,
        ..DelayedDeliverySettings::default()
    }
}

pub fn transport_with_queues(queues: &[&str]) -> InMemoryTransport {
    let transport = InMemoryTransport::new();
    for queue in queues {
        transport.create_queue(*queue);
    }
    transport
}

pub fn delayed(id: &str, destination: &str, due: DateTime<Utc>) -> DelayedMessage {
    let mut headers = BTreeMap::new();
    headers.insert("origin".to_string(), id.to_string());
    DelayedMessage::new(
        id,
        destination,
        due,
        tarry_common::headers::encode(&headers).expect("Failed to encode headers"),
        format!("body of {id}").into_bytes(),
    )
}

pub async fn commit_stored(store: &dyn DelayedMessageStore, message: DelayedMessage) {
    let tx = Transaction::begin();
    store.store(message, &tx).await.expect("Failed to store");
    tx.commit().await.expect("Failed to commit");
}

/// A timeout request as it arrives on the timeouts queue
pub fn timeout_request(
    id: &str,
    timeouts_queue: &str,
    destination: &str,
    due: DateTime<Utc>,
) -> OutgoingMessage {
    let mut headers = BTreeMap::new();
    headers.insert("origin".to_string(), id.to_string());

    OutgoingMessage {
        message_id: id.to_string(),
        headers,
        body: Arc::from(format!("body of {id}").into_bytes()),
        destination: destination.to_string(),
    }
    .defer(timeouts_queue, due)
}

/// Poll `condition` until it holds or the test timeout elapses
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not met before timeout");
}

/// Dispatcher wrapping the loopback transport with scripted behaviour
///
/// Delayed message dispatches can be made to fail, to take a while, or to
/// block on a gate until the test releases them.
pub struct ScriptedDispatcher {
    inner: InMemoryTransport,
    failures: AtomicU32,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDispatcher {
    pub fn new(inner: InMemoryTransport) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            delay: Duration::ZERO,
            gate: None,
            attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(self, failures: u32) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch_delayed_message(
        &self,
        message_id: &str,
        headers: &[u8],
        body: &[u8],
        destination: &str,
        transaction: &Transaction,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("Gate closed")
                .forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if failed {
            Err(TransportError::Unavailable(format!(
                "scripted failure for {message_id}"
            )))
        } else {
            self.inner
                .dispatch_delayed_message(message_id, headers, body, destination, transaction)
                .await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn dispatch(
        &self,
        messages: Vec<OutgoingMessage>,
        transaction: &Transaction,
    ) -> Result<(), TransportError> {
        self.inner.dispatch(messages, transaction).await
    }
}
