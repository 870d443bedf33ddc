//! Polls the delayed message store and dispatches messages as they fall due
//!
//! # Units of concurrency
//!
//! `start` spawns two long-lived tasks:
//!
//! 1. The **poll loop** fetches the oldest due message and hands it to a
//!    short-lived dispatch task, then immediately fetches again. When nothing
//!    is due it sleeps until the next due time (capped at the max sleep
//!    duration) or until woken through [`PollerWaker`].
//! 2. The **completion sink** awaits dispatch tasks in submission order and
//!    reports their failures to the failure-handling breaker.
//!
//! Dispatch tasks pass through a bounded queue, so at most
//! [`MAX_OUTSTANDING_DISPATCHES`] are outstanding. A full queue suspends the
//! poll loop before it fetches again.
//!
//! # Shutdown
//!
//! `stop` cancels the poll loop and any waits it is suspended in. The sink is
//! never cancelled: it drains every dispatch that was already started before
//! `stop` returns.

mod cycle;
mod dispatch;
mod waker;

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tarry_common::{ScopeOption, TransactionMode, internal, tracing};
use tarry_store::DelayedMessageStore;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub use waker::PollerWaker;

use crate::{
    circuit_breaker::{
        CriticalErrorHandler, FailureRateCircuitBreaker, RepeatedFailuresOverTimeCircuitBreaker,
    },
    error::DelayedDeliveryError,
    settings::DelayedDeliverySettings,
    transport::Dispatcher,
};

/// Upper bound on dispatch tasks that have been started but not yet drained
pub const MAX_OUTSTANDING_DISPATCHES: usize = 2;

const SOURCE: &str = "tarry.delivery.poller";

/// State shared by the poll loop, the sink and every dispatch task
struct Shared {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: DelayedDeliverySettings,
    scope: ScopeOption,
    error_queue: String,
    timeouts_queue: String,
    fetch_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    dispatch_breaker: RepeatedFailuresOverTimeCircuitBreaker,
    failure_breaker: FailureRateCircuitBreaker,
    waker: PollerWaker,
    token: CancellationToken,
}

struct Tasks {
    poll_loop: JoinHandle<()>,
    sink: JoinHandle<()>,
}

/// Surfaces due messages from the store and dispatches them
pub struct DueDelayedMessagePoller {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: DelayedDeliverySettings,
    waker: PollerWaker,
    wake: Mutex<Option<mpsc::Receiver<()>>>,
    token: CancellationToken,
    shared: OnceLock<Arc<Shared>>,
    tasks: Mutex<Option<Tasks>>,
}

impl fmt::Debug for DueDelayedMessagePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DueDelayedMessagePoller")
            .field("store", &self.store)
            .field("settings", &self.settings)
            .field("initialized", &self.shared.get().is_some())
            .field("running", &self.tasks.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl DueDelayedMessagePoller {
    #[must_use]
    pub fn new(
        store: Arc<dyn DelayedMessageStore>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: DelayedDeliverySettings,
    ) -> Self {
        let (waker, wake) = PollerWaker::channel(settings.max_sleep_duration());
        Self {
            store,
            dispatcher,
            settings,
            waker,
            wake: Mutex::new(Some(wake)),
            token: CancellationToken::new(),
            shared: OnceLock::new(),
            tasks: Mutex::new(None),
        }
    }

    /// Configure breakers, the transaction scope policy and error routing
    ///
    /// `timeouts_queue` is recorded as the failed queue on dead-lettered
    /// messages.
    ///
    /// # Errors
    /// If the poller was already initialised.
    pub fn init(
        &self,
        on_critical: &CriticalErrorHandler,
        transaction_mode: TransactionMode,
        error_queue: impl Into<String>,
        timeouts_queue: impl Into<String>,
    ) -> Result<(), DelayedDeliveryError> {
        internal!("Initialising delayed message poller ...");

        let settings = &self.settings;
        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            settings: settings.clone(),
            scope: ScopeOption::for_mode(transaction_mode),
            error_queue: error_queue.into(),
            timeouts_queue: timeouts_queue.into(),
            fetch_breaker: RepeatedFailuresOverTimeCircuitBreaker::new(
                "fetch",
                "Failed to fetch due delayed messages from the storage",
                settings.fetch_breaker_window(),
                settings.delay_after_failure(),
                Arc::clone(on_critical),
            ),
            dispatch_breaker: RepeatedFailuresOverTimeCircuitBreaker::new(
                "dispatch",
                "Failed to dispatch delayed messages to destination",
                settings.dispatch_breaker_window(),
                settings.delay_after_failure(),
                Arc::clone(on_critical),
            ),
            failure_breaker: FailureRateCircuitBreaker::new(
                "recoverability",
                "Failed to execute error handling for delayed message forwarding",
                settings.maximum_recoverability_failures_per_second,
                Arc::clone(on_critical),
            ),
            waker: self.waker.clone(),
            token: self.token.clone(),
        });

        self.shared
            .set(shared)
            .map_err(|_| DelayedDeliveryError::AlreadyInitialized("delayed message poller"))?;

        internal!(
            "Delayed message poller initialised with scope={:?}, max_sleep={:?}, retries={}",
            ScopeOption::for_mode(transaction_mode),
            settings.max_sleep_duration(),
            settings.number_of_retries
        );
        Ok(())
    }

    /// Spawn the poll loop and completion sink
    ///
    /// # Errors
    /// If called before `init`, or a second time.
    pub fn start(&self) -> Result<(), DelayedDeliveryError> {
        let Some(shared) = self.shared.get() else {
            return Err(DelayedDeliveryError::NotInitialized(
                "delayed message poller. Call init() first.",
            ));
        };
        let Some(wake) = self.wake.lock().take() else {
            return Err(DelayedDeliveryError::AlreadyInitialized(
                "delayed message poller already started",
            ));
        };

        let (queue, pending) = mpsc::channel(MAX_OUTSTANDING_DISPATCHES - 1);
        let poll_loop = tokio::spawn(cycle::poll(Arc::clone(shared), wake, queue));
        let sink = tokio::spawn(cycle::drain(Arc::clone(shared), pending));

        *self.tasks.lock() = Some(Tasks { poll_loop, sink });
        internal!("Delayed message poller started");
        Ok(())
    }

    /// Cancel the poll loop and wait for in-flight dispatches to finish
    pub async fn stop(&self) {
        self.token.cancel();

        let tasks = self.tasks.lock().take();
        let Some(Tasks { poll_loop, sink }) = tasks else {
            return;
        };

        if let Err(e) = poll_loop.await {
            tracing::error!(error = %e, "Delayed message poll loop failed");
        }
        if let Err(e) = sink.await {
            tracing::error!(error = %e, "Delayed message completion sink failed");
        }

        internal!("Delayed message poller stopped");
    }

    /// Hint that a message was stored which becomes due at `due`
    ///
    /// See [`PollerWaker::signal`].
    pub fn signal(&self, due: DateTime<Utc>) -> bool {
        self.waker.signal(due)
    }

    /// A cloneable handle for signalling this poller
    #[must_use]
    pub fn waker(&self) -> PollerWaker {
        self.waker.clone()
    }
}
