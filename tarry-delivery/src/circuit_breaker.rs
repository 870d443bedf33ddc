//! Failure circuit breakers guarding the delayed delivery pipeline
//!
//! A breaker does not stop work. It suppresses noisy failure reporting and
//! escalates to the host's critical error handler once a failure channel is
//! clearly broken, while the pipeline keeps trying to make progress.
//!
//! # Variants
//!
//! - [`RepeatedFailuresOverTimeCircuitBreaker`]: triggers when failures have
//!   been continuous for `time_to_wait` with no intervening success. Guards
//!   the store, fetch and dispatch channels.
//! - [`FailureRateCircuitBreaker`]: triggers when more than
//!   `max_failures_per_second` failures land in a one second window. Guards
//!   failure handling (retry counting and dead-lettering), which may fail
//!   occasionally without being fatal.
//!
//! # Example
//!
//! ```text
//! time_to_wait: 30s, delay_after_failure: 1s
//!
//! t=0s:   failure → armed, timer started
//! t=1s..: failures keep arriving, each followed by a 1s back-off
//! t=30s:  still no success → critical error raised once
//! t=42s:  success → reset, timer disarmed
//! ```

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tarry_common::tracing;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Raised to the host when a breaker triggers
#[derive(Debug, Clone, Error)]
#[error("{breaker}: {message}")]
pub struct CriticalError {
    /// Name of the breaker that triggered
    pub breaker: String,
    /// Operator facing description of the broken channel
    pub message: String,
    /// Text of the most recent failure, if one was recorded
    pub error: Option<String>,
}

/// Host callback invoked when a breaker triggers
pub type CriticalErrorHandler = Arc<dyn Fn(CriticalError) + Send + Sync>;

#[derive(Debug, Default)]
struct WindowData {
    failure_count: u32,
    first_failure_at: Option<Instant>,
    /// Bumped on every reset so stale timers can tell they were disarmed
    generation: u64,
    triggered: bool,
    last_error: Option<String>,
}

/// Breaker that triggers after a continuous run of failures
pub struct RepeatedFailuresOverTimeCircuitBreaker {
    name: String,
    trigger_message: String,
    time_to_wait: Duration,
    delay_after_failure: Duration,
    on_critical: CriticalErrorHandler,
    data: Arc<Mutex<WindowData>>,
}

impl fmt::Debug for RepeatedFailuresOverTimeCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatedFailuresOverTimeCircuitBreaker")
            .field("name", &self.name)
            .field("time_to_wait", &self.time_to_wait)
            .field("delay_after_failure", &self.delay_after_failure)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl RepeatedFailuresOverTimeCircuitBreaker {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        trigger_message: impl Into<String>,
        time_to_wait: Duration,
        delay_after_failure: Duration,
        on_critical: CriticalErrorHandler,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_message: trigger_message.into(),
            time_to_wait,
            delay_after_failure,
            on_critical,
            data: Arc::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a success, disarming the breaker
    pub fn success(&self) {
        let mut data = self.data.lock();
        if data.failure_count == 0 {
            return;
        }

        let failures = data.failure_count;
        let was_triggered = data.triggered;
        *data = WindowData {
            generation: data.generation.wrapping_add(1),
            ..WindowData::default()
        };
        drop(data);

        tracing::info!(
            breaker = %self.name,
            failures,
            was_triggered,
            "Circuit breaker reset after success"
        );
    }

    /// Record a failure, then back off for `delay_after_failure`
    ///
    /// The first failure of a run arms a timer. If no success arrives before
    /// `time_to_wait` elapses the critical error handler is invoked once for
    /// the run. The back-off is abandoned as soon as `cancel` fires.
    pub async fn failure(&self, error: &(dyn Display + Sync), cancel: &CancellationToken) {
        let armed = {
            let mut data = self.data.lock();
            data.failure_count = data.failure_count.saturating_add(1);
            data.last_error = Some(error.to_string());
            if data.first_failure_at.is_none() {
                data.first_failure_at = Some(Instant::now());
                Some(data.generation)
            } else {
                None
            }
        };

        if let Some(generation) = armed {
            tracing::warn!(
                breaker = %self.name,
                time_to_wait = ?self.time_to_wait,
                %error,
                "Circuit breaker armed"
            );
            self.spawn_trigger(generation);
        }

        if !self.delay_after_failure.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.delay_after_failure) => {}
            }
        }
    }

    fn spawn_trigger(&self, generation: u64) {
        let data = Arc::clone(&self.data);
        let on_critical = Arc::clone(&self.on_critical);
        let name = self.name.clone();
        let message = self.trigger_message.clone();
        let time_to_wait = self.time_to_wait;

        tokio::spawn(async move {
            tokio::time::sleep(time_to_wait).await;

            let last_error = {
                let mut data = data.lock();
                if data.generation != generation || data.triggered {
                    return;
                }
                data.triggered = true;
                data.last_error.clone()
            };

            tracing::warn!(
                breaker = %name,
                error = last_error.as_deref().unwrap_or_default(),
                "Circuit breaker triggered: {message}"
            );
            on_critical(CriticalError {
                breaker: name,
                message,
                error: last_error,
            });
        });
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.data.lock().triggered
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.data.lock().failure_count
    }
}

#[derive(Debug)]
struct RateData {
    window_start: Instant,
    failure_count: u32,
    triggered: bool,
}

/// Breaker that triggers when failures arrive faster than a fixed rate
pub struct FailureRateCircuitBreaker {
    name: String,
    trigger_message: String,
    max_failures_per_second: u32,
    on_critical: CriticalErrorHandler,
    data: Mutex<RateData>,
}

impl fmt::Debug for FailureRateCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRateCircuitBreaker")
            .field("name", &self.name)
            .field("max_failures_per_second", &self.max_failures_per_second)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

const RATE_WINDOW: Duration = Duration::from_secs(1);

impl FailureRateCircuitBreaker {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        trigger_message: impl Into<String>,
        max_failures_per_second: u32,
        on_critical: CriticalErrorHandler,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_message: trigger_message.into(),
            max_failures_per_second,
            on_critical,
            data: Mutex::new(RateData {
                window_start: Instant::now(),
                failure_count: 0,
                triggered: false,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a failure
    ///
    /// Returns `true` if this failure pushed the current window over the
    /// threshold and the critical error handler was invoked.
    pub fn failure(&self, error: &dyn Display) -> bool {
        let count = {
            let mut data = self.data.lock();
            let now = Instant::now();
            if now.duration_since(data.window_start) >= RATE_WINDOW {
                data.window_start = now;
                data.failure_count = 0;
                data.triggered = false;
            }

            data.failure_count = data.failure_count.saturating_add(1);
            if data.failure_count <= self.max_failures_per_second || data.triggered {
                return false;
            }
            data.triggered = true;
            data.failure_count
        };

        tracing::warn!(
            breaker = %self.name,
            failures = count,
            threshold = self.max_failures_per_second,
            %error,
            "Circuit breaker triggered: {}",
            self.trigger_message
        );
        (self.on_critical)(CriticalError {
            breaker: self.name.clone(),
            message: self.trigger_message.clone(),
            error: Some(error.to_string()),
        });
        true
    }
}
