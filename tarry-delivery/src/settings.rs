use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

const fn default_number_of_retries() -> u32 {
    5
}

const fn default_breaker_secs() -> u64 {
    30
}

const fn default_failures_per_second() -> u32 {
    1
}

const fn default_max_sleep_duration_ms() -> u64 {
    60_000
}

const fn default_delay_after_failure_ms() -> u64 {
    1_000
}

fn default_timeouts_queue_suffix() -> String {
    String::from("timeouts")
}

/// Tuning for the delayed delivery pipeline
///
/// # Example
///
/// ```ron
/// delayed_delivery: (
///     number_of_retries: 3,
///     time_to_trigger_fetch_circuit_breaker_secs: 60,
///     fault_metadata: { "host": "worker-1" },
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DelayedDeliverySettings {
    /// Appended to the endpoint input queue to form the timeouts queue
    #[serde(default = "default_timeouts_queue_suffix")]
    pub timeouts_queue_suffix: String,

    /// Failed attempts tolerated before a message is dead-lettered
    ///
    /// Applies both to due messages that fail dispatch and to timeout
    /// requests that fail on receipt.
    #[serde(default = "default_number_of_retries")]
    pub number_of_retries: u32,

    #[serde(default = "default_breaker_secs")]
    pub time_to_trigger_store_circuit_breaker_secs: u64,

    #[serde(default = "default_breaker_secs")]
    pub time_to_trigger_fetch_circuit_breaker_secs: u64,

    #[serde(default = "default_breaker_secs")]
    pub time_to_trigger_dispatch_circuit_breaker_secs: u64,

    /// Failure-handling errors tolerated per second before escalating
    #[serde(default = "default_failures_per_second")]
    pub maximum_recoverability_failures_per_second: u32,

    /// Longest the poll loop sleeps without being signalled
    #[serde(default = "default_max_sleep_duration_ms")]
    pub max_sleep_duration_ms: u64,

    /// Back-off applied by the time-windowed breakers after each failure
    #[serde(default = "default_delay_after_failure_ms")]
    pub delay_after_failure_ms: u64,

    /// Headers stamped onto every dead-lettered message
    #[serde(default)]
    pub fault_metadata: BTreeMap<String, String>,
}

impl Default for DelayedDeliverySettings {
    fn default() -> Self {
        Self {
            timeouts_queue_suffix: default_timeouts_queue_suffix(),
            number_of_retries: default_number_of_retries(),
            time_to_trigger_store_circuit_breaker_secs: default_breaker_secs(),
            time_to_trigger_fetch_circuit_breaker_secs: default_breaker_secs(),
            time_to_trigger_dispatch_circuit_breaker_secs: default_breaker_secs(),
            maximum_recoverability_failures_per_second: default_failures_per_second(),
            max_sleep_duration_ms: default_max_sleep_duration_ms(),
            delay_after_failure_ms: default_delay_after_failure_ms(),
            fault_metadata: BTreeMap::new(),
        }
    }
}

impl DelayedDeliverySettings {
    #[must_use]
    pub const fn max_sleep_duration(&self) -> Duration {
        Duration::from_millis(self.max_sleep_duration_ms)
    }

    #[must_use]
    pub const fn delay_after_failure(&self) -> Duration {
        Duration::from_millis(self.delay_after_failure_ms)
    }

    #[must_use]
    pub const fn store_breaker_window(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_store_circuit_breaker_secs)
    }

    #[must_use]
    pub const fn fetch_breaker_window(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_fetch_circuit_breaker_secs)
    }

    #[must_use]
    pub const fn dispatch_breaker_window(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_dispatch_circuit_breaker_secs)
    }

    /// Name of the queue timeout requests arrive on for `input_queue`
    #[must_use]
    pub fn timeouts_queue(&self, input_queue: &str) -> String {
        format!("{input_queue}.{}", self.timeouts_queue_suffix)
    }
}
