use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message scheduled for delivery at a future instant
///
/// Only `number_of_retries` ever changes once a record has been stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedMessage {
    /// When the message becomes due
    pub time: DateTime<Utc>,
    /// Natural id of the original message, unique within a store
    pub message_id: String,
    /// Opaque payload
    pub body: Arc<[u8]>,
    /// Opaque, encoded transport headers
    pub headers: Arc<[u8]>,
    /// Address to deliver to once due
    pub destination: String,
    /// Failed dispatch attempts so far
    pub number_of_retries: u32,
}

impl DelayedMessage {
    /// Create a record that has never been attempted
    pub fn new(
        message_id: impl Into<String>,
        destination: impl Into<String>,
        time: DateTime<Utc>,
        headers: impl Into<Arc<[u8]>>,
        body: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            time,
            message_id: message_id.into(),
            body: body.into(),
            headers: headers.into(),
            destination: destination.into(),
            number_of_retries: 0,
        }
    }

    /// Whether the message is due at `at`
    #[must_use]
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.time <= at
    }
}
