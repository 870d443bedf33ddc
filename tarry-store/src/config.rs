use std::sync::Arc;

use serde::Deserialize;

use crate::{MemoryDelayedMessageStore, r#trait::DelayedMessageStore};

/// Delayed message store configuration
///
/// # Examples
///
/// Unbounded memory store:
/// ```ron
/// Tarry (
///     store: Memory(),
/// )
/// ```
///
/// Memory store with a capacity limit:
/// ```ron
/// Tarry (
///     store: Memory(capacity: Some(10000)),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// Memory-based store (testing/development)
    Memory {
        /// Maximum number of messages to hold (omit for unlimited)
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory { capacity: None }
    }
}

impl StoreConfig {
    /// Convert the configuration into a concrete store
    #[must_use]
    pub fn into_store(self) -> Arc<dyn DelayedMessageStore> {
        match self {
            Self::Memory { capacity } => Arc::new(capacity.map_or_else(
                MemoryDelayedMessageStore::new,
                MemoryDelayedMessageStore::with_capacity,
            )),
        }
    }
}
