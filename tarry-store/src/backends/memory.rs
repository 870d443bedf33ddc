use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tarry_common::{
    Enlistment, Transaction, TransactionError, TransactionId, TransactionLock, TransactionMode,
};

use crate::{DelayedMessage, StoreError, r#trait::DelayedMessageStore};

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) message: DelayedMessage,
    locked_by: Option<TransactionLock>,
    /// Transaction with a staged removal of this entry
    removed_by: Option<TransactionLock>,
}

impl Entry {
    const fn new(message: DelayedMessage) -> Self {
        Self {
            message,
            locked_by: None,
            removed_by: None,
        }
    }

    fn is_locked(&self) -> bool {
        self.locked_by.as_ref().is_some_and(TransactionLock::is_held) || self.is_being_removed()
    }

    fn is_being_removed(&self) -> bool {
        self.removed_by.as_ref().is_some_and(TransactionLock::is_held)
    }
}

type Entries = Arc<RwLock<HashMap<String, Entry>>>;

/// In-memory, transactional delayed message store
///
/// Writes are staged against the caller's transaction and applied when it
/// commits. A fetched record is locked to the fetching transaction until that
/// transaction completes, so concurrent fetches skip it.
///
/// # Capacity Management
/// An optional capacity bounds the number of stored messages, counting both
/// committed messages and inserts staged by transactions still in flight.
/// Stores beyond the capacity fail with [`StoreError::CapacityExceeded`].
///
/// # Removal
/// A removal claims the record for the removing transaction. Until that
/// transaction completes, other removals report the record as already gone
/// and fetches skip it. Rolling back releases the claim.
///
/// # Concurrency
/// A single `RwLock` serialises every operation, which makes fetch-and-lock
/// atomic.
#[derive(Debug, Clone)]
pub struct MemoryDelayedMessageStore {
    pub(crate) entries: Entries,
    /// Inserts staged but not yet committed or rolled back
    staged_inserts: Arc<AtomicUsize>,
    owner: Arc<Mutex<Option<String>>>,
    capacity: Option<usize>,
}

impl MemoryDelayedMessageStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            staged_inserts: Arc::new(AtomicUsize::new(0)),
            owner: Arc::new(Mutex::new(None)),
            capacity: None,
        }
    }

    /// Create a new store with a capacity limit
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Number of committed messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Snapshot of a committed message
    #[must_use]
    pub fn get(&self, message_id: &str) -> Option<DelayedMessage> {
        self.entries
            .read()
            .get(message_id)
            .map(|entry| entry.message.clone())
    }

    /// Snapshot of every committed message, earliest first
    #[must_use]
    pub fn messages(&self) -> Vec<DelayedMessage> {
        let mut messages: Vec<_> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.message.clone())
            .collect();
        messages.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        messages
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn ensure_initialized(&self) -> crate::Result<()> {
        if self.owner.lock().is_some() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    fn stage(&self, transaction: &Transaction, write: Staged) -> crate::Result<()> {
        transaction.enlist(StagedWrite {
            entries: Arc::clone(&self.entries),
            staged_inserts: Arc::clone(&self.staged_inserts),
            transaction: transaction.id(),
            write,
        })?;
        Ok(())
    }
}

impl Default for MemoryDelayedMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Staged {
    Insert(DelayedMessage),
    Remove(String),
    Increment(String),
}

struct StagedWrite {
    entries: Entries,
    staged_inserts: Arc<AtomicUsize>,
    transaction: TransactionId,
    write: Staged,
}

#[async_trait]
impl Enlistment for StagedWrite {
    async fn commit(&self) -> Result<(), TransactionError> {
        let mut entries = self.entries.write();
        match &self.write {
            Staged::Insert(message) => {
                entries
                    .entry(message.message_id.clone())
                    .or_insert_with(|| Entry::new(message.clone()));
                self.staged_inserts.fetch_sub(1, Ordering::SeqCst);
            }
            Staged::Remove(message_id) => {
                entries.remove(message_id);
            }
            Staged::Increment(message_id) => {
                if let Some(entry) = entries.get_mut(message_id) {
                    entry.message.number_of_retries =
                        entry.message.number_of_retries.saturating_add(1);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self) {
        match &self.write {
            Staged::Insert(_) => {
                self.staged_inserts.fetch_sub(1, Ordering::SeqCst);
            }
            Staged::Remove(message_id) => {
                if let Some(entry) = self.entries.write().get_mut(message_id)
                    && entry
                        .removed_by
                        .as_ref()
                        .is_some_and(|lock| lock.id() == self.transaction)
                {
                    entry.removed_by = None;
                }
            }
            Staged::Increment(_) => {}
        }
    }
}

#[async_trait]
impl DelayedMessageStore for MemoryDelayedMessageStore {
    async fn initialize(&self, owner: &str, _mode: TransactionMode) -> crate::Result<()> {
        let mut current = self.owner.lock();
        match current.as_deref() {
            None => {
                *current = Some(owner.to_string());
                Ok(())
            }
            Some(existing) if existing == owner => Ok(()),
            Some(existing) => Err(StoreError::AlreadyInitialized(existing.to_string())),
        }
    }

    async fn next(&self, _transaction: &Transaction) -> crate::Result<Option<DateTime<Utc>>> {
        self.ensure_initialized()?;

        Ok(self
            .entries
            .read()
            .values()
            .filter(|entry| !entry.is_locked())
            .map(|entry| entry.message.time)
            .min())
    }

    async fn store(
        &self,
        message: DelayedMessage,
        transaction: &Transaction,
    ) -> crate::Result<()> {
        self.ensure_initialized()?;

        {
            let entries = self.entries.write();
            if entries.contains_key(&message.message_id) {
                tracing::debug!(
                    message_id = %message.message_id,
                    "Delayed message already stored, ignoring duplicate"
                );
                return Ok(());
            }

            let len = entries.len() + self.staged_inserts.load(Ordering::SeqCst);
            if let Some(capacity) = self.capacity
                && len >= capacity
            {
                return Err(StoreError::CapacityExceeded { len, capacity });
            }

            self.staged_inserts.fetch_add(1, Ordering::SeqCst);
        }

        self.stage(transaction, Staged::Insert(message))
            .inspect_err(|_| {
                self.staged_inserts.fetch_sub(1, Ordering::SeqCst);
            })
    }

    async fn remove(
        &self,
        message: &DelayedMessage,
        transaction: &Transaction,
    ) -> crate::Result<bool> {
        self.ensure_initialized()?;

        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&message.message_id) else {
            return Ok(false);
        };
        if entry.is_being_removed() {
            return Ok(false);
        }

        self.stage(transaction, Staged::Remove(message.message_id.clone()))?;
        entry.removed_by = Some(transaction.lock());
        Ok(true)
    }

    async fn increment_failure_count(
        &self,
        message: &DelayedMessage,
        transaction: &Transaction,
    ) -> crate::Result<bool> {
        self.ensure_initialized()?;

        if !self.entries.read().contains_key(&message.message_id) {
            return Ok(false);
        }

        self.stage(transaction, Staged::Increment(message.message_id.clone()))?;
        Ok(true)
    }

    async fn fetch_next_due_timeout(
        &self,
        at: DateTime<Utc>,
        transaction: &Transaction,
    ) -> crate::Result<Option<DelayedMessage>> {
        self.ensure_initialized()?;

        let mut entries = self.entries.write();
        let candidate = entries
            .values_mut()
            .filter(|entry| entry.message.is_due(at) && !entry.is_locked())
            .min_by(|a, b| {
                a.message
                    .time
                    .cmp(&b.message.time)
                    .then_with(|| a.message.message_id.cmp(&b.message.message_id))
            });

        Ok(candidate.map(|entry| {
            entry.locked_by = Some(transaction.lock());
            entry.message.clone()
        }))
    }
}
