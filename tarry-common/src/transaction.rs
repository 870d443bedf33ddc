//! Explicit transactions shared by stores and transports.
//!
//! A [`Transaction`] is passed by reference through every call that touches a
//! durable resource. Resources stage their work by enlisting an
//! [`Enlistment`], which is committed or rolled back together with the
//! transaction. Handles obtained through [`Transaction::join`] share the same
//! enlistments but never complete the transaction themselves: only the owning
//! handle decides the outcome.
//!
//! ```text
//!  inbound (owner) ──join()──> handler scope (joined)
//!        │                           │ enlist(store insert)
//!        │                           │ commit()  -> no-op
//!        └── commit() ──> runs every enlistment in order
//! ```

use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

/// Transaction guarantees offered by the host transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TransactionMode {
    /// No transactions at all
    None,
    /// The receive is transactional, sends are not
    ReceiveOnly,
    /// Sends are committed atomically with the receive
    #[default]
    SendsAtomicWithReceive,
    /// Sends, receives and store operations share one distributed transaction
    TransactionScope,
}

/// Whether a unit of work joins the surrounding transaction or starts its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOption {
    Join,
    RequiresNew,
}

impl ScopeOption {
    /// Select the scope policy for a transport transaction mode
    #[must_use]
    pub const fn for_mode(mode: TransactionMode) -> Self {
        match mode {
            TransactionMode::TransactionScope => Self::Join,
            TransactionMode::None
            | TransactionMode::ReceiveOnly
            | TransactionMode::SendsAtomicWithReceive => Self::RequiresNew,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    /// The transaction already committed or rolled back
    #[error("Transaction {0} is no longer active")]
    NotActive(TransactionId),

    /// An enlisted resource failed while applying its staged work
    #[error("Enlisted resource failed to commit: {0}")]
    Commit(String),
}

/// Work staged against a transaction by a resource
#[async_trait]
pub trait Enlistment: Send + Sync {
    /// Apply the staged work
    ///
    /// # Errors
    /// If the resource cannot apply the work
    async fn commit(&self) -> Result<(), TransactionError>;

    /// Discard the staged work
    fn rollback(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(ulid::Ulid);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Enlistments are being applied; the transaction still holds its locks
    Committing,
    Committed,
    RolledBack,
}

struct Inner {
    id: TransactionId,
    state: Mutex<TransactionState>,
    enlistments: Mutex<Vec<Box<dyn Enlistment>>>,
}

impl Inner {
    fn rollback(&self) {
        {
            let mut state = self.state.lock();
            if *state != TransactionState::Active {
                return;
            }
            *state = TransactionState::RolledBack;
        }

        let enlistments = std::mem::take(&mut *self.enlistments.lock());
        for enlistment in enlistments.iter().rev() {
            enlistment.rollback();
        }
    }
}

pub struct Transaction {
    inner: Arc<Inner>,
    owner: bool,
}

impl Transaction {
    /// Begin a new transaction owned by the caller
    #[must_use]
    pub fn begin() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: TransactionId(ulid::Ulid::new()),
                state: Mutex::new(TransactionState::Active),
                enlistments: Mutex::new(Vec::new()),
            }),
            owner: true,
        }
    }

    /// Obtain a non-owning handle that enlists into this transaction
    #[must_use]
    pub fn join(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: false,
        }
    }

    /// Open a scope according to `option`
    ///
    /// Joins `parent` when asked to and one is available, otherwise begins a
    /// fresh transaction.
    #[must_use]
    pub fn scope(parent: Option<&Self>, option: ScopeOption) -> Self {
        match (option, parent) {
            (ScopeOption::Join, Some(parent)) => parent.join(),
            _ => Self::begin(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.owner
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// A weak token that reports whether this transaction still holds its locks
    #[must_use]
    pub fn lock(&self) -> TransactionLock {
        TransactionLock {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stage work to be applied on commit
    ///
    /// # Errors
    /// If the transaction is no longer active
    pub fn enlist<E: Enlistment + 'static>(&self, enlistment: E) -> Result<(), TransactionError> {
        let state = self.inner.state.lock();
        if *state != TransactionState::Active {
            return Err(TransactionError::NotActive(self.inner.id));
        }

        self.inner.enlistments.lock().push(Box::new(enlistment));
        Ok(())
    }

    /// Complete this handle's part of the transaction
    ///
    /// For the owner this applies every enlistment in the order they were made.
    /// If one fails, the remaining enlistments are rolled back. For a joined
    /// handle this is a no-op: the owner decides the outcome.
    ///
    /// # Errors
    /// If the transaction is no longer active, or an enlistment fails to commit
    pub async fn commit(self) -> Result<(), TransactionError> {
        if !self.owner {
            return Ok(());
        }

        let enlistments = {
            let mut state = self.inner.state.lock();
            if *state != TransactionState::Active {
                return Err(TransactionError::NotActive(self.inner.id));
            }
            *state = TransactionState::Committing;
            std::mem::take(&mut *self.inner.enlistments.lock())
        };

        let mut pending = enlistments.into_iter();
        while let Some(enlistment) = pending.next() {
            if let Err(err) = enlistment.commit().await {
                enlistment.rollback();
                pending.by_ref().for_each(|rest| rest.rollback());
                *self.inner.state.lock() = TransactionState::RolledBack;
                return Err(err);
            }
        }

        *self.inner.state.lock() = TransactionState::Committed;
        Ok(())
    }

    /// Discard everything staged against this transaction
    ///
    /// Dropping an owning handle without committing has the same effect.
    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.owner {
            self.inner.rollback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Reports whether the transaction that took a lock is still running
#[derive(Debug, Clone)]
pub struct TransactionLock {
    id: TransactionId,
    inner: Weak<Inner>,
}

impl TransactionLock {
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// `true` while the transaction is active or still committing
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            matches!(
                *inner.state.lock(),
                TransactionState::Active | TransactionState::Committing
            )
        })
    }
}
