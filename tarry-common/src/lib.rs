pub mod headers;
pub mod logging;
pub mod transaction;

pub use tracing;

pub use self::{
    headers::{HeaderError, Headers},
    transaction::{
        Enlistment, ScopeOption, Transaction, TransactionError, TransactionId, TransactionLock,
        TransactionMode, TransactionState,
    },
};

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
