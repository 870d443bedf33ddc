//! Backend storage implementations for delayed messages
//!
//! - `memory`: In-memory transactional storage
//! - `test`: Test utilities with synchronisation primitives and fault injection

pub mod memory;

pub use memory::MemoryDelayedMessageStore;
pub use test::TestDelayedMessageStore;
