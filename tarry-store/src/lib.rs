pub mod backends;
pub mod config;
pub mod error;
pub mod message;
pub mod r#trait;

pub use backends::{MemoryDelayedMessageStore, TestDelayedMessageStore};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use message::DelayedMessage;
pub use r#trait::DelayedMessageStore;
