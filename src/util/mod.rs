//! Shared utilities: logging setup and per-key async locking

pub mod keyed_lock;
pub mod logging;

pub use keyed_lock::KeyedLocks;
pub use logging::{init_logging, LoggingConfig};
