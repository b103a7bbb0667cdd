//! Infrastructure layer
//!
//! Implements persistence, locking, configuration loading and logging:
//! - File locks with backoff (fs2 / PID markers)
//! - Atomic JSON state documents
//! - Configuration management (figment)
//! - Logging (tracing)

pub mod config;
pub mod locking;
pub mod logging;
pub mod state;

pub use config::{ConfigError, ConfigLoader};
pub use locking::{LockGuard, LockManager};
pub use state::StateStore;
