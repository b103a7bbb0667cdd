//! Durable JSON documents under the state root.
//!
//! All reads and writes of a document happen while holding that document's
//! named lock. Writes go to a temp file in the same directory and are renamed
//! into place.

mod store;

pub use store::{
    StateStore, ITERATION_STATE_FILE, RETRY_STATE_FILE, STAGE_STATE_FILE,
};

use crate::domain::errors::{DomainError, DomainResult};

/// Run lock-taking state I/O on the blocking pool.
///
/// Lock acquisition sleeps the calling thread between attempts, so async
/// callers go through here to keep runtime workers and timers free while a
/// document is contended.
pub async fn blocking<T, F>(f: F) -> DomainResult<T>
where
    F: FnOnce() -> DomainResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DomainError::ExecutionFailed(format!("state task failed: {err}")))?
}
