//! Named, per-file mutual exclusion for state documents.
//!
//! Every durable document has a sibling lock file in a dedicated locks
//! directory. `LockManager` acquires it with bounded exponential backoff and a
//! hard timeout; the backend decides what "holding" a lock means:
//!
//! - `NativeLock`: OS advisory locks through `fs2` (`flock` on Unix,
//!   `LockFileEx` on Windows). Lock files stay on disk between uses.
//! - `PidFileLock`: a marker file created exclusively and holding the owner's
//!   PID. Cooperative only; every acquisition logs a warning.
//!
//! Lock files are advisory and can be deleted when orphaned; see
//! `LockManager::cleanup_stale`.

mod manager;
mod native;
mod pid_file;

use std::io;
use std::path::{Path, PathBuf};

pub use manager::{LockGuard, LockManager};
pub use native::NativeLock;
pub use pid_file::PidFileLock;

/// A held lock. Releasing happens on drop.
pub trait HeldLock: Send {
    /// Path of the lock file backing this lock.
    fn path(&self) -> &Path;
}

/// One locking backend.
pub trait FileLock: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Try once to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when another holder has it.
    fn try_acquire(&self, path: &Path) -> io::Result<Option<Box<dyn HeldLock>>>;

    /// Remove the lock file at `path` if it is orphaned and older than the
    /// threshold. Returns whether it was removed.
    fn remove_if_stale(&self, path: &Path, older_than: std::time::Duration) -> io::Result<bool>;
}

/// Lock file path for a document name, e.g. `prd.json` → `<dir>/prd.json.lock`.
pub fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.lock"))
}

pub(crate) fn file_age(path: &Path) -> io::Result<std::time::Duration> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified.elapsed().unwrap_or_default())
}
