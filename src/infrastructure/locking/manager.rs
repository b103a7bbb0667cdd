use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;
use tracing::{debug, info, warn};

use super::{lock_path, FileLock, HeldLock, NativeLock, PidFileLock};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::{LockBackend, LockConfig};

/// Holds one named lock until dropped.
pub struct LockGuard {
    name: String,
    held: Box<dyn HeldLock>,
    acquired_at: Instant,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.held.path()
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("path", &self.held.path())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(
            lock = %self.name,
            held_ms = u64::try_from(self.acquired_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "lock released"
        );
    }
}

enum Attempt {
    Contended,
    Failed(io::Error),
}

/// Acquires named locks in a locks directory with bounded exponential backoff.
#[derive(Clone)]
pub struct LockManager {
    dir: PathBuf,
    backend: Arc<dyn FileLock>,
    timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("dir", &self.dir)
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, config: &LockConfig) -> Self {
        let backend: Arc<dyn FileLock> = match config.backend {
            LockBackend::Native => Arc::new(NativeLock),
            LockBackend::PidFile => {
                warn!("pid-file lock backend selected; locks are cooperative only");
                Arc::new(PidFileLock)
            }
        };
        Self::with_backend(dir, backend, config)
    }

    pub fn with_backend(
        dir: impl Into<PathBuf>,
        backend: Arc<dyn FileLock>,
        config: &LockConfig,
    ) -> Self {
        Self {
            dir: dir.into(),
            backend,
            timeout: config.timeout(),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(
                config.max_backoff_ms.max(config.initial_backoff_ms).max(1),
            ),
        }
    }

    /// Override the acquisition timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Acquire the lock named `name`, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// `LockTimeout` when the lock stayed contended for the whole timeout,
    /// `LockFailed` when the lock file could not be used at all.
    pub fn acquire(&self, name: &str) -> DomainResult<LockGuard> {
        std::fs::create_dir_all(&self.dir).map_err(|err| DomainError::LockFailed {
            name: name.to_string(),
            reason: format!("cannot create {}: {err}", self.dir.display()),
        })?;

        let path = lock_path(&self.dir, name);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(Some(self.timeout))
            .build();

        let started = Instant::now();
        let mut attempts = 0u32;
        let result = backoff::retry(policy, || {
            attempts += 1;
            match self.backend.try_acquire(&path) {
                Ok(Some(held)) => Ok(held),
                Ok(None) => Err(backoff::Error::transient(Attempt::Contended)),
                Err(err) => Err(backoff::Error::permanent(Attempt::Failed(err))),
            }
        });

        match result {
            Ok(held) => {
                debug!(lock = %name, attempts, backend = self.backend.name(), "lock acquired");
                Ok(LockGuard {
                    name: name.to_string(),
                    held,
                    acquired_at: Instant::now(),
                })
            }
            Err(backoff::Error::Permanent(Attempt::Failed(err))) => Err(DomainError::LockFailed {
                name: name.to_string(),
                reason: err.to_string(),
            }),
            Err(_) => {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(lock = %name, waited_ms, attempts, "timed out waiting for lock");
                Err(DomainError::LockTimeout {
                    name: name.to_string(),
                    waited_ms,
                })
            }
        }
    }

    /// Delete orphaned lock files older than `max_age`. Returns removed paths.
    pub fn cleanup_stale(&self, max_age: Duration) -> DomainResult<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("lock") {
                continue;
            }
            match self.backend.remove_if_stale(&path, max_age) {
                Ok(true) => removed.push(path),
                Ok(false) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not inspect lock file");
                }
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), dir = %self.dir.display(), "removed stale lock files");
        }
        removed.sort();
        Ok(removed)
    }
}
