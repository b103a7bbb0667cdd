use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::{file_age, FileLock, HeldLock};

/// Cooperative lock backend: a marker file holding the owner's PID.
///
/// Nothing stops a process that ignores the marker. Use only where OS
/// advisory locks are unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidFileLock;

struct PidHeld {
    path: PathBuf,
}

impl HeldLock for PidHeld {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidHeld {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove pid lock marker");
        }
    }
}

fn read_owner(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 only checks for existence; EPERM still means the process exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

impl PidFileLock {
    fn create_marker(path: &Path) -> io::Result<Option<Box<dyn HeldLock>>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                file.sync_all()?;
                warn!(
                    path = %path.display(),
                    "acquired pid-file lock; this backend is cooperative and gives no OS-level exclusion"
                );
                Ok(Some(Box::new(PidHeld {
                    path: path.to_path_buf(),
                })))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Whether the marker's owner is gone.
    fn owner_dead(path: &Path) -> bool {
        read_owner(path).is_some_and(|pid| !process_alive(pid))
    }

    /// Take over a dead owner's marker by renaming ours over it.
    ///
    /// The marker never disappears, so plain acquirers keep failing on it,
    /// and reclaimers serialize on the guard and recheck the owner inside it.
    fn reclaim(path: &Path) -> io::Result<Option<Box<dyn HeldLock>>> {
        let Some(_guard) = ReclaimGuard::take(path)? else {
            return Ok(None);
        };
        if !Self::owner_dead(path) {
            return Ok(None);
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut marker = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(marker, "{}", std::process::id())?;
        marker.as_file().sync_all()?;
        marker.persist(path).map_err(|err| err.error)?;
        debug!(path = %path.display(), "reclaimed pid lock from dead process");
        Ok(Some(Box::new(PidHeld {
            path: path.to_path_buf(),
        })))
    }
}

/// Exclusive right to replace or remove one marker, held as
/// `<marker>.reclaim`.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn take(marker: &Path) -> io::Result<Option<Self>> {
        let mut name = marker.as_os_str().to_owned();
        name.push(".reclaim");
        let path = PathBuf::from(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(Self { path }))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // A reclaimer that died mid-way leaves its guard behind.
                if PidFileLock::owner_dead(&path) {
                    let _ = fs::remove_file(&path);
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl FileLock for PidFileLock {
    fn name(&self) -> &'static str {
        "pid_file"
    }

    fn try_acquire(&self, path: &Path) -> io::Result<Option<Box<dyn HeldLock>>> {
        if let Some(held) = Self::create_marker(path)? {
            return Ok(Some(held));
        }
        if Self::owner_dead(path) {
            return Self::reclaim(path);
        }
        Ok(None)
    }

    fn remove_if_stale(&self, path: &Path, older_than: Duration) -> io::Result<bool> {
        let Some(_guard) = ReclaimGuard::take(path)? else {
            return Ok(false);
        };
        let dead = Self::owner_dead(path);
        let unowned = read_owner(path).is_none();
        if dead || (unowned && file_age(path)? >= older_than) {
            fs::remove_file(path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_excludes_until_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stage-state.json.lock");
        let backend = PidFileLock;

        let held = backend.try_acquire(&path).unwrap().unwrap();
        assert_eq!(read_owner(&path), Some(i32::try_from(std::process::id()).unwrap()));
        assert!(backend.try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(!path.exists());
        assert!(backend.try_acquire(&path).unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_owner_is_reclaimed() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("prd.json.lock");
        // PIDs are capped well below i32::MAX on every supported platform.
        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();

        let held = PidFileLock.try_acquire(&path).unwrap();
        assert!(held.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_reclaimed_marker_is_not_reclaimed_again() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("prd.json.lock");
        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();

        let first = PidFileLock.try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert_eq!(read_owner(&path), Some(i32::try_from(std::process::id()).unwrap()));
        // A second reclaimer that saw the dead owner earlier now finds a live one.
        assert!(PidFileLock::reclaim(&path).unwrap().is_none());
        assert!(PidFileLock.try_acquire(&path).unwrap().is_none());
        assert!(!temp.path().join("prd.json.lock.reclaim").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_reclaim_waits_for_guard_holder() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("prd.json.lock");
        let guard = temp.path().join("prd.json.lock.reclaim");
        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();
        fs::write(&guard, format!("{}\n", std::process::id())).unwrap();

        assert!(PidFileLock.try_acquire(&path).unwrap().is_none());
        assert!(!PidFileLock.remove_if_stale(&path, Duration::ZERO).unwrap());
        assert_eq!(read_owner(&path), Some(i32::MAX));

        fs::remove_file(&guard).unwrap();
        assert!(PidFileLock.try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_live_owner_is_not_stale() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("x.lock");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(!PidFileLock.remove_if_stale(&path, Duration::ZERO).unwrap());
        assert!(path.exists());
    }
}
