use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::debug;

use super::{file_age, FileLock, HeldLock};

/// OS advisory lock backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLock;

struct NativeHeld {
    file: File,
    path: PathBuf,
}

impl HeldLock for NativeHeld {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NativeHeld {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well; unlocking first keeps
        // the release prompt even if the handle is kept alive elsewhere.
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl FileLock for NativeLock {
    fn name(&self) -> &'static str {
        "native"
    }

    fn try_acquire(&self, path: &Path) -> io::Result<Option<Box<dyn HeldLock>>> {
        #[allow(clippy::suspicious_open_options)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        lock_opened(file, path)
    }

    fn remove_if_stale(&self, path: &Path, older_than: Duration) -> io::Result<bool> {
        if file_age(path)? < older_than {
            return Ok(false);
        }
        // Only an unheld lock file may go.
        let Some(held) = self.try_acquire(path)? else {
            return Ok(false);
        };
        std::fs::remove_file(path)?;
        drop(held);
        Ok(true)
    }
}

/// Lock an already opened lock file.
///
/// A handle opened before a stale cleanup unlinked the path locks an orphaned
/// inode, so the lock only counts while the path still names the same file.
fn lock_opened(file: File, path: &Path) -> io::Result<Option<Box<dyn HeldLock>>> {
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if is_contended(&err) => return Ok(None),
        Err(err) => return Err(err),
    }
    if !still_linked(&file, path)? {
        debug!(path = %path.display(), "lock file was replaced while opening; retrying");
        return Ok(None);
    }

    // Owner marker for humans inspecting the locks directory.
    file.set_len(0)?;
    let mut writer = &file;
    let _ = writeln!(writer, "{}", std::process::id());

    Ok(Some(Box::new(NativeHeld {
        file,
        path: path.to_path_buf(),
    })))
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

// Windows refuses to delete a file another handle has open.
#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_contended_until_release() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("prd.json.lock");
        let backend = NativeLock;

        let first = backend.try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(backend.try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(backend.try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_stale_removal_skips_fresh_files() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("x.lock");
        std::fs::write(&path, "1").unwrap();

        let backend = NativeLock;
        assert!(!backend.remove_if_stale(&path, Duration::from_secs(3600)).unwrap());
        assert!(backend.remove_if_stale(&path, Duration::ZERO).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_handle_to_removed_lock_file_does_not_hold() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("prd.json.lock");
        std::fs::write(&path, "1").unwrap();
        let backend = NativeLock;

        // Opened before cleanup removes the file, locked after.
        let early = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(backend.remove_if_stale(&path, Duration::ZERO).unwrap());
        assert!(lock_opened(early, &path).unwrap().is_none());

        let fresh = backend.try_acquire(&path).unwrap();
        assert!(fresh.is_some());
        assert!(backend.try_acquire(&path).unwrap().is_none());
    }
}
