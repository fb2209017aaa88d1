//! Cross-process restore lock
//!
//! `<store>.restore.lock` holds the PID of the process restoring the store.
//! Opening the store or checking out a connection fails while that process is
//! alive. A lock left behind by a dead process is removed the next time anyone
//! looks at it.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// `<store>.restore.lock`
pub(crate) fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".restore.lock");
    PathBuf::from(name)
}

/// Fail with [`Error::StoreInUse`] while a live process holds the restore lock
pub(crate) fn ensure_unlocked(db_path: &Path) -> Result<()> {
    let path = lock_path(db_path);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    match contents.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => Err(Error::StoreInUse(format!(
            "process {} is restoring {} (lock {})",
            pid,
            db_path.display(),
            path.display()
        ))),
        owner => {
            warn!(lock = %path.display(), owner = ?owner.ok(), "Removing stale restore lock");
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// A held restore lock, removed on release or drop
#[derive(Debug)]
pub(crate) struct RestoreLock {
    path: PathBuf,
    held: bool,
}

impl RestoreLock {
    /// Take the lock for `db_path`, clearing a stale one first
    ///
    /// The PID is written to a temp file that is then linked into place, so the
    /// lock never exists without an owner.
    pub(crate) fn acquire(db_path: &Path) -> Result<Self> {
        ensure_unlocked(db_path)?;

        let path = lock_path(db_path);
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staging = tempfile::Builder::new()
            .prefix(".tally-lock-")
            .tempfile_in(parent)?;
        write!(staging, "{}", std::process::id())?;
        staging.as_file().sync_all()?;

        staging.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                Error::StoreInUse(format!("another restore holds {}", path.display()))
            } else {
                Error::Io(e.error)
            }
        })?;
        debug!(lock = %path.display(), "Store locked for restore");

        Ok(Self { path, held: true })
    }

    pub(crate) fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to remove restore lock");
        }
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return false,
    };
    // Signal 0 checks existence only; EPERM means it runs under another user
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_blocks_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");

        let mut lock = RestoreLock::acquire(&db_path).unwrap();
        let pid = fs::read_to_string(lock_path(&db_path)).unwrap();
        assert_eq!(pid, std::process::id().to_string());
        assert!(matches!(ensure_unlocked(&db_path), Err(Error::StoreInUse(_))));
        assert!(matches!(RestoreLock::acquire(&db_path), Err(Error::StoreInUse(_))));

        lock.release();
        assert!(!lock_path(&db_path).exists());
        assert!(ensure_unlocked(&db_path).is_ok());
    }

    #[test]
    fn test_unreadable_owner_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        fs::write(lock_path(&db_path), "not-a-pid").unwrap();

        assert!(ensure_unlocked(&db_path).is_ok());
        assert!(!lock_path(&db_path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_owner_is_cleared() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        fs::write(lock_path(&db_path), pid.to_string()).unwrap();

        let lock = RestoreLock::acquire(&db_path).unwrap();
        let owner = fs::read_to_string(lock_path(&db_path)).unwrap();
        assert_eq!(owner, std::process::id().to_string());
        drop(lock);
        assert!(!lock_path(&db_path).exists());
    }
}
