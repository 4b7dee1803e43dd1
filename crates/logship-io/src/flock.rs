//! Advisory locks on backlog entries
//!
//! Every backlog entry `<id>.batch` has a `<id>.batch.lock` sidecar. The
//! sidecar is opened write-exclusive and flocked non-blocking; the lock is
//! held for the duration of read-and-dispatch or delete. Releasing
//! unlocks, closes the descriptor, and unlinks the sidecar.
//!
//! Within one process a mutex-guarded map keyed by the entry path makes a
//! second acquire a no-op instead of a self-deadlock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Suffix of the lock sidecar next to each backlog entry
pub const LOCK_SUFFIX: &str = ".lock";

/// Result of an acquire attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The flock was taken just now
    Acquired,
    /// This process already holds the lock; nothing was done
    AlreadyHeld,
}

/// Process-level registry of held backlog locks
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashMap<PathBuf, File>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sidecar(target: &Path) -> PathBuf {
        let mut os = target.as_os_str().to_owned();
        os.push(LOCK_SUFFIX);
        PathBuf::from(os)
    }

    /// Take the exclusive advisory lock for `target`.
    ///
    /// Errors with `WouldBlock` when another process holds it.
    pub fn acquire(&self, target: &Path) -> io::Result<Acquire> {
        let mut held = self.held.lock().expect("lock registry poisoned");
        if held.contains_key(target) {
            return Ok(Acquire::AlreadyHeld);
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::sidecar(target))?;
        fs2::FileExt::try_lock_exclusive(&file)?;
        held.insert(target.to_path_buf(), file);
        Ok(Acquire::Acquired)
    }

    /// Release the lock for `target`; a no-op when it isn't held here.
    pub fn release(&self, target: &Path) -> io::Result<()> {
        let mut held = self.held.lock().expect("lock registry poisoned");
        if let Some(file) = held.remove(target) {
            fs2::FileExt::unlock(&file)?;
            drop(file);
            match std::fs::remove_file(Self::sidecar(target)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn is_held(&self, target: &Path) -> bool {
        self.held
            .lock()
            .expect("lock registry poisoned")
            .contains_key(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_reentrant_within_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deadbeef.batch");
        let locks = LockRegistry::new();

        assert_eq!(locks.acquire(&target).unwrap(), Acquire::Acquired);
        assert_eq!(locks.acquire(&target).unwrap(), Acquire::AlreadyHeld);
        assert!(locks.is_held(&target));

        locks.release(&target).unwrap();
        assert!(!locks.is_held(&target));
    }

    #[test]
    fn second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cafe.batch");
        // Two registries stand in for two processes; flock(2) is per open
        // file description, so separate descriptors contend for real.
        let ours = LockRegistry::new();
        let theirs = LockRegistry::new();

        ours.acquire(&target).unwrap();
        let refused = theirs.acquire(&target).unwrap_err();
        assert_eq!(refused.kind(), io::ErrorKind::WouldBlock);

        ours.release(&target).unwrap();
        assert_eq!(theirs.acquire(&target).unwrap(), Acquire::Acquired);
        theirs.release(&target).unwrap();
    }

    #[test]
    fn release_unlinks_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f00d.batch");
        let locks = LockRegistry::new();

        locks.acquire(&target).unwrap();
        let sidecar = dir.path().join("f00d.batch.lock");
        assert!(sidecar.exists());
        locks.release(&target).unwrap();
        assert!(!sidecar.exists());
    }

    #[test]
    fn release_without_acquire_is_a_noop() {
        let locks = LockRegistry::new();
        locks.release(Path::new("/nonexistent/x.batch")).unwrap();
    }
}
