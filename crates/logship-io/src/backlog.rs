//! Disk-backed batch backlog
//!
//! One flat directory of `<sha1>.batch` files; the directory listing is
//! authoritative. Entries are written by spill, removed after successful
//! dispatch or by disk-pressure reclamation, and coordinated across
//! processes with per-entry advisory locks.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::flock::{Acquire, LockRegistry};

/// Batch ids submitted per replay pass
pub const REPLAY_PER_PASS: usize = 25;

/// Spills between disk-pressure checks
const RECLAIM_EVERY: u64 = 10;

/// Counters from one reclamation walk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed: u64,
    pub failed: u64,
}

/// What a spill did
#[derive(Debug)]
pub struct SpillOutcome {
    /// False when the entry already existed on disk
    pub wrote: bool,
    /// Set on every RECLAIM_EVERY-th spill
    pub cleanup: Option<CleanupStats>,
}

pub struct Backlog {
    dir: PathBuf,
    disk_space: Option<u64>,
    spills: u64,
    pub locks: LockRegistry,
}

impl Backlog {
    pub fn new(dir: PathBuf, disk_space: Option<u64>) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            disk_space,
            spills: 0,
            locks: LockRegistry::new(),
        })
    }

    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.batch"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry_path(id).exists()
    }

    /// Persist a batch unless it is already on disk.
    pub fn spill(&mut self, id: &str, bytes: &[u8]) -> io::Result<SpillOutcome> {
        let path = self.entry_path(id);
        let wrote = if path.exists() {
            false
        } else {
            std::fs::write(&path, bytes)?;
            true
        };
        self.spills += 1;
        let cleanup = (self.spills % RECLAIM_EVERY == 0).then(|| self.reclaim());
        Ok(SpillOutcome { wrote, cleanup })
    }

    pub fn read(&self, id: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.entry_path(id))
    }

    pub fn remove(&self, id: &str) -> io::Result<()> {
        std::fs::remove_file(self.entry_path(id))
    }

    /// Batch ids currently on disk, in directory order.
    pub fn list(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list backlog");
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()? != "batch" {
                    return None;
                }
                Some(path.file_stem()?.to_string_lossy().into_owned())
            })
            .collect()
    }

    /// Delete oldest entries until the directory fits under the ceiling.
    ///
    /// The newest entry is never deleted: reclaiming must not empty the
    /// spill. A delete race counts as a failure but is not an error.
    pub fn reclaim(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let Some(ceiling) = self.disk_space else {
            return stats;
        };

        let mut entries = self.walk();
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= ceiling {
            return stats;
        }
        entries.sort_by_key(|e| e.ctime);

        let last = entries.len().saturating_sub(1);
        for (i, entry) in entries.iter().enumerate() {
            if total <= ceiling || i == last {
                break;
            }
            match self.locks.acquire(&entry.path) {
                Ok(Acquire::Acquired) => {}
                // held by an in-flight dispatch of ours, or by a peer
                Ok(Acquire::AlreadyHeld) | Err(_) => continue,
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    stats.removed += 1;
                    total = total.saturating_sub(entry.size);
                    debug!(entry = %entry.path.display(), size = entry.size, "reclaimed backlog entry");
                }
                Err(e) => {
                    stats.failed += 1;
                    debug!(entry = %entry.path.display(), error = %e, "reclaim lost the delete race");
                }
            }
            if let Err(e) = self.locks.release(&entry.path) {
                warn!(entry = %entry.path.display(), error = %e, "failed to release reclaim lock");
            }
        }
        stats
    }

    fn walk(&self) -> Vec<WalkEntry> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()? != "batch" {
                    return None;
                }
                let meta = path.metadata().ok()?;
                Some(WalkEntry {
                    ctime: ctime_of(&meta, &path),
                    size: meta.len(),
                    path,
                })
            })
            .collect()
    }
}

struct WalkEntry {
    path: PathBuf,
    size: u64,
    ctime: (i64, i64),
}

#[cfg(unix)]
fn ctime_of(meta: &std::fs::Metadata, _path: &Path) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt;
    (meta.ctime(), meta.ctime_nsec())
}

#[cfg(not(unix))]
fn ctime_of(meta: &std::fs::Metadata, _path: &Path) -> (i64, i64) {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .unwrap_or_default();
    (modified.as_secs() as i64, modified.subsec_nanos() as i64)
}
