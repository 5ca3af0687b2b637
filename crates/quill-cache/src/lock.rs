use crate::error::{CacheError, Result};
use fs2::FileExt as _;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// An exclusive lock guarding one persistent map for its whole open lifetime.
///
/// `fs2` file locks coordinate across processes but are process-scoped on
/// Unix platforms (they do not exclude other threads of the same process),
/// so a process-wide set of locked paths backs the file lock.
///
/// Acquisition never blocks: cache operations are bounded-time, and a busy
/// lock means another holder already owns the map, which is an error rather
/// than something to wait out.
#[derive(Debug)]
pub(crate) struct MapLock {
    file: File,
    path: PathBuf,
    registered: PathBuf,
}

impl MapLock {
    pub(crate) fn try_exclusive(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        // The lockfile exists now, so canonicalization cannot fail on a
        // missing path; fall back to the literal path on other errors.
        let registered = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        if !register_path(&registered) {
            return Err(CacheError::MapLocked {
                path: path.to_path_buf(),
            });
        }

        if let Err(err) = file.try_lock_exclusive() {
            unregister_path(&registered);
            if is_lock_contended(&err) {
                return Err(CacheError::MapLocked {
                    path: path.to_path_buf(),
                });
            }
            return Err(err.into());
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            registered,
        })
    }
}

impl Drop for MapLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::debug!(
                target = "quill.cache",
                path = %self.path.display(),
                error = %err,
                "failed to release map lock"
            );
        }
        unregister_path(&self.registered);
    }
}

fn is_lock_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn locked_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCKED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LOCKED.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_path(path: &Path) -> bool {
    locked_paths()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(path.to_path_buf())
}

fn unregister_path(path: &Path) {
    locked_paths()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(path);
}
