use crate::error::CacheError;
use fs2::FileExt as _;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Exclusive ownership of a persistent store directory.
///
/// Cross-process exclusion comes from an `fs2` advisory lock on the lock
/// file. `fs2` locks are process-scoped on Unix, so a registry of held paths
/// rejects a second open from the same process instead of silently sharing
/// the lock. Both are released when the value is dropped.
#[derive(Debug)]
pub(crate) struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Lock `path`, creating the lock file if needed.
    ///
    /// Blocks while another process holds the lock.
    pub(crate) fn acquire(path: &Path, store: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let path = std::fs::canonicalize(path)?;

        if !held_paths().insert(path.clone()) {
            return Err(CacheError::StoreLocked {
                path: store.to_path_buf(),
            });
        }
        if let Err(err) = file.lock_exclusive() {
            held_paths().remove(&path);
            return Err(err.into());
        }

        tracing::debug!(target = "nova.rule_cache", path = %path.display(), "acquired store lock");
        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::debug!(
                target = "nova.rule_cache",
                path = %self.path.display(),
                error = %err,
                "failed to release store lock"
            );
        }
        held_paths().remove(&self.path);
    }
}

struct HeldPaths(std::sync::MutexGuard<'static, HashSet<PathBuf>>);

impl HeldPaths {
    fn insert(mut self, path: PathBuf) -> bool {
        self.0.insert(path)
    }

    fn remove(mut self, path: &Path) {
        self.0.remove(path);
    }
}

fn held_paths() -> HeldPaths {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    let held = HELD.get_or_init(|| Mutex::new(HashSet::new()));
    HeldPaths(held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_in_process_fails_until_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("store.lock");

        let first = StoreLock::acquire(&lock_path, tmp.path()).unwrap();
        let err = StoreLock::acquire(&lock_path, tmp.path()).unwrap_err();
        assert!(matches!(err, CacheError::StoreLocked { .. }), "{err:?}");

        drop(first);
        StoreLock::acquire(&lock_path, tmp.path()).unwrap();
    }
}
