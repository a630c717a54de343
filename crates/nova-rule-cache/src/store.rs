//! Backing stores for encoded cache entries.

use crate::error::CacheError;
use crate::hash::ContentHash;
use crate::lock::StoreLock;
use crate::util::{atomic_write, bincode_deserialize, bincode_serialize, read_file_limited};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Bumped whenever the layout of persisted entries changes.
pub const ENTRY_SCHEMA_VERSION: u32 = 1;

/// Thread-safe key/value storage for encoded entries.
///
/// `put` replaces the whole entry; readers never observe a partial write.
pub trait EntryStore: Send + Sync {
    fn get(&self, key: &ContentHash) -> Result<Option<Arc<[u8]>>, CacheError>;

    fn put(&self, key: &ContentHash, entry: &[u8]) -> Result<(), CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    schema_version: u32,
    key: ContentHash,
    payload: Vec<u8>,
}

/// Directory of `entries/<hex key>.bin` files owned by one process at a time.
///
/// Opening blocks until any other process holding the store closes it. The
/// lock is released by [`PersistentEntryStore::close`] (or on drop); every
/// call made after closing fails with [`CacheError::StoreClosed`].
#[derive(Debug)]
pub struct PersistentEntryStore {
    root: PathBuf,
    entries_dir: PathBuf,
    lock: RwLock<Option<StoreLock>>,
}

impl PersistentEntryStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let entries_dir = root.join("entries");
        std::fs::create_dir_all(&entries_dir)?;
        let lock = StoreLock::acquire(&root.join("store.lock"), &root)?;
        tracing::debug!(
            target = "nova.rule_cache",
            root = %root.display(),
            "opened rule cache store"
        );
        Ok(Self {
            root,
            entries_dir,
            lock: RwLock::new(Some(lock)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        self.lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Release the store lock. Closing twice is an error.
    pub fn close(&self) -> Result<(), CacheError> {
        let mut lock = self
            .lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match lock.take() {
            Some(held) => {
                drop(held);
                tracing::debug!(
                    target = "nova.rule_cache",
                    root = %self.root.display(),
                    "closed rule cache store"
                );
                Ok(())
            }
            None => Err(self.closed()),
        }
    }

    fn entry_path(&self, key: &ContentHash) -> PathBuf {
        self.entries_dir.join(format!("{}.bin", key.to_hex()))
    }

    fn closed(&self) -> CacheError {
        CacheError::StoreClosed {
            path: self.root.clone(),
        }
    }
}

impl EntryStore for PersistentEntryStore {
    fn get(&self, key: &ContentHash) -> Result<Option<Arc<[u8]>>, CacheError> {
        let lock = self
            .lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if lock.is_none() {
            return Err(self.closed());
        }

        let path = self.entry_path(key);
        let Some(bytes) = read_file_limited(&path)? else {
            return Ok(None);
        };
        let persisted: PersistedEntry =
            bincode_deserialize(&bytes).map_err(|err| CacheError::CorruptEntry {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        if persisted.schema_version != ENTRY_SCHEMA_VERSION {
            tracing::warn!(
                target = "nova.rule_cache",
                path = %path.display(),
                found = persisted.schema_version,
                expected = ENTRY_SCHEMA_VERSION,
                "ignoring cache entry written with a different schema version"
            );
            return Ok(None);
        }
        if persisted.key != *key {
            return Err(CacheError::CorruptEntry {
                path,
                reason: format!("entry belongs to key {}", persisted.key),
            });
        }
        Ok(Some(Arc::from(persisted.payload)))
    }

    fn put(&self, key: &ContentHash, entry: &[u8]) -> Result<(), CacheError> {
        let lock = self
            .lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if lock.is_none() {
            return Err(self.closed());
        }

        let persisted = PersistedEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            key: *key,
            payload: entry.to_vec(),
        };
        atomic_write(&self.entry_path(key), &bincode_serialize(&persisted)?)
    }
}

/// Process-local store, for tests and callers that only need memoization
/// within one run.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    entries: Mutex<HashMap<ContentHash, Arc<[u8]>>>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntryStore for InMemoryEntryStore {
    fn get(&self, key: &ContentHash) -> Result<Option<Arc<[u8]>>, CacheError> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &ContentHash, entry: &[u8]) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(*key, Arc::from(entry));
        Ok(())
    }
}
