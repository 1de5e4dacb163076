//! Where the key store lives on disk, and the lock that guards it in memory.
//!
//! [`PsFile`] is the system persistent-storage file: opened once, locked
//! exclusively for the life of the daemon, rewritten in place on every
//! persist. [`StoreHandle`] wraps the in-memory [`KeyStore`] and its backing
//! behind a single mutex; every worker goes through it, none holds a copy.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FlushPolicy;
use crate::record::{Handle, KeyRecord, Layout};
use crate::store::{KeyStore, StoreError};

/// Destination a store is persisted to.
pub trait StoreBacking: Send {
    /// Replaces everything previously persisted with `bytes`.
    fn replace(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("failed to open store file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store file {path} is already in use by another process")]
    Locked { path: PathBuf },
}

/// Exclusively locked store file.
///
/// The advisory lock lives on a sidecar `<file>.lock` so it survives the
/// rename that [`StoreBacking::replace`] performs. It is released when the
/// value is dropped.
pub struct PsFile {
    lock: File,
    path: PathBuf,
}

impl PsFile {
    /// Opens (creating if needed) and locks the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackingError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| BackingError::Open {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(open_err)?;
        }
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(&path, "lock"))
            .map_err(open_err)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(BackingError::Locked { path });
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(open_err)?;
        debug!(path = %path.display(), "locked store file");
        Ok(Self { lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the current contents of the file.
    pub fn load(&mut self) -> Result<KeyStore, StoreError> {
        let file = File::open(&self.path).map_err(StoreError::ReadFailed)?;
        let len = file.metadata().map_err(StoreError::ReadFailed)?.len();
        KeyStore::load(BufReader::new(file), len)
    }

    fn write_staged(&self, staged: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = File::create(staged)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(staged, &self.path)?;
        let dir = self.path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let (true, Some(dir)) = (cfg!(unix), dir) {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}

/// `<path>.<suffix>`, next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

impl StoreBacking for PsFile {
    /// Writes `bytes` to a staging file and renames it over the store, so a
    /// failed or interrupted write leaves the previous contents intact.
    fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        let staged = sibling(&self.path, "tmp");
        let result = self.write_staged(&staged, bytes);
        if result.is_err() {
            let _ = fs::remove_file(&staged);
        }
        result
    }
}

impl Drop for PsFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

/// In-memory backing, shared so the persisted bytes stay observable.
#[derive(Clone, Default)]
pub struct MemoryBacking {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StoreBacking for MemoryBacking {
    fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut stored = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        stored.clear();
        stored.extend_from_slice(bytes);
        Ok(())
    }
}

struct StoreState {
    store: KeyStore,
    backing: Box<dyn StoreBacking>,
    policy: FlushPolicy,
    dirty: bool,
}

/// The daemon's single, lock-guarded key store.
///
/// Readers and writers both take the same exclusive lock, held for one
/// store operation and never across network I/O.
pub struct StoreHandle {
    state: Mutex<StoreState>,
}

impl StoreHandle {
    pub fn new(store: KeyStore, backing: impl StoreBacking + 'static, policy: FlushPolicy) -> Self {
        Self {
            state: Mutex::new(StoreState {
                store,
                backing: Box::new(backing),
                policy,
                dirty: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, handle: &Handle) -> Option<KeyRecord> {
        self.lock().store.lookup(handle).cloned()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.lock().store.handles().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> Layout {
        self.lock().store.layout()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn register(&self, record: KeyRecord) -> Result<(), StoreError> {
        let handle = record.handle;
        self.mutate(|store| store.insert(record))?;
        info!(%handle, "registered key");
        Ok(())
    }

    pub fn unregister(&self, handle: &Handle) -> Result<KeyRecord, StoreError> {
        let removed = self.mutate(|store| store.remove(handle))?;
        info!(%handle, "unregistered key");
        Ok(removed)
    }

    /// Persists pending mutations. A no-op when nothing changed.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.dirty {
            return Ok(());
        }
        let bytes = state.store.to_bytes()?;
        state
            .backing
            .replace(&bytes)
            .map_err(StoreError::WriteFailed)?;
        state.dirty = false;
        debug!(bytes = bytes.len(), "flushed key store");
        Ok(())
    }

    /// Applies `op` to a copy of the store and commits it only once the
    /// result is encodable and, under write-through, persisted.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut KeyStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.lock();
        let mut next = state.store.clone();
        let out = op(&mut next)?;
        let bytes = next.to_bytes()?;

        match state.policy {
            FlushPolicy::WriteThrough => {
                state
                    .backing
                    .replace(&bytes)
                    .map_err(StoreError::WriteFailed)?;
            }
            FlushPolicy::Explicit => state.dirty = true,
        }
        state.store = next;
        Ok(out)
    }
}
