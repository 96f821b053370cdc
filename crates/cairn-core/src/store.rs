//! On-disk content store rooted at a single directory.
//!
//! Every key is resolved through the configured [`PathTransform`]. Access to
//! a single key is serialised through a per-key async lock so that a local
//! write and a replication write for the same key cannot interleave on the
//! same file. Different keys never contend.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::path::{cas_path_transform, PathKey, PathTransform};

/// Root directory used when none is configured.
pub const DEFAULT_ROOT: &str = "cairn_store";

/// Configuration for a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding every stored file.
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
        }
    }
}

/// Content-addressable byte store.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
    locks: Arc<KeyLocks>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let root = if config.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            config.root
        };

        Self {
            root,
            path_transform: config.path_transform,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `key` lives on disk, relative to the root.
    pub fn path_for(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    /// Copy everything from `reader` into the file for `key`, replacing any
    /// previous content. Returns the number of bytes written.
    ///
    /// Content lands in a partial file next to the target and is renamed
    /// over it only once the copy has finished, so a failed write leaves the
    /// previous content in place.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_inner(key, reader, None).await
    }

    /// Like [`write`](Self::write), but only commits if `reader` yields
    /// exactly `len` bytes. Anything shorter or longer is
    /// [`StoreError::Truncated`] and the previous content is kept.
    pub async fn write_exact<R>(
        &self,
        key: &str,
        reader: &mut R,
        len: u64,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_inner(key, reader, Some(len)).await
    }

    async fn write_inner<R>(
        &self,
        key: &str,
        reader: &mut R,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let _guard = self.locks.acquire(key).await;
        let path_key = self.path_for(key);
        let dir = path_key.dir_path(&self.root);
        let full_path = path_key.full_path(&self.root);
        let partial = dir.join(format!(".{}.partial", path_key.file_name));

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let mut file = File::create(&partial)
            .await
            .map_err(|e| StoreError::io(&partial, e))?;

        let copied = async {
            let n = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(n)
        }
        .await;
        drop(file);

        let result = match copied {
            Ok(n) if expected.is_some_and(|len| len != n) => Err(StoreError::Truncated {
                key: key.to_string(),
                expected: expected.unwrap_or_default(),
                written: n,
            }),
            Ok(n) => fs::rename(&partial, &full_path)
                .await
                .map(|()| n)
                .map_err(|e| StoreError::io(&full_path, e)),
            Err(e) => Err(StoreError::io(&partial, e)),
        };

        match result {
            Ok(n) => {
                debug!(key, path = %full_path.display(), bytes = n, "wrote to disk");
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    /// Read the full content stored under `key`.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let _guard = self.locks.acquire(key).await;
        let full_path = self.path_for(key).full_path(&self.root);

        fs::read(&full_path)
            .await
            .map_err(|e| self.map_missing(key, &full_path, e))
    }

    /// Open `key` for streaming. Returns the file size alongside the handle.
    ///
    /// The per-key lock is only held while the file is opened; the caller
    /// streams from an already-open handle.
    pub async fn open(&self, key: &str) -> Result<(u64, File), StoreError> {
        let _guard = self.locks.acquire(key).await;
        let full_path = self.path_for(key).full_path(&self.root);

        let file = File::open(&full_path)
            .await
            .map_err(|e| self.map_missing(key, &full_path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(&full_path, e))?
            .len();
        Ok((size, file))
    }

    /// Whether a file exists for `key`. Only consults filesystem metadata.
    pub async fn has(&self, key: &str) -> bool {
        let full_path = self.path_for(key).full_path(&self.root);
        fs::metadata(&full_path).await.is_ok()
    }

    /// Remove `key` and any shard directories left empty by the removal.
    /// Removing an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(key).await;
        let path_key = self.path_for(key);
        let full_path = path_key.full_path(&self.root);

        match fs::remove_file(&full_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key, "delete of absent key");
                return Ok(());
            }
            Err(e) => return Err(StoreError::io(&full_path, e)),
        }

        // Walk back up towards the root, stopping at the first directory
        // that still has other content.
        let mut dir = path_key.dir_path(&self.root);
        while dir != self.root && dir.starts_with(&self.root) {
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            if !dir.pop() {
                break;
            }
        }

        info!(key, file = %path_key.file_name, "deleted from disk");
        Ok(())
    }

    /// Remove the whole store root.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                info!(root = %self.root.display(), "store cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.root, e)),
        }
    }

    fn map_missing(&self, key: &str, path: &Path, err: std::io::Error) -> StoreError {
        if err.kind() == ErrorKind::NotFound {
            StoreError::NotFound {
                key: key.to_string(),
            }
        } else {
            StoreError::io(path, err)
        }
    }
}

// ── Per-key locking ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct KeyLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(self: &Arc<Self>, key: &str) -> KeyGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            locks: Arc::clone(self),
            _guard: guard,
        }
    }
}

/// Holds a key's lock; drops the table entry once nobody else wants it.
struct KeyGuard {
    key: String,
    locks: Arc<KeyLocks>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut table = self
            .locks
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one held by our guard.
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            table.remove(&self.key);
        }
    }
}
