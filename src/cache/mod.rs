//! Write-once JSON cache on the local filesystem.
//!
//! Each key maps to one file under the cache root. Entries are never
//! updated: a key may only be used for values that cannot change, such
//! as the logs of a finished workflow run.

use crate::error::CacheError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::debug;

/// Whether a value was served from disk or computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// A value returned by the cache together with where it came from.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
}

/// Build the cache key of a run's log bundle.
pub fn cache_key(repo: &str, run_id: u64) -> String {
    format!("{}-{}", repo, run_id)
}

/// Replace path separators so a key is a single file name.
pub fn sanitize_key(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

/// Directory-backed key/value store.
pub struct CacheStore {
    root: PathBuf,
    /// Keys currently being computed in this process.
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheStore {
    /// Open a cache rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| CacheError::Io {
            key: root.display().to_string(),
            source,
        })?;

        Ok(Self {
            root,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the file that stores `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }

    /// Return the stored value for `key`, or compute, store and return it.
    #[allow(dead_code)] // Convenience wrapper; the pipeline needs the status
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_compute_with_status(key, compute)
            .await
            .map(|cached| cached.value)
    }

    /// Like [`CacheStore::get_or_compute`], also reporting hit or miss.
    ///
    /// `compute` runs at most once per key in this process: concurrent
    /// callers for the same key wait for the first one and then read its
    /// entry. A failed computation writes nothing.
    pub async fn get_or_compute_with_status<T, E, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = sanitize_key(key);
        let key_lock = self.lock_for(&name);
        let result = {
            let _guard = key_lock.lock().await;
            self.lookup_or_compute(&name, compute).await
        };
        self.release(&name, key_lock);
        result
    }

    async fn lookup_or_compute<T, E, F, Fut>(&self, name: &str, compute: F) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.read_entry(name).await? {
            debug!("Cache hit: {}", name);
            return Ok(Cached {
                value,
                status: CacheStatus::Hit,
            });
        }

        debug!("Cache miss: {}", name);
        let value = compute().await?;
        self.write_entry(name, &value).await?;

        Ok(Cached {
            value,
            status: CacheStatus::Miss,
        })
    }

    /// Whether an entry exists for `key`.
    #[allow(dead_code)] // Utility for inspecting a cache directory
    pub fn contains(&self, key: &str) -> bool {
        self.entry_path(key).is_file()
    }

    /// Delete the entry for `key`. Returns whether one existed.
    ///
    /// The aggregation pipeline never evicts; this exists for manual
    /// maintenance of a cache directory.
    #[allow(dead_code)] // Explicit maintenance operation, not used by the pipeline
    pub fn evict(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn read_entry<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CacheError> {
        let path = self.root.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    key: name.to_string(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Serde {
                key: name.to_string(),
                source,
            })
    }

    /// Write through a temporary file and link it into place, so readers
    /// never see a partial entry. An entry that appeared meanwhile is kept.
    async fn write_entry<T: Serialize>(&self, name: &str, value: &T) -> Result<(), CacheError> {
        let content = serde_json::to_vec_pretty(value).map_err(|source| CacheError::Serde {
            key: name.to_string(),
            source,
        })?;
        let size = content.len();

        let root = self.root.clone();
        let key = name.to_string();
        tokio::task::spawn_blocking(move || persist_entry(&root, &key, &content))
            .await
            .map_err(|e| CacheError::Io {
                key: name.to_string(),
                source: std::io::Error::other(e),
            })??;

        debug!("Cache stored: {} ({} bytes)", name, size);
        Ok(())
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.entry(name.to_string()).or_default().clone()
    }

    fn release(&self, name: &str, key_lock: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // One reference is ours, one is the map's.
        if Arc::strong_count(&key_lock) <= 2 {
            in_flight.remove(name);
        }
    }
}

fn persist_entry(root: &Path, name: &str, content: &[u8]) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        key: name.to_string(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(root).map_err(io_err)?;
    tmp.write_all(content).map_err(io_err)?;
    match tmp.persist_noclobber(root.join(name)) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!("Cache entry {} was written concurrently, keeping it", name);
            Ok(())
        }
        Err(e) => Err(io_err(e.error)),
    }
}
