//! Hash Cache
//!
//! Persisted mapping from file path to {digest, size, last-modified}. An entry
//! is trusted without rehashing iff the live file's size and last-modified
//! exactly match the cached values; any mismatch forces a rehash. This is the
//! dominant cost optimization for re-running verify/add over unchanged trees.
//!
//! Each database holds two independent instances: one scoped to the local
//! filesystem (repeated local scans) and one scoped to the metadata store
//! (verify against the canonical record).

use crate::error::StorageError;
use crate::hash::hash_stream;
use crate::storage::{FileInfo, Storage};
use crate::types::{Hash, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

const CACHE_FORMAT_VERSION: u32 = 1;

/// Default persisted blob name.
pub const HASH_CACHE_FILE: &str = "hash-cache-x.dat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub hash: Hash,
    pub size: u64,
    pub last_modified: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct CacheBlob {
    version: u32,
    entries: HashMap<String, HashCacheEntry>,
}

/// Pluggable content validator run before a fresh hash is accepted into the
/// cache. Media-format validation (the excluded collaborator) plugs in here.
pub trait FileValidator: Send + Sync {
    fn validate(&self, path: &str, data: &[u8]) -> bool;
}

pub struct HashCache {
    storage: Arc<dyn Storage>,
    file_path: String,
    entries: HashMap<String, HashCacheEntry>,
    dirty: bool,
}

impl HashCache {
    pub fn new(storage: Arc<dyn Storage>, file_path: &str) -> Self {
        Self {
            storage,
            file_path: file_path.to_string(),
            entries: HashMap::new(),
            dirty: false,
        }
    }

    /// Load the persisted blob. Returns `false` when no cache file exists,
    /// which is not an error (first run).
    pub async fn load(&mut self) -> Result<bool, StorageError> {
        if !self.storage.file_exists(&self.file_path).await? {
            return Ok(false);
        }

        let bytes = self.storage.read(&self.file_path).await?;
        let blob: CacheBlob =
            bincode::deserialize(&bytes).map_err(StorageError::serialization)?;
        if blob.version != CACHE_FORMAT_VERSION {
            // Stale format: discard rather than guess. Entries regenerate on
            // the next scan.
            debug!(version = blob.version, "discarding hash cache with unknown format");
            self.entries.clear();
            return Ok(false);
        }

        debug!(entries = blob.entries.len(), path = %self.file_path, "loaded hash cache");
        self.entries = blob.entries;
        self.dirty = false;
        Ok(true)
    }

    /// Atomically overwrite the persisted blob.
    pub async fn save(&mut self) -> Result<(), StorageError> {
        let blob = CacheBlob {
            version: CACHE_FORMAT_VERSION,
            entries: self.entries.clone(),
        };
        let bytes = bincode::serialize(&blob).map_err(StorageError::serialization)?;
        self.storage.write(&self.file_path, None, bytes).await?;
        self.dirty = false;
        Ok(())
    }

    /// Save only if entries changed since the last save/load.
    pub async fn save_if_dirty(&mut self) -> Result<(), StorageError> {
        if self.dirty {
            self.save().await?;
        }
        Ok(())
    }

    pub fn get_hash(&self, path: &str) -> Option<&HashCacheEntry> {
        self.entries.get(path)
    }

    pub fn add_hash(&mut self, path: &str, entry: HashCacheEntry) {
        self.entries.insert(path.to_string(), entry);
        self.dirty = true;
    }

    pub fn remove_hash(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = (&String, &HashCacheEntry)> {
        self.entries.iter()
    }

    /// Hash a storage file through the cache. If the cached entry's size and
    /// last-modified exactly match `info`, the cached digest is returned
    /// without reading file bytes. Otherwise the file is streamed (optionally
    /// validated), the cache upserted, and the fresh digest returned.
    pub async fn hash_with_cache(
        &mut self,
        storage: &dyn Storage,
        path: &str,
        info: &FileInfo,
        validator: Option<&dyn FileValidator>,
    ) -> Result<Hash, StorageError> {
        if let Some(entry) = self.entries.get(path) {
            if entry.size == info.length && entry.last_modified == info.last_modified {
                trace!(path, "hash cache hit");
                return Ok(entry.hash);
            }
        }

        let hash = match validator {
            Some(validator) => {
                // Validation needs the bytes anyway; hash the same buffer.
                let data = storage.read(path).await?;
                if !validator.validate(path, &data) {
                    return Err(StorageError::InvalidPath(format!(
                        "file failed validation: {}",
                        path
                    )));
                }
                crate::hash::hash_bytes(&data)
            }
            None => {
                let mut stream = storage.read_stream(path).await?;
                hash_stream(&mut stream).await?
            }
        };

        self.add_hash(
            path,
            HashCacheEntry {
                hash,
                size: info.length,
                last_modified: info.last_modified,
            },
        );
        Ok(hash)
    }
}
