//! Merkle aggregation over the record store.
//!
//! One verifiable hash per shard, per collection, and for the whole database.
//! The database hash changes iff any collection hash changes iff any shard
//! hash changes iff any record's serialized bytes change. Propagation is an
//! explicit step taken on save, not automatic observation.

use crate::error::StorageError;
use crate::storage::Storage;
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Blob holding the aggregated database hash, under the metadata root.
pub const DATABASE_HASH_FILE: &str = "db.dat";

/// Digest of one shard's serialized bytes.
pub fn shard_hash(shard_bytes: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"shard");
    hasher.update(shard_bytes);
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Digest over a collection's shard hashes, in shard-id order.
pub fn collection_hash(name: &str, shard_hashes: &BTreeMap<u32, Hash>) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"collection");
    hasher.update(&(name.len() as u64).to_be_bytes());
    hasher.update(name.as_bytes());
    for (shard_id, hash) in shard_hashes {
        hasher.update(&shard_id.to_be_bytes());
        hasher.update(hash.as_bytes());
    }
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Digest over all collection hashes, in name order.
pub fn database_hash(collection_hashes: &BTreeMap<String, Hash>) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"database");
    for (name, hash) in collection_hashes {
        hasher.update(&(name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update(hash.as_bytes());
    }
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Persisted database-level hash record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseHashes {
    pub collections: BTreeMap<String, Hash>,
    pub hash: Hash,
}

impl DatabaseHashes {
    /// Recompute the aggregate from the per-collection hashes.
    pub fn recompute(&mut self) {
        self.hash = database_hash(&self.collections);
    }

    pub async fn load(storage: &dyn Storage) -> Result<DatabaseHashes, StorageError> {
        if !storage.file_exists(DATABASE_HASH_FILE).await? {
            return Ok(DatabaseHashes::default());
        }
        let bytes = storage.read(DATABASE_HASH_FILE).await?;
        bincode::deserialize(&bytes).map_err(StorageError::serialization)
    }

    pub async fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let bytes = bincode::serialize(self).map_err(StorageError::serialization)?;
        storage.write(DATABASE_HASH_FILE, None, bytes).await
    }
}
