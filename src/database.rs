//! Database Composition
//!
//! `MediaFileDatabase` ties the engines together over one storage root:
//! asset bytes under `original/`, everything the database knows about itself
//! under `metadata/` (tree blob, record collections, block graph, hash cache,
//! aggregated hashes). The `metadata/` subtree is deliberately outside the
//! asset Merkle tree; its integrity is covered by the record-store hashes.
//!
//! All mutation drains through one owning instance; the pipelines in `add`,
//! `verify`, and `replicate` are `impl` extensions of this type.

use crate::blocks::{BlockGraph, DatabaseUpdate};
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, StorageError};
use crate::hash_cache::{HashCache, HASH_CACHE_FILE};
use crate::records::merkle::DatabaseHashes;
use crate::records::{document_id, RecordCollection};
use crate::storage::prefix::PrefixStorage;
use crate::storage::{Storage, StorageLocation};
use crate::tree::persistence::TREE_FORMAT_VERSION;
use crate::tree::AssetTree;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Asset subtree: one file per unique content digest.
pub const ORIGINAL_DIR: &str = "original";

/// Database-internal subtree, excluded from the asset tree.
pub const METADATA_DIR: &str = "metadata";

/// Marker written when asset content is stored through an encrypting
/// decorator. Replication refuses to mix marked and unmarked databases.
pub const ENCRYPTION_MARKER: &str = "encryption.pub";

/// The collection holding one document per stored asset.
pub const METADATA_COLLECTION: &str = "metadata";

/// Human-facing database totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSummary {
    /// Files currently tracked by the asset tree.
    pub total_files: u64,
    /// Sum of tracked file sizes in bytes.
    pub total_size: u64,
    /// Lifetime import counter; deletions never decrement it.
    pub total_imports: u64,
    pub database_version: u32,
    pub full_hash: String,
    pub short_hash: String,
}

pub struct MediaFileDatabase {
    location: StorageLocation,
    pub(crate) root: Arc<dyn Storage>,
    pub(crate) metadata: Arc<dyn Storage>,
    pub(crate) tree: AssetTree,
    pub(crate) collections: HashMap<String, RecordCollection>,
    pub(crate) hashes: DatabaseHashes,
    pub(crate) blocks: BlockGraph,
    pub(crate) cache: HashCache,
    pub(crate) config: DatabaseConfig,
}

impl MediaFileDatabase {
    /// Initialize a new database. The location must be completely empty.
    #[instrument(skip(config))]
    pub async fn create(
        location: StorageLocation,
        config: DatabaseConfig,
    ) -> Result<MediaFileDatabase, DatabaseError> {
        config.validate()?;
        let root = location.open();
        if !root.is_empty("").await? {
            return Err(DatabaseError::LocationNotEmpty(format!("{:?}", location)));
        }

        let metadata: Arc<dyn Storage> =
            Arc::new(PrefixStorage::new(root.clone(), METADATA_DIR)?);
        let tree = AssetTree::new();
        tree.save(metadata.as_ref()).await?;

        let hashes = DatabaseHashes::default();
        hashes.save(metadata.as_ref()).await?;

        let blocks = BlockGraph::load(metadata.clone()).await?;
        let cache = HashCache::new(metadata.clone(), HASH_CACHE_FILE);

        info!("created database");
        Ok(MediaFileDatabase {
            location,
            root,
            metadata,
            tree,
            collections: HashMap::new(),
            hashes,
            blocks,
            cache,
            config,
        })
    }

    /// Open an existing database. A location without a tree blob is not a
    /// database and fails structurally.
    #[instrument(skip(config))]
    pub async fn load(
        location: StorageLocation,
        config: DatabaseConfig,
    ) -> Result<MediaFileDatabase, DatabaseError> {
        config.validate()?;
        let root = location.open();
        let metadata: Arc<dyn Storage> =
            Arc::new(PrefixStorage::new(root.clone(), METADATA_DIR)?);

        let tree = AssetTree::load(metadata.as_ref()).await?;
        let hashes = DatabaseHashes::load(metadata.as_ref()).await?;
        let blocks = BlockGraph::load(metadata.clone()).await?;
        let mut cache = HashCache::new(metadata.clone(), HASH_CACHE_FILE);
        cache.load().await?;

        info!(files = tree.len(), root = %tree.root_hash(), "loaded database");
        Ok(MediaFileDatabase {
            location,
            root,
            metadata,
            tree,
            collections: HashMap::new(),
            hashes,
            blocks,
            cache,
            config,
        })
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    pub fn tree(&self) -> &AssetTree {
        &self.tree
    }

    /// Root hash of the asset tree; the database's identity for comparisons.
    pub fn root_hash(&self) -> crate::types::Hash {
        self.tree.root_hash()
    }

    /// Aggregated record-store hash.
    pub fn records_hash(&self) -> crate::types::Hash {
        self.hashes.hash
    }

    /// A collection handle, opened on first use.
    pub async fn collection(
        &mut self,
        name: &str,
    ) -> Result<&mut RecordCollection, DatabaseError> {
        if !self.collections.contains_key(name) {
            let collection = RecordCollection::open(
                self.metadata.clone(),
                name,
                self.config.shard_count,
                self.config.sort_page_capacity,
            )
            .await?;
            self.collections.insert(name.to_string(), collection);
        }
        Ok(self
            .collections
            .get_mut(name)
            .expect("collection just opened"))
    }

    /// Apply one record-store update; replay path for block reconciliation.
    pub(crate) async fn apply_update(
        &mut self,
        update: &DatabaseUpdate,
    ) -> Result<(), DatabaseError> {
        match update {
            DatabaseUpdate::Upsert {
                collection,
                document,
                ..
            } => {
                self.collection(collection)
                    .await?
                    .upsert_one(document.clone())
                    .await?;
            }
            DatabaseUpdate::FieldUpdate {
                collection,
                record_id,
                field,
                value,
                ..
            } => {
                let coll = self.collection(collection).await?;
                // Updating an absent record is a no-op; the upsert that
                // created it replays separately.
                if let Some(mut doc) = coll.get_one(record_id).await? {
                    doc.insert(field.clone(), value.clone());
                    coll.upsert_one(doc).await?;
                }
            }
            DatabaseUpdate::Delete {
                collection,
                record_id,
                ..
            } => {
                self.collection(collection)
                    .await?
                    .delete_one(record_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply local updates and record them as a new block.
    pub async fn record_updates(
        &mut self,
        updates: Vec<DatabaseUpdate>,
    ) -> Result<(), DatabaseError> {
        for update in &updates {
            if let DatabaseUpdate::Upsert { document, .. } = update {
                document_id(document)?;
            }
            self.apply_update(update).await?;
        }
        self.blocks.append(updates).await?;
        Ok(())
    }

    /// Persist everything: dirty shards, collection and database hashes, the
    /// tree blob, and the hash cache. Hash propagation happens here, never as
    /// a side effect of individual mutations.
    #[instrument(skip(self))]
    pub async fn save(&mut self) -> Result<(), DatabaseError> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        for name in names {
            let collection = self.collections.get_mut(&name).expect("known collection");
            let hash = collection.save().await?;
            self.hashes.collections.insert(name, hash);
        }
        self.hashes.recompute();
        self.hashes.save(self.metadata.as_ref()).await?;

        self.tree.save(self.metadata.as_ref()).await?;
        self.cache.save_if_dirty().await?;
        Ok(())
    }

    pub fn summary(&self) -> DatabaseSummary {
        let total_size: u64 = self.tree.iter().map(|r| r.size).sum();
        let full_hash = self.tree.root_hash().to_hex();
        let short_hash = self.tree.root_hash().short_hex();
        DatabaseSummary {
            total_files: self.tree.len() as u64,
            total_size,
            total_imports: self.tree.metadata.files_imported,
            database_version: TREE_FORMAT_VERSION,
            full_hash,
            short_hash,
        }
    }

    /// Record that asset content at this location is stored encrypted.
    pub async fn write_encryption_marker(&self, marker: &[u8]) -> Result<(), StorageError> {
        self.root
            .write(ENCRYPTION_MARKER, None, marker.to_vec())
            .await
    }

    pub async fn encryption_marker(&self) -> Result<Option<Vec<u8>>, StorageError> {
        if !self.root.file_exists(ENCRYPTION_MARKER).await? {
            return Ok(None);
        }
        Ok(Some(self.root.read(ENCRYPTION_MARKER).await?))
    }
}
