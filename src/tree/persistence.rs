//! Asset tree persistence.
//!
//! The whole tree is persisted as one binary blob (`tree.dat`): a format
//! version, the database metadata record, and the path-sorted leaf set. The
//! structure is rebuilt deterministically on load, so the loaded tree's root
//! hash is identical to the saved one.

use crate::error::{DatabaseError, StorageError};
use crate::storage::Storage;
use crate::tree::{AssetTree, DatabaseMetadata, FileRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Blob name within the metadata storage.
pub const TREE_FILE: &str = "tree.dat";

/// Current tree blob format. Loading a newer version refuses outright; older
/// versions are migrated on load where possible.
pub const TREE_FORMAT_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct TreeBlob {
    version: u32,
    metadata: DatabaseMetadata,
    records: Vec<FileRecord>,
}

impl AssetTree {
    /// Initialize a new tree into an empty location. Fails with
    /// `LocationNotEmpty` if the storage already contains files: a database
    /// can only be created into an empty location.
    pub async fn create(storage: &dyn Storage) -> Result<AssetTree, DatabaseError> {
        if !storage.is_empty("").await? {
            return Err(DatabaseError::LocationNotEmpty("storage root".to_string()));
        }

        let tree = AssetTree::new();
        tree.save(storage).await?;
        info!("initialized empty asset tree");
        Ok(tree)
    }

    /// Load the tree blob. A missing blob is a structural error: the location
    /// does not hold a database.
    pub async fn load(storage: &dyn Storage) -> Result<AssetTree, DatabaseError> {
        if !storage.file_exists(TREE_FILE).await? {
            return Err(DatabaseError::TreeNotFound(TREE_FILE.to_string()));
        }

        let bytes = storage.read(TREE_FILE).await?;
        let blob: TreeBlob = bincode::deserialize(&bytes)
            .map_err(|e| DatabaseError::Corruption(format!("tree blob: {}", e)))?;

        if blob.version > TREE_FORMAT_VERSION {
            return Err(DatabaseError::UnsupportedVersion {
                found: blob.version,
                supported: TREE_FORMAT_VERSION,
            });
        }

        let mut tree = AssetTree::new();
        tree.metadata = blob.metadata;
        for record in blob.records {
            tree.add_file_hash(record);
        }

        // Pre-v2 blobs hashed the metadata directory alongside assets; the
        // current format tracks assets only.
        if blob.version < TREE_FORMAT_VERSION {
            tree.rebuild_tree("metadata/");
            debug!(from = blob.version, to = TREE_FORMAT_VERSION, "migrated tree format");
        }

        debug!(leaves = tree.len(), root = %tree.root_hash(), "loaded asset tree");
        Ok(tree)
    }

    /// Persist the tree as a single blob (atomic overwrite).
    pub async fn save(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let blob = TreeBlob {
            version: TREE_FORMAT_VERSION,
            metadata: self.metadata.clone(),
            records: self.iter().cloned().collect(),
        };
        let bytes = bincode::serialize(&blob).map_err(StorageError::serialization)?;
        storage.write(TREE_FILE, None, bytes).await
    }
}
