//! Block Graph
//!
//! Append-only log of record-store updates, organized as a hash-linked DAG so
//! two databases that diverged offline can reconcile. Each block carries the
//! ids of the heads it extended; a block's own id is the digest of its
//! contents, so identical histories produce identical ids on both sides.
//!
//! Replay selection uses a timestamp watermark: the earliest update in any
//! unapplied block defines the point from which history must be re-applied,
//! pulling already-applied blocks back in when their updates interleave with
//! the new ones. Updates then apply in timestamp order, last writer wins.

use crate::error::{DatabaseError, StorageError};
use crate::hash::hash_bytes;
use crate::records::Document;
use crate::storage::Storage;
use crate::types::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

const BLOCKS_DIR: &str = "blocks";
const HEADS_FILE: &str = "blocks/heads.dat";
const APPLIED_FILE: &str = "blocks/applied.dat";

pub type BlockId = String;

/// One record-store mutation, timestamped at the moment it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseUpdate {
    Upsert {
        collection: String,
        document: Document,
        timestamp: Timestamp,
    },
    FieldUpdate {
        collection: String,
        record_id: RecordId,
        field: String,
        value: Value,
        timestamp: Timestamp,
    },
    Delete {
        collection: String,
        record_id: RecordId,
        timestamp: Timestamp,
    },
}

impl DatabaseUpdate {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DatabaseUpdate::Upsert { timestamp, .. }
            | DatabaseUpdate::FieldUpdate { timestamp, .. }
            | DatabaseUpdate::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            DatabaseUpdate::Upsert { collection, .. }
            | DatabaseUpdate::FieldUpdate { collection, .. }
            | DatabaseUpdate::Delete { collection, .. } => collection,
        }
    }
}

/// A node of the update DAG. The id is content-derived, never assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Heads this block extended; empty for the first block.
    pub prev_blocks: Vec<BlockId>,
    pub data: Vec<DatabaseUpdate>,
}

impl Block {
    /// Build a block over `updates`, deriving the id from the exact content.
    pub fn new(prev_blocks: Vec<BlockId>, data: Vec<DatabaseUpdate>) -> Result<Block, StorageError> {
        #[derive(Serialize)]
        struct Content<'a> {
            prev_blocks: &'a [BlockId],
            data: &'a [DatabaseUpdate],
        }
        let bytes = serde_json::to_vec(&Content {
            prev_blocks: &prev_blocks,
            data: &data,
        })
        .map_err(StorageError::serialization)?;
        Ok(Block {
            id: hash_bytes(&bytes).to_hex(),
            prev_blocks,
            data,
        })
    }

    /// Earliest update timestamp in the block.
    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.data.iter().map(|u| u.timestamp()).min()
    }

    /// Latest update timestamp in the block.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.data.iter().map(|u| u.timestamp()).max()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdList {
    ids: Vec<BlockId>,
}

/// The persisted DAG plus the local applied-set.
pub struct BlockGraph {
    storage: Arc<dyn Storage>,
    heads: Vec<BlockId>,
    applied: BTreeSet<BlockId>,
}

impl BlockGraph {
    /// Load the graph state; a location with no blocks yields an empty graph.
    pub async fn load(storage: Arc<dyn Storage>) -> Result<BlockGraph, DatabaseError> {
        let heads = Self::read_id_list(storage.as_ref(), HEADS_FILE).await?;
        let applied = Self::read_id_list(storage.as_ref(), APPLIED_FILE)
            .await?
            .into_iter()
            .collect();
        Ok(BlockGraph {
            storage,
            heads,
            applied,
        })
    }

    async fn read_id_list(storage: &dyn Storage, path: &str) -> Result<Vec<BlockId>, DatabaseError> {
        if !storage.file_exists(path).await? {
            return Ok(Vec::new());
        }
        let bytes = storage.read(path).await?;
        let list: IdList = serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::Corruption(format!("block id list {}: {}", path, e)))?;
        Ok(list.ids)
    }

    async fn write_id_list(&self, path: &str, ids: &[BlockId]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&IdList { ids: ids.to_vec() })
            .map_err(StorageError::serialization)?;
        self.storage.write(path, None, bytes).await
    }

    fn block_path(id: &str) -> String {
        format!("{}/block-{}.dat", BLOCKS_DIR, id)
    }

    pub fn heads(&self) -> &[BlockId] {
        &self.heads
    }

    pub fn is_applied(&self, id: &str) -> bool {
        self.applied.contains(id)
    }

    /// Record local updates as a new block extending the current heads. The
    /// block is immediately marked applied: its updates already live in the
    /// local record store.
    #[instrument(skip(self, updates))]
    pub async fn append(&mut self, updates: Vec<DatabaseUpdate>) -> Result<Block, DatabaseError> {
        let block = Block::new(self.heads.clone(), updates)?;
        self.storage
            .write(
                &Self::block_path(&block.id),
                None,
                serde_json::to_vec(&block).map_err(StorageError::serialization)?,
            )
            .await?;

        self.heads = vec![block.id.clone()];
        self.applied.insert(block.id.clone());
        self.persist_state().await?;
        debug!(block = %block.id, updates = block.data.len(), "appended block");
        Ok(block)
    }

    /// Copy a foreign block into this graph without marking it applied. Heads
    /// are recomputed: a block stops being a head once anything extends it.
    pub async fn import_block(&mut self, block: &Block) -> Result<(), DatabaseError> {
        let path = Self::block_path(&block.id);
        if !self.storage.file_exists(&path).await? {
            self.storage
                .write(
                    &path,
                    None,
                    serde_json::to_vec(block).map_err(StorageError::serialization)?,
                )
                .await?;
        }

        let all = self.all_blocks().await?;
        let extended: BTreeSet<&BlockId> =
            all.iter().flat_map(|b| b.prev_blocks.iter()).collect();
        self.heads = all
            .iter()
            .filter(|b| !extended.contains(&b.id))
            .map(|b| b.id.clone())
            .collect();
        self.persist_state().await?;
        Ok(())
    }

    /// Mark blocks as applied after their updates have been replayed.
    pub async fn mark_applied(
        &mut self,
        ids: impl IntoIterator<Item = BlockId>,
    ) -> Result<(), DatabaseError> {
        self.applied.extend(ids);
        self.persist_state().await?;
        Ok(())
    }

    async fn persist_state(&self) -> Result<(), StorageError> {
        self.write_id_list(HEADS_FILE, &self.heads).await?;
        let applied: Vec<BlockId> = self.applied.iter().cloned().collect();
        self.write_id_list(APPLIED_FILE, &applied).await
    }

    pub async fn block(&self, id: &str) -> Result<Block, DatabaseError> {
        let bytes = self.storage.read(&Self::block_path(id)).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::Corruption(format!("block {}: {}", id, e)))
    }

    /// Every block in the graph, in id order.
    pub async fn all_blocks(&self) -> Result<Vec<Block>, DatabaseError> {
        let mut blocks = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .storage
                .list_files(BLOCKS_DIR, 256, token.as_deref())
                .await?;
            for name in page.names {
                let Some(id) = name
                    .strip_prefix("block-")
                    .and_then(|rest| rest.strip_suffix(".dat"))
                else {
                    continue;
                };
                blocks.push(self.block(id).await?);
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Select the blocks whose updates must be (re)played, given which blocks
    /// this database has already applied.
    ///
    /// The watermark is the earliest update timestamp across unapplied blocks.
    /// Applied blocks re-enter the replay set when any of their updates is at
    /// or after the watermark, because last-writer-wins can only be decided by
    /// replaying both sides in order.
    pub fn blocks_to_apply(all: &[Block], applied: &BTreeSet<BlockId>) -> Vec<Block> {
        let unapplied: Vec<&Block> = all.iter().filter(|b| !applied.contains(&b.id)).collect();
        let Some(watermark) = unapplied.iter().filter_map(|b| b.min_timestamp()).min() else {
            return Vec::new();
        };

        let mut selected: Vec<Block> = all
            .iter()
            .filter(|b| {
                !applied.contains(&b.id)
                    || b.max_timestamp().is_some_and(|ts| ts >= watermark)
            })
            .cloned()
            .collect();
        selected.sort_by_key(|b| (b.min_timestamp(), b.id.clone()));
        selected
    }

    /// Flatten blocks into one replay sequence, ordered by update timestamp.
    /// The sort is stable, so same-timestamp updates keep block order.
    pub fn replay_order(blocks: Vec<Block>) -> Vec<DatabaseUpdate> {
        let mut updates: Vec<DatabaseUpdate> =
            blocks.into_iter().flat_map(|b| b.data).collect();
        updates.sort_by_key(|u| u.timestamp());
        updates
    }

    pub fn applied(&self) -> &BTreeSet<BlockId> {
        &self.applied
    }
}
