//! Replication / Sync Engine
//!
//! Replication makes the destination's asset set match the source: a
//! root-hash comparison short-circuits the no-op case, otherwise a merge-join
//! over both trees' path-sorted leaves drives copy, overwrite, and prune
//! decisions. Copied leaves carry the source's record verbatim, so two
//! databases holding the same content converge on the same root hash. The
//! record store reconciles separately through block-graph watermark replay.
//!
//! Sync is replication that respects destination-local changes: it detects
//! divergence first and refuses to touch anything until called with `force`,
//! at which point the source wins.

use crate::blocks::{BlockGraph, BlockId};
use crate::database::{MediaFileDatabase, ORIGINAL_DIR};
use crate::error::DatabaseError;
use crate::tree::FileRecord;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Default)]
pub struct ReplicateOptions {
    /// Only consider leaves whose path starts with this prefix.
    pub path_filter: Option<String>,
    /// Reduced replica: skip `original/` content and never prune.
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationResult {
    /// Destination's lifetime import counter after replication.
    pub files_imported: u64,
    /// Source leaves examined after filtering.
    pub files_considered: u64,
    pub copied_files: u64,
    /// Record-store updates replayed from the block graph.
    pub copied_records: u64,
    /// Already present with identical content.
    pub existing_files: u64,
    pub pruned_files: Vec<String>,
}

/// Destination-local state that sync refuses to overwrite without `force`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncConflict {
    /// Present only at the destination; a forced sync would prune it.
    DestOnly(String),
    /// Same path, different content on the two sides.
    ContentDiverged(String),
    /// Record history the source has never seen. The block union preserves
    /// it even under `force`, but the two record stores cannot match.
    RecordsDiverged(BlockId),
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub conflicts: Vec<SyncConflict>,
    /// `None` when sync refused to act.
    pub replication: Option<ReplicationResult>,
}

fn filtered_leaves(db: &MediaFileDatabase, options: &ReplicateOptions) -> Vec<FileRecord> {
    db.tree()
        .iter()
        .filter(|r| {
            if let Some(prefix) = &options.path_filter {
                if !r.path.starts_with(prefix.as_str()) {
                    return false;
                }
            }
            if options.partial && r.path.starts_with(ORIGINAL_DIR) {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

enum LeafAction<'a> {
    Copy(&'a FileRecord),
    Overwrite(&'a FileRecord),
    Keep,
    Prune(&'a FileRecord),
}

/// Merge-join two path-sorted leaf lists into per-path actions.
fn plan<'a>(source: &'a [FileRecord], dest: &'a [FileRecord]) -> Vec<LeafAction<'a>> {
    let mut actions = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < source.len() || j < dest.len() {
        match (source.get(i), dest.get(j)) {
            (Some(s), None) => {
                actions.push(LeafAction::Copy(s));
                i += 1;
            }
            (None, Some(d)) => {
                actions.push(LeafAction::Prune(d));
                j += 1;
            }
            (Some(s), Some(d)) => match s.path.cmp(&d.path) {
                Ordering::Less => {
                    actions.push(LeafAction::Copy(s));
                    i += 1;
                }
                Ordering::Greater => {
                    actions.push(LeafAction::Prune(d));
                    j += 1;
                }
                Ordering::Equal => {
                    if s.hash == d.hash {
                        actions.push(LeafAction::Keep);
                    } else {
                        actions.push(LeafAction::Overwrite(s));
                    }
                    i += 1;
                    j += 1;
                }
            },
            (None, None) => unreachable!("loop condition"),
        }
    }
    actions
}

impl MediaFileDatabase {
    /// Make this database's asset set match `source`, then reconcile records
    /// through the block graph.
    #[instrument(skip(self, source))]
    pub async fn replicate_from(
        &mut self,
        source: &MediaFileDatabase,
        options: &ReplicateOptions,
    ) -> Result<ReplicationResult, DatabaseError> {
        if source.encryption_marker().await? != self.encryption_marker().await? {
            return Err(DatabaseError::Validation(
                "encryption markers differ between source and destination".to_string(),
            ));
        }

        let mut result = ReplicationResult::default();

        let whole_tree = options.path_filter.is_none() && !options.partial;
        if whole_tree && source.root_hash() == self.root_hash() {
            debug!("root hashes match, skipping file walk");
        } else {
            let source_leaves = filtered_leaves(source, options);
            let dest_leaves = filtered_leaves(self, options);
            result.files_considered = source_leaves.len() as u64;

            for action in plan(&source_leaves, &dest_leaves) {
                match action {
                    LeafAction::Copy(record) | LeafAction::Overwrite(record) => {
                        self.copy_file(source, record).await?;
                        result.copied_files += 1;
                    }
                    LeafAction::Keep => result.existing_files += 1,
                    LeafAction::Prune(record) => {
                        if options.partial {
                            continue;
                        }
                        self.root.delete_file(&record.path).await?;
                        self.tree.delete_item(&record.path);
                        self.cache.remove_hash(&record.path);
                        result.pruned_files.push(record.path.clone());
                    }
                }
            }
        }

        result.copied_records = self.replay_blocks_from(source).await?;

        // The import counter is lifetime-monotonic across replicas.
        if source.tree.metadata.files_imported > self.tree.metadata.files_imported {
            self.tree.metadata.files_imported = source.tree.metadata.files_imported;
        }
        result.files_imported = self.tree.metadata.files_imported;

        self.save().await?;
        info!(
            copied = result.copied_files,
            existing = result.existing_files,
            pruned = result.pruned_files.len(),
            records = result.copied_records,
            "replication complete"
        );
        Ok(result)
    }

    /// Copy one file's bytes and adopt the source's leaf record verbatim, so
    /// both trees hash the leaf identically.
    async fn copy_file(
        &mut self,
        source: &MediaFileDatabase,
        record: &FileRecord,
    ) -> Result<(), DatabaseError> {
        let info = source.root.info(&record.path).await?;
        let mut stream = source.root.read_stream(&record.path).await?;
        self.root
            .write_stream(&record.path, None, &mut stream, info.map(|i| i.length))
            .await?;
        self.cache.remove_hash(&record.path);
        self.tree.add_file_hash(record.clone());
        Ok(())
    }

    /// Import the source's blocks, select what needs (re)playing by
    /// watermark, apply in timestamp order, and mark applied.
    async fn replay_blocks_from(
        &mut self,
        source: &MediaFileDatabase,
    ) -> Result<u64, DatabaseError> {
        for block in source.blocks.all_blocks().await? {
            self.blocks.import_block(&block).await?;
        }

        let all = self.blocks.all_blocks().await?;
        let to_apply = BlockGraph::blocks_to_apply(&all, self.blocks.applied());
        if to_apply.is_empty() {
            return Ok(0);
        }

        let ids: Vec<BlockId> = to_apply.iter().map(|b| b.id.clone()).collect();
        let updates = BlockGraph::replay_order(to_apply);
        let count = updates.len() as u64;
        for update in &updates {
            self.apply_update(update).await?;
        }
        self.blocks.mark_applied(ids).await?;
        debug!(updates = count, "replayed block updates");
        Ok(count)
    }

    /// Replication that protects destination-local state. Divergence
    /// (dest-only files, content conflicts, local record history) causes a
    /// refusal that reports the conflicts and changes nothing; `force` lets
    /// the source win.
    #[instrument(skip(self, source))]
    pub async fn sync_from(
        &mut self,
        source: &MediaFileDatabase,
        force: bool,
    ) -> Result<SyncResult, DatabaseError> {
        let options = ReplicateOptions::default();
        let source_leaves = filtered_leaves(source, &options);
        let dest_leaves = filtered_leaves(self, &options);

        let mut conflicts = Vec::new();
        for action in plan(&source_leaves, &dest_leaves) {
            match action {
                LeafAction::Prune(record) => {
                    conflicts.push(SyncConflict::DestOnly(record.path.clone()))
                }
                LeafAction::Overwrite(record) => {
                    conflicts.push(SyncConflict::ContentDiverged(record.path.clone()))
                }
                _ => {}
            }
        }

        // Divergence is not limited to files: blocks only the destination
        // holds mean its record store carries history the source lacks.
        let source_blocks: BTreeSet<BlockId> = source
            .blocks
            .all_blocks()
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect();
        for block in self.blocks.all_blocks().await? {
            if !source_blocks.contains(&block.id) {
                conflicts.push(SyncConflict::RecordsDiverged(block.id));
            }
        }

        if !conflicts.is_empty() && !force {
            info!(conflicts = conflicts.len(), "sync refused without force");
            return Ok(SyncResult {
                conflicts,
                replication: None,
            });
        }

        let replication = self.replicate_from(source, &options).await?;
        Ok(SyncResult {
            conflicts,
            replication: Some(replication),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::add::AddOptions;
    use crate::blocks::DatabaseUpdate;
    use crate::config::DatabaseConfig;
    use crate::database::METADATA_COLLECTION;
    use crate::hash::hash_bytes;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{Storage, StorageLocation};
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn empty_db() -> MediaFileDatabase {
        MediaFileDatabase::create(
            StorageLocation::Memory(Arc::new(MemoryStorage::new())),
            DatabaseConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn db_with_files(files: &[(&str, &[u8])]) -> MediaFileDatabase {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let mut db = empty_db().await;
        db.add_files(&[dir.path().to_path_buf()], AddOptions::default())
            .await
            .unwrap();
        db
    }

    fn asset_path(content: &[u8]) -> String {
        format!("{}/{}", ORIGINAL_DIR, hash_bytes(content).to_hex())
    }

    #[tokio::test]
    async fn test_replicate_converges_and_is_idempotent() {
        let source = db_with_files(&[("a.jpg", b"one"), ("b.jpg", b"two"), ("c.jpg", b"three")])
            .await;
        let mut dest = empty_db().await;

        let first = dest
            .replicate_from(&source, &ReplicateOptions::default())
            .await
            .unwrap();
        assert_eq!(first.copied_files, 3);
        assert_eq!(dest.root_hash(), source.root_hash());
        assert_eq!(dest.summary().total_imports, 3);

        // Second run: root hashes match, nothing moves.
        let second = dest
            .replicate_from(&source, &ReplicateOptions::default())
            .await
            .unwrap();
        assert_eq!(second.copied_files, 0);
        assert_eq!(second.files_considered, 0);
        assert_eq!(dest.root_hash(), source.root_hash());
    }

    #[tokio::test]
    async fn test_replicate_overwrites_and_prunes() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        let mut dest = db_with_files(&[("b.jpg", b"extra")]).await;

        let result = dest
            .replicate_from(&source, &ReplicateOptions::default())
            .await
            .unwrap();
        assert_eq!(result.copied_files, 1);
        assert_eq!(result.pruned_files, vec![asset_path(b"extra")]);
        assert_eq!(dest.root_hash(), source.root_hash());
        assert!(!dest.root.file_exists(&asset_path(b"extra")).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_replication_never_prunes_originals() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        let mut dest = db_with_files(&[("b.jpg", b"extra")]).await;

        let result = dest
            .replicate_from(
                &source,
                &ReplicateOptions {
                    path_filter: None,
                    partial: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.copied_files, 0);
        assert!(result.pruned_files.is_empty());
        assert!(dest.root.file_exists(&asset_path(b"extra")).await.unwrap());
    }

    #[tokio::test]
    async fn test_replicate_carries_record_blocks() {
        let mut source = db_with_files(&[("a.jpg", b"one")]).await;
        let Value::Object(doc) = json!({ "_id": "album-1", "title": "trip" }) else {
            unreachable!()
        };
        source
            .record_updates(vec![DatabaseUpdate::Upsert {
                collection: "albums".to_string(),
                document: doc,
                timestamp: 1_000,
            }])
            .await
            .unwrap();
        source.save().await.unwrap();

        let mut dest = empty_db().await;
        let result = dest
            .replicate_from(&source, &ReplicateOptions::default())
            .await
            .unwrap();
        // The album upsert plus the add pipeline's metadata upsert.
        assert!(result.copied_records >= 2);

        let doc = dest
            .collection("albums")
            .await
            .unwrap()
            .get_one("album-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["title"], json!("trip"));

        // Replay is idempotent: nothing left to apply.
        let again = dest
            .replicate_from(&source, &ReplicateOptions::default())
            .await
            .unwrap();
        assert_eq!(again.copied_records, 0);
    }

    #[tokio::test]
    async fn test_sync_refuses_on_divergence_without_force() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        let mut dest = db_with_files(&[("a.jpg", b"one"), ("local.jpg", b"local-only")]).await;
        let dest_root_before = dest.root_hash();

        let result = dest.sync_from(&source, false).await.unwrap();
        // The local add shows up twice: the asset itself and the block
        // carrying its metadata record.
        assert!(result
            .conflicts
            .contains(&SyncConflict::DestOnly(asset_path(b"local-only"))));
        assert!(result
            .conflicts
            .iter()
            .any(|c| matches!(c, SyncConflict::RecordsDiverged(_))));
        assert!(result.replication.is_none());
        // Refusal changes nothing.
        assert_eq!(dest.root_hash(), dest_root_before);
        assert!(dest
            .root
            .file_exists(&asset_path(b"local-only"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sync_with_force_makes_source_win() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        let mut dest = db_with_files(&[("a.jpg", b"one"), ("local.jpg", b"local-only")]).await;

        let result = dest.sync_from(&source, true).await.unwrap();
        assert!(!result.conflicts.is_empty());
        let replication = result.replication.unwrap();
        assert_eq!(replication.pruned_files, vec![asset_path(b"local-only")]);
        assert_eq!(dest.root_hash(), source.root_hash());
    }

    #[tokio::test]
    async fn test_sync_reports_local_record_history() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        let mut dest = empty_db().await;
        dest.replicate_from(&source, &ReplicateOptions::default())
            .await
            .unwrap();

        // A record-store-only local change: the trees stay identical.
        let Value::Object(doc) = json!({ "_id": "note-1", "text": "mine" }) else {
            unreachable!()
        };
        dest.record_updates(vec![DatabaseUpdate::Upsert {
            collection: "notes".to_string(),
            document: doc,
            timestamp: 5_000,
        }])
        .await
        .unwrap();

        let refused = dest.sync_from(&source, false).await.unwrap();
        assert!(refused.replication.is_none());
        assert_eq!(refused.conflicts.len(), 1);
        assert!(matches!(
            refused.conflicts[0],
            SyncConflict::RecordsDiverged(_)
        ));

        // Forcing proceeds; the local record survives the block union.
        let forced = dest.sync_from(&source, true).await.unwrap();
        assert!(forced.replication.is_some());
        let doc = dest
            .collection("notes")
            .await
            .unwrap()
            .get_one("note-1")
            .await
            .unwrap();
        assert!(doc.is_some());
    }

    #[tokio::test]
    async fn test_sync_without_divergence_just_replicates() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        let mut dest = empty_db().await;

        let result = dest.sync_from(&source, false).await.unwrap();
        assert!(result.conflicts.is_empty());
        assert!(result.replication.is_some());
        assert_eq!(dest.root_hash(), source.root_hash());
    }

    #[tokio::test]
    async fn test_replicate_refuses_mixed_encryption() {
        let source = db_with_files(&[("a.jpg", b"one")]).await;
        source.write_encryption_marker(b"cipher-a").await.unwrap();
        let mut dest = empty_db().await;

        let result = dest
            .replicate_from(&source, &ReplicateOptions::default())
            .await;
        assert!(matches!(result, Err(DatabaseError::Validation(_))));
    }
}
