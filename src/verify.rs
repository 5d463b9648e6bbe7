//! Verify / Repair Engine
//!
//! Verification walks the asset tree and classifies every tracked file
//! against live storage: `unmodified`, `modified` (bytes diverged from the
//! recorded digest), `removed` (tracked but gone), plus `new` for storage
//! files the tree does not know about. The default mode trusts the hash cache
//! under the size + mtime rule; `full` rehashes every file through the worker
//! pool and refreshes the cache as it goes.
//!
//! Repair restores modified and removed files from a known-good source
//! database and re-verifies each restored file individually. New files are
//! reported, never deleted.
//!
//! Both verify modes checkpoint the hash cache every `cache_save_interval`
//! files, so an interrupted run keeps most of its rehash work.

use crate::database::{MediaFileDatabase, ORIGINAL_DIR};
use crate::error::DatabaseError;
use crate::hash_cache::HashCacheEntry;
use crate::storage::list_files_recursive;
use crate::tasks::HashPool;
use crate::tree::FileRecord;
use futures::stream::{self, StreamExt};
use tracing::{info, instrument, warn};

const LIST_PAGE_SIZE: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    /// Files tracked by the tree at verification time.
    pub total_files: u64,
    pub unmodified: u64,
    pub modified: Vec<String>,
    /// On storage but not in the tree (orphan report).
    pub new: Vec<String>,
    /// In the tree but missing from storage.
    pub removed: Vec<String>,
}

impl VerificationResult {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty() && self.new.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairResult {
    pub verification: VerificationResult,
    pub repaired: Vec<String>,
    pub unrepaired: Vec<String>,
}

enum LeafStatus {
    Unmodified,
    Modified,
    Removed,
}

impl MediaFileDatabase {
    /// Verify tracked files against storage. `full` bypasses the cache and
    /// rehashes everything concurrently.
    #[instrument(skip(self))]
    pub async fn verify(&mut self, full: bool) -> Result<VerificationResult, DatabaseError> {
        let leaves: Vec<FileRecord> = self.tree.iter().cloned().collect();
        let mut result = VerificationResult {
            total_files: leaves.len() as u64,
            ..Default::default()
        };

        if full {
            self.verify_full(&leaves, &mut result).await?;
        } else {
            self.verify_cached(&leaves, &mut result).await?;
        }

        // Orphan scan: anything under the asset subtree the tree ignores.
        for path in list_files_recursive(self.root.as_ref(), ORIGINAL_DIR, LIST_PAGE_SIZE).await? {
            if self.tree.get(&path).is_none() {
                result.new.push(path);
            }
        }

        self.cache.save_if_dirty().await?;
        info!(
            total = result.total_files,
            unmodified = result.unmodified,
            modified = result.modified.len(),
            new = result.new.len(),
            removed = result.removed.len(),
            "verify complete"
        );
        Ok(result)
    }

    async fn verify_cached(
        &mut self,
        leaves: &[FileRecord],
        result: &mut VerificationResult,
    ) -> Result<(), DatabaseError> {
        let root = self.root.clone();
        for (processed, leaf) in leaves.iter().enumerate() {
            if processed > 0 && processed % self.config.cache_save_interval == 0 {
                self.cache.save_if_dirty().await?;
            }
            let Some(info) = root.info(&leaf.path).await? else {
                result.removed.push(leaf.path.clone());
                continue;
            };
            let hash = self
                .cache
                .hash_with_cache(root.as_ref(), &leaf.path, &info, None)
                .await?;
            if hash == leaf.hash {
                result.unmodified += 1;
            } else {
                result.modified.push(leaf.path.clone());
            }
        }
        Ok(())
    }

    async fn verify_full(
        &mut self,
        leaves: &[FileRecord],
        result: &mut VerificationResult,
    ) -> Result<(), DatabaseError> {
        let workers = self.config.effective_hash_workers();
        let pool = HashPool::new(self.location().clone(), workers);
        let root = self.root.clone();

        let checks = stream::iter(leaves.iter().map(|leaf| {
            let pool = &pool;
            let root = root.clone();
            async move {
                let Some(info) = root.info(&leaf.path).await? else {
                    return Ok::<_, DatabaseError>((leaf, LeafStatus::Removed, None));
                };
                let hash = pool.hash_file(&leaf.path).await?;
                let status = if hash == leaf.hash {
                    LeafStatus::Unmodified
                } else {
                    LeafStatus::Modified
                };
                Ok((leaf, status, Some((hash, info))))
            }
        }))
        .buffer_unordered(workers)
        .collect::<Vec<_>>()
        .await;

        for (processed, check) in checks.into_iter().enumerate() {
            if processed > 0 && processed % self.config.cache_save_interval == 0 {
                self.cache.save_if_dirty().await?;
            }
            let (leaf, status, fresh) = check?;
            match status {
                LeafStatus::Unmodified => result.unmodified += 1,
                LeafStatus::Modified => result.modified.push(leaf.path.clone()),
                LeafStatus::Removed => result.removed.push(leaf.path.clone()),
            }
            // Full mode refreshes the cache with what is actually on disk.
            if let Some((hash, info)) = fresh {
                self.cache.add_hash(
                    &leaf.path,
                    HashCacheEntry {
                        hash,
                        size: info.length,
                        last_modified: info.last_modified,
                    },
                );
            }
        }
        Ok(())
    }

    /// Restore modified and removed files from `source`, re-verifying each
    /// one. `new` files are reported through the embedded verification and
    /// left alone.
    #[instrument(skip(self, source))]
    pub async fn repair_from(
        &mut self,
        source: &MediaFileDatabase,
    ) -> Result<RepairResult, DatabaseError> {
        let verification = self.verify(false).await?;
        let mut result = RepairResult {
            verification: verification.clone(),
            ..Default::default()
        };

        let damaged: Vec<String> = verification
            .modified
            .iter()
            .chain(verification.removed.iter())
            .cloned()
            .collect();

        for path in damaged {
            match self.restore_one(source, &path).await {
                Ok(true) => result.repaired.push(path),
                Ok(false) => result.unrepaired.push(path),
                Err(e) => {
                    warn!(path, error = %e, "repair failed");
                    result.unrepaired.push(path);
                }
            }
        }

        self.cache.save_if_dirty().await?;
        info!(
            repaired = result.repaired.len(),
            unrepaired = result.unrepaired.len(),
            "repair complete"
        );
        Ok(result)
    }

    /// Copy one file from the source and check it against the expected
    /// digest. Fails with [`DatabaseError::HashMismatch`] when the source
    /// itself holds diverged bytes at that path.
    async fn restore_one(
        &mut self,
        source: &MediaFileDatabase,
        path: &str,
    ) -> Result<bool, DatabaseError> {
        let Some(expected) = self.tree.get(path).map(|r| r.hash) else {
            return Ok(false);
        };
        if !source.root.file_exists(path).await? {
            return Ok(false);
        }

        let info = source.root.info(path).await?;
        let mut stream = source.root.read_stream(path).await?;
        self.root
            .write_stream(path, None, &mut stream, info.map(|i| i.length))
            .await?;

        // Stale by definition now; the re-verify below repopulates it.
        self.cache.remove_hash(path);

        let root = self.root.clone();
        let Some(live) = root.info(path).await? else {
            return Ok(false);
        };
        let hash = self
            .cache
            .hash_with_cache(root.as_ref(), path, &live, None)
            .await?;
        if hash != expected {
            return Err(DatabaseError::HashMismatch {
                path: path.to_string(),
                expected,
                actual: hash,
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::add::AddOptions;
    use crate::config::DatabaseConfig;
    use crate::hash::hash_bytes;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{Storage, StorageLocation};
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn db_with_files(
        files: &[(&str, &[u8])],
    ) -> (MediaFileDatabase, Arc<MemoryStorage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }

        let storage = Arc::new(MemoryStorage::new());
        let mut db = MediaFileDatabase::create(
            StorageLocation::Memory(storage.clone()),
            DatabaseConfig::default(),
        )
        .await
        .unwrap();
        db.add_files(&[dir.path().to_path_buf()], AddOptions::default())
            .await
            .unwrap();
        (db, storage, dir)
    }

    fn asset_path(content: &[u8]) -> String {
        format!("{}/{}", ORIGINAL_DIR, hash_bytes(content).to_hex())
    }

    #[tokio::test]
    async fn test_clean_database_verifies_clean() {
        let (mut db, _storage, _dir) = db_with_files(&[("a.jpg", b"one"), ("b.jpg", b"two")]).await;

        for full in [false, true] {
            let result = db.verify(full).await.unwrap();
            assert!(result.is_clean());
            assert_eq!(result.total_files, 2);
            assert_eq!(result.unmodified, 2);
        }
    }

    #[tokio::test]
    async fn test_metadata_visible_change_detected_without_full() {
        let (mut db, storage, _dir) = db_with_files(&[("a.jpg", b"one")]).await;

        // Overwrite through the normal path: mtime moves, cache rule rehashes.
        storage
            .write(&asset_path(b"one"), None, b"tampered".to_vec())
            .await
            .unwrap();

        let result = db.verify(false).await.unwrap();
        assert_eq!(result.modified, vec![asset_path(b"one")]);
        assert_eq!(result.unmodified, 0);
    }

    #[tokio::test]
    async fn test_silent_tamper_needs_full_mode() {
        let (mut db, storage, _dir) = db_with_files(&[("a.jpg", b"one")]).await;
        db.verify(false).await.unwrap(); // populate the cache

        // Same size, same mtime: inside the cache trust boundary.
        storage.tamper(&asset_path(b"one"), b"two".to_vec());

        let cached = db.verify(false).await.unwrap();
        assert!(cached.is_clean());

        let full = db.verify(true).await.unwrap();
        assert_eq!(full.modified, vec![asset_path(b"one")]);
    }

    #[tokio::test]
    async fn test_removed_and_new_files_reported() {
        let (mut db, storage, _dir) = db_with_files(&[("a.jpg", b"one")]).await;

        storage.delete_file(&asset_path(b"one")).await.unwrap();
        storage
            .write("original/stray", None, b"untracked".to_vec())
            .await
            .unwrap();

        let result = db.verify(false).await.unwrap();
        assert_eq!(result.removed, vec![asset_path(b"one")]);
        assert_eq!(result.new, vec!["original/stray".to_string()]);
    }

    #[tokio::test]
    async fn test_repair_restores_from_source() {
        let (mut dest, dest_storage, _dir1) =
            db_with_files(&[("a.jpg", b"one"), ("b.jpg", b"two")]).await;
        let (source, _src_storage, _dir2) =
            db_with_files(&[("a.jpg", b"one"), ("b.jpg", b"two")]).await;

        // Damage one file and delete another.
        dest_storage
            .write(&asset_path(b"one"), None, b"garbage".to_vec())
            .await
            .unwrap();
        dest_storage.delete_file(&asset_path(b"two")).await.unwrap();

        let result = dest.repair_from(&source).await.unwrap();
        assert_eq!(result.repaired.len(), 2);
        assert!(result.unrepaired.is_empty());

        let after = dest.verify(true).await.unwrap();
        assert!(after.is_clean());
    }

    #[tokio::test]
    async fn test_repair_rejects_corrupt_source_copy() {
        let (mut dest, dest_storage, _dir1) = db_with_files(&[("a.jpg", b"one")]).await;
        let (source, src_storage, _dir2) = db_with_files(&[("a.jpg", b"one")]).await;

        dest_storage.delete_file(&asset_path(b"one")).await.unwrap();
        // The source holds wrong bytes at the expected path; restoring from
        // it must not count as a repair.
        src_storage.tamper(&asset_path(b"one"), b"bad".to_vec());

        let result = dest.repair_from(&source).await.unwrap();
        assert!(result.repaired.is_empty());
        assert_eq!(result.unrepaired, vec![asset_path(b"one")]);
    }

    #[tokio::test]
    async fn test_verify_checkpoints_cache_under_small_interval() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }

        let storage = Arc::new(MemoryStorage::new());
        let mut db = MediaFileDatabase::create(
            StorageLocation::Memory(storage.clone()),
            DatabaseConfig {
                cache_save_interval: 1,
                ..DatabaseConfig::default()
            },
        )
        .await
        .unwrap();
        db.add_files(&[dir.path().to_path_buf()], AddOptions::default())
            .await
            .unwrap();

        for full in [false, true] {
            let result = db.verify(full).await.unwrap();
            assert!(result.is_clean());
        }
        // The refreshed cache reached storage, not just memory.
        assert!(storage
            .file_exists(&format!("metadata/{}", crate::hash_cache::HASH_CACHE_FILE))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_repair_reports_unrepairable() {
        let (mut dest, dest_storage, _dir1) = db_with_files(&[("a.jpg", b"one")]).await;
        // Source lacks the damaged file entirely.
        let empty_dir = tempfile::tempdir().unwrap();
        let src_storage = Arc::new(MemoryStorage::new());
        let mut source = MediaFileDatabase::create(
            StorageLocation::Memory(src_storage),
            DatabaseConfig::default(),
        )
        .await
        .unwrap();
        source
            .add_files(&[PathBuf::from(empty_dir.path())], AddOptions::default())
            .await
            .unwrap();

        dest_storage.delete_file(&asset_path(b"one")).await.unwrap();

        let result = dest.repair_from(&source).await.unwrap();
        assert!(result.repaired.is_empty());
        assert_eq!(result.unrepaired, vec![asset_path(b"one")]);
    }
}
