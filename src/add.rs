//! Add Pipeline
//!
//! Imports local media files into the database: classify by extension, hash
//! through the local scan cache, deduplicate against the metadata
//! collection's hash index, then register — asset bytes under
//! `original/<digest>`, a tree leaf, and a metadata document, all keyed by the
//! content digest. Zip archives are unpacked and their entries imported as
//! virtual paths.
//!
//! Every per-file failure is isolated: the batch continues and the summary
//! stays accurate. A failed registration deletes whatever it managed to write
//! before giving up on that file.

use crate::blocks::DatabaseUpdate;
use crate::database::{MediaFileDatabase, METADATA_COLLECTION, ORIGINAL_DIR};
use crate::error::DatabaseError;
use crate::hash::hash_bytes;
use crate::hash_cache::{HashCache, HashCacheEntry};
use crate::records::Document;
use crate::storage::local::LocalStorage;
use crate::storage::{ByteStream, Storage};
use crate::tree::FileRecord;
use crate::types::{now_millis, timestamp_millis, Hash, Timestamp};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Local scan cache blob, keyed by absolute local path.
pub const LOCAL_HASH_CACHE_FILE: &str = "hash-cache-local.dat";

/// Post-registration hook for renditions, EXIF extraction, and similar
/// derived work. The default implementation does nothing.
#[async_trait]
pub trait AssetProcessor: Send + Sync {
    async fn process(
        &self,
        storage: &dyn Storage,
        asset_path: &str,
        content_type: &str,
    ) -> Result<(), DatabaseError>;
}

pub struct NoopProcessor;

#[async_trait]
impl AssetProcessor for NoopProcessor {
    async fn process(
        &self,
        _storage: &dyn Storage,
        _asset_path: &str,
        _content_type: &str,
    ) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct AddOptions<'a> {
    /// Run the full pipeline without writing anything.
    pub check_only: bool,
    pub processor: Option<&'a dyn AssetProcessor>,
}

/// Batch outcome; counters stay accurate under partial failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddSummary {
    pub files_added: u64,
    pub files_already_added: u64,
    pub files_ignored: u64,
    pub files_failed: u64,
    /// Bytes newly written, duplicates excluded.
    pub total_size: u64,
}

impl AddSummary {
    pub fn average_size(&self) -> u64 {
        if self.files_added == 0 {
            0
        } else {
            self.total_size / self.files_added
        }
    }
}

/// Extension classification.
enum Kind {
    Media(&'static str),
    Archive,
    Unknown,
}

fn classify(path: &Path) -> Kind {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Kind::Unknown;
    };
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Kind::Media("image/jpeg"),
        "png" => Kind::Media("image/png"),
        "gif" => Kind::Media("image/gif"),
        "webp" => Kind::Media("image/webp"),
        "tif" | "tiff" => Kind::Media("image/tiff"),
        "bmp" => Kind::Media("image/bmp"),
        "heic" | "heif" => Kind::Media("image/heic"),
        "mp4" => Kind::Media("video/mp4"),
        "m4v" => Kind::Media("video/x-m4v"),
        "mov" => Kind::Media("video/quicktime"),
        "avi" => Kind::Media("video/x-msvideo"),
        "mkv" => Kind::Media("video/x-matroska"),
        "webm" => Kind::Media("video/webm"),
        "zip" => Kind::Archive,
        _ => Kind::Unknown,
    }
}

/// One unit of work: a local file or an unpacked archive entry.
struct Candidate {
    /// Display path: local path, or `archive.zip/entry` for archive entries.
    name: String,
    content_type: &'static str,
    size: u64,
    last_modified: Timestamp,
    source: CandidateSource,
}

enum CandidateSource {
    LocalFile(PathBuf),
    Bytes(Vec<u8>),
}

impl MediaFileDatabase {
    /// Import files or directory trees. Directories are walked recursively in
    /// path order.
    #[instrument(skip(self, inputs, options))]
    pub async fn add_files(
        &mut self,
        inputs: &[PathBuf],
        options: AddOptions<'_>,
    ) -> Result<AddSummary, DatabaseError> {
        let mut summary = AddSummary::default();
        let cache_storage: Arc<dyn Storage> = match &self.config.local_cache_dir {
            Some(dir) => Arc::new(LocalStorage::new(dir.clone())),
            None => self.metadata.clone(),
        };
        let mut scan_cache = HashCache::new(cache_storage, LOCAL_HASH_CACHE_FILE);
        scan_cache.load().await?;

        // In check mode nothing reaches the dedup index, so repeats within
        // the batch are caught here instead.
        let mut batch_hashes: HashSet<Hash> = HashSet::new();

        self.collection(METADATA_COLLECTION)
            .await?
            .ensure_index("hash")
            .await?;

        let mut processed = 0usize;
        for input in inputs {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(input = %input.display(), error = %e, "scan failed");
                        summary.files_failed += 1;
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let path = entry.path().to_path_buf();
                match classify(&path) {
                    Kind::Unknown => {
                        debug!(path = %path.display(), "ignoring unrecognized file");
                        summary.files_ignored += 1;
                    }
                    Kind::Media(content_type) => {
                        match self.candidate_for_local(&path, content_type).await {
                            Ok(candidate) => {
                                self.handle_candidate(
                                    candidate,
                                    &options,
                                    &mut scan_cache,
                                    &mut batch_hashes,
                                    &mut summary,
                                )
                                .await;
                            }
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "stat failed");
                                summary.files_failed += 1;
                            }
                        }
                    }
                    Kind::Archive => match unpack_archive(&path).await {
                        Ok(entries) => {
                            for candidate in entries {
                                self.handle_candidate(
                                    candidate,
                                    &options,
                                    &mut scan_cache,
                                    &mut batch_hashes,
                                    &mut summary,
                                )
                                .await;
                            }
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "archive unpack failed");
                            summary.files_failed += 1;
                        }
                    },
                }

                processed += 1;
                if !options.check_only && processed % self.config.cache_save_interval == 0 {
                    scan_cache.save_if_dirty().await?;
                    self.save().await?;
                }
            }
        }

        if !options.check_only {
            scan_cache.save_if_dirty().await?;
            self.save().await?;
        }
        info!(
            added = summary.files_added,
            duplicates = summary.files_already_added,
            ignored = summary.files_ignored,
            failed = summary.files_failed,
            "add complete"
        );
        Ok(summary)
    }

    /// `add_files` with every write suppressed.
    pub async fn check_files(&mut self, inputs: &[PathBuf]) -> Result<AddSummary, DatabaseError> {
        self.add_files(
            inputs,
            AddOptions {
                check_only: true,
                processor: None,
            },
        )
        .await
    }

    async fn candidate_for_local(
        &self,
        path: &Path,
        content_type: &'static str,
    ) -> Result<Candidate, DatabaseError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            DatabaseError::Storage(crate::error::StorageError::IoError(e))
        })?;
        let last_modified = meta
            .modified()
            .map(timestamp_millis)
            .unwrap_or_else(|_| now_millis());
        Ok(Candidate {
            name: path.display().to_string(),
            content_type,
            size: meta.len(),
            last_modified,
            source: CandidateSource::LocalFile(path.to_path_buf()),
        })
    }

    async fn handle_candidate(
        &mut self,
        candidate: Candidate,
        options: &AddOptions<'_>,
        scan_cache: &mut HashCache,
        batch_hashes: &mut HashSet<Hash>,
        summary: &mut AddSummary,
    ) {
        match self
            .process_candidate(candidate, options, scan_cache, batch_hashes)
            .await
        {
            Ok(Outcome::Added(size)) => {
                summary.files_added += 1;
                summary.total_size += size;
            }
            Ok(Outcome::Duplicate) => summary.files_already_added += 1,
            Err(e) => {
                warn!(error = %e, "import failed");
                summary.files_failed += 1;
            }
        }
    }

    async fn process_candidate(
        &mut self,
        candidate: Candidate,
        options: &AddOptions<'_>,
        scan_cache: &mut HashCache,
        batch_hashes: &mut HashSet<Hash>,
    ) -> Result<Outcome, DatabaseError> {
        let hash = match &candidate.source {
            CandidateSource::LocalFile(path) => {
                hash_local_cached(scan_cache, path, &candidate).await?
            }
            CandidateSource::Bytes(data) => hash_bytes(data),
        };
        let id = hash.to_hex();

        let existing = self
            .collection(METADATA_COLLECTION)
            .await?
            .find_by_index("hash", &json!(id))
            .await?;
        if !existing.is_empty() {
            debug!(hash = %hash.short_hex(), name = %candidate.name, "duplicate content");
            return Ok(Outcome::Duplicate);
        }

        if options.check_only {
            if !batch_hashes.insert(hash) {
                return Ok(Outcome::Duplicate);
            }
            return Ok(Outcome::Added(candidate.size));
        }

        let size = candidate.size;
        match self.register(candidate, hash, options).await {
            Ok(()) => Ok(Outcome::Added(size)),
            Err(e) => {
                self.unregister(&hash).await;
                Err(e)
            }
        }
    }

    /// Write the asset, the tree leaf, and the metadata document. Any failure
    /// here triggers [`Self::unregister`] in the caller.
    async fn register(
        &mut self,
        candidate: Candidate,
        hash: Hash,
        options: &AddOptions<'_>,
    ) -> Result<(), DatabaseError> {
        let asset_path = format!("{}/{}", ORIGINAL_DIR, hash.to_hex());

        match candidate.source {
            CandidateSource::LocalFile(ref path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(crate::error::StorageError::IoError)?;
                let mut stream: ByteStream = Box::new(file);
                self.root
                    .write_stream(
                        &asset_path,
                        Some(candidate.content_type),
                        &mut stream,
                        Some(candidate.size),
                    )
                    .await?;
            }
            CandidateSource::Bytes(ref data) => {
                self.root
                    .write(&asset_path, Some(candidate.content_type), data.clone())
                    .await?;
            }
        }

        let info = self
            .root
            .info(&asset_path)
            .await?
            .ok_or_else(|| DatabaseError::Corruption(format!("missing after write: {}", asset_path)))?;
        self.tree.add_file_hash(FileRecord {
            path: asset_path.clone(),
            hash,
            size: info.length,
            last_modified: info.last_modified,
        });
        self.tree.metadata.files_imported += 1;

        let document: Document = {
            let serde_json::Value::Object(map) = json!({
                "_id": hash.to_hex(),
                "hash": hash.to_hex(),
                "size": candidate.size,
                "last_modified": candidate.last_modified,
                "content_type": candidate.content_type,
                "source_name": candidate.name,
                "imported_at": now_millis(),
            }) else {
                unreachable!("object literal")
            };
            map
        };
        if let Some(processor) = options.processor {
            processor
                .process(self.root.as_ref(), &asset_path, candidate.content_type)
                .await?;
        }

        // Committed last: once the metadata upsert enters the block graph it
        // replicates, so nothing may fail after it for this file.
        self.record_updates(vec![DatabaseUpdate::Upsert {
            collection: METADATA_COLLECTION.to_string(),
            document,
            timestamp: now_millis(),
        }])
        .await?;

        debug!(hash = %hash.short_hex(), name = %candidate.name, "registered");
        Ok(())
    }

    /// Compensating cleanup for a failed registration. Best effort; failures
    /// here only log.
    async fn unregister(&mut self, hash: &Hash) {
        let asset_path = format!("{}/{}", ORIGINAL_DIR, hash.to_hex());
        if let Err(e) = self.root.delete_file(&asset_path).await {
            warn!(path = %asset_path, error = %e, "cleanup delete failed");
        }
        if self.tree.delete_item(&asset_path) {
            self.tree.metadata.files_imported =
                self.tree.metadata.files_imported.saturating_sub(1);
        }
        if let Ok(coll) = self.collection(METADATA_COLLECTION).await {
            if let Err(e) = coll.delete_one(&hash.to_hex()).await {
                warn!(error = %e, "cleanup record delete failed");
            }
        }
    }
}

enum Outcome {
    Added(u64),
    Duplicate,
}

/// Hash a local file through the scan cache, trusting the cached digest only
/// on an exact size + mtime match.
async fn hash_local_cached(
    cache: &mut HashCache,
    path: &Path,
    candidate: &Candidate,
) -> Result<Hash, DatabaseError> {
    let key = path.display().to_string();
    if let Some(entry) = cache.get_hash(&key) {
        if entry.size == candidate.size && entry.last_modified == candidate.last_modified {
            return Ok(entry.hash);
        }
    }
    let hash = crate::hash::hash_local_file(path).await?;
    cache.add_hash(
        &key,
        HashCacheEntry {
            hash,
            size: candidate.size,
            last_modified: candidate.last_modified,
        },
    );
    Ok(hash)
}

/// Unpack a zip archive off the async runtime; returns media entries as
/// in-memory candidates with virtual `archive.zip/entry` names.
async fn unpack_archive(path: &Path) -> Result<Vec<Candidate>, DatabaseError> {
    let archive_name = path.display().to_string();
    let archive_mtime = tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .map(timestamp_millis)
        .unwrap_or_else(now_millis);
    let path = path.to_path_buf();

    let entries = tokio::task::spawn_blocking(move || -> Result<Vec<(String, &'static str, Vec<u8>)>, String> {
        let file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;

        let mut out = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| e.to_string())?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let Kind::Media(content_type) = classify(Path::new(&name)) else {
                continue;
            };
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).map_err(|e| e.to_string())?;
            out.push((name, content_type, data));
        }
        Ok(out)
    })
    .await
    .map_err(|e| DatabaseError::TaskFailed {
        attempts: 1,
        message: e.to_string(),
    })?
    .map_err(DatabaseError::Validation)?;

    Ok(entries
        .into_iter()
        .map(|(name, content_type, data)| Candidate {
            name: format!("{}/{}", archive_name, name),
            content_type,
            size: data.len() as u64,
            last_modified: archive_mtime,
            source: CandidateSource::Bytes(data),
        })
        .collect())
}
