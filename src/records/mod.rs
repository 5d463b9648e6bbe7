//! Record Store
//!
//! JSON documents in named collections, sharded by `_id` digest so a large
//! collection never serializes as one blob. Each shard is an independently
//! hashed file; per-collection and database hashes aggregate upward
//! ([`merkle`]). Collections optionally carry hash indexes for exact-match
//! lookup and disk-backed sort indexes ([`sort_index`]) for ordered
//! pagination.
//!
//! Mutations stay in memory until [`RecordCollection::save`], which writes
//! only dirty shards and returns the refreshed collection hash.

pub mod merkle;
pub mod sort_index;

use crate::error::{DatabaseError, StorageError};
use crate::storage::{join_paths, Storage};
use crate::types::{Hash, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

use merkle::{collection_hash, shard_hash};
use sort_index::{IndexEntry, JsonKey, SortDirection, SortIndex, SortedPage};

/// A stored record: a JSON object with a string `_id` field.
pub type Document = serde_json::Map<String, Value>;

/// Extract the `_id` field; every record must carry one.
pub fn document_id(doc: &Document) -> Result<RecordId, DatabaseError> {
    match doc.get("_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(DatabaseError::InvalidRecord(
            "document is missing a string _id".to_string(),
        )),
    }
}

/// Shard assignment: first four digest bytes of the `_id`, mod the
/// collection's persisted shard count. Stable for the collection's lifetime.
pub fn shard_id_for(record_id: &str, shard_count: u32) -> u32 {
    let digest = blake3::hash(record_id.as_bytes());
    let prefix: [u8; 4] = digest.as_bytes()[0..4].try_into().expect("digest prefix");
    u32::from_be_bytes(prefix) % shard_count
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionMeta {
    name: String,
    /// Fixed at creation; changing it would reshuffle every record.
    shard_count: u32,
    shard_hashes: BTreeMap<u32, Hash>,
    hash_index_fields: Vec<String>,
    sort_index_fields: Vec<(String, SortDirection)>,
}

#[derive(Debug, Default)]
struct Shard {
    records: BTreeMap<RecordId, Document>,
    dirty: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HashIndexBlob {
    entries: BTreeMap<String, Vec<RecordId>>,
}

/// Canonical map key for an indexed field value.
fn index_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct RecordCollection {
    storage: Arc<dyn Storage>,
    meta: CollectionMeta,
    meta_dirty: bool,
    shards: HashMap<u32, Shard>,
    hash_indexes: HashMap<String, HashIndexBlob>,
    dirty_hash_indexes: Vec<String>,
    sort_indexes: HashMap<(String, SortDirection), SortIndex>,
    page_capacity: usize,
}

impl RecordCollection {
    /// Open a collection, creating its metadata on first use. `shard_count`
    /// only applies at creation; an existing collection keeps its persisted
    /// count.
    #[instrument(skip(storage))]
    pub async fn open(
        storage: Arc<dyn Storage>,
        name: &str,
        shard_count: u32,
        page_capacity: usize,
    ) -> Result<RecordCollection, DatabaseError> {
        let meta_path = Self::meta_path_for(name);
        let (meta, meta_dirty) = if storage.file_exists(&meta_path).await? {
            let bytes = storage.read(&meta_path).await?;
            let meta: CollectionMeta = serde_json::from_slice(&bytes)
                .map_err(|e| DatabaseError::Corruption(format!("collection meta: {}", e)))?;
            (meta, false)
        } else {
            debug!(name, shard_count, "creating collection");
            (
                CollectionMeta {
                    name: name.to_string(),
                    shard_count: shard_count.max(1),
                    shard_hashes: BTreeMap::new(),
                    hash_index_fields: Vec::new(),
                    sort_index_fields: Vec::new(),
                },
                true,
            )
        };

        let mut collection = RecordCollection {
            storage,
            meta,
            meta_dirty,
            shards: HashMap::new(),
            hash_indexes: HashMap::new(),
            dirty_hash_indexes: Vec::new(),
            sort_indexes: HashMap::new(),
            page_capacity,
        };

        for field in collection.meta.hash_index_fields.clone() {
            collection.load_hash_index(&field).await?;
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn shard_count(&self) -> u32 {
        self.meta.shard_count
    }

    fn meta_path_for(name: &str) -> String {
        format!("{}/meta.dat", name)
    }

    fn shard_path(&self, shard_id: u32) -> String {
        format!("{}/shard-{}", self.meta.name, shard_id)
    }

    fn hash_index_path(&self, field: &str) -> String {
        format!("{}/hash_index/{}.dat", self.meta.name, field)
    }

    async fn load_shard(&mut self, shard_id: u32) -> Result<&mut Shard, DatabaseError> {
        if !self.shards.contains_key(&shard_id) {
            let path = self.shard_path(shard_id);
            let records = if self.storage.file_exists(&path).await? {
                let bytes = self.storage.read(&path).await?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    DatabaseError::Corruption(format!("shard {} of {}: {}", shard_id, self.meta.name, e))
                })?
            } else {
                BTreeMap::new()
            };
            self.shards.insert(
                shard_id,
                Shard {
                    records,
                    dirty: false,
                },
            );
        }
        Ok(self.shards.get_mut(&shard_id).expect("shard just loaded"))
    }

    /// Shard ids with a persisted file, from the collection metadata.
    pub fn existing_shards(&self) -> Vec<u32> {
        self.meta.shard_hashes.keys().copied().collect()
    }

    /// Insert or replace a record. Indexes are maintained in the same step.
    pub async fn upsert_one(&mut self, doc: Document) -> Result<RecordId, DatabaseError> {
        let id = document_id(&doc)?;
        let shard_id = shard_id_for(&id, self.meta.shard_count);
        let shard = self.load_shard(shard_id).await?;
        let previous = shard.records.insert(id.clone(), doc.clone());
        shard.dirty = true;

        self.update_hash_indexes(&id, previous.as_ref(), Some(&doc));
        self.update_sort_indexes(&id, previous.as_ref(), Some(&doc))
            .await?;
        Ok(id)
    }

    pub async fn get_one(&mut self, id: &str) -> Result<Option<Document>, DatabaseError> {
        let shard_id = shard_id_for(id, self.meta.shard_count);
        let shard = self.load_shard(shard_id).await?;
        Ok(shard.records.get(id).cloned())
    }

    /// Delete a record; returns whether it existed.
    pub async fn delete_one(&mut self, id: &str) -> Result<bool, DatabaseError> {
        let shard_id = shard_id_for(id, self.meta.shard_count);
        let shard = self.load_shard(shard_id).await?;
        let previous = shard.records.remove(id);
        if previous.is_none() {
            return Ok(false);
        }
        shard.dirty = true;

        self.update_hash_indexes(id, previous.as_ref(), None);
        self.update_sort_indexes(id, previous.as_ref(), None).await?;
        Ok(true)
    }

    /// Every record in the collection, across all shards.
    pub async fn all_records(&mut self) -> Result<Vec<Document>, DatabaseError> {
        let mut shard_ids: Vec<u32> = self.existing_shards();
        for id in self.shards.keys() {
            if !shard_ids.contains(id) {
                shard_ids.push(*id);
            }
        }
        shard_ids.sort_unstable();

        let mut out = Vec::new();
        for shard_id in shard_ids {
            let shard = self.load_shard(shard_id).await?;
            out.extend(shard.records.values().cloned());
        }
        Ok(out)
    }

    pub async fn count(&mut self) -> Result<u64, DatabaseError> {
        Ok(self.all_records().await?.len() as u64)
    }

    // ---- hash indexes ----

    pub fn has_index(&self, field: &str) -> bool {
        self.meta.hash_index_fields.iter().any(|f| f == field)
    }

    async fn load_hash_index(&mut self, field: &str) -> Result<(), DatabaseError> {
        let path = self.hash_index_path(field);
        let blob = if self.storage.file_exists(&path).await? {
            let bytes = self.storage.read(&path).await?;
            serde_json::from_slice(&bytes)
                .map_err(|e| DatabaseError::Corruption(format!("hash index {}: {}", field, e)))?
        } else {
            HashIndexBlob::default()
        };
        self.hash_indexes.insert(field.to_string(), blob);
        Ok(())
    }

    /// Build (or rebuild) an exact-match index over `field`.
    #[instrument(skip(self), fields(collection = %self.meta.name))]
    pub async fn ensure_index(&mut self, field: &str) -> Result<(), DatabaseError> {
        if self.has_index(field) {
            return Ok(());
        }

        let mut blob = HashIndexBlob::default();
        for doc in self.all_records().await? {
            let id = document_id(&doc)?;
            if let Some(value) = doc.get(field) {
                blob.entries.entry(index_key(value)).or_default().push(id);
            }
        }
        self.hash_indexes.insert(field.to_string(), blob);
        self.meta.hash_index_fields.push(field.to_string());
        self.meta_dirty = true;
        self.mark_hash_index_dirty(field);
        debug!(field, "built hash index");
        Ok(())
    }

    /// Exact-match lookup through a hash index.
    pub async fn find_by_index(
        &mut self,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, DatabaseError> {
        if !self.has_index(field) {
            return Err(DatabaseError::Validation(format!(
                "no hash index for field '{}'",
                field
            )));
        }
        let ids: Vec<RecordId> = self
            .hash_indexes
            .get(field)
            .and_then(|blob| blob.entries.get(&index_key(value)))
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get_one(&id).await? {
                out.push(doc);
            }
        }
        Ok(out)
    }

    fn mark_hash_index_dirty(&mut self, field: &str) {
        if !self.dirty_hash_indexes.iter().any(|f| f == field) {
            self.dirty_hash_indexes.push(field.to_string());
        }
    }

    fn update_hash_indexes(&mut self, id: &str, old: Option<&Document>, new: Option<&Document>) {
        let fields = self.meta.hash_index_fields.clone();
        for field in fields {
            let old_value = old.and_then(|d| d.get(&field)).map(index_key);
            let new_value = new.and_then(|d| d.get(&field)).map(index_key);
            if old_value == new_value {
                continue;
            }

            let blob = self.hash_indexes.entry(field.clone()).or_default();
            if let Some(key) = old_value {
                if let Some(ids) = blob.entries.get_mut(&key) {
                    ids.retain(|existing| existing != id);
                    if ids.is_empty() {
                        blob.entries.remove(&key);
                    }
                }
            }
            if let Some(key) = new_value {
                blob.entries.entry(key).or_default().push(id.to_string());
            }
            self.mark_hash_index_dirty(&field);
        }
    }

    // ---- sort indexes ----

    pub fn list_sort_indexes(&self) -> &[(String, SortDirection)] {
        &self.meta.sort_index_fields
    }

    fn sort_index_handle(&mut self, field: &str, direction: SortDirection) -> &mut SortIndex {
        let key = (field.to_string(), direction);
        let storage = self.storage.clone();
        let name = self.meta.name.clone();
        let capacity = self.page_capacity;
        self.sort_indexes
            .entry(key)
            .or_insert_with(|| SortIndex::new(storage, &name, field, direction, capacity))
    }

    /// Build a sort index over `field` if one does not already exist.
    #[instrument(skip(self), fields(collection = %self.meta.name))]
    pub async fn ensure_sort_index(
        &mut self,
        field: &str,
        direction: SortDirection,
    ) -> Result<(), DatabaseError> {
        if self
            .meta
            .sort_index_fields
            .iter()
            .any(|(f, d)| f == field && *d == direction)
        {
            return Ok(());
        }

        let entries: Vec<IndexEntry> = self
            .all_records()
            .await?
            .into_iter()
            .map(|doc| {
                let id = document_id(&doc)?;
                Ok(IndexEntry {
                    key: JsonKey(doc.get(field).cloned().unwrap_or(Value::Null)),
                    record_id: id,
                })
            })
            .collect::<Result<_, DatabaseError>>()?;

        self.sort_index_handle(field, direction).build(entries).await?;
        self.meta.sort_index_fields.push((field.to_string(), direction));
        self.meta_dirty = true;
        Ok(())
    }

    /// One page of records ordered by an existing sort index.
    pub async fn get_sorted_page(
        &mut self,
        field: &str,
        direction: SortDirection,
        page_id: Option<u64>,
    ) -> Result<SortedPage, DatabaseError> {
        if !self
            .meta
            .sort_index_fields
            .iter()
            .any(|(f, d)| f == field && *d == direction)
        {
            return Err(DatabaseError::SortIndexNotFound {
                field: field.to_string(),
                direction: direction.to_string(),
            });
        }
        self.sort_index_handle(field, direction).get_page(page_id).await
    }

    async fn update_sort_indexes(
        &mut self,
        id: &str,
        old: Option<&Document>,
        new: Option<&Document>,
    ) -> Result<(), DatabaseError> {
        for (field, direction) in self.meta.sort_index_fields.clone() {
            let old_key = old.map(|d| JsonKey(d.get(&field).cloned().unwrap_or(Value::Null)));
            let new_key = new.map(|d| JsonKey(d.get(&field).cloned().unwrap_or(Value::Null)));
            if old_key == new_key {
                continue;
            }

            let index = self.sort_index_handle(&field, direction);
            if let Some(key) = old_key {
                index.remove(&key, id).await?;
            }
            if let Some(key) = new_key {
                let index = self.sort_index_handle(&field, direction);
                index.insert(key, id.to_string()).await?;
            }
        }
        Ok(())
    }

    // ---- persistence ----

    /// Persist dirty shards, indexes, and metadata; return the refreshed
    /// collection hash. Shard hashes are recomputed from the exact bytes
    /// written.
    #[instrument(skip(self), fields(collection = %self.meta.name))]
    pub async fn save(&mut self) -> Result<Hash, DatabaseError> {
        let mut dirty_ids: Vec<u32> = self
            .shards
            .iter()
            .filter(|(_, shard)| shard.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty_ids.sort_unstable();

        for shard_id in dirty_ids {
            let path = self.shard_path(shard_id);
            let bytes = {
                let shard = self.shards.get_mut(&shard_id).expect("dirty shard present");
                shard.dirty = false;
                if shard.records.is_empty() {
                    None
                } else {
                    Some(serde_json::to_vec(&shard.records).map_err(StorageError::serialization)?)
                }
            };

            match bytes {
                None => {
                    self.storage.delete_file(&path).await?;
                    if self.meta.shard_hashes.remove(&shard_id).is_some() {
                        self.meta_dirty = true;
                    }
                }
                Some(bytes) => {
                    let hash = shard_hash(&bytes);
                    self.storage.write(&path, None, bytes).await?;
                    if self.meta.shard_hashes.insert(shard_id, hash) != Some(hash) {
                        self.meta_dirty = true;
                    }
                }
            }
        }

        for field in std::mem::take(&mut self.dirty_hash_indexes) {
            let blob = self.hash_indexes.get(&field).expect("dirty index loaded");
            let bytes = serde_json::to_vec(blob).map_err(StorageError::serialization)?;
            self.storage
                .write(&self.hash_index_path(&field), None, bytes)
                .await?;
        }

        if self.meta_dirty {
            let bytes = serde_json::to_vec(&self.meta).map_err(StorageError::serialization)?;
            self.storage
                .write(&Self::meta_path_for(&self.meta.name), None, bytes)
                .await?;
            self.meta_dirty = false;
        }

        Ok(self.hash())
    }

    /// Current collection hash from the persisted shard hashes.
    pub fn hash(&self) -> Hash {
        collection_hash(&self.meta.name, &self.meta.shard_hashes)
    }

    /// Names of collections present under the storage root, from their
    /// metadata blobs.
    pub async fn list_collections(storage: &dyn Storage) -> Result<Vec<String>, DatabaseError> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = storage.list_dirs("", 256, token.as_deref()).await?;
            for name in page.names {
                if name == "sort_indexes" {
                    continue;
                }
                if storage
                    .file_exists(&join_paths(&name, "meta.dat"))
                    .await?
                {
                    names.push(name);
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        names.sort();
        Ok(names)
    }
}
