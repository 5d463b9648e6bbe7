//! Sort Index
//!
//! Disk-backed B-tree ordering a collection's records by one field, with an
//! `_id` tie-break. Every tree node is a page blob under
//! `sort_indexes/<collection>/<field>_<asc|desc>/`; leaves form a
//! doubly-linked chain so `get_page` can walk the whole index forward or
//! backward with exact totals.
//!
//! `build()` is the primary maintenance path (initial creation and repair);
//! `insert`/`remove` maintain the same on-disk page format incrementally.
//! Deletion does not merge or borrow from siblings; a rebuild is the
//! compaction story.

use crate::error::{DatabaseError, StorageError};
use crate::storage::{join_paths, Storage};
use crate::types::RecordId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default number of entries per page.
pub const DEFAULT_PAGE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

impl std::fmt::Display for SortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An orderable JSON field value. Values of different types sort by type rank
/// (null < bool < number < string < array < object); numbers compare by their
/// f64 total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonKey(pub Value);

impl Eq for JsonKey {}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

impl Ord for JsonKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = type_rank(&self.0).cmp(&type_rank(&other.0));
        if rank != Ordering::Equal {
            return rank;
        }
        match (&self.0, &other.0) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            // Rare for sortable fields; compared by canonical text.
            (a, b) => a.to_string().cmp(&b.to_string()),
        }
    }
}

impl PartialOrd for JsonKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One indexed record reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: JsonKey,
    pub record_id: RecordId,
}

#[derive(Debug, Serialize, Deserialize)]
enum Page {
    /// Routing node: (minimum key of subtree, child page id), key-sorted.
    Internal { children: Vec<(IndexEntry, u64)> },
    /// Chain node holding the actual ordered references.
    Leaf {
        entries: Vec<IndexEntry>,
        prev: Option<u64>,
        next: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexMeta {
    root: u64,
    first_leaf: u64,
    next_page_id: u64,
    total_records: u64,
    total_pages: u64,
    page_capacity: usize,
}

/// One page of sorted results.
#[derive(Debug, Clone)]
pub struct SortedPage {
    pub record_ids: Vec<RecordId>,
    pub current_page_id: u64,
    pub total_pages: u64,
    pub total_records: u64,
    pub previous_page_id: Option<u64>,
    pub next_page_id: Option<u64>,
}

/// Structural diagnostics, for operators rather than correctness.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStructure {
    pub node_count: u64,
    pub leaf_count: u64,
    pub depth: u32,
    pub total_records: u64,
    /// Mean leaf occupancy relative to page capacity, in [0, 1].
    pub avg_fill_factor: f64,
}

pub struct SortIndex {
    storage: Arc<dyn Storage>,
    dir: String,
    field: String,
    direction: SortDirection,
    meta: Option<IndexMeta>,
    page_capacity: usize,
}

impl SortIndex {
    pub fn new(
        storage: Arc<dyn Storage>,
        collection: &str,
        field: &str,
        direction: SortDirection,
        page_capacity: usize,
    ) -> Self {
        let dir = format!("sort_indexes/{}/{}_{}", collection, field, direction.as_str());
        Self {
            storage,
            dir,
            field: field.to_string(),
            direction,
            meta: None,
            page_capacity,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    /// Direction-aware ordering: field value first (reversed for descending),
    /// `_id` ascending as the tie-break.
    fn compare(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        let keys = match self.direction {
            SortDirection::Asc => a.key.cmp(&b.key),
            SortDirection::Desc => b.key.cmp(&a.key),
        };
        keys.then_with(|| a.record_id.cmp(&b.record_id))
    }

    fn meta_path(&self) -> String {
        join_paths(&self.dir, "index.dat")
    }

    fn page_path(&self, page_id: u64) -> String {
        join_paths(&self.dir, &format!("page-{}.dat", page_id))
    }

    /// Whether the index has been built (meta blob exists on disk or loaded).
    pub async fn exists(&self) -> Result<bool, StorageError> {
        if self.meta.is_some() {
            return Ok(true);
        }
        self.storage.file_exists(&self.meta_path()).await
    }

    async fn load_meta(&mut self) -> Result<&IndexMeta, DatabaseError> {
        if self.meta.is_none() {
            let path = self.meta_path();
            if !self.storage.file_exists(&path).await? {
                return Err(DatabaseError::SortIndexNotFound {
                    field: self.field.clone(),
                    direction: self.direction.to_string(),
                });
            }
            let bytes = self.storage.read(&path).await?;
            // JSON framing: page and meta blobs carry document field values,
            // which only a self-describing format can round-trip.
            let meta: IndexMeta = serde_json::from_slice(&bytes)
                .map_err(|e| DatabaseError::Corruption(format!("sort index meta: {}", e)))?;
            self.meta = Some(meta);
        }
        Ok(self.meta.as_ref().expect("meta just loaded"))
    }

    async fn save_meta(&self) -> Result<(), StorageError> {
        let meta = self.meta.as_ref().expect("meta present when saving");
        let bytes = serde_json::to_vec(meta).map_err(StorageError::serialization)?;
        self.storage.write(&self.meta_path(), None, bytes).await
    }

    async fn read_page(&self, page_id: u64) -> Result<Page, DatabaseError> {
        let path = self.page_path(page_id);
        if !self.storage.file_exists(&path).await? {
            return Err(DatabaseError::PageNotFound(page_id));
        }
        let bytes = self.storage.read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::Corruption(format!("sort index page {}: {}", page_id, e)))
    }

    async fn write_page(&self, page_id: u64, page: &Page) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(page).map_err(StorageError::serialization)?;
        self.storage.write(&self.page_path(page_id), None, bytes).await
    }

    /// Full rebuild from the collection's current entries. Discards any
    /// existing pages. Used for initial creation and repair.
    #[instrument(skip(self, entries), fields(field = %self.field, direction = %self.direction))]
    pub async fn build(&mut self, mut entries: Vec<IndexEntry>) -> Result<(), DatabaseError> {
        entries.sort_by(|a, b| self.compare(a, b));
        self.storage.delete_dir(&self.dir).await?;

        let total_records = entries.len() as u64;
        let capacity = self.page_capacity;
        let mut next_page_id: u64 = 1;

        // Leaf level: fixed-capacity chunks chained together.
        let mut leaves: Vec<(u64, IndexEntry)> = Vec::new(); // (page id, min entry)
        let chunks: Vec<Vec<IndexEntry>> = if entries.is_empty() {
            vec![Vec::new()]
        } else {
            entries
                .chunks(capacity)
                .map(|c| c.to_vec())
                .collect()
        };

        let leaf_ids: Vec<u64> = (0..chunks.len())
            .map(|i| next_page_id + i as u64)
            .collect();
        next_page_id += chunks.len() as u64;

        for (i, chunk) in chunks.iter().enumerate() {
            let min_entry = chunk.first().cloned().unwrap_or(IndexEntry {
                key: JsonKey(Value::Null),
                record_id: String::new(),
            });
            leaves.push((leaf_ids[i], min_entry));

            let page = Page::Leaf {
                entries: chunk.clone(),
                prev: (i > 0).then(|| leaf_ids[i - 1]),
                next: (i + 1 < leaf_ids.len()).then(|| leaf_ids[i + 1]),
            };
            self.write_page(leaf_ids[i], &page).await?;
        }

        let total_pages = leaf_ids.len() as u64;
        let first_leaf = leaf_ids[0];

        // Internal levels, bottom-up, until a single root remains.
        let mut level = leaves;
        while level.len() > 1 {
            let mut parents = Vec::new();
            for group in level.chunks(capacity.max(2)) {
                let page_id = next_page_id;
                next_page_id += 1;
                let children: Vec<(IndexEntry, u64)> = group
                    .iter()
                    .map(|(id, min)| (min.clone(), *id))
                    .collect();
                let min_entry = children[0].0.clone();
                self.write_page(page_id, &Page::Internal { children }).await?;
                parents.push((page_id, min_entry));
            }
            level = parents;
        }

        self.meta = Some(IndexMeta {
            root: level[0].0,
            first_leaf,
            next_page_id,
            total_records,
            total_pages,
            page_capacity: capacity,
        });
        self.save_meta().await?;
        debug!(records = total_records, pages = total_pages, "built sort index");
        Ok(())
    }

    /// Fetch one page of ordered results. `None` returns the first page.
    pub async fn get_page(&mut self, page_id: Option<u64>) -> Result<SortedPage, DatabaseError> {
        let meta = self.load_meta().await?.clone();
        let current = page_id.unwrap_or(meta.first_leaf);

        match self.read_page(current).await? {
            Page::Leaf { entries, prev, next } => Ok(SortedPage {
                record_ids: entries.into_iter().map(|e| e.record_id).collect(),
                current_page_id: current,
                total_pages: meta.total_pages,
                total_records: meta.total_records,
                previous_page_id: prev,
                next_page_id: next,
            }),
            Page::Internal { .. } => Err(DatabaseError::PageNotFound(current)),
        }
    }

    /// Incrementally add one entry, splitting pages on overflow.
    pub async fn insert(&mut self, key: JsonKey, record_id: RecordId) -> Result<(), DatabaseError> {
        self.load_meta().await?;
        let entry = IndexEntry { key, record_id };
        let mut meta = self.meta.clone().expect("meta loaded");

        // Descend to the target leaf, remembering the path of internal pages.
        let mut path: Vec<(u64, Page)> = Vec::new();
        let mut current = meta.root;
        let mut leaf = loop {
            match self.read_page(current).await? {
                Page::Internal { children } => {
                    let slot = Self::route(&children, &entry, |a, b| self.compare(a, b));
                    let child = children[slot].1;
                    path.push((current, Page::Internal { children }));
                    current = child;
                }
                leaf @ Page::Leaf { .. } => break leaf,
            }
        };

        // Insert in sorted position within the leaf.
        let Page::Leaf { entries, next, .. } = &mut leaf else {
            unreachable!("descent ends at a leaf");
        };
        let pos = entries
            .partition_point(|existing| self.compare(existing, &entry) != Ordering::Greater);
        entries.insert(pos, entry);
        meta.total_records += 1;

        // Split on overflow; the separator carries the right page's minimum.
        let mut carry: Option<(IndexEntry, u64)> = None;
        if entries.len() > meta.page_capacity {
            let mid = entries.len() / 2;
            let right_entries: Vec<IndexEntry> = entries.split_off(mid);
            let right_id = meta.next_page_id;
            meta.next_page_id += 1;
            meta.total_pages += 1;

            let right_page = Page::Leaf {
                entries: right_entries.clone(),
                prev: Some(current),
                next: *next,
            };
            if let Some(old_next) = *next {
                if let Page::Leaf {
                    entries: n_entries,
                    prev: _,
                    next: n_next,
                } = self.read_page(old_next).await?
                {
                    self.write_page(
                        old_next,
                        &Page::Leaf {
                            entries: n_entries,
                            prev: Some(right_id),
                            next: n_next,
                        },
                    )
                    .await?;
                }
            }
            *next = Some(right_id);
            self.write_page(right_id, &right_page).await?;
            carry = Some((right_entries[0].clone(), right_id));
        }
        self.write_page(current, &leaf).await?;

        // Propagate splits upward.
        while let Some((parent_id, parent)) = path.pop() {
            let Page::Internal { mut children } = parent else {
                unreachable!("path holds internal pages");
            };
            if let Some((sep, new_child)) = carry.take() {
                let pos = children
                    .partition_point(|(min, _)| self.compare(min, &sep) != Ordering::Greater);
                children.insert(pos, (sep, new_child));

                if children.len() > meta.page_capacity.max(2) {
                    let mid = children.len() / 2;
                    let right: Vec<(IndexEntry, u64)> = children.split_off(mid);
                    let right_id = meta.next_page_id;
                    meta.next_page_id += 1;
                    let right_min = right[0].0.clone();
                    self.write_page(right_id, &Page::Internal { children: right })
                        .await?;
                    carry = Some((right_min, right_id));
                }
            }
            self.write_page(parent_id, &Page::Internal { children }).await?;
        }

        // A carry that survives the whole path grows the tree by one level.
        if let Some((sep, new_child)) = carry {
            let old_root = meta.root;
            let old_min = self.subtree_min(old_root).await?;
            let new_root_id = meta.next_page_id;
            meta.next_page_id += 1;
            let children = vec![(old_min, old_root), (sep, new_child)];
            self.write_page(new_root_id, &Page::Internal { children }).await?;
            meta.root = new_root_id;
        }

        self.meta = Some(meta);
        self.save_meta().await?;
        Ok(())
    }

    /// Remove one (key, record id) entry. Pages are never merged; rebuild
    /// compacts.
    pub async fn remove(&mut self, key: &JsonKey, record_id: &str) -> Result<bool, DatabaseError> {
        self.load_meta().await?;
        let target = IndexEntry {
            key: key.clone(),
            record_id: record_id.to_string(),
        };
        let mut meta = self.meta.clone().expect("meta loaded");

        let mut current = meta.root;
        loop {
            match self.read_page(current).await? {
                Page::Internal { children } => {
                    let slot = Self::route(&children, &target, |a, b| self.compare(a, b));
                    current = children[slot].1;
                }
                Page::Leaf { mut entries, prev, next } => {
                    let before = entries.len();
                    entries.retain(|e| !(e.key == target.key && e.record_id == target.record_id));
                    if entries.len() == before {
                        return Ok(false);
                    }
                    meta.total_records -= (before - entries.len()) as u64;
                    self.write_page(current, &Page::Leaf { entries, prev, next })
                        .await?;
                    self.meta = Some(meta);
                    self.save_meta().await?;
                    return Ok(true);
                }
            }
        }
    }

    /// Child slot for `entry`: the last child whose minimum is not greater,
    /// defaulting to the first.
    fn route<F>(children: &[(IndexEntry, u64)], entry: &IndexEntry, compare: F) -> usize
    where
        F: Fn(&IndexEntry, &IndexEntry) -> Ordering,
    {
        let idx = children.partition_point(|(min, _)| compare(min, entry) != Ordering::Greater);
        idx.saturating_sub(1)
    }

    async fn subtree_min(&self, page_id: u64) -> Result<IndexEntry, DatabaseError> {
        let mut current = page_id;
        loop {
            match self.read_page(current).await? {
                Page::Internal { children } => current = children[0].1,
                Page::Leaf { entries, .. } => {
                    return Ok(entries.first().cloned().unwrap_or(IndexEntry {
                        key: JsonKey(Value::Null),
                        record_id: String::new(),
                    }))
                }
            }
        }
    }

    /// Structural statistics: node/leaf counts, depth, fill factor.
    pub async fn analyze_tree_structure(&mut self) -> Result<IndexStructure, DatabaseError> {
        let meta = self.load_meta().await?.clone();
        let mut node_count = 0u64;
        let mut leaf_count = 0u64;
        let mut leaf_entries = 0u64;
        let mut depth = 0u32;

        let mut level = vec![meta.root];
        while !level.is_empty() {
            depth += 1;
            let mut next_level = Vec::new();
            for page_id in level {
                node_count += 1;
                match self.read_page(page_id).await? {
                    Page::Internal { children } => {
                        next_level.extend(children.iter().map(|(_, id)| *id));
                    }
                    Page::Leaf { entries, .. } => {
                        leaf_count += 1;
                        leaf_entries += entries.len() as u64;
                    }
                }
            }
            level = next_level;
        }

        let avg_fill_factor = if leaf_count == 0 {
            0.0
        } else {
            leaf_entries as f64 / (leaf_count as f64 * meta.page_capacity as f64)
        };

        Ok(IndexStructure {
            node_count,
            leaf_count,
            depth,
            total_records: meta.total_records,
            avg_fill_factor,
        })
    }

    /// Indented dump of the page tree, for debugging.
    pub async fn visualize_tree(&mut self) -> Result<String, DatabaseError> {
        let meta = self.load_meta().await?.clone();
        let mut out = String::new();
        let mut stack = vec![(meta.root, 0usize)];
        while let Some((page_id, indent)) = stack.pop() {
            let pad = "  ".repeat(indent);
            match self.read_page(page_id).await? {
                Page::Internal { children } => {
                    out.push_str(&format!(
                        "{}internal page-{} ({} children)\n",
                        pad,
                        page_id,
                        children.len()
                    ));
                    for (_, child) in children.iter().rev() {
                        stack.push((*child, indent + 1));
                    }
                }
                Page::Leaf { entries, prev, next } => {
                    out.push_str(&format!(
                        "{}leaf page-{} ({} entries, prev={:?}, next={:?})\n",
                        pad,
                        page_id,
                        entries.len(),
                        prev,
                        next
                    ));
                }
            }
        }
        Ok(out)
    }
}
