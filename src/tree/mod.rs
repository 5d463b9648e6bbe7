//! Asset Merkle Tree
//!
//! Binary search tree over file records, sorted by path, where every node's
//! hash is a function of its record and its children's hashes. The root hash
//! is the single source of truth for "has anything changed" comparisons in
//! verify and replicate.
//!
//! Nodes live in an arena and rebalancing uses rotations with priorities
//! derived from the path hash, so the shape — and therefore the root hash —
//! depends only on the set of leaves, never on insertion order. Two databases
//! holding the same files agree on their root hash regardless of the order
//! the files arrived in.

pub mod persistence;

use crate::types::{Hash, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::ControlFlow;

/// Leaf payload: one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Storage-relative path; unique key, sort order of the tree.
    pub path: String,
    /// Content digest.
    pub hash: Hash,
    /// Size in bytes.
    pub size: u64,
    /// Last-modified time in epoch milliseconds.
    pub last_modified: Timestamp,
}

/// Database-level metadata carried in the tree blob, outside the hashed leaf
/// set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    /// Count of files ever imported, across the database's lifetime. Never
    /// decremented by deletions.
    pub files_imported: u64,
}

#[derive(Debug, Clone)]
struct Node {
    record: FileRecord,
    priority: u64,
    node_hash: Hash,
    left: Option<usize>,
    right: Option<usize>,
}

/// The asset Merkle tree. Exclusively owned by the database instance that
/// loaded it; all mutation funnels through that single owner.
#[derive(Debug, Clone, Default)]
pub struct AssetTree {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: Option<usize>,
    leaf_count: usize,
    pub metadata: DatabaseMetadata,
}

/// Rebalancing priority, derived from the path so the tree shape is a pure
/// function of the key set.
fn path_priority(path: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tree-priority");
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
}

fn empty_root_hash() -> Hash {
    Hash::from_bytes(*blake3::hash(b"empty-tree").as_bytes())
}

impl AssetTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    /// Aggregate hash of the entire leaf set. Changes iff any leaf's content
    /// hash, size, timestamp, or the path set changes.
    pub fn root_hash(&self) -> Hash {
        match self.root {
            Some(idx) => self.nodes[idx].node_hash,
            None => empty_root_hash(),
        }
    }

    /// Look up a record by exact path.
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        let mut current = self.root;
        while let Some(idx) = current {
            let node = &self.nodes[idx];
            match path.cmp(node.record.path.as_str()) {
                Ordering::Equal => return Some(&node.record),
                Ordering::Less => current = node.left,
                Ordering::Greater => current = node.right,
            }
        }
        None
    }

    /// Insert or replace the record for its path. Ancestor hashes are
    /// recomputed bottom-up on the way back out.
    pub fn add_file_hash(&mut self, record: FileRecord) {
        let root = self.root;
        let (new_root, added) = self.insert_at(root, record);
        self.root = Some(new_root);
        if added {
            self.leaf_count += 1;
        }
    }

    /// Delete the leaf for `path`, recomputing ancestor hashes. Returns
    /// whether a leaf was removed.
    pub fn delete_item(&mut self, path: &str) -> bool {
        let root = self.root;
        let (new_root, removed) = self.remove_at(root, path);
        self.root = new_root;
        if removed {
            self.leaf_count -= 1;
        }
        removed
    }

    /// In-order traversal with early exit.
    pub fn traverse<F>(&self, visitor: &mut F)
    where
        F: FnMut(&FileRecord) -> ControlFlow<()>,
    {
        let _ = self.traverse_at(self.root, visitor);
    }

    /// Iterator over records in path-sorted order.
    pub fn iter(&self) -> TreeIter<'_> {
        let mut iter = TreeIter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_left(self.root);
        iter
    }

    /// Rebuild the tree from its own leaves, dropping every path under
    /// `exclude_prefix`. Used during format migration to remove a subtree
    /// (e.g. `metadata/`) from the hashed set.
    pub fn rebuild_tree(&mut self, exclude_prefix: &str) {
        let kept: Vec<FileRecord> = self
            .iter()
            .filter(|r| !r.path.starts_with(exclude_prefix))
            .cloned()
            .collect();

        let metadata = self.metadata.clone();
        *self = AssetTree::new();
        self.metadata = metadata;
        for record in kept {
            self.add_file_hash(record);
        }
    }

    fn alloc(&mut self, record: FileRecord) -> usize {
        let priority = path_priority(&record.path);
        let node = Node {
            priority,
            node_hash: Hash::ZERO,
            record,
            left: None,
            right: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.update_hash(idx);
        idx
    }

    fn release(&mut self, idx: usize) {
        self.free.push(idx);
    }

    /// Recompute a node's hash from its record and children. Every structural
    /// change calls this on the affected nodes, deepest first.
    fn update_hash(&mut self, idx: usize) {
        let node = &self.nodes[idx];
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tree-node");
        hasher.update(&(node.record.path.len() as u64).to_be_bytes());
        hasher.update(node.record.path.as_bytes());
        hasher.update(node.record.hash.as_bytes());
        hasher.update(&node.record.size.to_be_bytes());
        hasher.update(&node.record.last_modified.to_be_bytes());
        match node.left {
            Some(left) => hasher.update(self.nodes[left].node_hash.as_bytes()),
            None => hasher.update(Hash::ZERO.as_bytes()),
        };
        match node.right {
            Some(right) => hasher.update(self.nodes[right].node_hash.as_bytes()),
            None => hasher.update(Hash::ZERO.as_bytes()),
        };
        self.nodes[idx].node_hash = Hash::from_bytes(*hasher.finalize().as_bytes());
    }

    fn insert_at(&mut self, node: Option<usize>, record: FileRecord) -> (usize, bool) {
        let idx = match node {
            None => return (self.alloc(record), true),
            Some(idx) => idx,
        };

        let added;
        match record.path.cmp(&self.nodes[idx].record.path) {
            Ordering::Equal => {
                self.nodes[idx].record = record;
                added = false;
            }
            Ordering::Less => {
                let left = self.nodes[idx].left;
                let (child, was_added) = self.insert_at(left, record);
                added = was_added;
                self.nodes[idx].left = Some(child);
                if self.nodes[child].priority > self.nodes[idx].priority {
                    return (self.rotate_right(idx), added);
                }
            }
            Ordering::Greater => {
                let right = self.nodes[idx].right;
                let (child, was_added) = self.insert_at(right, record);
                added = was_added;
                self.nodes[idx].right = Some(child);
                if self.nodes[child].priority > self.nodes[idx].priority {
                    return (self.rotate_left(idx), added);
                }
            }
        }
        self.update_hash(idx);
        (idx, added)
    }

    fn rotate_right(&mut self, idx: usize) -> usize {
        let left = self.nodes[idx].left.expect("rotate_right requires left child");
        self.nodes[idx].left = self.nodes[left].right;
        self.nodes[left].right = Some(idx);
        self.update_hash(idx);
        self.update_hash(left);
        left
    }

    fn rotate_left(&mut self, idx: usize) -> usize {
        let right = self.nodes[idx].right.expect("rotate_left requires right child");
        self.nodes[idx].right = self.nodes[right].left;
        self.nodes[right].left = Some(idx);
        self.update_hash(idx);
        self.update_hash(right);
        right
    }

    fn remove_at(&mut self, node: Option<usize>, path: &str) -> (Option<usize>, bool) {
        let idx = match node {
            None => return (None, false),
            Some(idx) => idx,
        };

        match path.cmp(self.nodes[idx].record.path.as_str()) {
            Ordering::Less => {
                let left = self.nodes[idx].left;
                let (new_left, removed) = self.remove_at(left, path);
                self.nodes[idx].left = new_left;
                if removed {
                    self.update_hash(idx);
                }
                (Some(idx), removed)
            }
            Ordering::Greater => {
                let right = self.nodes[idx].right;
                let (new_right, removed) = self.remove_at(right, path);
                self.nodes[idx].right = new_right;
                if removed {
                    self.update_hash(idx);
                }
                (Some(idx), removed)
            }
            Ordering::Equal => {
                let (left, right) = (self.nodes[idx].left, self.nodes[idx].right);
                let merged = self.merge(left, right);
                self.release(idx);
                (merged, true)
            }
        }
    }

    /// Merge two subtrees where every key in `left` sorts before every key in
    /// `right`, preserving the priority heap order.
    fn merge(&mut self, left: Option<usize>, right: Option<usize>) -> Option<usize> {
        match (left, right) {
            (None, other) | (other, None) => other,
            (Some(l), Some(r)) => {
                if self.nodes[l].priority > self.nodes[r].priority {
                    let merged = self.merge(self.nodes[l].right, Some(r));
                    self.nodes[l].right = merged;
                    self.update_hash(l);
                    Some(l)
                } else {
                    let merged = self.merge(Some(l), self.nodes[r].left);
                    self.nodes[r].left = merged;
                    self.update_hash(r);
                    Some(r)
                }
            }
        }
    }

    fn traverse_at<F>(&self, node: Option<usize>, visitor: &mut F) -> ControlFlow<()>
    where
        F: FnMut(&FileRecord) -> ControlFlow<()>,
    {
        if let Some(idx) = node {
            self.traverse_at(self.nodes[idx].left, visitor)?;
            visitor(&self.nodes[idx].record)?;
            self.traverse_at(self.nodes[idx].right, visitor)?;
        }
        ControlFlow::Continue(())
    }
}

/// In-order (path-sorted) iterator over tree records.
pub struct TreeIter<'a> {
    tree: &'a AssetTree,
    stack: Vec<usize>,
}

impl<'a> TreeIter<'a> {
    fn push_left(&mut self, mut node: Option<usize>) {
        while let Some(idx) = node {
            self.stack.push(idx);
            node = self.tree.nodes[idx].left;
        }
    }
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = &'a FileRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        self.push_left(self.tree.nodes[idx].right);
        Some(&self.tree.nodes[idx].record)
    }
}
