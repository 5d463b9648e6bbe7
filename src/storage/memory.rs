//! In-memory storage backend.
//!
//! Used by tests and ephemeral replicas. Honors the same path and pagination
//! contracts as the filesystem backend, so engine tests run against it
//! unchanged.

use crate::error::StorageError;
use crate::storage::{normalize_path, ByteStream, FileInfo, Storage, StoragePage};
use crate::types::{now_millis, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Clone)]
struct MemoryFile {
    data: Vec<u8>,
    content_type: Option<String>,
    last_modified: Timestamp,
}

#[derive(Default)]
pub struct MemoryStorage {
    files: RwLock<BTreeMap<String, MemoryFile>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a file's modification time. Test hook for exercising the
    /// cache-trust boundary (spoofed mtime).
    pub fn set_last_modified(&self, path: &str, last_modified: Timestamp) {
        if let Some(file) = self.files.write().get_mut(path) {
            file.last_modified = last_modified;
        }
    }

    /// Overwrite file bytes without touching size or mtime. Test hook for
    /// simulating out-of-band tampering.
    pub fn tamper(&self, path: &str, data: Vec<u8>) {
        if let Some(file) = self.files.write().get_mut(path) {
            file.data = data;
        }
    }

    /// Direct children of `dir`: (name, is_dir) pairs in sorted order.
    fn children(&self, dir: &str) -> Vec<(String, bool)> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let files = self.files.read();
        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for path in files.keys() {
            let rest = match path.strip_prefix(&prefix) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };
            match rest.split_once('/') {
                Some((first, _)) => {
                    children.insert(first.to_string(), true);
                }
                None => {
                    children.entry(rest.to_string()).or_insert(false);
                }
            }
        }
        children.into_iter().collect()
    }

    fn paginate(
        mut names: Vec<String>,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        if let Some(token) = next {
            if token.is_empty() {
                return Err(StorageError::InvalidContinuationToken(
                    "empty token".to_string(),
                ));
            }
            let token = token.to_string();
            names.retain(|n| *n > token);
        }
        let has_more = names.len() > page_size;
        names.truncate(page_size);
        let next = if has_more { names.last().cloned() } else { None };
        Ok(StoragePage { names, next })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn is_empty(&self, dir: &str) -> Result<bool, StorageError> {
        let dir = normalize_path(dir)?;
        Ok(self.children(&dir).is_empty())
    }

    async fn list_files(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        let dir = normalize_path(dir)?;
        let names = self
            .children(&dir)
            .into_iter()
            .filter(|(_, is_dir)| !is_dir)
            .map(|(name, _)| name)
            .collect();
        Self::paginate(names, page_size, next)
    }

    async fn list_dirs(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        let dir = normalize_path(dir)?;
        let names = self
            .children(&dir)
            .into_iter()
            .filter(|(_, is_dir)| *is_dir)
            .map(|(name, _)| name)
            .collect();
        Self::paginate(names, page_size, next)
    }

    async fn file_exists(&self, path: &str) -> Result<bool, StorageError> {
        let path = normalize_path(path)?;
        Ok(self.files.read().contains_key(&path))
    }

    async fn dir_exists(&self, dir: &str) -> Result<bool, StorageError> {
        let dir = normalize_path(dir)?;
        Ok(self.children(&dir).iter().any(|_| true))
    }

    async fn info(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        let path = normalize_path(path)?;
        Ok(self.files.read().get(&path).map(|file| FileInfo {
            length: file.data.len() as u64,
            last_modified: file.last_modified,
            content_type: file.content_type.clone(),
        }))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let normalized = normalize_path(path)?;
        self.files
            .read()
            .get(&normalized)
            .map(|file| file.data.clone())
            .ok_or_else(|| StorageError::FileNotFound(path.to_string()))
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError> {
        let data = self.read(path).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn write(
        &self,
        path: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let path = normalize_path(path)?;
        self.files.write().insert(
            path,
            MemoryFile {
                data,
                content_type: content_type.map(String::from),
                last_modified: now_millis(),
            },
        );
        Ok(())
    }

    async fn write_stream(
        &self,
        path: &str,
        content_type: Option<&str>,
        stream: &mut ByteStream,
        _length: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(stream, &mut data).await?;
        self.write(path, content_type, data).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize_path(path)?;
        self.files.write().remove(&path);
        Ok(())
    }

    async fn delete_dir(&self, dir: &str) -> Result<(), StorageError> {
        let dir = normalize_path(dir)?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        self.files
            .write()
            .retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }
}
