//! Prefix-scoping storage decorator.
//!
//! Scopes every operation under a fixed subtree of the wrapped storage. The
//! metadata store is typically the asset store scoped to `metadata/`.

use crate::error::StorageError;
use crate::storage::{join_paths, normalize_path, ByteStream, FileInfo, Storage, StoragePage};
use async_trait::async_trait;
use std::sync::Arc;

pub struct PrefixStorage {
    inner: Arc<dyn Storage>,
    prefix: String,
}

impl PrefixStorage {
    pub fn new(inner: Arc<dyn Storage>, prefix: &str) -> Result<Self, StorageError> {
        Ok(Self {
            inner,
            prefix: normalize_path(prefix)?,
        })
    }

    fn scoped(&self, path: &str) -> Result<String, StorageError> {
        Ok(join_paths(&self.prefix, &normalize_path(path)?))
    }
}

#[async_trait]
impl Storage for PrefixStorage {
    async fn is_empty(&self, dir: &str) -> Result<bool, StorageError> {
        self.inner.is_empty(&self.scoped(dir)?).await
    }

    async fn list_files(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        self.inner
            .list_files(&self.scoped(dir)?, page_size, next)
            .await
    }

    async fn list_dirs(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        self.inner
            .list_dirs(&self.scoped(dir)?, page_size, next)
            .await
    }

    async fn file_exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.file_exists(&self.scoped(path)?).await
    }

    async fn dir_exists(&self, dir: &str) -> Result<bool, StorageError> {
        self.inner.dir_exists(&self.scoped(dir)?).await
    }

    async fn info(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        self.inner.info(&self.scoped(path)?).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.read(&self.scoped(path)?).await
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError> {
        self.inner.read_stream(&self.scoped(path)?).await
    }

    async fn write(
        &self,
        path: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.inner.write(&self.scoped(path)?, content_type, data).await
    }

    async fn write_stream(
        &self,
        path: &str,
        content_type: Option<&str>,
        stream: &mut ByteStream,
        length: Option<u64>,
    ) -> Result<(), StorageError> {
        self.inner
            .write_stream(&self.scoped(path)?, content_type, stream, length)
            .await
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        self.inner.delete_file(&self.scoped(path)?).await
    }

    async fn delete_dir(&self, dir: &str) -> Result<(), StorageError> {
        self.inner.delete_dir(&self.scoped(dir)?).await
    }
}
