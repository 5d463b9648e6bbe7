//! Transparent encryption decorator.
//!
//! Wraps any storage with a content transform applied on write and undone on
//! read. Key management lives outside this crate: callers supply a
//! [`ContentCipher`] and the database layer only records *that* a location is
//! encrypted (the `encryption.pub` marker), never key material.
//!
//! Metadata (`info`, listings) reports ciphertext sizes; the engines compare
//! sizes from the same storage instance against each other, so the transform
//! stays invisible to them.

use crate::error::StorageError;
use crate::storage::{ByteStream, FileInfo, Storage, StoragePage};
use async_trait::async_trait;
use std::sync::Arc;

/// Byte-level transform capability. Implementations must be deterministic per
/// (path, plaintext) so re-written identical content stays byte-identical at
/// rest.
pub trait ContentCipher: Send + Sync {
    fn encrypt(&self, path: &str, data: Vec<u8>) -> Vec<u8>;
    fn decrypt(&self, path: &str, data: Vec<u8>) -> Vec<u8>;
}

pub struct EncryptedStorage {
    inner: Arc<dyn Storage>,
    cipher: Arc<dyn ContentCipher>,
}

impl EncryptedStorage {
    pub fn new(inner: Arc<dyn Storage>, cipher: Arc<dyn ContentCipher>) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl Storage for EncryptedStorage {
    async fn is_empty(&self, dir: &str) -> Result<bool, StorageError> {
        self.inner.is_empty(dir).await
    }

    async fn list_files(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        self.inner.list_files(dir, page_size, next).await
    }

    async fn list_dirs(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        self.inner.list_dirs(dir, page_size, next).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.file_exists(path).await
    }

    async fn dir_exists(&self, dir: &str) -> Result<bool, StorageError> {
        self.inner.dir_exists(dir).await
    }

    async fn info(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        self.inner.info(path).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let ciphertext = self.inner.read(path).await?;
        Ok(self.cipher.decrypt(path, ciphertext))
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError> {
        // Decryption needs the full buffer; re-expose it as a stream so
        // callers keep a single code path.
        let plaintext = self.read(path).await?;
        Ok(Box::new(std::io::Cursor::new(plaintext)))
    }

    async fn write(
        &self,
        path: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let ciphertext = self.cipher.encrypt(path, data);
        self.inner.write(path, content_type, ciphertext).await
    }

    async fn write_stream(
        &self,
        path: &str,
        content_type: Option<&str>,
        stream: &mut ByteStream,
        _length: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut plaintext = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(stream, &mut plaintext).await?;
        self.write(path, content_type, plaintext).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        self.inner.delete_file(path).await
    }

    async fn delete_dir(&self, dir: &str) -> Result<(), StorageError> {
        self.inner.delete_dir(dir).await
    }
}
