//! Storage Abstraction
//!
//! Capability interface over a byte-addressed hierarchical store. Every higher
//! component (tree, record store, pipelines) depends only on this trait, never
//! on a concrete backend. Paths are always forward-slash relative; pagination
//! tokens are opaque strings.

pub mod encrypted;
pub mod local;
pub mod memory;
pub mod prefix;
pub mod retry;

use crate::error::StorageError;
use crate::types::Timestamp;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Size in bytes.
    pub length: u64,
    /// Last-modified time in epoch milliseconds.
    pub last_modified: Timestamp,
    /// Content type, when the backend records one.
    pub content_type: Option<String>,
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default)]
pub struct StoragePage {
    /// Entry names (not full paths), in lexicographic order.
    pub names: Vec<String>,
    /// Opaque continuation token; `None` means the listing is exhausted.
    pub next: Option<String>,
}

/// Boxed async byte stream returned by `read_stream`.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Capability interface over a hierarchical byte store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// True if the directory contains no files or subdirectories.
    /// A directory that does not exist is empty.
    async fn is_empty(&self, dir: &str) -> Result<bool, StorageError>;

    /// List files directly under `dir`, paginated.
    async fn list_files(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError>;

    /// List directories directly under `dir`, paginated.
    async fn list_dirs(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError>;

    async fn file_exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn dir_exists(&self, dir: &str) -> Result<bool, StorageError>;

    /// File metadata, or `None` if the file does not exist.
    async fn info(&self, path: &str) -> Result<Option<FileInfo>, StorageError>;

    /// Read the whole file. Fails with `FileNotFound` if absent.
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Open a streaming reader. Fails with `FileNotFound` if absent.
    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError>;

    /// Write the whole file atomically, creating parent directories.
    async fn write(
        &self,
        path: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// Write a file from a stream. `length` is advisory; backends that need an
    /// up-front length may buffer when it is absent.
    async fn write_stream(
        &self,
        path: &str,
        content_type: Option<&str>,
        stream: &mut ByteStream,
        length: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Delete a file. Deleting a missing file is not an error.
    async fn delete_file(&self, path: &str) -> Result<(), StorageError>;

    /// Delete a directory and everything under it.
    async fn delete_dir(&self, dir: &str) -> Result<(), StorageError>;
}

/// Serializable-in-spirit descriptor from which a worker can open its own
/// storage handle instead of sharing a live one. The memory backend carries
/// its handle directly since there is nothing to reopen; the encrypted
/// variant carries its cipher the same way (key material never serializes).
#[derive(Clone)]
pub enum StorageLocation {
    Local { root: PathBuf },
    Memory(Arc<memory::MemoryStorage>),
    Encrypted {
        inner: Box<StorageLocation>,
        cipher: Arc<dyn encrypted::ContentCipher>,
    },
}

impl StorageLocation {
    pub fn open(&self) -> Arc<dyn Storage> {
        match self {
            StorageLocation::Local { root } => Arc::new(local::LocalStorage::new(root.clone())),
            StorageLocation::Memory(storage) => storage.clone(),
            StorageLocation::Encrypted { inner, cipher } => Arc::new(
                encrypted::EncryptedStorage::new(inner.open(), cipher.clone()),
            ),
        }
    }
}

impl std::fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            StorageLocation::Memory(_) => f.write_str("Memory"),
            StorageLocation::Encrypted { inner, .. } => {
                f.debug_struct("Encrypted").field("inner", inner).finish()
            }
        }
    }
}

/// Normalize a storage path: forward slashes, no leading slash, no `.`/`..`
/// segments, no empty segments.
pub fn normalize_path(path: &str) -> Result<String, StorageError> {
    if path.contains('\\') {
        return Err(StorageError::InvalidPath(format!(
            "backslash in storage path: {}",
            path
        )));
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(StorageError::InvalidPath(format!(
                    "parent traversal in storage path: {}",
                    path
                )))
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Join two storage paths, tolerating an empty prefix or suffix.
pub fn join_paths(prefix: &str, suffix: &str) -> String {
    match (prefix.is_empty(), suffix.is_empty()) {
        (true, _) => suffix.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}/{}", prefix.trim_end_matches('/'), suffix),
    }
}

/// Collect every file path under `dir` (recursively), driving the paginated
/// listing so arbitrarily large trees never load one giant listing.
pub async fn list_files_recursive(
    storage: &dyn Storage,
    dir: &str,
    page_size: usize,
) -> Result<Vec<String>, StorageError> {
    let mut result = Vec::new();
    let mut pending = vec![dir.to_string()];

    while let Some(current) = pending.pop() {
        let mut token: Option<String> = None;
        loop {
            let page = storage
                .list_files(&current, page_size, token.as_deref())
                .await?;
            for name in page.names {
                result.push(join_paths(&current, &name));
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let mut token: Option<String> = None;
        loop {
            let page = storage
                .list_dirs(&current, page_size, token.as_deref())
                .await?;
            for name in page.names {
                pending.push(join_paths(&current, &name));
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
    }

    result.sort();
    Ok(result)
}
