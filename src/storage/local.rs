//! Local filesystem storage backend.
//!
//! Writes are atomic (temp file + rename) so an interrupted process never
//! leaves a half-written blob at its final path. Listings are returned in
//! lexicographic order with the last returned name as the continuation token,
//! which keeps tokens stable even when entries are inserted between pages.

use crate::error::StorageError;
use crate::storage::{normalize_path, ByteStream, FileInfo, Storage, StoragePage};
use crate::types::timestamp_millis;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let normalized = normalize_path(path)?;
        let mut resolved = self.root.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            resolved.push(segment);
        }
        Ok(resolved)
    }

    /// Staging path for an atomic write. The suffix is appended to the full
    /// file name, so `x` and `x.dat` never share a staging file.
    fn temp_path(resolved: &Path) -> PathBuf {
        let mut name = resolved
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".mvtmp");
        resolved.with_file_name(name)
    }

    /// List sorted entry names under `dir`, filtered by `want_dir`.
    async fn list_entries(
        &self,
        dir: &str,
        want_dirs: bool,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        let dir_path = self.resolve(dir)?;
        if !dir_path.is_dir() {
            return Ok(StoragePage::default());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() == want_dirs && (file_type.is_dir() || file_type.is_file()) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        // Continuation token is the last name of the previous page; an empty
        // token can never have come from a listing.
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
impl Storage for LocalStorage {
    async fn is_empty(&self, dir: &str) -> Result<bool, StorageError> {
        let dir_path = self.resolve(dir)?;
        if !dir_path.is_dir() {
            return Ok(true);
        }
        let mut entries = fs::read_dir(&dir_path).await?;
        Ok(entries.next_entry().await?.is_none())
    }

    async fn list_files(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        self.list_entries(dir, false, page_size, next).await
    }

    async fn list_dirs(
        &self,
        dir: &str,
        page_size: usize,
        next: Option<&str>,
    ) -> Result<StoragePage, StorageError> {
        self.list_entries(dir, true, page_size, next).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(path)?.is_file())
    }

    async fn dir_exists(&self, dir: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(dir)?.is_dir())
    }

    async fn info(&self, path: &str) -> Result<Option<FileInfo>, StorageError> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => {
                let last_modified = metadata
                    .modified()
                    .map(timestamp_millis)
                    .unwrap_or_default();
                Ok(Some(FileInfo {
                    length: metadata.len(),
                    last_modified,
                    content_type: None,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let resolved = self.resolve(path)?;
        match fs::read(&resolved).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError> {
        let resolved = self.resolve(path)?;
        match fs::File::open(&resolved).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(
        &self,
        path: &str,
        _content_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path(&resolved);
        fs::write(&temp_path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &resolved).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        trace!(path, bytes = data.len(), "wrote file");
        Ok(())
    }

    async fn write_stream(
        &self,
        path: &str,
        _content_type: Option<&str>,
        stream: &mut ByteStream,
        _length: Option<u64>,
    ) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path(&resolved);
        let mut file = fs::File::create(&temp_path).await?;
        if let Err(e) = tokio::io::copy(stream, &mut file).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        file.flush().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &resolved).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        match fs::remove_file(&resolved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_dir(&self, dir: &str) -> Result<(), StorageError> {
        let resolved = self.resolve(dir)?;
        match fs::remove_dir_all(&resolved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
