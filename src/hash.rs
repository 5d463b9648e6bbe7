//! Hash Engine
//!
//! Streaming BLAKE3 digests over storage streams. The digest of a byte
//! sequence is identical across backends regardless of source path or
//! metadata; this is the identity used for deduplication, Merkle nodes, and
//! integrity checks.

use crate::error::StorageError;
use crate::storage::{ByteStream, Storage};
use crate::types::Hash;
use tokio::io::AsyncReadExt;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Hash an in-memory byte slice.
pub fn hash_bytes(data: &[u8]) -> Hash {
    Hash::from_bytes(*blake3::hash(data).as_bytes())
}

/// Hash an async stream without buffering the whole content. I/O errors from
/// the underlying stream propagate unchanged.
pub async fn hash_stream(stream: &mut ByteStream) -> Result<Hash, StorageError> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];

    loop {
        let bytes_read = stream.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Hash::from_bytes(*hasher.finalize().as_bytes()))
}

/// Hash a file held by a storage backend, streaming.
pub async fn hash_storage_file(storage: &dyn Storage, path: &str) -> Result<Hash, StorageError> {
    let mut stream = storage.read_stream(path).await?;
    hash_stream(&mut stream).await
}

/// Hash a local file, streaming.
pub async fn hash_local_file(path: &std::path::Path) -> Result<Hash, StorageError> {
    let file = tokio::fs::File::open(path).await?;
    let mut stream: ByteStream = Box::new(file);
    hash_stream(&mut stream).await
}
