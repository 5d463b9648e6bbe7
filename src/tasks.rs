//! Hashing Worker Pool
//!
//! Fixed set of tokio workers that hash storage-resident files concurrently,
//! used by full verification where every file must be re-read. Each worker
//! opens its own storage handle from a [`StorageLocation`] so handles are
//! never shared across tasks; per-file failures go back to the requester
//! through the reply channel and a worker that exits is replaced by the
//! supervisor.

use crate::error::DatabaseError;
use crate::hash::hash_storage_file;
use crate::storage::retry::with_retry;
use crate::storage::StorageLocation;
use crate::types::Hash;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

struct HashTask {
    path: String,
    reply: oneshot::Sender<Result<Hash, DatabaseError>>,
}

type TaskReceiver = Arc<Mutex<mpsc::Receiver<HashTask>>>;

pub struct HashPool {
    sender: mpsc::Sender<HashTask>,
}

impl HashPool {
    /// Spawn `workers` hashing workers reading from `location`.
    pub fn new(location: StorageLocation, workers: usize) -> HashPool {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<HashTask>(workers * 2);
        let receiver: TaskReceiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..workers {
            Self::spawn_worker(worker_id, location.clone(), receiver.clone());
        }
        debug!(workers, "started hash pool");
        HashPool { sender }
    }

    fn spawn_worker(worker_id: usize, location: StorageLocation, receiver: TaskReceiver) {
        tokio::spawn(async move {
            let handle =
                tokio::spawn(Self::worker_loop(worker_id, location.clone(), receiver.clone()));
            // Replace the worker if its task dies instead of draining the
            // channel to completion.
            if handle.await.is_err() {
                warn!(worker_id, "hash worker panicked, replacing");
                Self::spawn_worker(worker_id, location, receiver);
            }
        });
    }

    async fn worker_loop(worker_id: usize, location: StorageLocation, receiver: TaskReceiver) {
        let storage = location.open();
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(task) = task else {
                debug!(worker_id, "hash worker shutting down");
                break;
            };

            let result = with_retry("hash", || hash_storage_file(storage.as_ref(), &task.path))
                .await
                .map_err(DatabaseError::from);
            // The requester may have given up; nothing to do then.
            let _ = task.reply.send(result);
        }
    }

    /// Hash one file through the pool.
    pub async fn hash_file(&self, path: &str) -> Result<Hash, DatabaseError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(HashTask {
                path: path.to_string(),
                reply,
            })
            .await
            .map_err(|_| DatabaseError::TaskFailed {
                attempts: 1,
                message: "hash pool is shut down".to_string(),
            })?;

        response.await.map_err(|_| DatabaseError::TaskFailed {
            attempts: 1,
            message: "hash worker dropped the task".to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;

    async fn pool_with_files(count: usize, workers: usize) -> (HashPool, Vec<(String, Hash)>) {
        let storage = Arc::new(MemoryStorage::new());
        let mut expected = Vec::new();
        for i in 0..count {
            let path = format!("original/{:03}", i);
            let data = vec![i as u8; 1000 + i];
            storage.write(&path, None, data.clone()).await.unwrap();
            expected.push((path, hash_bytes(&data)));
        }
        (
            HashPool::new(StorageLocation::Memory(storage), workers),
            expected,
        )
    }

    #[tokio::test]
    async fn test_concurrent_hashing_matches_direct() {
        let (pool, expected) = pool_with_files(40, 4).await;

        let mut handles = Vec::new();
        let pool = Arc::new(pool);
        for (path, hash) in expected {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                assert_eq!(pool.hash_file(&path).await.unwrap(), hash);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_file_reports_error_per_task() {
        let (pool, expected) = pool_with_files(1, 2).await;

        assert!(pool.hash_file("original/does-not-exist").await.is_err());
        // The pool keeps serving after a failed task.
        let (path, hash) = &expected[0];
        assert_eq!(pool.hash_file(path).await.unwrap(), *hash);
    }
}
