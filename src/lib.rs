//! Mediavault: Content-Addressed Media File Database
//!
//! A media file database that stores each unique file once under its BLAKE3
//! digest and tracks integrity through a Merkle tree over the asset set.
//! Metadata lives in a sharded record store with its own hash aggregation;
//! verification, repair, replication, and offline reconciliation all reduce
//! to hash comparisons.

pub mod add;
pub mod blocks;
pub mod config;
pub mod database;
pub mod error;
pub mod hash;
pub mod hash_cache;
pub mod logging;
pub mod records;
pub mod replicate;
pub mod storage;
pub mod tasks;
pub mod tree;
pub mod types;
pub mod verify;

pub use add::{AddOptions, AddSummary, AssetProcessor};
pub use config::DatabaseConfig;
pub use database::{DatabaseSummary, MediaFileDatabase};
pub use error::{DatabaseError, StorageError};
pub use replicate::{ReplicateOptions, ReplicationResult, SyncConflict, SyncResult};
pub use storage::{Storage, StorageLocation};
pub use types::Hash;
pub use verify::{RepairResult, VerificationResult};
