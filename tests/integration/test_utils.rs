use mediavault::add::AddOptions;
use mediavault::config::DatabaseConfig;
use mediavault::database::{MediaFileDatabase, ORIGINAL_DIR};
use mediavault::hash::hash_bytes;
use mediavault::storage::StorageLocation;
use std::path::Path;
use tempfile::TempDir;

/// A database on local disk plus the directory holding it.
pub async fn local_db() -> (MediaFileDatabase, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = MediaFileDatabase::create(
        StorageLocation::Local {
            root: dir.path().to_path_buf(),
        },
        DatabaseConfig::default(),
    )
    .await
    .unwrap();
    (db, dir)
}

/// Write media files into a fresh input directory.
pub fn input_dir(files: &[(&str, &[u8])]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

/// Create a local database populated with the given files.
pub async fn local_db_with(files: &[(&str, &[u8])]) -> (MediaFileDatabase, TempDir) {
    let (mut db, dir) = local_db().await;
    let input = input_dir(files);
    db.add_files(&[input.path().to_path_buf()], AddOptions::default())
        .await
        .unwrap();
    (db, dir)
}

/// Storage-relative asset path for the given content.
pub fn asset_path(content: &[u8]) -> String {
    format!("{}/{}", ORIGINAL_DIR, hash_bytes(content).to_hex())
}

/// Absolute on-disk path of the stored asset.
pub fn asset_file(db_root: &Path, content: &[u8]) -> std::path::PathBuf {
    db_root.join(asset_path(content))
}
