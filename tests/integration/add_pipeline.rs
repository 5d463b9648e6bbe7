use crate::integration::test_utils::{asset_file, input_dir, local_db, local_db_with};
use mediavault::add::AddOptions;
use mediavault::config::DatabaseConfig;
use mediavault::database::{MediaFileDatabase, METADATA_COLLECTION};
use mediavault::hash::hash_bytes;
use mediavault::storage::StorageLocation;
use serde_json::json;

#[tokio::test]
async fn add_then_reload_from_disk() {
    let (db, dir) = local_db_with(&[("a.jpg", b"alpha"), ("b.png", b"beta")]).await;
    let root_hash = db.root_hash();
    let summary = db.summary();
    drop(db);

    // A fresh process sees exactly the same state.
    let mut reloaded = MediaFileDatabase::load(
        StorageLocation::Local {
            root: dir.path().to_path_buf(),
        },
        DatabaseConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(reloaded.root_hash(), root_hash);
    assert_eq!(reloaded.summary(), summary);
    assert_eq!(reloaded.summary().total_files, 2);

    let id = hash_bytes(b"alpha").to_hex();
    let doc = reloaded
        .collection(METADATA_COLLECTION)
        .await
        .unwrap()
        .get_one(&id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["content_type"], json!("image/jpeg"));
    assert!(asset_file(dir.path(), b"alpha").exists());
}

#[tokio::test]
async fn readding_same_inputs_changes_nothing() {
    let (mut db, _dir) = local_db_with(&[("a.jpg", b"alpha"), ("b.jpg", b"beta")]).await;
    let root_before = db.root_hash();
    let records_before = db.records_hash();

    let input = input_dir(&[("a.jpg", b"alpha"), ("b.jpg", b"beta")]);
    let summary = db
        .add_files(&[input.path().to_path_buf()], AddOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.files_added, 0);
    assert_eq!(summary.files_already_added, 2);
    assert_eq!(db.root_hash(), root_before);
    assert_eq!(db.records_hash(), records_before);
}

#[tokio::test]
async fn same_bytes_under_different_names_stored_once() {
    let (mut db, dir) = local_db().await;
    let input = input_dir(&[
        ("holiday.jpg", b"pixels"),
        ("copy-of-holiday.jpg", b"pixels"),
        ("unrelated.jpg", b"other"),
    ]);

    let summary = db
        .add_files(&[input.path().to_path_buf()], AddOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.files_added, 2);
    assert_eq!(summary.files_already_added, 1);
    assert_eq!(db.tree().len(), 2);
    assert!(asset_file(dir.path(), b"pixels").exists());
}

#[tokio::test]
async fn mixed_batch_counts_every_outcome() {
    let (mut db, _dir) = local_db().await;
    let input = input_dir(&[
        ("a.jpg", b"media"),
        ("b.jpg", b"media"),
        ("notes.txt", b"ignored"),
        ("data.bin", b"ignored too"),
    ]);

    let summary = db
        .add_files(&[input.path().to_path_buf()], AddOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.files_added, 1);
    assert_eq!(summary.files_already_added, 1);
    assert_eq!(summary.files_ignored, 2);
    assert_eq!(summary.files_failed, 0);
    assert_eq!(summary.total_size, b"media".len() as u64);
}

#[tokio::test]
async fn check_mode_leaves_database_untouched() {
    let (mut db, dir) = local_db().await;
    let input = input_dir(&[("a.jpg", b"alpha")]);

    let summary = db.check_files(&[input.path().to_path_buf()]).await.unwrap();

    assert_eq!(summary.files_added, 1);
    assert_eq!(db.tree().len(), 0);
    assert!(!asset_file(dir.path(), b"alpha").exists());
}
