use crate::integration::test_utils::{asset_file, asset_path, local_db_with};

#[tokio::test]
async fn unchanged_database_verifies_clean() {
    let (mut db, _dir) = local_db_with(&[("a.jpg", b"one"), ("b.jpg", b"two")]).await;

    let cached = db.verify(false).await.unwrap();
    assert!(cached.is_clean());
    assert_eq!(cached.total_files, 2);
    assert_eq!(cached.unmodified, 2);

    let full = db.verify(true).await.unwrap();
    assert!(full.is_clean());
    assert_eq!(full.unmodified, 2);
}

#[tokio::test]
async fn on_disk_tamper_detected() {
    let (mut db, dir) = local_db_with(&[("a.jpg", b"one"), ("b.jpg", b"two")]).await;

    // Overwriting on disk moves size and mtime, so the cached mode already
    // refuses to trust the stale digest.
    std::fs::write(asset_file(dir.path(), b"one"), b"corrupted bytes").unwrap();

    let result = db.verify(false).await.unwrap();
    assert_eq!(result.modified, vec![asset_path(b"one")]);
    assert_eq!(result.unmodified, 1);
    assert!(result.removed.is_empty());
}

#[tokio::test]
async fn missing_and_stray_files_reported() {
    let (mut db, dir) = local_db_with(&[("a.jpg", b"one")]).await;

    std::fs::remove_file(asset_file(dir.path(), b"one")).unwrap();
    std::fs::write(dir.path().join("original/stray.bin"), b"dropped in").unwrap();

    let result = db.verify(false).await.unwrap();
    assert_eq!(result.removed, vec![asset_path(b"one")]);
    assert_eq!(result.new, vec!["original/stray.bin".to_string()]);
    assert_eq!(result.unmodified, 0);
}

#[tokio::test]
async fn repair_restores_damage_from_replica() {
    let (mut damaged, damaged_dir) =
        local_db_with(&[("a.jpg", b"one"), ("b.jpg", b"two"), ("c.jpg", b"three")]).await;
    let (good, _good_dir) =
        local_db_with(&[("a.jpg", b"one"), ("b.jpg", b"two"), ("c.jpg", b"three")]).await;

    std::fs::write(asset_file(damaged_dir.path(), b"one"), b"flipped").unwrap();
    std::fs::remove_file(asset_file(damaged_dir.path(), b"two")).unwrap();

    let result = damaged.repair_from(&good).await.unwrap();
    let mut repaired = result.repaired.clone();
    repaired.sort();
    let mut expected = vec![asset_path(b"one"), asset_path(b"two")];
    expected.sort();
    assert_eq!(repaired, expected);
    assert!(result.unrepaired.is_empty());

    // The database is whole again, even under a full rehash.
    let after = damaged.verify(true).await.unwrap();
    assert!(after.is_clean());
    assert_eq!(after.unmodified, 3);
}

#[tokio::test]
async fn repair_never_deletes_stray_files() {
    let (mut db, dir) = local_db_with(&[("a.jpg", b"one")]).await;
    let (good, _good_dir) = local_db_with(&[("a.jpg", b"one")]).await;

    let stray = dir.path().join("original/keep-me.bin");
    std::fs::write(&stray, b"local data").unwrap();

    let result = db.repair_from(&good).await.unwrap();
    assert_eq!(
        result.verification.new,
        vec!["original/keep-me.bin".to_string()]
    );
    assert!(stray.exists());
}
