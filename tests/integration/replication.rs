use crate::integration::test_utils::{asset_path, input_dir, local_db, local_db_with};
use anyhow::Result;
use async_trait::async_trait;
use mediavault::add::{AddOptions, AssetProcessor};
use mediavault::blocks::DatabaseUpdate;
use mediavault::database::METADATA_COLLECTION;
use mediavault::error::DatabaseError;
use mediavault::hash::hash_bytes;
use mediavault::replicate::{ReplicateOptions, SyncConflict};
use mediavault::storage::Storage;
use serde_json::{json, Value};

#[tokio::test]
async fn replication_converges_across_backends() -> Result<()> {
    let (source, _src_dir) =
        local_db_with(&[("a.jpg", b"one"), ("b.jpg", b"two"), ("c.jpg", b"three")]).await;
    let (mut dest, _dest_dir) = local_db().await;

    let result = dest
        .replicate_from(&source, &ReplicateOptions::default())
        .await?;
    assert_eq!(result.copied_files, 3);
    assert_eq!(dest.root_hash(), source.root_hash());
    assert_eq!(dest.records_hash(), source.records_hash());

    // Destination verifies clean against its adopted tree.
    let verification = dest.verify(true).await?;
    assert!(verification.is_clean());

    // Re-running replication is a no-op.
    let again = dest
        .replicate_from(&source, &ReplicateOptions::default())
        .await?;
    assert_eq!(again.copied_files, 0);
    assert_eq!(again.copied_records, 0);
    assert!(again.pruned_files.is_empty());
    Ok(())
}

#[tokio::test]
async fn record_blocks_replay_on_replica() -> Result<()> {
    let (mut source, _src_dir) = local_db_with(&[("a.jpg", b"one")]).await;
    let Value::Object(doc) = json!({ "_id": "album-1", "title": "summer" }) else {
        unreachable!()
    };
    source
        .record_updates(vec![DatabaseUpdate::Upsert {
            collection: "albums".to_string(),
            document: doc,
            timestamp: 10_000,
        }])
        .await?;
    source
        .record_updates(vec![DatabaseUpdate::FieldUpdate {
            collection: "albums".to_string(),
            record_id: "album-1".to_string(),
            field: "title".to_string(),
            value: json!("summer 2026"),
            timestamp: 20_000,
        }])
        .await?;
    source.save().await?;

    let (mut dest, _dest_dir) = local_db().await;
    dest.replicate_from(&source, &ReplicateOptions::default())
        .await?;

    let doc = dest
        .collection("albums")
        .await?
        .get_one("album-1")
        .await?
        .expect("replayed record present");
    assert_eq!(doc["title"], json!("summer 2026"));
    Ok(())
}

#[tokio::test]
async fn sync_protects_local_changes_until_forced() -> Result<()> {
    let (source, _src_dir) = local_db_with(&[("shared.jpg", b"shared")]).await;
    let (mut dest, dest_dir) =
        local_db_with(&[("shared.jpg", b"shared"), ("mine.jpg", b"local-only")]).await;

    let refused = dest.sync_from(&source, false).await?;
    assert!(refused
        .conflicts
        .contains(&SyncConflict::DestOnly(asset_path(b"local-only"))));
    assert!(refused.replication.is_none());
    assert!(dest_dir.path().join(asset_path(b"local-only")).exists());

    let forced = dest.sync_from(&source, true).await?;
    let replication = forced.replication.expect("forced sync replicates");
    assert_eq!(replication.pruned_files, vec![asset_path(b"local-only")]);
    assert_eq!(dest.root_hash(), source.root_hash());
    assert!(!dest_dir.path().join(asset_path(b"local-only")).exists());
    Ok(())
}

struct FailingRenditions;

#[async_trait]
impl AssetProcessor for FailingRenditions {
    async fn process(
        &self,
        _storage: &dyn Storage,
        _asset_path: &str,
        _content_type: &str,
    ) -> Result<(), DatabaseError> {
        Err(DatabaseError::Validation("rendition generation failed".to_string()))
    }
}

#[tokio::test]
async fn failed_import_leaves_no_record_history() -> Result<()> {
    let (mut source, _src_dir) = local_db().await;
    let input = input_dir(&[("a.jpg", b"one")]);
    let summary = source
        .add_files(
            &[input.path().to_path_buf()],
            AddOptions {
                check_only: false,
                processor: Some(&FailingRenditions),
            },
        )
        .await?;
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_added, 0);

    let id = hash_bytes(b"one").to_hex();
    assert!(source
        .collection(METADATA_COLLECTION)
        .await?
        .get_one(&id)
        .await?
        .is_none());

    // Nothing about the failed import reaches a replica, not even through
    // block replay.
    let (mut dest, _dest_dir) = local_db().await;
    dest.replicate_from(&source, &ReplicateOptions::default())
        .await?;
    assert!(dest
        .collection(METADATA_COLLECTION)
        .await?
        .get_one(&id)
        .await?
        .is_none());
    assert_eq!(dest.tree().len(), 0);
    Ok(())
}

#[tokio::test]
async fn import_counter_survives_replication() -> Result<()> {
    let (source, _src_dir) = local_db_with(&[("a.jpg", b"one"), ("b.jpg", b"two")]).await;
    assert_eq!(source.summary().total_imports, 2);

    let (mut dest, _dest_dir) = local_db().await;
    let result = dest
        .replicate_from(&source, &ReplicateOptions::default())
        .await?;
    assert_eq!(result.files_imported, 2);
    assert_eq!(dest.summary().total_imports, 2);
    Ok(())
}
