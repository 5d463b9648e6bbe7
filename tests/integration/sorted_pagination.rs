use crate::integration::test_utils::local_db;
use mediavault::config::DatabaseConfig;
use mediavault::database::MediaFileDatabase;
use mediavault::records::sort_index::SortDirection;
use mediavault::storage::local::LocalStorage;
use mediavault::storage::{Storage, StorageLocation};
use serde_json::{json, Value};
use std::collections::HashSet;
use tempfile::TempDir;

fn doc(id: &str, taken_at: i64) -> serde_json::Map<String, Value> {
    let Value::Object(map) = json!({ "_id": id, "taken_at": taken_at }) else {
        unreachable!()
    };
    map
}

#[tokio::test]
async fn sorted_pages_cover_every_record_in_order() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        sort_page_capacity: 4,
        ..DatabaseConfig::default()
    };
    let mut db = MediaFileDatabase::create(
        StorageLocation::Local {
            root: dir.path().to_path_buf(),
        },
        config,
    )
    .await
    .unwrap();
    let coll = db.collection("photos").await.unwrap();

    // Insertion order deliberately scrambled.
    for i in [37, 2, 91, 15, 68, 4, 50, 23, 80, 11, 99, 42, 7, 61, 30] {
        coll.upsert_one(doc(&format!("p{:03}", i), i)).await.unwrap();
    }
    coll.ensure_sort_index("taken_at", SortDirection::Asc)
        .await
        .unwrap();
    db.save().await.unwrap();

    let coll = db.collection("photos").await.unwrap();
    let mut seen = Vec::new();
    let mut page_id = None;
    let mut pages = 0;
    loop {
        let page = coll
            .get_sorted_page("taken_at", SortDirection::Asc, page_id)
            .await
            .unwrap();
        assert_eq!(page.total_records, 15);
        assert!(page.record_ids.len() <= 4);
        seen.extend(page.record_ids);
        pages += 1;
        match page.next_page_id {
            Some(next) => page_id = Some(next),
            None => break,
        }
    }

    let expected: Vec<String> = [2, 4, 7, 11, 15, 23, 30, 37, 42, 50, 61, 68, 80, 91, 99]
        .iter()
        .map(|i| format!("p{:03}", i))
        .collect();
    assert_eq!(seen, expected);
    assert!(pages > 1, "fifteen records must span several pages");

    let first = coll
        .get_sorted_page("taken_at", SortDirection::Asc, None)
        .await
        .unwrap();
    assert_eq!(first.total_pages, pages);
    assert!(first.previous_page_id.is_none());
}

#[tokio::test]
async fn descending_index_reverses_field_order() {
    let (mut db, _dir) = local_db().await;
    let coll = db.collection("photos").await.unwrap();
    for i in 1..=5 {
        coll.upsert_one(doc(&format!("p{}", i), i)).await.unwrap();
    }
    coll.ensure_sort_index("taken_at", SortDirection::Desc)
        .await
        .unwrap();

    let page = coll
        .get_sorted_page("taken_at", SortDirection::Desc, None)
        .await
        .unwrap();
    assert_eq!(page.record_ids, vec!["p5", "p4", "p3", "p2", "p1"]);
}

#[tokio::test]
async fn paginated_listing_is_complete_and_duplicate_free() {
    let dir = TempDir::new().unwrap();
    let storage = LocalStorage::new(dir.path().to_path_buf());

    let mut expected = HashSet::new();
    for i in 0..250 {
        let name = format!("file-{:04}", i);
        storage.write(&name, None, vec![i as u8]).await.unwrap();
        expected.insert(name);
    }

    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    loop {
        let page = storage.list_files("", 7, token.as_deref()).await.unwrap();
        for name in page.names {
            assert!(seen.insert(name), "duplicate listing entry");
        }
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, expected);
}
