//! Property-based tests for asset tree determinism

use mediavault::hash::hash_bytes;
use mediavault::records::shard_id_for;
use mediavault::tree::{AssetTree, FileRecord};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn record(name: u8, content: u64) -> FileRecord {
    FileRecord {
        path: format!("original/{:03}", name),
        hash: hash_bytes(&content.to_be_bytes()),
        size: 8,
        last_modified: content as i64,
    }
}

/// The root hash depends only on the final leaf set, never on the order or
/// history of the mutations that produced it.
#[test]
fn test_mutation_history_does_not_leak_into_root_hash() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<Vec<(u8, u64, bool)>>(), |ops| {
            let mut tree = AssetTree::new();
            let mut surviving: BTreeMap<String, FileRecord> = BTreeMap::new();

            for (name, content, delete) in &ops {
                let rec = record(*name, *content);
                if *delete {
                    tree.delete_item(&rec.path);
                    surviving.remove(&rec.path);
                } else {
                    tree.add_file_hash(rec.clone());
                    surviving.insert(rec.path.clone(), rec);
                }
            }

            let mut rebuilt = AssetTree::new();
            for rec in surviving.values() {
                rebuilt.add_file_hash(rec.clone());
            }

            assert_eq!(tree.root_hash(), rebuilt.root_hash());
            assert_eq!(tree.len(), surviving.len());
            Ok(())
        })
        .unwrap();
}

/// Reversed insertion order converges on the same root hash.
#[test]
fn test_insertion_order_independence() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<Vec<(u8, u64)>>(), |files| {
            let mut dedup: BTreeMap<u8, u64> = BTreeMap::new();
            for (name, content) in &files {
                dedup.insert(*name, *content);
            }

            let mut forward = AssetTree::new();
            for (name, content) in &dedup {
                forward.add_file_hash(record(*name, *content));
            }
            let mut reverse = AssetTree::new();
            for (name, content) in dedup.iter().rev() {
                reverse.add_file_hash(record(*name, *content));
            }

            assert_eq!(forward.root_hash(), reverse.root_hash());
            Ok(())
        })
        .unwrap();
}

/// In-order iteration is always path-sorted, whatever the mutation history.
#[test]
fn test_iteration_stays_path_sorted() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<Vec<(u8, bool)>>(), |ops| {
            let mut tree = AssetTree::new();
            for (name, delete) in &ops {
                let rec = record(*name, *name as u64);
                if *delete {
                    tree.delete_item(&rec.path);
                } else {
                    tree.add_file_hash(rec);
                }
            }

            let paths: Vec<&str> = tree.iter().map(|r| r.path.as_str()).collect();
            let mut sorted = paths.clone();
            sorted.sort();
            assert_eq!(paths, sorted);
            Ok(())
        })
        .unwrap();
}

/// Changing one leaf's content always moves the root hash.
#[test]
fn test_leaf_content_feeds_root_hash() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(any::<u8>(), any::<u64>(), any::<u64>()),
            |(name, content, changed)| {
                prop_assume!(content != changed);

                let mut tree = AssetTree::new();
                tree.add_file_hash(record(name, content));
                let before = tree.root_hash();

                tree.add_file_hash(record(name, changed));
                assert_ne!(tree.root_hash(), before);
                assert_eq!(tree.len(), 1);
                Ok(())
            },
        )
        .unwrap();
}

/// Shard routing stays in range and is a pure function of its inputs.
#[test]
fn test_shard_routing_bounds_and_determinism() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(any::<String>(), 1u32..10_000), |(id, shard_count)| {
            let shard = shard_id_for(&id, shard_count);
            assert!(shard < shard_count);
            assert_eq!(shard, shard_id_for(&id, shard_count));
            Ok(())
        })
        .unwrap();
}
