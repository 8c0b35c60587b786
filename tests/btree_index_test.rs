use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use garnetdb::common::types::Rid;
use garnetdb::index::btree::BPlusTree;

mod common;
use common::create_test_buffer_pool;

fn rid(n: i32) -> Rid {
    Rid::new(0, n as u32)
}

fn collect_keys(tree: &BPlusTree<i32>) -> Result<Vec<i32>> {
    let mut keys = Vec::new();
    for entry in tree.iter()? {
        let (key, _) = entry?;
        keys.push(key);
    }
    Ok(keys)
}

#[test]
fn test_empty_tree() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree: BPlusTree<i32> = BPlusTree::new("empty", buffer_pool)?;

    assert!(tree.is_empty());
    assert_eq!(tree.find(&42)?, None);
    assert!(tree.iter()?.next().is_none());
    assert!(!tree.remove(&42)?);
    Ok(())
}

#[test]
fn test_insert_and_find() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(50)?;
    let tree: BPlusTree<i32> = BPlusTree::new("lookup", buffer_pool)?;

    let entries = [(5, 1001), (3, 1002), (8, 1003), (2, 1004), (7, 1005)];
    for &(key, value) in &entries {
        assert!(tree.insert(key, rid(value))?);
    }

    for &(key, value) in &entries {
        assert_eq!(tree.find(&key)?, Some(rid(value)));
    }
    assert_eq!(tree.find(&100)?, None);
    Ok(())
}

#[test]
fn test_duplicate_insert_is_rejected() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree: BPlusTree<i32> = BPlusTree::new("unique", buffer_pool)?;

    assert!(tree.insert(1, rid(10))?);
    assert!(!tree.insert(1, rid(20))?);
    assert_eq!(tree.find(&1)?, Some(rid(10)));
    Ok(())
}

// Sequential inserts with fanout 3 drive leaf and internal splits; an
// in-order walk of the leaf chain must yield the keys sorted.
#[test]
fn test_sequential_inserts_with_small_fanout() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(50)?;
    let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("seq", buffer_pool, 3, 3)?;

    for key in 1..=8 {
        assert!(tree.insert(key, rid(key))?);
    }

    assert_eq!(collect_keys(&tree)?, (1..=8).collect::<Vec<_>>());
    for key in 1..=8 {
        assert_eq!(tree.find(&key)?, Some(rid(key)));
    }
    Ok(())
}

// Removing a key from an underfull leaf redistributes with a neighbour and
// keeps the in-order traversal intact.
#[test]
fn test_remove_triggers_rebalance() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(50)?;
    let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("rebalance", buffer_pool, 3, 3)?;

    for key in 1..=8 {
        tree.insert(key, rid(key))?;
    }

    assert!(tree.remove(&4)?);
    assert_eq!(collect_keys(&tree)?, vec![1, 2, 3, 5, 6, 7, 8]);
    assert_eq!(tree.find(&4)?, None);
    assert!(!tree.remove(&4)?);
    Ok(())
}

#[test]
fn test_insert_then_drain_in_reverse() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(100)?;
    let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("drain", buffer_pool, 3, 3)?;

    for key in 1..=50 {
        assert!(tree.insert(key, rid(key))?);
    }
    for key in (1..=50).rev() {
        assert!(tree.remove(&key)?, "key {key} should be present");
        assert_eq!(tree.find(&key)?, None);
    }

    assert!(tree.is_empty());
    assert!(tree.iter()?.next().is_none());
    Ok(())
}

#[test]
fn test_shuffled_workload() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(200)?;
    let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("shuffled", buffer_pool, 5, 5)?;

    let mut rng = StdRng::seed_from_u64(0xB7E55);
    let mut keys: Vec<i32> = (0..400).collect();
    keys.shuffle(&mut rng);

    for &key in &keys {
        assert!(tree.insert(key, rid(key))?);
    }
    for &key in &keys {
        assert_eq!(tree.find(&key)?, Some(rid(key)));
    }
    assert_eq!(collect_keys(&tree)?, (0..400).collect::<Vec<_>>());

    // Remove a shuffled half and verify the rest survives
    let (gone, kept) = keys.split_at(200);
    for &key in gone {
        assert!(tree.remove(&key)?);
    }
    for &key in gone {
        assert_eq!(tree.find(&key)?, None);
    }
    for &key in kept {
        assert_eq!(tree.find(&key)?, Some(rid(key)));
    }

    let mut expected: Vec<i32> = kept.to_vec();
    expected.sort_unstable();
    assert_eq!(collect_keys(&tree)?, expected);
    Ok(())
}

#[test]
fn test_seeded_iterator_and_range_scan() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(100)?;
    let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("ranges", buffer_pool, 4, 4)?;

    for key in (0..100).step_by(2) {
        tree.insert(key, rid(key))?;
    }

    // Seeded on a present key
    let mut iter = tree.iter_from(&50)?;
    let (first, _) = iter.next().unwrap()?;
    assert_eq!(first, 50);

    // Seeded between keys lands on the next larger one
    let mut iter = tree.iter_from(&51)?;
    let (first, _) = iter.next().unwrap()?;
    assert_eq!(first, 52);

    let rids = tree.range_scan(&10, &20)?;
    assert_eq!(rids.len(), 6); // 10, 12, 14, 16, 18, 20

    assert!(tree.range_scan(&60, &40)?.is_empty());
    Ok(())
}

// The root page id is persisted in the header page, so an index reopened
// over the same database file finds its data again.
#[test]
fn test_reopen_from_header_page() -> Result<()> {
    let (file, path) = common::create_temp_db_file()?;

    {
        let buffer_pool = std::sync::Arc::new(garnetdb::BufferPoolManager::new(50, &path)?);
        let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("accounts", buffer_pool.clone(), 4, 4)?;
        for key in 0..30 {
            tree.insert(key, rid(key))?;
        }
        buffer_pool.flush_all_pages()?;
    }

    let buffer_pool = std::sync::Arc::new(garnetdb::BufferPoolManager::new(50, &path)?);
    let tree: BPlusTree<i32> = BPlusTree::with_max_sizes("accounts", buffer_pool, 4, 4)?;
    assert!(!tree.is_empty());
    for key in 0..30 {
        assert_eq!(tree.find(&key)?, Some(rid(key)));
    }

    drop(file);
    Ok(())
}

#[test]
fn test_two_indexes_share_the_directory() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(100)?;

    let orders: BPlusTree<i32> = BPlusTree::with_max_sizes("orders", buffer_pool.clone(), 4, 4)?;
    let users: BPlusTree<i32> = BPlusTree::with_max_sizes("users", buffer_pool, 4, 4)?;

    for key in 0..20 {
        orders.insert(key, rid(key))?;
        users.insert(key, rid(1000 + key))?;
    }

    assert_eq!(orders.find(&7)?, Some(rid(7)));
    assert_eq!(users.find(&7)?, Some(rid(1007)));
    Ok(())
}
