//! Tests for Hash-Order Navigation
//!
//! Most tests use a hash function that keeps key order, so hash order and
//! key order coincide and results can be checked against plain ranges.

use std::sync::Arc;

use pagehash::codec::LongSerializer;
use pagehash::config::Config;
use pagehash::hashindex::LocalHashTable;
use pagehash::page::FilePageCache;
use pagehash::{HashFunction, NoopAtomicOperation, Xxh3HashFunction};
use tempfile::TempDir;

type OrderedTable = LocalHashTable<i64, i64>;

const KEYS: i64 = 1000;

// =============================================================================
// Helper Functions
// =============================================================================

/// Places non-negative keys in the top bits, keeping key order
struct OrderedHash;

impl HashFunction<i64> for OrderedHash {
    fn hash_code(&self, key: &i64) -> u64 {
        (*key as u64) << 48
    }
}

fn setup_temp_table(hash: Arc<dyn HashFunction<i64>>) -> (TempDir, OrderedTable) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .page_size(4096)
        .page_cache_capacity(256)
        .build();
    let cache = Arc::new(FilePageCache::new(config.clone()).unwrap());
    let table = OrderedTable::create(
        "nav",
        cache,
        &config,
        Arc::new(LongSerializer),
        Arc::new(LongSerializer),
        hash,
        &NoopAtomicOperation,
    )
    .unwrap();
    (temp_dir, table)
}

fn setup_ordered_table() -> (TempDir, OrderedTable) {
    let (temp_dir, table) = setup_temp_table(Arc::new(OrderedHash));
    for key in 0..KEYS {
        table.put(&NoopAtomicOperation, Some(&key), key * 10).unwrap();
    }
    (temp_dir, table)
}

fn keys_of(entries: &[pagehash::HashEntry<i64, i64>]) -> Vec<i64> {
    entries.iter().map(|entry| entry.key).collect()
}

fn assert_consecutive(keys: &[i64]) {
    for pair in keys.windows(2) {
        assert_eq!(pair[0] + 1, pair[1], "{keys:?}");
    }
}

// =============================================================================
// Single Step Tests
// =============================================================================

#[test]
fn test_first_and_last_entry() {
    let (_temp, table) = setup_ordered_table();

    let first = table.first_entry().unwrap().unwrap();
    assert_eq!((first.key, first.value), (0, 0));
    assert_eq!(first.hash_code, 0);

    let last = table.last_entry().unwrap().unwrap();
    assert_eq!((last.key, last.value), (KEYS - 1, (KEYS - 1) * 10));
}

#[test]
fn test_empty_table_has_no_ends() {
    let (_temp, table) = setup_temp_table(Arc::new(OrderedHash));
    assert!(table.first_entry().unwrap().is_none());
    assert!(table.last_entry().unwrap().is_none());
    assert!(table.higher_entries(&5, None).unwrap().is_empty());
}

#[test]
fn test_higher_and_ceiling() {
    let (_temp, table) = setup_ordered_table();

    let higher = keys_of(&table.higher_entries(&500, None).unwrap());
    assert_eq!(higher.first(), Some(&501));
    assert_consecutive(&higher);

    let ceiling = keys_of(&table.ceiling_entries(&500).unwrap());
    assert_eq!(ceiling.first(), Some(&500));
    assert_consecutive(&ceiling);
}

#[test]
fn test_lower_and_floor() {
    let (_temp, table) = setup_ordered_table();

    let lower = keys_of(&table.lower_entries(&500).unwrap());
    assert_eq!(lower.last(), Some(&499));
    assert_consecutive(&lower);

    let floor = keys_of(&table.floor_entries(&500).unwrap());
    assert_eq!(floor.last(), Some(&500));
    assert_consecutive(&floor);
}

#[test]
fn test_navigation_past_the_ends() {
    let (_temp, table) = setup_ordered_table();

    assert!(table.higher_entries(&(KEYS - 1), None).unwrap().is_empty());
    assert!(table.lower_entries(&0).unwrap().is_empty());

    assert_eq!(keys_of(&table.ceiling_entries(&(KEYS - 1)).unwrap()), vec![KEYS - 1]);
    assert_eq!(keys_of(&table.floor_entries(&0).unwrap()), vec![0]);
}

#[test]
fn test_higher_entries_limit() {
    let (_temp, table) = setup_ordered_table();

    let entries = table.higher_entries(&0, Some(3)).unwrap();
    assert_eq!(keys_of(&entries), vec![1, 2, 3]);
    assert_eq!(entries[1].value, 20);
}

#[test]
fn test_navigation_from_absent_key() {
    let (_temp, table) = setup_ordered_table();
    for key in 400..600 {
        table.remove(&NoopAtomicOperation, Some(&key)).unwrap();
    }

    let higher = keys_of(&table.higher_entries(&450, None).unwrap());
    assert_eq!(higher.first(), Some(&600));

    let lower = keys_of(&table.lower_entries(&550).unwrap());
    assert_eq!(lower.last(), Some(&399));
}

// =============================================================================
// Full Walk Tests
// =============================================================================

#[test]
fn test_forward_walk_visits_every_key() {
    let (_temp, table) = setup_ordered_table();

    let mut walked = vec![table.first_entry().unwrap().unwrap().key];
    loop {
        let last = *walked.last().unwrap();
        let batch = table.higher_entries(&last, None).unwrap();
        if batch.is_empty() {
            break;
        }
        walked.extend(keys_of(&batch));
    }

    assert_eq!(walked, (0..KEYS).collect::<Vec<_>>());
}

#[test]
fn test_backward_walk_visits_every_key() {
    let (_temp, table) = setup_ordered_table();

    let mut walked = vec![table.last_entry().unwrap().unwrap().key];
    loop {
        let first = *walked.last().unwrap();
        let batch = table.lower_entries(&first).unwrap();
        if batch.is_empty() {
            break;
        }
        walked.extend(keys_of(&batch).into_iter().rev());
    }

    assert_eq!(walked, (0..KEYS).rev().collect::<Vec<_>>());
}

#[test]
fn test_walk_follows_hash_order() {
    let (_temp, table) = setup_temp_table(Arc::new(Xxh3HashFunction::<i64, _>::new(
        LongSerializer,
    )));
    for key in 0..3_000i64 {
        table.put(&NoopAtomicOperation, Some(&key), key).unwrap();
    }

    let first = table.first_entry().unwrap().unwrap();
    let mut walked = vec![first];
    loop {
        let last = walked.last().unwrap().key;
        let batch = table.higher_entries(&last, None).unwrap();
        if batch.is_empty() {
            break;
        }
        walked.extend(batch);
    }

    assert_eq!(walked.len(), 3_000);
    for pair in walked.windows(2) {
        assert!(pair[0].hash_code < pair[1].hash_code);
    }

    let mut keys = keys_of(&walked);
    keys.sort_unstable();
    assert_eq!(keys, (0..3_000i64).collect::<Vec<_>>());
}
