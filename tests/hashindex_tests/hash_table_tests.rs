//! Tests for the Local Hash Table
//!
//! These tests verify:
//! - Put / get / remove through bucket splits and merges
//! - Null key handling
//! - Validated puts and atomic operation brackets
//! - Size limits on keys and entries
//! - Persistence, clear and delete
//! - Concurrent access from several threads

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use pagehash::codec::{LongSerializer, StringSerializer};
use pagehash::config::{Config, ConfigBuilder};
use pagehash::hashindex::{LocalHashTable, Validation};
use pagehash::page::FilePageCache;
use pagehash::{AtomicOperation, NoopAtomicOperation, PageHashError, Xxh3HashFunction};
use tempfile::TempDir;

type LongTable = LocalHashTable<i64, String>;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_config(
    configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
) -> (TempDir, Config, Arc<FilePageCache>) {
    let temp_dir = TempDir::new().unwrap();
    let builder = Config::builder()
        .data_dir(temp_dir.path())
        .page_size(4096)
        .page_cache_capacity(512);
    let config = configure(builder).build();
    let cache = Arc::new(FilePageCache::new(config.clone()).unwrap());
    (temp_dir, config, cache)
}

fn create_long_table(config: &Config, cache: &Arc<FilePageCache>, name: &str) -> LongTable {
    LongTable::create(
        name,
        Arc::clone(cache),
        config,
        Arc::new(LongSerializer),
        Arc::new(StringSerializer),
        Arc::new(Xxh3HashFunction::<i64, _>::new(LongSerializer)),
        &NoopAtomicOperation,
    )
    .unwrap()
}

fn open_long_table(config: &Config, cache: &Arc<FilePageCache>, name: &str) -> LongTable {
    LongTable::open(
        name,
        Arc::clone(cache),
        config,
        Arc::new(LongSerializer),
        Arc::new(StringSerializer),
        Arc::new(Xxh3HashFunction::<i64, _>::new(LongSerializer)),
    )
    .unwrap()
}

fn value_of(i: i64) -> String {
    format!("{i:040}")
}

/// Atomic operation that records every component it brackets
#[derive(Default)]
struct RecordingOperation {
    components: Mutex<Vec<(String, bool)>>,
}

impl AtomicOperation for RecordingOperation {
    fn start_component(&self, _name: &str) {}

    fn end_component(&self, name: &str, rollback: bool) {
        self.components.lock().push((name.to_string(), rollback));
    }
}

// =============================================================================
// Basic Tests
// =============================================================================

#[test]
fn test_new_table_shape() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "shape");

    assert_eq!(table.size().unwrap(), 0);
    assert!(table.is_null_key_supported());

    let stats = table.check_invariants().unwrap();
    assert_eq!(stats.buckets, 256);
    assert_eq!(stats.max_bucket_depth, 8);
    assert_eq!(stats.directory_nodes, 1);
    assert_eq!(stats.directory_slots, 1);
    assert_eq!(stats.entries, 0);
}

#[test]
fn test_put_get_remove() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "basic");
    let op = NoopAtomicOperation;

    table.put(&op, Some(&1), "one".to_string()).unwrap();
    table.put(&op, Some(&2), "two".to_string()).unwrap();
    assert_eq!(table.size().unwrap(), 2);

    assert_eq!(table.get(Some(&1)).unwrap(), Some("one".to_string()));
    assert_eq!(table.get(Some(&3)).unwrap(), None);

    assert_eq!(table.remove(&op, Some(&1)).unwrap(), Some("one".to_string()));
    assert_eq!(table.remove(&op, Some(&1)).unwrap(), None);
    assert_eq!(table.get(Some(&1)).unwrap(), None);
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn test_update_changes_value_size() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "update");
    let op = NoopAtomicOperation;

    table.put(&op, Some(&7), "short".to_string()).unwrap();
    table.put(&op, Some(&7), "a considerably longer value".to_string()).unwrap();
    assert_eq!(
        table.get(Some(&7)).unwrap(),
        Some("a considerably longer value".to_string())
    );

    table.put(&op, Some(&7), "tiny".to_string()).unwrap();
    assert_eq!(table.get(Some(&7)).unwrap(), Some("tiny".to_string()));
    assert_eq!(table.size().unwrap(), 1);
    table.check_invariants().unwrap();
}

// =============================================================================
// Split and Merge Tests
// =============================================================================

#[test]
fn test_splits_and_merges() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "split");
    let op = NoopAtomicOperation;
    let count = 20_000i64;

    for i in 0..count {
        table.put(&op, Some(&i), value_of(i)).unwrap();
    }
    assert_eq!(table.size().unwrap(), count as u64);

    let grown = table.check_invariants().unwrap();
    assert_eq!(grown.entries, count as u64);
    assert!(grown.max_bucket_depth > 8);
    assert!(grown.buckets > 256);
    assert!(grown.directory_nodes > 1);

    for i in 0..count {
        assert_eq!(table.get(Some(&i)).unwrap(), Some(value_of(i)), "key {i}");
    }

    for i in 0..count {
        assert_eq!(table.remove(&op, Some(&i)).unwrap(), Some(value_of(i)), "key {i}");
    }
    assert_eq!(table.size().unwrap(), 0);

    let shrunk = table.check_invariants().unwrap();
    assert_eq!(shrunk.entries, 0);
    assert!(shrunk.buckets < grown.buckets);
    assert!(shrunk.directory_nodes < grown.directory_nodes);
    assert_eq!(shrunk.directory_slots, grown.directory_slots);

    // Freed buckets and directory nodes are recycled by the next round of
    // splits; the directory only grows once its free list is drained
    for i in 0..count {
        table.put(&op, Some(&i), value_of(i)).unwrap();
    }
    let regrown = table.check_invariants().unwrap();
    assert_eq!(regrown.entries, count as u64);
    assert!(
        regrown.directory_slots == grown.directory_slots
            || regrown.directory_slots == regrown.directory_nodes,
        "{grown:?} {regrown:?}"
    );
    for i in (0..count).step_by(97) {
        assert_eq!(table.get(Some(&i)).unwrap(), Some(value_of(i)));
    }
}

#[test]
fn test_interleaved_removal_keeps_invariants() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "interleaved");
    let op = NoopAtomicOperation;

    for i in 0..8_000i64 {
        table.put(&op, Some(&i), value_of(i)).unwrap();
    }
    for i in (0..8_000i64).filter(|i| i % 3 != 0) {
        table.remove(&op, Some(&i)).unwrap();
    }

    let stats = table.check_invariants().unwrap();
    assert_eq!(stats.entries, (0..8_000i64).filter(|i| i % 3 == 0).count() as u64);
    for i in 0..8_000i64 {
        let expected = (i % 3 == 0).then(|| value_of(i));
        assert_eq!(table.get(Some(&i)).unwrap(), expected);
    }
}

// =============================================================================
// Null Key Tests
// =============================================================================

#[test]
fn test_null_key() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "null");
    let op = NoopAtomicOperation;

    assert_eq!(table.get(None).unwrap(), None);
    table.put(&op, None, "nothing".to_string()).unwrap();
    table.put(&op, Some(&1), "one".to_string()).unwrap();
    assert_eq!(table.get(None).unwrap(), Some("nothing".to_string()));
    assert_eq!(table.size().unwrap(), 2);

    table.put(&op, None, "replaced".to_string()).unwrap();
    assert_eq!(table.size().unwrap(), 2);

    let stats = table.check_invariants().unwrap();
    assert!(stats.null_entry);
    assert_eq!(stats.entries, 1);

    assert_eq!(table.remove(&op, None).unwrap(), Some("replaced".to_string()));
    assert_eq!(table.remove(&op, None).unwrap(), None);
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn test_null_key_not_supported() {
    let (_temp, config, cache) = setup_temp_config(|b| b.null_key_supported(false));
    let table = create_long_table(&config, &cache, "no_null");
    let op = NoopAtomicOperation;

    assert!(!table.is_null_key_supported());
    assert!(matches!(
        table.put(&op, None, "x".to_string()),
        Err(PageHashError::NullKeyNotSupported(_))
    ));
    assert!(matches!(
        table.get(None),
        Err(PageHashError::NullKeyNotSupported(_))
    ));
    assert!(matches!(
        table.remove(&op, None),
        Err(PageHashError::NullKeyNotSupported(_))
    ));
}

// =============================================================================
// Validated Put Tests
// =============================================================================

#[test]
fn test_validated_put_ignore() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "ignore");
    let op = NoopAtomicOperation;

    table.put(&op, Some(&5), "kept".to_string()).unwrap();
    let written = table
        .validated_put(&op, Some(&5), "rejected".to_string(), |key, previous, new| {
            assert_eq!(key, Some(&5));
            assert_eq!(previous.map(String::as_str), Some("kept"));
            assert_eq!(new, "rejected");
            Ok(Validation::Ignore)
        })
        .unwrap();

    assert!(!written);
    assert_eq!(table.get(Some(&5)).unwrap(), Some("kept".to_string()));
}

#[test]
fn test_validated_put_store_substitutes_value() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "store");
    let op = NoopAtomicOperation;

    let written = table
        .validated_put(&op, Some(&9), "given".to_string(), |_, previous, new| {
            assert!(previous.is_none());
            Ok(Validation::Store(format!("{new}-checked")))
        })
        .unwrap();

    assert!(written);
    assert_eq!(table.get(Some(&9)).unwrap(), Some("given-checked".to_string()));
    assert_eq!(table.size().unwrap(), 1);

    let written = table
        .validated_put(&op, None, "null".to_string(), |key, _, _| {
            assert!(key.is_none());
            Ok(Validation::Store("null-checked".to_string()))
        })
        .unwrap();
    assert!(written);
    assert_eq!(table.get(None).unwrap(), Some("null-checked".to_string()));
}

#[test]
fn test_failed_validator_rolls_back_component() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "rollback");
    let op = RecordingOperation::default();

    table.put(&op, Some(&1), "one".to_string()).unwrap();
    let result = table.validated_put(&op, Some(&1), "two".to_string(), |_, _, _| {
        Err(PageHashError::Config("validator refused".to_string()))
    });
    assert!(matches!(result, Err(PageHashError::Config(_))));
    assert_eq!(table.get(Some(&1)).unwrap(), Some("one".to_string()));

    let components = op.components.lock();
    assert_eq!(
        *components,
        vec![("rollback".to_string(), false), ("rollback".to_string(), true)]
    );
}

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_key_too_large() {
    let (_temp, config, cache) = setup_temp_config(|b| b.max_key_size(16));
    let table = LocalHashTable::<String, String>::create(
        "keys",
        Arc::clone(&cache),
        &config,
        Arc::new(StringSerializer),
        Arc::new(StringSerializer),
        Arc::new(Xxh3HashFunction::<String, _>::new(StringSerializer)),
        &NoopAtomicOperation,
    )
    .unwrap();
    let op = NoopAtomicOperation;

    table.put(&op, Some(&"short".to_string()), "ok".to_string()).unwrap();

    let long_key = "k".repeat(64);
    let result = table.put(&op, Some(&long_key), "value".to_string());
    assert!(matches!(result, Err(PageHashError::KeyTooLarge { max: 16, .. })));
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn test_entry_too_large() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "entries");
    let op = NoopAtomicOperation;

    let result = table.put(&op, Some(&1), "v".repeat(5000));
    assert!(matches!(result, Err(PageHashError::EntryTooLarge { .. })));

    let result = table.put(&op, None, "v".repeat(5000));
    assert!(matches!(result, Err(PageHashError::EntryTooLarge { .. })));
    assert_eq!(table.size().unwrap(), 0);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_put_get_remove() {
    const THREADS: i64 = 8;
    const PER_THREAD: i64 = 1_500;

    let (_temp, config, cache) = setup_temp_config(|b| b.page_cache_capacity(64));
    let table = Arc::new(create_long_table(&config, &cache, "concurrent"));

    thread::scope(|s| {
        for t in 0..THREADS {
            let table = Arc::clone(&table);
            s.spawn(move || {
                let op = NoopAtomicOperation;
                let keys = t * PER_THREAD..(t + 1) * PER_THREAD;

                for i in keys.clone() {
                    table.put(&op, Some(&i), value_of(i)).unwrap();
                }
                for i in keys.clone() {
                    assert_eq!(table.get(Some(&i)).unwrap(), Some(value_of(i)), "key {i}");
                }
                for i in keys.clone().filter(|i| i % 2 == 1) {
                    assert_eq!(table.remove(&op, Some(&i)).unwrap(), Some(value_of(i)));
                }

                // Other threads keep changing the table, so only check the
                // entries returned are consistent with themselves
                for i in keys.step_by(101) {
                    for entry in table.higher_entries(&i, Some(8)).unwrap() {
                        assert_eq!(entry.value, value_of(entry.key));
                    }
                }
            });
        }
    });

    let expected = (0..THREADS * PER_THREAD).filter(|i| i % 2 == 0);
    let stats = table.check_invariants().unwrap();
    assert_eq!(stats.entries, expected.clone().count() as u64);
    assert_eq!(table.size().unwrap(), stats.entries);
    for i in expected {
        assert_eq!(table.get(Some(&i)).unwrap(), Some(value_of(i)), "key {i}");
    }
    assert_eq!(table.get(Some(&1)).unwrap(), None);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_reopen_keeps_entries() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let op = NoopAtomicOperation;
    {
        let table = create_long_table(&config, &cache, "durable");
        for i in 0..3_000i64 {
            table.put(&op, Some(&i), value_of(i)).unwrap();
        }
        table.put(&op, None, "null".to_string()).unwrap();
        table.close().unwrap();
    }

    let table = open_long_table(&config, &cache, "durable");
    assert_eq!(table.size().unwrap(), 3_001);
    let stats = table.check_invariants().unwrap();
    assert_eq!(stats.entries, 3_000);
    assert!(stats.null_entry);
    for i in (0..3_000i64).step_by(7) {
        assert_eq!(table.get(Some(&i)).unwrap(), Some(value_of(i)));
    }
    assert_eq!(table.get(None).unwrap(), Some("null".to_string()));
}

#[test]
fn test_reopen_with_other_serializers() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    create_long_table(&config, &cache, "typed").close().unwrap();

    let result = LocalHashTable::<i64, i64>::open(
        "typed",
        Arc::clone(&cache),
        &config,
        Arc::new(LongSerializer),
        Arc::new(LongSerializer),
        Arc::new(Xxh3HashFunction::<i64, _>::new(LongSerializer)),
    );
    assert!(matches!(result, Err(PageHashError::Serialization(_))));
}

#[test]
fn test_clear() {
    let (_temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "clear");
    let op = NoopAtomicOperation;

    for i in 0..5_000i64 {
        table.put(&op, Some(&i), value_of(i)).unwrap();
    }
    table.put(&op, None, "null".to_string()).unwrap();

    table.clear(&op).unwrap();
    assert_eq!(table.size().unwrap(), 0);
    assert_eq!(table.get(Some(&10)).unwrap(), None);
    assert_eq!(table.get(None).unwrap(), None);

    let stats = table.check_invariants().unwrap();
    assert_eq!(stats.buckets, 256);
    assert_eq!(stats.directory_nodes, 1);

    table.put(&op, Some(&10), "again".to_string()).unwrap();
    assert_eq!(table.get(Some(&10)).unwrap(), Some("again".to_string()));
}

#[test]
fn test_delete_removes_files() {
    let (temp, config, cache) = setup_temp_config(|b| b);
    let table = create_long_table(&config, &cache, "doomed");
    table.put(&NoopAtomicOperation, Some(&1), "x".to_string()).unwrap();

    table.delete().unwrap();
    for ext in ["him", "hit", "hib", "hnb"] {
        assert!(!temp.path().join(format!("doomed.{ext}")).exists(), "{ext}");
    }
}
