//! Tests for the Page Cache
//!
//! These tests verify:
//! - Page allocation, mutation and write-back
//! - Reloading pages after close and reopen
//! - Eviction under capacity with pinned and guarded pages kept resident
//! - Checksum verification on load
//! - Truncate and delete of cache files
//! - Concurrent loads and writes racing with eviction

use std::sync::Arc;
use std::thread;

use pagehash::config::{Config, FileKind};
use pagehash::file::HEADER_SIZE;
use pagehash::page::{FilePageCache, PageCache};
use pagehash::PageHashError;
use tempfile::TempDir;

const PAGE: usize = 4096;
const CAPACITY: usize = 16;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_cache(kind: FileKind) -> (TempDir, Arc<FilePageCache>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .file_kind(kind)
        .page_size(PAGE)
        .page_cache_capacity(CAPACITY)
        .async_workers(2)
        .mmap_block_size(64 * 1024)
        .build();
    let cache = Arc::new(FilePageCache::new(config).unwrap());
    (temp_dir, cache)
}

// =============================================================================
// Basic Tests
// =============================================================================

#[test]
fn test_add_page_and_reload_every_kind() {
    for kind in [FileKind::Sync, FileKind::Async, FileKind::Mmap] {
        let (_temp, cache) = setup_temp_cache(kind);
        let file_id = cache.add_file("pages.dat").unwrap();

        for i in 0..3u64 {
            let mut page = cache.add_page(file_id).unwrap();
            assert_eq!(page.index(), i);
            page.set_i64(64, (i as i64 + 1) * 1000);
        }
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 3);

        cache.flush(file_id).unwrap();
        cache.close_file(file_id, true).unwrap();

        let file_id = cache.open_file("pages.dat").unwrap();
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 3, "{kind:?}");
        for i in 0..3u64 {
            let page = cache.load_for_read(file_id, i).unwrap();
            assert_eq!(page.get_i64(64), (i as i64 + 1) * 1000, "{kind:?}");
        }
    }
}

#[test]
fn test_write_guard_marks_dirty() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("dirty.dat").unwrap();
    drop(cache.add_page(file_id).unwrap());
    cache.flush(file_id).unwrap();

    {
        let page = cache.load_for_read(file_id, 0).unwrap();
        assert!(!page.is_dirty());
    }

    let mut page = cache.load_for_write(file_id, 0).unwrap();
    page.set_u32(32, 7);
    assert!(page.is_dirty());
}

#[test]
fn test_add_existing_file_is_rejected() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    cache.add_file("twice.dat").unwrap();

    let result = cache.add_file("twice.dat");
    assert!(matches!(result, Err(PageHashError::FileExists(_))));
}

#[test]
fn test_open_file_returns_registered_id() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("shared.dat").unwrap();
    assert_eq!(cache.open_file("shared.dat").unwrap(), file_id);
    assert_eq!(cache.file_name(file_id).unwrap(), "shared.dat");
}

#[test]
fn test_load_missing_page() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("missing.dat").unwrap();
    drop(cache.add_page(file_id).unwrap());

    let result = cache.load_for_read(file_id, 5);
    assert!(matches!(
        result,
        Err(PageHashError::PageNotFound { page: 5, .. })
    ));
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_eviction_respects_capacity() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("evict.dat").unwrap();

    for i in 0..40i64 {
        let mut page = cache.add_page(file_id).unwrap();
        page.set_i64(100, i * 3);
    }
    assert!(cache.cached_pages() <= CAPACITY);

    // Evicted dirty pages were written back
    for i in 0..40u64 {
        let page = cache.load_for_read(file_id, i).unwrap();
        assert_eq!(page.get_i64(100), i as i64 * 3);
    }
    assert!(cache.cached_pages() <= CAPACITY);
}

#[test]
fn test_pinned_page_stays_resident() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("pinned.dat").unwrap();

    {
        let mut page = cache.add_page(file_id).unwrap();
        page.set_i64(200, 42);
    }
    cache.flush(file_id).unwrap();
    cache.pin(file_id, 0).unwrap();

    for _ in 0..40 {
        drop(cache.add_page(file_id).unwrap());
    }

    // Corrupting the on-disk copy is invisible while the page stays cached
    let path = cache.config().data_dir.join("pinned.dat");
    let mut raw = std::fs::read(&path).unwrap();
    raw[HEADER_SIZE as usize + 200] ^= 0xFF;
    std::fs::write(&path, &raw).unwrap();

    let page = cache.load_for_read(file_id, 0).unwrap();
    assert_eq!(page.get_i64(200), 42);
    drop(page);

    cache.unpin(file_id, 0);
}

// =============================================================================
// Checksum Tests
// =============================================================================

#[test]
fn test_corrupted_page_is_fatal() {
    let (temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("corrupt.dat").unwrap();
    {
        let mut page = cache.add_page(file_id).unwrap();
        page.set_i64(100, 123_456);
    }
    cache.close_file(file_id, true).unwrap();

    let path = temp.path().join("corrupt.dat");
    let mut raw = std::fs::read(&path).unwrap();
    raw[HEADER_SIZE as usize + 100] ^= 0xFF;
    std::fs::write(&path, &raw).unwrap();

    let file_id = cache.open_file("corrupt.dat").unwrap();
    let err = cache.load_for_read(file_id, 0).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, PageHashError::Corrupted(_)));
}

// =============================================================================
// File Lifecycle Tests
// =============================================================================

#[test]
fn test_truncate() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("truncate.dat").unwrap();
    for _ in 0..4 {
        drop(cache.add_page(file_id).unwrap());
    }

    cache.truncate(file_id).unwrap();
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
    assert!(cache.load_for_read(file_id, 0).is_err());

    let page = cache.add_page(file_id).unwrap();
    assert_eq!(page.index(), 0);
}

#[test]
fn test_delete_file() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("gone.dat").unwrap();
    drop(cache.add_page(file_id).unwrap());
    assert!(cache.exists("gone.dat"));

    cache.delete_file(file_id).unwrap();
    assert!(!cache.exists("gone.dat"));
    assert!(matches!(
        cache.filled_up_to(file_id),
        Err(PageHashError::UnknownFile(_))
    ));
}

#[test]
fn test_close_without_flush_discards_changes() {
    let (_temp, cache) = setup_temp_cache(FileKind::Sync);
    let file_id = cache.add_file("discard.dat").unwrap();
    {
        let mut page = cache.add_page(file_id).unwrap();
        page.set_i64(64, 1);
    }
    cache.flush(file_id).unwrap();
    {
        let mut page = cache.load_for_write(file_id, 0).unwrap();
        page.set_i64(64, 2);
    }
    cache.close_file(file_id, false).unwrap();

    let file_id = cache.open_file("discard.dat").unwrap();
    let page = cache.load_for_read(file_id, 0).unwrap();
    assert_eq!(page.get_i64(64), 1);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers_survive_eviction() {
    const THREADS: u64 = 8;
    const PAGES: u64 = 128;

    for kind in [FileKind::Sync, FileKind::Mmap] {
        let (_temp, cache) = setup_temp_cache(kind);
        let file_id = cache.add_file("shared.dat").unwrap();
        for _ in 0..PAGES {
            drop(cache.add_page(file_id).unwrap());
        }

        // Each thread owns the pages congruent to its id, every load of
        // another thread's page may evict one of ours
        thread::scope(|s| {
            for t in 0..THREADS {
                let cache = &cache;
                s.spawn(move || {
                    for round in 0..4i64 {
                        for page in (t..PAGES).step_by(THREADS as usize) {
                            let mut guard = cache.load_for_write(file_id, page).unwrap();
                            assert_eq!(guard.get_i64(100), (round - 1).max(0) * page as i64);
                            guard.set_i64(100, round * page as i64);
                            drop(guard);

                            let other = (page * 7 + 3) % PAGES;
                            drop(cache.load_for_read(file_id, other).unwrap());
                        }
                    }
                });
            }
        });

        cache.close_file(file_id, true).unwrap();
        let file_id = cache.open_file("shared.dat").unwrap();
        for page in 0..PAGES {
            let guard = cache.load_for_read(file_id, page).unwrap();
            assert_eq!(guard.get_i64(100), 3 * page as i64, "{kind:?} page {page}");
        }
    }
}
