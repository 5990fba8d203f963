//! Tests for Memory-Mapped Files and the MmapManager
//!
//! These tests verify:
//! - Reads and writes through mapped windows
//! - Direct I/O fallback under restrictive strategies
//! - LRU eviction under the memory budget, within and across files
//! - Remapping after the file grows, unmapping on shrink
//! - Durability of mapped writes after synch and close
//! - Budget accounting with many threads sharing one manager

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use pagehash::file::{File, MmapFile, HEADER_SIZE};
use pagehash::mmap::{AllocationStrategy, MmapManager};
use pagehash::PageHashError;
use tempfile::TempDir;

const PAGE: u64 = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_mmap(block_size: usize, budget: u64) -> (TempDir, Arc<MmapManager>) {
    let temp_dir = TempDir::new().unwrap();
    let manager = Arc::new(MmapManager::with_limits(block_size, budget));
    (temp_dir, manager)
}

fn create_file(
    dir: &TempDir,
    name: &str,
    manager: &Arc<MmapManager>,
    strategy: AllocationStrategy,
    pages: u64,
) -> (MmapFile, PathBuf) {
    let path = dir.path().join(name);
    let file = MmapFile::new(&path, PAGE, Arc::clone(manager), strategy);
    file.create().unwrap();
    file.allocate_space(pages * PAGE).unwrap();
    (file, path)
}

fn read_vec(file: &MmapFile, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    file.read(offset, &mut buf, true).unwrap();
    buf
}

// =============================================================================
// Manager Tests
// =============================================================================

#[test]
fn test_block_size_is_page_aligned() {
    let manager = MmapManager::with_limits(5000, 1 << 20);
    assert_eq!(manager.block_size(), 4096);
    assert_eq!(manager.total_mapped(), 0);
    assert_eq!(manager.effective_budget(), 1 << 20);
}

// =============================================================================
// Mapped I/O Tests
// =============================================================================

#[test]
fn test_mapped_round_trip() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, _) = create_file(&temp, "mapped.dat", &manager, AllocationStrategy::MmapAlways, 2);

    file.write(0, b"first").unwrap();
    file.write(PAGE + 3, b"second").unwrap();

    assert_eq!(read_vec(&file, 0, 5), b"first");
    assert_eq!(read_vec(&file, PAGE + 3, 6), b"second");
    assert!(manager.total_mapped() > 0);
}

#[test]
fn test_never_strategy_uses_direct_io() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, _) = create_file(&temp, "direct.dat", &manager, AllocationStrategy::MmapNever, 1);

    file.write(42, b"direct").unwrap();
    assert_eq!(read_vec(&file, 42, 6), b"direct");
    assert_eq!(manager.total_mapped(), 0);
}

#[test]
fn test_only_available_pool_falls_back_when_full() {
    let (temp, manager) = setup_temp_mmap(4096, 4096);
    let (file, _) = create_file(
        &temp,
        "pool.dat",
        &manager,
        AllocationStrategy::MmapOnlyAvailablePool,
        2,
    );

    // Block 0 fits the budget, block 1 has to go through direct I/O
    file.write(0, b"mapped").unwrap();
    file.write(PAGE, b"direct").unwrap();
    assert_eq!(manager.total_mapped(), 4096);

    assert_eq!(read_vec(&file, 0, 6), b"mapped");
    assert_eq!(read_vec(&file, PAGE, 6), b"direct");
    assert_eq!(manager.total_mapped(), 4096);
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_eviction_keeps_budget() {
    let (temp, manager) = setup_temp_mmap(4096, 2 * 4096);
    let (file, _) = create_file(&temp, "evict.dat", &manager, AllocationStrategy::MmapAlways, 4);

    for page in 0..4u64 {
        file.write(page * PAGE, &[page as u8 + 1; 16]).unwrap();
        assert!(manager.total_mapped() <= 2 * 4096);
    }

    // Evicted windows were flushed before they were dropped
    for page in 0..4u64 {
        assert_eq!(read_vec(&file, page * PAGE, 16), vec![page as u8 + 1; 16]);
    }
    assert!(manager.total_mapped() <= manager.effective_budget());
}

#[test]
fn test_eviction_across_files() {
    let (temp, manager) = setup_temp_mmap(4096, 2 * 4096);
    let (first, _) = create_file(&temp, "a.dat", &manager, AllocationStrategy::MmapAlways, 2);
    let (second, _) = create_file(&temp, "b.dat", &manager, AllocationStrategy::MmapAlways, 2);

    first.write(0, b"aaaa").unwrap();
    first.write(PAGE, b"AAAA").unwrap();
    second.write(0, b"bbbb").unwrap();
    second.write(PAGE, b"BBBB").unwrap();
    assert!(manager.total_mapped() <= 2 * 4096);

    assert_eq!(read_vec(&first, 0, 4), b"aaaa");
    assert_eq!(read_vec(&first, PAGE, 4), b"AAAA");
    assert_eq!(read_vec(&second, 0, 4), b"bbbb");
    assert_eq!(read_vec(&second, PAGE, 4), b"BBBB");
}

// =============================================================================
// Growth and Shrink Tests
// =============================================================================

#[test]
fn test_remap_after_growth() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, _) = create_file(&temp, "grow.dat", &manager, AllocationStrategy::MmapAlways, 1);

    file.write(0, b"before").unwrap();
    assert_eq!(manager.total_mapped(), HEADER_SIZE + PAGE);

    // The window covering block 0 is too short now and gets replaced
    file.allocate_space(PAGE).unwrap();
    file.write(PAGE + 10, b"after").unwrap();
    assert_eq!(manager.total_mapped(), HEADER_SIZE + 2 * PAGE);

    assert_eq!(read_vec(&file, 0, 6), b"before");
    assert_eq!(read_vec(&file, PAGE + 10, 5), b"after");
}

#[test]
fn test_failed_growth_keeps_size() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, path) = create_file(&temp, "huge.dat", &manager, AllocationStrategy::MmapAlways, 1);

    // Neither request can be backed by the OS file
    assert!(matches!(
        file.allocate_space(u64::MAX),
        Err(PageHashError::OutOfRange { .. })
    ));
    assert!(file.allocate_space(1 << 63).is_err());
    assert_eq!(file.size(), PAGE);
    assert!(file.write(PAGE, b"past the end").is_err());

    assert_eq!(file.allocate_space(PAGE).unwrap(), PAGE);
    file.write(PAGE, b"next page").unwrap();
    assert_eq!(read_vec(&file, PAGE, 9), b"next page");
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        HEADER_SIZE + 2 * PAGE
    );
}

#[test]
fn test_shrink_unmaps_windows() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, _) = create_file(&temp, "shrink.dat", &manager, AllocationStrategy::MmapAlways, 2);

    file.write(PAGE, b"gone").unwrap();
    file.write(0, b"kept").unwrap();
    assert!(manager.total_mapped() > 0);

    file.shrink(PAGE).unwrap();
    assert_eq!(manager.total_mapped(), 0);
    assert_eq!(file.size(), PAGE);
    assert_eq!(read_vec(&file, 0, 4), b"kept");
}

// =============================================================================
// Durability Tests
// =============================================================================

#[test]
fn test_synch_reaches_the_os_file() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, path) = create_file(&temp, "synch.dat", &manager, AllocationStrategy::MmapAlways, 1);

    file.write(64, b"persisted").unwrap();
    file.synch();

    let raw = std::fs::read(&path).unwrap();
    let start = (HEADER_SIZE + 64) as usize;
    assert_eq!(&raw[start..start + 9], b"persisted");
}

#[test]
fn test_reopen_after_close() {
    let (temp, manager) = setup_temp_mmap(1 << 20, 64 << 20);
    let (file, path) = create_file(&temp, "reopen.dat", &manager, AllocationStrategy::MmapAlways, 1);

    file.write(128, b"survives").unwrap();
    file.close().unwrap();
    drop(file);
    assert_eq!(manager.total_mapped(), 0);

    let file = MmapFile::new(&path, PAGE, Arc::clone(&manager), AllocationStrategy::MmapAlways);
    file.open().unwrap();
    assert_eq!(file.size(), PAGE);
    assert_eq!(read_vec(&file, 128, 8), b"survives");
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_files_share_budget() {
    const FILES: usize = 4;
    const THREADS: usize = 8;
    const PAGES: u64 = 16;
    let budget = 16 * 4096;

    let (temp, manager) = setup_temp_mmap(4096, budget);
    let files: Vec<MmapFile> = (0..FILES)
        .map(|i| {
            create_file(
                &temp,
                &format!("shared_{i}.dat"),
                &manager,
                AllocationStrategy::MmapAlways,
                PAGES,
            )
            .0
        })
        .collect();

    // Two threads per file, one on even pages and one on odd pages
    thread::scope(|s| {
        for t in 0..THREADS {
            let file = &files[t % FILES];
            let manager = &manager;
            s.spawn(move || {
                for round in 0..8u64 {
                    for page in (0..PAGES).filter(|page| (page % 2) as usize == t / FILES) {
                        let fill = [(t as u8) ^ (page as u8) ^ (round as u8); 64];
                        file.write(page * PAGE + 32, &fill).unwrap();
                        assert_eq!(read_vec(file, page * PAGE + 32, 64), fill);
                        assert!(manager.total_mapped() <= manager.effective_budget());
                    }
                }
            });
        }
    });

    assert!(manager.total_mapped() <= budget);
    for (i, file) in files.iter().enumerate() {
        for page in 0..PAGES {
            let t = i + FILES * (page % 2) as usize;
            let expected = [(t as u8) ^ (page as u8) ^ 7; 64];
            assert_eq!(read_vec(file, page * PAGE + 32, 64), expected, "file {i} page {page}");
        }
    }
}
