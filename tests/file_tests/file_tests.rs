//! Tests for Byte-Range Files
//!
//! These tests verify:
//! - Create / allocate / write / read on every file variant
//! - Bounds checking against the logical size
//! - Size persistence across close and reopen
//! - Size reconciliation after an unclean shutdown
//! - Structural operations (shrink, rename, replace, delete)
//! - Batched writes on the asynchronous variant
//! - Concurrent allocation and I/O from several threads

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use pagehash::config::{Config, FileKind};
use pagehash::file::{open_file, AsyncFile, ClassicFile, File, IoWorkerPool, HEADER_SIZE};
use pagehash::PageHashError;
use tempfile::TempDir;

const PAGE: u64 = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file(name: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(name);
    (temp_dir, path)
}

fn config_for(kind: FileKind, dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .file_kind(kind)
        .page_size(PAGE as usize)
        .async_workers(2)
        .build()
}

// =============================================================================
// Basic I/O Tests
// =============================================================================

#[test]
fn test_write_read_every_kind() {
    for kind in [FileKind::Sync, FileKind::Async, FileKind::Mmap] {
        let (temp, path) = setup_temp_file(&format!("{kind:?}.dat"));
        let config = config_for(kind, &temp);

        let file = open_file(&path, &config, None, None).unwrap();
        file.create().unwrap();
        assert!(file.is_open());
        assert_eq!(file.size(), 0);

        assert_eq!(file.allocate_space(2 * PAGE).unwrap(), 0);
        assert_eq!(file.size(), 2 * PAGE);

        file.write(100, b"hello").unwrap();
        file.write(PAGE + 7, b"world").unwrap();

        let mut buf = [0u8; 5];
        file.read(100, &mut buf, true).unwrap();
        assert_eq!(&buf, b"hello", "{kind:?}");
        file.read(PAGE + 7, &mut buf, true).unwrap();
        assert_eq!(&buf, b"world", "{kind:?}");

        // Growing keeps old content and hands out the old size
        assert_eq!(file.allocate_space(PAGE).unwrap(), 2 * PAGE);
        file.write(2 * PAGE, b"third").unwrap();
        file.read(100, &mut buf, true).unwrap();
        assert_eq!(&buf, b"hello", "{kind:?}");

        file.close().unwrap();
        assert!(!file.is_open());
    }
}

#[test]
fn test_read_outside_logical_size() {
    let (_temp, path) = setup_temp_file("range.dat");
    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    file.allocate_space(PAGE).unwrap();

    let mut buf = [0u8; 16];
    let result = file.read(PAGE, &mut buf, true);
    assert!(matches!(result, Err(PageHashError::OutOfRange { .. })));

    let result = file.write(PAGE - 8, &[1u8; 16]);
    assert!(matches!(result, Err(PageHashError::OutOfRange { .. })));
}

#[test]
fn test_unwritten_region_reads_short() {
    let (_temp, path) = setup_temp_file("short.dat");
    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    file.allocate_space(PAGE).unwrap();

    let mut buf = vec![0u8; PAGE as usize];
    assert_eq!(file.read(0, &mut buf, false).unwrap(), 0);

    let result = file.read(0, &mut buf, true);
    assert!(matches!(result, Err(PageHashError::EndOfFile { .. })));
}

#[test]
fn test_io_on_closed_file() {
    let (_temp, path) = setup_temp_file("closed.dat");
    let file = ClassicFile::new(&path, PAGE);

    let result = file.allocate_space(PAGE).and_then(|_| file.write(0, b"x"));
    assert!(matches!(result, Err(PageHashError::NotOpen(_))));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_size_persists_after_close() {
    let (_temp, path) = setup_temp_file("persist.dat");

    {
        let file = ClassicFile::new(&path, PAGE);
        file.create().unwrap();
        file.allocate_space(PAGE).unwrap();
        file.write(10, b"durable").unwrap();
        file.close().unwrap();
    }

    let file = ClassicFile::new(&path, PAGE);
    file.open().unwrap();
    assert_eq!(file.size(), PAGE);

    let mut buf = [0u8; 7];
    file.read(10, &mut buf, true).unwrap();
    assert_eq!(&buf, b"durable");
}

#[test]
fn test_unclean_shutdown_drops_partial_page() {
    let (_temp, path) = setup_temp_file("crash.dat");

    {
        let file = ClassicFile::new(&path, PAGE);
        file.create().unwrap();
        file.allocate_space(4 * PAGE).unwrap();
        for page in 0..3 {
            file.write(page * PAGE, &vec![page as u8 + 1; PAGE as usize])
                .unwrap();
        }
        // Half of the fourth page reached the disk
        file.write(3 * PAGE, &[9u8; 100]).unwrap();
        file.synch();
        // Dropped without close: the header still says "in use"
    }

    let file = ClassicFile::new(&path, PAGE);
    file.open().unwrap();
    assert_eq!(file.size(), 3 * PAGE);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        HEADER_SIZE + 3 * PAGE
    );

    let mut buf = vec![0u8; PAGE as usize];
    file.read(2 * PAGE, &mut buf, true).unwrap();
    assert!(buf.iter().all(|b| *b == 3));
}

#[test]
fn test_open_missing_file() {
    let (_temp, path) = setup_temp_file("missing.dat");
    let file = ClassicFile::new(&path, PAGE);
    assert!(matches!(file.open(), Err(PageHashError::FileNotFound(_))));
    assert!(!file.exists());
}

#[test]
fn test_create_twice_is_rejected() {
    let (_temp, path) = setup_temp_file("twice.dat");
    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    assert!(matches!(file.create(), Err(PageHashError::AlreadyOpen(_))));
}

#[test]
fn test_close_is_idempotent() {
    let (_temp, path) = setup_temp_file("idempotent.dat");
    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    file.close().unwrap();
    file.close().unwrap();
}

// =============================================================================
// Structural Operation Tests
// =============================================================================

#[test]
fn test_shrink() {
    let (_temp, path) = setup_temp_file("shrink.dat");
    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    file.allocate_space(2 * PAGE).unwrap();
    file.write(0, b"keep").unwrap();

    file.shrink(PAGE).unwrap();
    assert_eq!(file.size(), PAGE);

    let mut buf = [0u8; 4];
    file.read(0, &mut buf, true).unwrap();
    assert_eq!(&buf, b"keep");
    assert!(file.read(PAGE, &mut buf, true).is_err());
}

#[test]
fn test_rename_to() {
    let (temp, path) = setup_temp_file("before.dat");
    let renamed = temp.path().join("after.dat");

    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    file.allocate_space(PAGE).unwrap();
    file.write(0, b"moved").unwrap();

    file.rename_to(&renamed).unwrap();
    assert_eq!(file.path(), renamed);
    assert!(file.is_open());
    assert!(!path.exists());

    let mut buf = [0u8; 5];
    file.read(0, &mut buf, true).unwrap();
    assert_eq!(&buf, b"moved");
}

#[test]
fn test_replace_content_with() {
    let (temp, path) = setup_temp_file("target.dat");
    let source_path = temp.path().join("source.dat");

    let source = ClassicFile::new(&source_path, PAGE);
    source.create().unwrap();
    source.allocate_space(2 * PAGE).unwrap();
    source.write(PAGE, b"from source").unwrap();
    source.close().unwrap();

    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    file.allocate_space(PAGE).unwrap();
    file.write(0, b"old").unwrap();

    file.replace_content_with(&source_path).unwrap();
    assert_eq!(file.size(), 2 * PAGE);

    let mut buf = [0u8; 11];
    file.read(PAGE, &mut buf, true).unwrap();
    assert_eq!(&buf, b"from source");
}

#[test]
fn test_delete() {
    let (_temp, path) = setup_temp_file("delete.dat");
    let file = ClassicFile::new(&path, PAGE);
    file.create().unwrap();
    assert!(path.exists());

    file.delete().unwrap();
    assert!(!path.exists());
    assert!(!file.is_open());
}

// =============================================================================
// Asynchronous Write Tests
// =============================================================================

#[test]
fn test_async_write_batch() {
    let (_temp, path) = setup_temp_file("batch.dat");
    let pool = Arc::new(IoWorkerPool::new(3).unwrap());
    let file = AsyncFile::new(&path, PAGE, pool);
    file.create().unwrap();
    file.allocate_space(4 * PAGE).unwrap();

    let writes: Vec<(u64, Vec<u8>)> = (0..4)
        .map(|page| (page * PAGE, vec![page as u8 + 10; PAGE as usize]))
        .collect();
    let handle = file.write_batch(writes).unwrap();
    handle.wait().unwrap();

    for page in 0..4u64 {
        let mut buf = vec![0u8; PAGE as usize];
        file.read(page * PAGE, &mut buf, true).unwrap();
        assert!(buf.iter().all(|b| *b == page as u8 + 10));
    }
}

#[test]
fn test_async_write_batch_rejected_before_queueing() {
    let (_temp, path) = setup_temp_file("batch_fail.dat");
    let pool = Arc::new(IoWorkerPool::new(2).unwrap());
    let file = AsyncFile::new(&path, PAGE, pool);
    file.create().unwrap();
    file.allocate_space(PAGE).unwrap();

    // Second write lies past the logical end, so nothing is written
    let result = file.write_batch(vec![(0, vec![1u8; 16]), (2 * PAGE, vec![2u8; 16])]);
    assert!(matches!(result, Err(PageHashError::OutOfRange { .. })));

    let mut buf = [0u8; 16];
    assert_eq!(file.read(0, &mut buf, false).unwrap(), 0);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_allocate_write_read() {
    const THREADS: u8 = 8;
    const ROUNDS: u8 = 16;

    for kind in [FileKind::Sync, FileKind::Async, FileKind::Mmap] {
        let (temp, path) = setup_temp_file(&format!("concurrent_{kind:?}.dat"));
        let config = config_for(kind, &temp);
        let file = open_file(&path, &config, None, None).unwrap();
        file.create().unwrap();
        let shared: &dyn File = &*file;

        let written: Vec<(u64, u8)> = thread::scope(|s| {
            let writers: Vec<_> = (0..THREADS)
                .map(|t| {
                    s.spawn(move || {
                        let mut owned = Vec::new();
                        for round in 0..ROUNDS {
                            let fill = t * ROUNDS + round;
                            let offset = shared.allocate_space(PAGE).unwrap();
                            shared.write(offset, &vec![fill; PAGE as usize]).unwrap();

                            let mut buf = vec![0u8; PAGE as usize];
                            shared.read(offset, &mut buf, true).unwrap();
                            assert!(buf.iter().all(|b| *b == fill), "{kind:?} page {offset}");
                            owned.push((offset, fill));
                        }
                        owned
                    })
                })
                .collect();

            s.spawn(move || {
                for _ in 0..32 {
                    shared.synch();
                    thread::yield_now();
                }
            });

            writers
                .into_iter()
                .flat_map(|writer| writer.join().unwrap())
                .collect()
        });

        let total = u64::from(THREADS) * u64::from(ROUNDS);
        assert_eq!(file.size(), total * PAGE, "{kind:?}");

        // Allocations never overlap
        let mut offsets: Vec<u64> = written.iter().map(|(offset, _)| *offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, (0..total).map(|page| page * PAGE).collect::<Vec<_>>());

        file.close().unwrap();
        file.open().unwrap();
        for (offset, fill) in written {
            let mut buf = vec![0u8; PAGE as usize];
            file.read(offset, &mut buf, true).unwrap();
            assert!(buf.iter().all(|b| *b == fill), "{kind:?} page {offset} after reopen");
        }
    }
}
