//! Byte-Range File Module
//!
//! Logical, append-sized binary files with a fixed header region.
//!
//! ## Responsibilities
//! - Validate every read/write against the logical size before touching disk
//! - Translate logical offsets to physical ones (header size added)
//! - Hand out space at the end of the file (`allocate_space`)
//! - Track pending writes so `synch` can skip redundant flushes
//! - Detect unclean shutdowns on `open` and reconcile the stored size
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ Header (1024 bytes)                                    │
//! │ ┌──────────┬─────────┬──────┬──────────────┬─────────┐ │
//! │ │Magic (4) │Ver (2)  │Kind  │SoftlyClosed  │Size (8) │ │
//! │ └──────────┴─────────┴──────┴──────────────┴─────────┘ │
//! │   CRC32 of the encoded fields, zero padding            │
//! ├────────────────────────────────────────────────────────┤
//! │ Data Region (logical offsets 0..size)                  │
//! │   pages written by the page cache                      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! A shared/exclusive lock guards the open/close lifecycle. Reads and writes
//! take it shared, structural operations (create, open, close, shrink,
//! delete, rename, replace) take it exclusive. Overlapping concurrent writes
//! have no ordering guarantee.

mod async_file;
mod base;
mod classic;
mod header;
mod mmap_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::{Config, FileKind};
use crate::error::{PageHashError, Result};
use crate::mmap::MmapManager;

pub use async_file::{AsyncFile, IoWorkerPool};
pub use classic::ClassicFile;
pub use mmap_file::MmapFile;

// =============================================================================
// Shared Constants
// =============================================================================

/// Bytes reserved in front of the logical data region
pub const HEADER_SIZE: u64 = 1024;

// =============================================================================
// File Contract
// =============================================================================

/// A logical byte-range file.
///
/// All offsets are logical: `0` is the first byte after the header.
/// Implementations are selected once, at construction, by [`open_file`].
pub trait File: Send + Sync {
    /// Current OS path of the file
    fn path(&self) -> PathBuf;

    /// Create the OS file and write a fresh header (logical size 0)
    fn create(&self) -> Result<()>;

    /// Attach to an existing OS file and read back its logical size
    fn open(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Logical size in bytes (excludes the header)
    fn size(&self) -> u64;

    /// Read `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read. A short read happens only when the
    /// physical file ends before the logical size does; with `throw_on_eof`
    /// it becomes [`PageHashError::EndOfFile`].
    fn read(&self, offset: u64, buf: &mut [u8], throw_on_eof: bool) -> Result<usize>;

    /// Write all of `data` at `offset` and mark the file dirty
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Submit several writes at once and return a handle to await.
    ///
    /// The default implementation writes sequentially on the calling thread
    /// and returns an already completed handle.
    fn write_batch(&self, writes: Vec<(u64, Vec<u8>)>) -> Result<WriteHandle> {
        let handle = WriteHandle::new(writes.len());
        for (offset, data) in writes {
            handle.complete_one(self.write(offset, &data));
        }
        Ok(handle)
    }

    /// Grow the logical size by `size` bytes, returning the old size
    fn allocate_space(&self, size: u64) -> Result<u64>;

    /// Truncate logical and physical size to `size` bytes
    fn shrink(&self, size: u64) -> Result<()>;

    /// Force pending writes to disk. Failures are logged, never returned.
    fn synch(&self);

    /// Flush and release OS resources. Idempotent.
    fn close(&self) -> Result<()>;

    /// Close the file and remove it from disk
    fn delete(&self) -> Result<()>;

    /// Close, rename on disk, and reopen under the new path
    fn rename_to(&self, new_path: &Path) -> Result<()>;

    /// Close, overwrite the OS file with the content of `source`, and reopen
    fn replace_content_with(&self, source: &Path) -> Result<()>;
}

/// Build the file implementation selected by `config.file_kind`.
///
/// Memory-mapped files share `mmap` when given; asynchronous files share
/// `pool` when given. Missing resources are created privately from `config`.
pub fn open_file(
    path: impl Into<PathBuf>,
    config: &Config,
    mmap: Option<Arc<MmapManager>>,
    pool: Option<Arc<IoWorkerPool>>,
) -> Result<Box<dyn File>> {
    let path = path.into();
    let page_size = config.page_size as u64;

    let file: Box<dyn File> = match config.file_kind {
        FileKind::Sync => Box::new(ClassicFile::new(path, page_size)),
        FileKind::Async => {
            let pool = match pool {
                Some(pool) => pool,
                None => Arc::new(IoWorkerPool::new(config.async_workers)?),
            };
            Box::new(AsyncFile::new(path, page_size, pool))
        }
        FileKind::Mmap => {
            let manager = mmap.unwrap_or_else(|| Arc::new(MmapManager::new(config)));
            Box::new(MmapFile::new(path, page_size, manager, config.mmap_strategy))
        }
    };

    Ok(file)
}

// =============================================================================
// Batched Write Handle
// =============================================================================

/// Completion handle for a batch of writes.
///
/// The first failure is kept and returned by [`WriteHandle::wait`]; later
/// failures are logged only.
pub struct WriteHandle {
    state: Arc<(Mutex<BatchProgress>, Condvar)>,
}

struct BatchProgress {
    pending: usize,
    first_error: Option<PageHashError>,
}

impl WriteHandle {
    pub(crate) fn new(pending: usize) -> Self {
        Self {
            state: Arc::new((
                Mutex::new(BatchProgress {
                    pending,
                    first_error: None,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Record the outcome of one write of the batch
    pub(crate) fn complete_one(&self, result: Result<()>) {
        let (lock, cond) = &*self.state;
        let mut progress = lock.lock();

        if let Err(err) = result {
            if progress.first_error.is_none() {
                progress.first_error = Some(err);
            } else {
                tracing::warn!(error = %err, "additional batched write failed");
            }
        }

        progress.pending = progress.pending.saturating_sub(1);
        if progress.pending == 0 || progress.first_error.is_some() {
            cond.notify_all();
        }
    }

    /// True once every write finished or one of them failed
    pub fn is_complete(&self) -> bool {
        let progress = self.state.0.lock();
        progress.pending == 0 || progress.first_error.is_some()
    }

    /// Block until the batch completes; raise the first recorded failure
    pub fn wait(self) -> Result<()> {
        let (lock, cond) = &*self.state;
        let mut progress = lock.lock();

        while progress.pending > 0 && progress.first_error.is_none() {
            cond.wait(&mut progress);
        }

        match progress.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn clone_for_worker(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}
