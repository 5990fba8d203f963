//! Configuration for pagehash
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{PageHashError, Result};
use crate::mmap::AllocationStrategy;

/// Smallest page size the directory layout can work with: one node is
/// 2051 bytes and must fit next to the page and directory headers.
pub const MIN_PAGE_SIZE: usize = 4096;

/// OS page granularity that memory-mapped windows must be aligned to.
pub const MMAP_ALIGNMENT: usize = 4096;

/// Main configuration for a pagehash storage instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {index}.him      (metadata page)
    ///     ├── {index}.hit      (directory nodes)
    ///     ├── {index}.hib      (buckets)
    ///     └── {index}.hnb      (null-key bucket)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // File Configuration
    // -------------------------------------------------------------------------
    /// Which byte-range file implementation backs every page file
    pub file_kind: FileKind,

    /// Worker threads serving the asynchronous file variant
    pub async_workers: usize,

    // -------------------------------------------------------------------------
    // Memory Map Configuration
    // -------------------------------------------------------------------------
    /// Size of one mapped window (bytes, multiple of 4096)
    pub mmap_block_size: usize,

    /// Process-wide budget for mapped windows (bytes)
    pub mmap_max_memory: u64,

    /// Strategy passed on every acquire by memory-mapped files
    pub mmap_strategy: AllocationStrategy,

    // -------------------------------------------------------------------------
    // Page Cache Configuration
    // -------------------------------------------------------------------------
    /// Size of a durable page (bytes, power of two, >= 4096)
    pub page_size: usize,

    /// Number of pages kept in memory before unpinned pages are evicted
    pub page_cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Hash Index Configuration
    // -------------------------------------------------------------------------
    /// Maximum serialized key size accepted by put
    pub max_key_size: usize,

    /// Whether the null key is routed to the null bucket or rejected
    pub null_key_supported: bool,

    /// Buckets whose content drops to this fraction of capacity try to merge
    pub merge_threshold: f64,
}

/// Byte-range file implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Positioned reads/writes on the calling thread
    Sync,

    /// Reads/writes dispatched to a worker pool, batch writes awaited via handle
    Async,

    /// Reads/writes served from memory-mapped windows with direct I/O fallback
    Mmap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pagehash_data"),
            file_kind: FileKind::Sync,
            async_workers: 4,
            mmap_block_size: 1024 * 1024,         // 1 MB
            mmap_max_memory: 256 * 1024 * 1024,   // 256 MB
            mmap_strategy: AllocationStrategy::MmapAlways,
            page_size: 64 * 1024,                 // 64 KB
            page_cache_capacity: 4096,
            max_key_size: 1024,
            null_key_supported: true,
            merge_threshold: 0.2,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that the on-disk layouts depend on
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(PageHashError::Config(format!(
                "page_size must be a power of two >= {}, got {}",
                MIN_PAGE_SIZE, self.page_size
            )));
        }

        if self.page_cache_capacity < 16 {
            return Err(PageHashError::Config(format!(
                "page_cache_capacity must be at least 16 pages, got {}",
                self.page_cache_capacity
            )));
        }

        if self.mmap_block_size == 0 || self.mmap_block_size % MMAP_ALIGNMENT != 0 {
            return Err(PageHashError::Config(format!(
                "mmap_block_size must be a non-zero multiple of {}, got {}",
                MMAP_ALIGNMENT, self.mmap_block_size
            )));
        }

        if self.async_workers == 0 {
            return Err(PageHashError::Config(
                "async_workers must be at least 1".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.merge_threshold) {
            return Err(PageHashError::Config(format!(
                "merge_threshold must be in [0, 1), got {}",
                self.merge_threshold
            )));
        }

        if self.max_key_size == 0 {
            return Err(PageHashError::Config(
                "max_key_size must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all page files)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the byte-range file implementation
    pub fn file_kind(mut self, kind: FileKind) -> Self {
        self.config.file_kind = kind;
        self
    }

    /// Set the number of async file workers
    pub fn async_workers(mut self, count: usize) -> Self {
        self.config.async_workers = count;
        self
    }

    /// Set the mapped window size (in bytes)
    pub fn mmap_block_size(mut self, size: usize) -> Self {
        self.config.mmap_block_size = size;
        self
    }

    /// Set the memory-map budget (in bytes)
    pub fn mmap_max_memory(mut self, size: u64) -> Self {
        self.config.mmap_max_memory = size;
        self
    }

    /// Set the allocation strategy used by memory-mapped files
    pub fn mmap_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.config.mmap_strategy = strategy;
        self
    }

    /// Set the durable page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the page cache capacity (in pages)
    pub fn page_cache_capacity(mut self, pages: usize) -> Self {
        self.config.page_cache_capacity = pages;
        self
    }

    /// Set the maximum serialized key size (in bytes)
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Enable or disable the null-key bucket
    pub fn null_key_supported(mut self, supported: bool) -> Self {
        self.config.null_key_supported = supported;
        self
    }

    /// Set the bucket merge threshold (fraction of bucket capacity)
    pub fn merge_threshold(mut self, threshold: f64) -> Self {
        self.config.merge_threshold = threshold;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
