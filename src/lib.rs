//! # PageHash
//!
//! A page-based storage core with:
//! - Logical byte-range files over plain, worker-pool or memory-mapped I/O
//! - A process-wide pool of memory-mapped windows under a memory budget
//! - Checksummed fixed-size pages behind a pinning page cache
//! - A durable extendible hash index with split, merge and hash-order walks
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LocalHashTable                            │
//! │        (get / put / remove / navigation, RwLock)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!     ┌─────────────────┼──────────────────┬──────────────┐
//!     ▼                 ▼                  ▼              ▼
//! ┌──────────┐   ┌─────────────┐   ┌─────────────┐ ┌────────────┐
//! │ Metadata │   │  Directory  │   │   Buckets   │ │ Null Bucket│
//! │  (.him)  │   │   (.hit)    │   │   (.hib)    │ │   (.hnb)   │
//! └────┬─────┘   └──────┬──────┘   └──────┬──────┘ └─────┬──────┘
//!      └────────────────┴─────────┬───────┴──────────────┘
//!                                 ▼
//!                       ┌───────────────────┐
//!                       │   FilePageCache   │
//!                       │ (pin, LRU, flush) │
//!                       └─────────┬─────────┘
//!                                 ▼
//!              ┌──────────────────┼──────────────────┐
//!              ▼                  ▼                  ▼
//!       ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//!       │ ClassicFile │   │  AsyncFile  │   │   MmapFile   │
//!       │   (pread)   │   │  (workers)  │   │ (MmapManager)│
//!       └─────────────┘   └─────────────┘   └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod atomic;
pub mod codec;
pub mod file;
pub mod mmap;
pub mod page;
pub mod hashindex;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{PageHashError, Result};
pub use config::{Config, FileKind};
pub use atomic::{AtomicOperation, NoopAtomicOperation};
pub use codec::{BinarySerializer, HashFunction, Xxh3HashFunction};
pub use file::File;
pub use mmap::{AllocationStrategy, MmapManager};
pub use page::{DurablePage, FilePageCache, PageCache};
pub use hashindex::{HashEntry, LocalHashTable, TableStats, Validation};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of PageHash
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
