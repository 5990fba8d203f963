//! Extendible Hash Index
//!
//! A durable extendible hash table built on the page cache.
//!
//! ## Responsibilities
//! - Route keys through a tree of 256-slot directory nodes to bucket pages
//! - Keep entries of each bucket sorted by (hash code, key)
//! - Split full buckets and grow the directory (node split or new level)
//! - Merge sparse buddy buckets and fold uniform nodes back into parents
//! - Walk buckets in hash order for range navigation
//!
//! ## Files
//! ```text
//! <name>.him   metadata page (record count, codec ids, free buckets)
//! <name>.hit   directory pages (tree nodes)
//! <name>.hib   bucket pages
//! <name>.hnb   null-key bucket
//! ```
//!
//! ## Directory Tree
//! ```text
//!                     root (local depth 8, 256 slots)
//!        ┌──────────────┬──────┴───────┬──────────────┐
//!     Bucket(p)      Bucket(q)     Child(n, 0)    Child(n, 128)
//!                                      │              │
//!                            node n, local depth 7: two maps of 128 slots
//! ```
//! A slot holds either a bucket pointer or a reference to one map of a
//! child node. A child of local depth `L` holds `256 / 2^L` maps, each
//! served by one consecutive slot of its parent.

mod bucket;
mod directory;
mod directory_page;
mod merge;
mod metadata;
mod navigation;
mod null_bucket;
mod path;
mod split;
mod table;

pub use bucket::{HashBucket, UpdateResult, BUCKET_CAPACITY_OFFSET};
pub use directory::HashTableDirectory;
pub use path::{BucketPath, PathSegment};
pub use table::{LocalHashTable, TableStats, Validation};

use crate::error::{PageHashError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Bits in a hash code
pub const HASH_CODE_SIZE: u8 = 64;

/// Bits consumed by one directory level
pub const MAX_LEVEL_DEPTH: u8 = 8;

/// Slots in one directory node
pub const MAX_LEVEL_SIZE: usize = 1 << MAX_LEVEL_DEPTH;

pub(crate) const LEVEL_MASK: usize = 0xFF;

/// File extension of the metadata page file
pub const METADATA_FILE_EXTENSION: &str = ".him";

/// File extension of the directory file
pub const DIRECTORY_FILE_EXTENSION: &str = ".hit";

/// File extension of the bucket file
pub const BUCKET_FILE_EXTENSION: &str = ".hib";

/// File extension of the null-key bucket file
pub const NULL_BUCKET_FILE_EXTENSION: &str = ".hnb";

// =============================================================================
// Node Pointer
// =============================================================================

/// Decoded directory slot.
///
/// On disk a slot is one i64 word: `page + 1` for a bucket (0 is never
/// valid), or `(node << 8) | offset` with the sign bit set for a child map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePointer {
    /// Page index of a bucket in the bucket file
    Bucket(u64),

    /// Map of a child node starting at slot `offset`
    Child { node: u32, offset: u8 },
}

impl NodePointer {
    pub fn encode(self) -> i64 {
        match self {
            NodePointer::Bucket(page) => (page + 1) as i64,
            NodePointer::Child { node, offset } => {
                ((node as i64) << 8) | offset as i64 | i64::MIN
            }
        }
    }

    pub fn decode(word: i64) -> Result<Self> {
        if word < 0 {
            let node = (word & i64::MAX) >> 8;
            if node > u32::MAX as i64 {
                return Err(PageHashError::corrupted(format!(
                    "child pointer {word:#x} references node {node}"
                )));
            }
            return Ok(NodePointer::Child {
                node: node as u32,
                offset: (word & 0xFF) as u8,
            });
        }

        if word == 0 {
            return Err(PageHashError::corrupted("empty directory slot"));
        }
        Ok(NodePointer::Bucket(word as u64 - 1))
    }

    pub fn is_bucket(word: i64) -> bool {
        word > 0
    }
}

/// Bucket pointer word of a page, as stored in directory slots and in
/// bucket free-list links
pub(crate) fn bucket_pointer(page: u64) -> i64 {
    NodePointer::Bucket(page).encode()
}

// =============================================================================
// Entries
// =============================================================================

/// One stored entry with its hash code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry<K, V> {
    pub hash_code: u64,
    pub key: K,
    pub value: V,
}

/// Top `depth` bits of a hash code
pub(crate) fn hash_prefix(hash_code: u64, depth: u8) -> u64 {
    if depth == 0 {
        0
    } else {
        hash_code >> (HASH_CODE_SIZE - depth)
    }
}

// =============================================================================
// Tests
// =============================================================================
