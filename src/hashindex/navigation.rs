//! Hash-Order Navigation
//!
//! Buckets are visited left to right (or right to left) through the
//! directory, which yields entries in ascending `(hash code, key)` order.
//! Key order is only preserved when the hash function itself preserves it,
//! so `higher`, `lower`, `ceiling` and `floor` all compare hash codes first.
//!
//! ```text
//!   bucket range in segment s      next slot          end of map
//!   [start .. start+len) ──────▶   descend leftmost   pop to segment s-1
//! ```

use std::cmp::Ordering;

use crate::error::Result;
use crate::page::PageCache;

use super::path::{BucketPath, PathSegment};
use super::table::LocalHashTable;
use super::{HashEntry, NodePointer};

/// Direction of a bucket walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl<K, V, C> LocalHashTable<K, V, C>
where
    K: Ord + Clone,
    C: PageCache,
{
    // =========================================================================
    // Bucket Walk
    // =========================================================================

    /// Path of the bucket that follows the one at `path` (of bucket depth
    /// `depth`) in hash order, or `None` after the last bucket
    pub(super) fn next_bucket_to_find(
        &self,
        path: &BucketPath,
        depth: u8,
    ) -> Result<Option<BucketPath>> {
        let range = path.range_for_depth(depth)?;
        let mut next = path.clone();
        next.truncate(range.segment + 1);
        next.leaf_mut()?.item_index = range.start + range.len - 1;

        self.next_level_up(next)
    }

    /// Path of the bucket that precedes the one at `path` in hash order
    pub(super) fn prev_bucket_to_find(
        &self,
        path: &BucketPath,
        depth: u8,
    ) -> Result<Option<BucketPath>> {
        let range = path.range_for_depth(depth)?;
        let mut prev = path.clone();
        prev.truncate(range.segment + 1);
        prev.leaf_mut()?.item_index = range.start;

        self.prev_level_up(prev)
    }

    /// Step one slot right, popping finished maps
    fn next_level_up(&self, mut path: BucketPath) -> Result<Option<BucketPath>> {
        while !path.is_empty() {
            let leaf = path.leaf_mut()?;
            if leaf.item_index + 1 < leaf.map_size() {
                leaf.item_index += 1;
                return self.descend(path, Direction::Forward).map(Some);
            }
            path.pop();
        }
        Ok(None)
    }

    /// Step one slot left, popping finished maps
    fn prev_level_up(&self, mut path: BucketPath) -> Result<Option<BucketPath>> {
        while !path.is_empty() {
            let leaf = path.leaf_mut()?;
            if leaf.item_index > 0 {
                leaf.item_index -= 1;
                return self.descend(path, Direction::Backward).map(Some);
            }
            path.pop();
        }
        Ok(None)
    }

    /// Follow child pointers from the leaf slot to the first (or last)
    /// bucket below it
    fn descend(&self, mut path: BucketPath, direction: Direction) -> Result<BucketPath> {
        loop {
            let leaf = path.leaf()?;
            match self.directory.get_pointer(leaf.node_index, leaf.slot())? {
                NodePointer::Bucket(_) => return Ok(path),
                NodePointer::Child { node, offset } => {
                    let local_depth = self.directory.get_node_local_depth(node)?;
                    let item_index = match direction {
                        Direction::Forward => 0,
                        Direction::Backward => (1usize << local_depth) - 1,
                    };
                    path.push(PathSegment {
                        node_index: node,
                        hash_map_offset: offset as usize,
                        item_index,
                        local_depth,
                        global_depth: leaf.global_depth + local_depth,
                    });
                }
            }
        }
    }

    /// Visit buckets from `path` on until `select` returns entries.
    ///
    /// `select` sees each bucket's entries in ascending order and whether
    /// the bucket is the starting one.
    fn scan_buckets<F>(
        &self,
        path: BucketPath,
        direction: Direction,
        mut select: F,
    ) -> Result<Vec<HashEntry<K, V>>>
    where
        F: FnMut(Vec<HashEntry<K, V>>, bool) -> Vec<HashEntry<K, V>>,
    {
        let mut cursor = Some(path);
        let mut first = true;

        while let Some(path) = cursor {
            let page = self.bucket_page(&path)?;
            let (entries, depth) = {
                let guard = self.cache.load_for_read(self.bucket_file, page)?;
                let bucket = self.bucket(&*guard);
                (bucket.all_entries()?, bucket.depth())
            };

            let selected = select(entries, first);
            if !selected.is_empty() {
                return Ok(selected);
            }
            first = false;

            cursor = match direction {
                Direction::Forward => self.next_bucket_to_find(&path, depth)?,
                Direction::Backward => self.prev_bucket_to_find(&path, depth)?,
            };
        }
        Ok(Vec::new())
    }

    // =========================================================================
    // Public Navigation
    // =========================================================================

    /// Entries strictly above `key` in hash order, taken from the first
    /// bucket holding any, at most `limit` of them.
    ///
    /// Results are in hash-code order, not key order.
    pub fn higher_entries(&self, key: &K, limit: Option<usize>) -> Result<Vec<HashEntry<K, V>>> {
        let mut entries = self.entries_above(key, false)?;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Entries at or above `key` in hash order, from the first bucket
    /// holding any. Hash-code order, not key order.
    pub fn ceiling_entries(&self, key: &K) -> Result<Vec<HashEntry<K, V>>> {
        self.entries_above(key, true)
    }

    /// Entries strictly below `key` in hash order, from the closest bucket
    /// holding any, returned ascending. Hash-code order, not key order.
    pub fn lower_entries(&self, key: &K) -> Result<Vec<HashEntry<K, V>>> {
        self.entries_below(key, false)
    }

    /// Entries at or below `key` in hash order, from the closest bucket
    /// holding any, returned ascending. Hash-code order, not key order.
    pub fn floor_entries(&self, key: &K) -> Result<Vec<HashEntry<K, V>>> {
        self.entries_below(key, true)
    }

    /// Entry with the smallest hash code
    pub fn first_entry(&self) -> Result<Option<HashEntry<K, V>>> {
        let _guard = self.state_lock.read();
        let path = self.get_bucket(0)?;
        let entries = self.scan_buckets(path, Direction::Forward, |entries, _| entries)?;
        Ok(entries.into_iter().next())
    }

    /// Entry with the largest hash code
    pub fn last_entry(&self) -> Result<Option<HashEntry<K, V>>> {
        let _guard = self.state_lock.read();
        let path = self.get_bucket(u64::MAX)?;
        let entries = self.scan_buckets(path, Direction::Backward, |entries, _| entries)?;
        Ok(entries.into_iter().next_back())
    }

    fn entries_above(&self, key: &K, inclusive: bool) -> Result<Vec<HashEntry<K, V>>> {
        let _guard = self.state_lock.read();
        let key = self.key_serializer.preprocess(key);
        let key: &K = &key;
        let hash_code = self.hash_function.hash_code(key);
        let path = self.get_bucket(hash_code)?;

        self.scan_buckets(path, Direction::Forward, |entries, first| {
            if !first {
                return entries;
            }
            entries
                .into_iter()
                .filter(|entry| match compare_entry(entry, hash_code, key) {
                    Ordering::Greater => true,
                    Ordering::Equal => inclusive,
                    Ordering::Less => false,
                })
                .collect()
        })
    }

    fn entries_below(&self, key: &K, inclusive: bool) -> Result<Vec<HashEntry<K, V>>> {
        let _guard = self.state_lock.read();
        let key = self.key_serializer.preprocess(key);
        let key: &K = &key;
        let hash_code = self.hash_function.hash_code(key);
        let path = self.get_bucket(hash_code)?;

        self.scan_buckets(path, Direction::Backward, |entries, first| {
            if !first {
                return entries;
            }
            entries
                .into_iter()
                .filter(|entry| match compare_entry(entry, hash_code, key) {
                    Ordering::Less => true,
                    Ordering::Equal => inclusive,
                    Ordering::Greater => false,
                })
                .collect()
        })
    }
}

/// Order of a stored entry against `(hash_code, key)`
fn compare_entry<K: Ord, V>(entry: &HashEntry<K, V>, hash_code: u64, key: &K) -> Ordering {
    entry
        .hash_code
        .cmp(&hash_code)
        .then_with(|| entry.key.cmp(key))
}
