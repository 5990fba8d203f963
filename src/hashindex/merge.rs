//! Bucket and Node Merge
//!
//! The inverse of split, run after a removal:
//! 1. A sparse bucket absorbs its buddy (the other half of the range they
//!    shared before their last split) and the buddy page joins the free
//!    bucket list
//! 2. Directory nodes whose maps each hold a single bucket are folded back
//!    into their parent, from the leaf upwards

use crate::error::{PageHashError, Result};
use crate::page::{DurablePage, PageCache};

use super::bucket::HashBucket;
use super::path::BucketPath;
use super::split::maps_hold_one_bucket;
use super::table::LocalHashTable;
use super::{bucket_pointer, NodePointer, HASH_CODE_SIZE, MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE};

impl<K, V, C> LocalHashTable<K, V, C>
where
    K: Ord + Clone,
    C: PageCache,
{
    // =========================================================================
    // Bucket Merge
    // =========================================================================

    /// Merge `bucket` with its buddy if both fit into one page. Returns
    /// whether a merge happened.
    pub(super) fn merge_buckets_after_deletion(
        &self,
        path: &BucketPath,
        bucket: &mut HashBucket<'_, &mut DurablePage, K, V>,
    ) -> Result<bool> {
        let depth = bucket.depth();
        let capacity = bucket.capacity();
        let threshold = (capacity as f64 * self.merge_threshold) as usize;
        if depth <= MAX_LEVEL_DEPTH || bucket.content_size() > threshold {
            return Ok(false);
        }

        // Step 1: the slots both buckets shared at depth - 1
        let range = path.range_for_depth(depth - 1)?;
        let segment = path.segment(range.segment);
        let half = range.len / 2;
        let in_right_half = segment.item_index - range.start >= half;
        let buddy_start = if in_right_half {
            range.start
        } else {
            range.start + half
        };

        // Step 2: the buddy must be one bucket of the same depth
        let page_index = bucket.page_index();
        let buddy_index =
            self.first_bucket_from(segment.node_index, segment.hash_map_offset + buddy_start)?;
        if buddy_index == page_index {
            return Ok(false);
        }

        let mut buddy_page = self.cache.load_for_write(self.bucket_file, buddy_index)?;
        let mut buddy = self.bucket(&mut *buddy_page);
        if buddy.depth() != depth || bucket.content_size() + buddy.content_size() > capacity {
            return Ok(false);
        }

        // Step 3: rebuild this bucket with the lower half first
        let own = bucket.all_entries()?;
        let other = buddy.all_entries()?;
        let (lower, upper) = if in_right_half {
            (other, own)
        } else {
            (own, other)
        };

        bucket.reset_entries(depth - 1);
        for entry in lower.iter().chain(upper.iter()) {
            if !bucket.append_entry(entry.hash_code, &entry.key, &entry.value)? {
                return Err(PageHashError::corrupted(format!(
                    "merged entries of buckets {page_index} and {buddy_index} do not fit"
                )));
            }
        }

        // Step 4: release the buddy onto the free list
        let free_head = self.read_metadata(|metadata| metadata.free_bucket_head())?;
        buddy.init(0);
        buddy.set_next_removed_bucket(free_head);
        drop(buddy_page);

        self.write_metadata(|metadata| {
            metadata.set_free_bucket_head(bucket_pointer(buddy_index));
            metadata.add_buckets_at_depth(depth, -2);
            metadata.add_buckets_at_depth(depth - 1, 1);
        })?;

        // Step 5: every slot of the shared range now leads to this bucket
        let merged = bucket_pointer(page_index);
        for item in range.start..range.start + range.len {
            self.update_bucket(segment.node_index, item, segment.hash_map_offset, merged)?;
        }

        tracing::debug!(
            bucket = page_index,
            freed = buddy_index,
            depth = depth - 1,
            entries = lower.len() + upper.len(),
            "buckets merged"
        );
        Ok(true)
    }

    /// Bucket reached from a slot, descending into first child slots
    fn first_bucket_from(&self, node: u32, slot: usize) -> Result<u64> {
        let mut node = node;
        let mut slot = slot;

        for _ in 0..=HASH_CODE_SIZE / MAX_LEVEL_DEPTH {
            match self.directory.get_pointer(node, slot)? {
                NodePointer::Bucket(page) => return Ok(page),
                NodePointer::Child {
                    node: child,
                    offset,
                } => {
                    node = child;
                    slot = offset as usize;
                }
            }
        }

        Err(PageHashError::corrupted(format!(
            "directory below node {node} is deeper than the hash code"
        )))
    }

    // =========================================================================
    // Node Merge
    // =========================================================================

    /// Fold uniform nodes of `path` into their parents, leaf first
    pub(super) fn merge_nodes_after_deletion(&self, path: &BucketPath) -> Result<()> {
        let mut level = path.len().saturating_sub(1);

        while level > 0 {
            let segment = path.segment(level);
            let node = self.directory.get_node(segment.node_index)?;
            if !maps_hold_one_bucket(&node, segment.map_size()) {
                break;
            }

            self.merge_node_to_parent(path, level, &node)?;
            level -= 1;
        }
        Ok(())
    }

    fn merge_node_to_parent(&self, path: &BucketPath, level: usize, node: &[i64]) -> Result<()> {
        let segment = path.segment(level);
        let parent = path.segment(level - 1);
        let map_size = segment.map_size();

        // Step 1: each parent slot takes the bucket of the map it served
        let pointers = MAX_LEVEL_SIZE / map_size;
        let start = (parent.slot() / pointers) * pointers;
        for (i, map) in node.chunks(map_size).enumerate() {
            self.directory
                .set_node_pointer(parent.node_index, start + i, map[0])?;
        }
        self.directory.delete_node(segment.node_index)?;

        // Step 2: the removed child may have been the deepest of its half
        let depth = segment.local_depth;
        if parent.slot() < MAX_LEVEL_SIZE / 2 {
            if self.directory.get_max_left_child_depth(parent.node_index)? == depth {
                let max = self.max_child_depth(parent.node_index, 0, MAX_LEVEL_SIZE / 2)?;
                self.directory
                    .set_max_left_child_depth(parent.node_index, max)?;
            }
        } else if self.directory.get_max_right_child_depth(parent.node_index)? == depth {
            let max = self.max_child_depth(parent.node_index, MAX_LEVEL_SIZE / 2, MAX_LEVEL_SIZE)?;
            self.directory
                .set_max_right_child_depth(parent.node_index, max)?;
        }

        tracing::debug!(
            node = segment.node_index,
            parent = parent.node_index,
            local_depth = depth,
            "directory node merged into parent"
        );
        Ok(())
    }

    /// Deepest child referenced from slots `[start, end)`, 0 if none
    fn max_child_depth(&self, node: u32, start: usize, end: usize) -> Result<u8> {
        let pointers = self.directory.get_node(node)?;
        let mut max = 0u8;
        for word in &pointers[start..end] {
            if let NodePointer::Child { node: child, .. } = NodePointer::decode(*word)? {
                max = max.max(self.directory.get_node_local_depth(child)?);
            }
        }
        Ok(max)
    }
}
