//! Bucket Split and Directory Growth
//!
//! A full bucket of depth `d` is split on hash bit `d + 1`; the directory is
//! then updated in one of three ways:
//!
//! ```text
//! new depth <= node global depth   rewrite the slots of the existing node
//! node local depth < 8             split the node into two of depth L + 1
//! node local depth == 8            link a new child node under the slot
//! ```

use crate::error::{PageHashError, Result};
use crate::page::{DurablePage, PageCache, PageWriteGuard};

use super::bucket::HashBucket;
use super::path::{BucketPath, PathSegment};
use super::table::LocalHashTable;
use super::{bucket_pointer, NodePointer, HASH_CODE_SIZE, MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE};

/// Result of splitting one bucket
#[derive(Debug, Clone, Copy)]
pub(super) struct BucketSplit {
    /// Depth of both buckets after the split
    pub new_depth: u8,

    /// Pointer of the split bucket, which keeps hashes with a 0 bit
    pub updated: i64,

    /// Pointer of the new bucket, which takes hashes with a 1 bit
    pub new: i64,
}

/// Leaf node rebuilt at local depth L + 1
struct NodeSplit {
    /// Right half of the old node, every slot duplicated
    new_node: Vec<i64>,

    all_left_hash_maps_equal: bool,

    all_right_hash_maps_equal: bool,
}

/// True when every map of `node` holds a single bucket pointer
pub(super) fn maps_hold_one_bucket(node: &[i64], map_size: usize) -> bool {
    node.chunks(map_size).all(|map| {
        NodePointer::is_bucket(map[0]) && map.iter().all(|word| *word == map[0])
    })
}

impl<K, V, C> LocalHashTable<K, V, C>
where
    K: Ord + Clone,
    C: PageCache,
{
    // =========================================================================
    // Bucket Split
    // =========================================================================

    /// Split a full bucket in place; the returned pointers must then be
    /// wired into the directory
    pub(super) fn split_bucket(
        &self,
        bucket: &mut HashBucket<'_, &mut DurablePage, K, V>,
    ) -> Result<BucketSplit> {
        let depth = bucket.depth();
        if depth >= HASH_CODE_SIZE {
            return Err(PageHashError::corrupted(format!(
                "bucket {} is full at depth {}",
                bucket.page_index(),
                depth
            )));
        }
        let new_depth = depth + 1;
        let page_index = bucket.page_index();
        let updated = bucket_pointer(page_index);

        let entries = bucket.all_entries()?;
        let (new_page_index, mut new_page) = self.allocate_bucket_page()?;
        let mut new_bucket = self.bucket(&mut *new_page);

        // Step 1: both halves inherit the history and record the split
        new_bucket.init(new_depth);
        for level in 0..depth {
            new_bucket.set_split_history(level, bucket.split_history(level));
        }
        new_bucket.set_split_history(depth, updated);
        bucket.set_split_history(depth, updated);
        bucket.reset_entries(new_depth);

        // Step 2: redistribute on the new hash bit
        let bit = HASH_CODE_SIZE - new_depth;
        for entry in &entries {
            let appended = if (entry.hash_code >> bit) & 1 == 0 {
                bucket.append_entry(entry.hash_code, &entry.key, &entry.value)?
            } else {
                new_bucket.append_entry(entry.hash_code, &entry.key, &entry.value)?
            };
            if !appended {
                return Err(PageHashError::corrupted(format!(
                    "entry with hash {:#018x} lost while splitting bucket {}",
                    entry.hash_code, page_index
                )));
            }
        }
        let moved = new_bucket.size();
        drop(new_page);

        self.write_metadata(|metadata| {
            metadata.add_buckets_at_depth(depth, -1);
            metadata.add_buckets_at_depth(new_depth, 2);
        })?;

        tracing::debug!(
            bucket = page_index,
            new_bucket = new_page_index,
            depth = new_depth,
            kept = entries.len() - moved,
            moved,
            "bucket split"
        );
        Ok(BucketSplit {
            new_depth,
            updated,
            new: bucket_pointer(new_page_index),
        })
    }

    /// Take a page from the free-bucket list, or append one
    fn allocate_bucket_page(&self) -> Result<(u64, PageWriteGuard)> {
        let head = self.read_metadata(|metadata| metadata.free_bucket_head())?;
        if head == 0 {
            let page = self.cache.add_page(self.bucket_file)?;
            return Ok((page.index(), page));
        }

        let NodePointer::Bucket(index) = NodePointer::decode(head)? else {
            return Err(PageHashError::corrupted(format!(
                "free bucket list head {head:#x} is not a bucket pointer"
            )));
        };
        let page = self.cache.load_for_write(self.bucket_file, index)?;
        let next = self.bucket(&*page).next_removed_bucket();
        self.write_metadata(|metadata| metadata.set_free_bucket_head(next))?;

        tracing::trace!(bucket = index, "bucket page reused");
        Ok((index, page))
    }

    // =========================================================================
    // Directory Update
    // =========================================================================

    pub(super) fn update_directory_after_split(
        &self,
        path: &BucketPath,
        split: &BucketSplit,
    ) -> Result<()> {
        let leaf = path.leaf()?;
        if split.new_depth <= leaf.global_depth {
            self.update_node_after_bucket_split(path, split)
        } else if leaf.local_depth < MAX_LEVEL_DEPTH {
            self.split_leaf_node(path, split)
        } else {
            self.add_new_level_node(path, split)
        }
    }

    /// Point the lower half of the old bucket's slots at the split bucket
    /// and the upper half at the new one
    fn update_node_after_bucket_split(&self, path: &BucketPath, split: &BucketSplit) -> Result<()> {
        let range = path.range_for_depth(split.new_depth - 1)?;
        let segment = path.segment(range.segment);
        let half = range.len / 2;

        for item in range.start..range.start + half {
            self.update_bucket(segment.node_index, item, segment.hash_map_offset, split.updated)?;
        }
        for item in range.start + half..range.start + range.len {
            self.update_bucket(segment.node_index, item, segment.hash_map_offset, split.new)?;
        }
        Ok(())
    }

    /// Store `pointer` in a slot, or in every slot of the child map the
    /// slot leads to
    pub(super) fn update_bucket(
        &self,
        node: u32,
        item: usize,
        hash_map_offset: usize,
        pointer: i64,
    ) -> Result<()> {
        let slot = hash_map_offset + item;
        match self.directory.get_pointer(node, slot)? {
            NodePointer::Bucket(_) => self.directory.set_node_pointer(node, slot, pointer),
            NodePointer::Child {
                node: child,
                offset,
            } => {
                let depth = self.directory.get_node_local_depth(child)?;
                for child_item in 0..1usize << depth {
                    self.update_bucket(child, child_item, offset as usize, pointer)?;
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Node Split
    // =========================================================================

    /// Double the local depth of the leaf node. Each half of its slots
    /// becomes a node of its own; a half whose maps each hold one bucket is
    /// folded straight into the parent.
    fn split_leaf_node(&self, path: &BucketPath, split: &BucketSplit) -> Result<()> {
        let leaf = path.leaf()?;
        let node_split = self.split_node(&leaf)?;
        let new_local = leaf.local_depth + 1;

        let updated_offset = leaf.hash_map_offset << 1;
        let target_left = updated_offset < MAX_LEVEL_SIZE;
        let mut all_left = node_split.all_left_hash_maps_equal;
        let mut all_right = node_split.all_right_hash_maps_equal;

        let new_node = if !all_right || !target_left {
            Some(
                self.directory
                    .add_new_node(0, 0, new_local, &node_split.new_node)?,
            )
        } else {
            None
        };

        // Step 1: wire the split bucket into whichever half holds it
        let mut updated_path = path.clone();
        let target = if target_left {
            all_left = false;
            PathSegment {
                node_index: leaf.node_index,
                hash_map_offset: updated_offset,
                item_index: leaf.item_index << 1,
                local_depth: new_local,
                global_depth: leaf.global_depth + 1,
            }
        } else {
            all_right = false;
            PathSegment {
                node_index: new_node.ok_or_else(|| {
                    PageHashError::corrupted("right half of a node split was not allocated")
                })?,
                hash_map_offset: updated_offset - MAX_LEVEL_SIZE,
                item_index: leaf.item_index << 1,
                local_depth: new_local,
                global_depth: leaf.global_depth + 1,
            }
        };
        *updated_path.leaf_mut()? = target;
        self.update_node_after_bucket_split(&updated_path, split)?;

        // Step 2: rewire the parent slots that served the old node
        self.update_nodes_after_split(path, &node_split.new_node, new_node, all_left, all_right)?;

        if all_left {
            self.directory.delete_node(leaf.node_index)?;
        }

        tracing::debug!(
            node = leaf.node_index,
            new_node = ?new_node,
            local_depth = new_local,
            all_left,
            all_right,
            "directory node split"
        );
        Ok(())
    }

    /// Rewrite the leaf node as its left half with every slot duplicated,
    /// and return the right half duplicated the same way
    fn split_node(&self, leaf: &PathSegment) -> Result<NodeSplit> {
        let node = self.directory.get_node(leaf.node_index)?;
        let half = MAX_LEVEL_SIZE / 2;

        let mut updated_node = vec![0i64; MAX_LEVEL_SIZE];
        let mut new_node = vec![0i64; MAX_LEVEL_SIZE];
        for i in 0..half {
            updated_node[2 * i] = node[i];
            updated_node[2 * i + 1] = node[i];
            new_node[2 * i] = node[half + i];
            new_node[2 * i + 1] = node[half + i];
        }

        let map_size = 1usize << (leaf.local_depth + 1);
        let all_left_hash_maps_equal = maps_hold_one_bucket(&updated_node, map_size);
        let all_right_hash_maps_equal = maps_hold_one_bucket(&new_node, map_size);

        self.directory.set_node(leaf.node_index, &updated_node)?;
        self.directory
            .set_node_local_depth(leaf.node_index, leaf.local_depth + 1)?;

        Ok(NodeSplit {
            new_node,
            all_left_hash_maps_equal,
            all_right_hash_maps_equal,
        })
    }

    fn update_nodes_after_split(
        &self,
        path: &BucketPath,
        new_node: &[i64],
        new_node_index: Option<u32>,
        all_left: bool,
        all_right: bool,
    ) -> Result<()> {
        let leaf = path.leaf()?;
        let parent = path
            .parent()
            .ok_or_else(|| PageHashError::corrupted("split of a node without a parent"))?;

        let old_pointers = MAX_LEVEL_SIZE >> leaf.local_depth;
        let start = (parent.slot() / old_pointers) * old_pointers;
        let new_local = leaf.local_depth + 1;
        let pointers = MAX_LEVEL_SIZE >> new_local;
        let map_size = 1usize << new_local;

        for i in 0..pointers {
            let word = if all_left {
                self.directory
                    .get_node_pointer(leaf.node_index, i * map_size)?
            } else {
                NodePointer::Child {
                    node: leaf.node_index,
                    offset: (i * map_size) as u8,
                }
                .encode()
            };
            self.directory
                .set_node_pointer(parent.node_index, start + i, word)?;
        }

        for i in 0..pointers {
            let word = if all_right {
                new_node[i * map_size]
            } else {
                let node = new_node_index.ok_or_else(|| {
                    PageHashError::corrupted("right half of a node split was not allocated")
                })?;
                NodePointer::Child {
                    node,
                    offset: (i * map_size) as u8,
                }
                .encode()
            };
            self.directory
                .set_node_pointer(parent.node_index, start + pointers + i, word)?;
        }

        self.update_max_child_depth(&parent, new_local)
    }

    // =========================================================================
    // New Level
    // =========================================================================

    /// Hang a new child node under the leaf slot. The child's depth follows
    /// the deepest child already present in the same half of the node, and
    /// the neighbouring slots it absorbs keep their buckets.
    fn add_new_level_node(&self, path: &BucketPath, split: &BucketSplit) -> Result<()> {
        let leaf = path.leaf()?;
        let slot = leaf.slot();

        let hint = if slot < MAX_LEVEL_SIZE / 2 {
            self.directory.get_max_left_child_depth(leaf.node_index)?
        } else {
            self.directory.get_max_right_child_depth(leaf.node_index)?
        };
        let new_local = hint
            .max(1)
            .min(MAX_LEVEL_DEPTH)
            .min(HASH_CODE_SIZE - leaf.global_depth);

        let map_size = 1usize << new_local;
        let interval = MAX_LEVEL_SIZE >> new_local;
        let start = (slot / interval) * interval;

        let mut pointers = vec![0i64; MAX_LEVEL_SIZE];
        for (i, map) in pointers.chunks_mut(map_size).enumerate() {
            let node_slot = start + i;
            if node_slot == slot {
                let (left, right) = map.split_at_mut(map_size / 2);
                left.fill(split.updated);
                right.fill(split.new);
            } else {
                let word = self.directory.get_node_pointer(leaf.node_index, node_slot)?;
                if !NodePointer::is_bucket(word) {
                    return Err(PageHashError::corrupted(format!(
                        "slot {} of node {} holds a child inside a new level",
                        node_slot, leaf.node_index
                    )));
                }
                map.fill(word);
            }
        }

        let child = self.directory.add_new_node(0, 0, new_local, &pointers)?;
        for i in 0..interval {
            self.directory.set_pointer(
                leaf.node_index,
                start + i,
                NodePointer::Child {
                    node: child,
                    offset: (i * map_size) as u8,
                },
            )?;
        }
        self.update_max_child_depth(&leaf, new_local)?;

        tracing::debug!(
            parent = leaf.node_index,
            node = child,
            local_depth = new_local,
            slots = interval,
            "directory level added"
        );
        Ok(())
    }

    /// Raise the max-child-depth hint of the half holding `segment`'s slot
    fn update_max_child_depth(&self, segment: &PathSegment, depth: u8) -> Result<()> {
        let node = segment.node_index;
        if segment.slot() < MAX_LEVEL_SIZE / 2 {
            if self.directory.get_max_left_child_depth(node)? < depth {
                self.directory.set_max_left_child_depth(node, depth)?;
            }
        } else if self.directory.get_max_right_child_depth(node)? < depth {
            self.directory.set_max_right_child_depth(node, depth)?;
        }
        Ok(())
    }
}
