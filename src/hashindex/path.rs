//! Bucket Path
//!
//! The chain of directory slots a hash code passes through from the root to
//! its bucket, recorded for one operation and then discarded.
//!
//! ```text
//!  segment 0 (root)      segment 1               segment 2 (leaf)
//!  node 0, L=8, G=8  ->  node 5, L=8, G=16   ->  node 9, L=3, G=19
//!  slot 17               slot 200                map offset 64, item 5
//! ```
//! `L` is the node's local depth (bits it consumes), `G` the number of hash
//! bits consumed once the node is reached. Item indexes are relative to the
//! map the parent slot points at.

use crate::error::{PageHashError, Result};

use super::LEVEL_MASK;

/// One directory node visited by a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSegment {
    pub node_index: u32,

    /// First slot of the map the walk entered
    pub hash_map_offset: usize,

    /// Slot within the map
    pub item_index: usize,

    pub local_depth: u8,

    pub global_depth: u8,
}

impl PathSegment {
    /// Absolute slot in the node
    pub fn slot(&self) -> usize {
        self.hash_map_offset + self.item_index
    }

    pub fn map_size(&self) -> usize {
        1 << self.local_depth
    }
}

/// Aligned run of slots inside one path segment's map covering every hash
/// code that shares a given prefix with the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotRange {
    /// Index of the segment holding the range
    pub segment: usize,

    /// First item index of the range, relative to the segment's map
    pub start: usize,

    pub len: usize,
}

/// Root-to-leaf walk through the directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketPath {
    segments: Vec<PathSegment>,
}

impl BucketPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.segments.pop()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> PathSegment {
        self.segments[index]
    }

    /// Segment of the node that holds the bucket pointer
    pub fn leaf(&self) -> Result<PathSegment> {
        self.segments
            .last()
            .copied()
            .ok_or_else(|| PageHashError::corrupted("empty bucket path"))
    }

    pub(crate) fn leaf_mut(&mut self) -> Result<&mut PathSegment> {
        self.segments
            .last_mut()
            .ok_or_else(|| PageHashError::corrupted("empty bucket path"))
    }

    /// Segment above the leaf, if the leaf is not the root
    pub fn parent(&self) -> Option<PathSegment> {
        self.segments.len().checked_sub(2).map(|i| self.segments[i])
    }

    /// Keep the first `len` segments
    pub(crate) fn truncate(&mut self, len: usize) {
        self.segments.truncate(len);
    }

    /// Hash bits selected by the walk, `leaf.global_depth` bits wide
    pub fn prefix(&self) -> u64 {
        self.segments.iter().fold(0u64, |prefix, segment| {
            (prefix << segment.local_depth) | segment.item_index as u64
        })
    }

    /// Locate the slots that cover all hash codes sharing the top `depth`
    /// bits of this path.
    ///
    /// Walks up from the leaf to the node whose bits contain bit `depth`,
    /// then aligns the item index down to the run of `2^(L - diff)` slots,
    /// where `diff` is how many of that node's bits are fixed by the prefix.
    pub(crate) fn range_for_depth(&self, depth: u8) -> Result<SlotRange> {
        let leaf = self.leaf()?;
        if depth > leaf.global_depth {
            return Err(PageHashError::corrupted(format!(
                "bucket depth {} exceeds directory depth {} of node {}",
                depth, leaf.global_depth, leaf.node_index
            )));
        }

        let mut index = self.segments.len() - 1;
        loop {
            let segment = self.segments[index];
            let node_start = segment.global_depth - segment.local_depth;
            if depth >= node_start {
                let free_bits = segment.local_depth - (depth - node_start);
                let len = 1usize << free_bits;
                let mask = (LEVEL_MASK << free_bits) & LEVEL_MASK;
                return Ok(SlotRange {
                    segment: index,
                    start: segment.item_index & mask,
                    len,
                });
            }
            if index == 0 {
                return Err(PageHashError::corrupted(format!(
                    "bucket depth {depth} is above the directory root"
                )));
            }
            index -= 1;
        }
    }
}
