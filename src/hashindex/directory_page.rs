//! Directory Page Layout
//!
//! Byte layout of the pages that store directory nodes.
//!
//! ## First Page
//! ```text
//! ┌──────────────┬────────────┬───────────────┬───────────────┬─────────┬─────┐
//! │ Page Hdr (16)│ Bitmap (4) │ Tree Size (4) │ Tombstone (4) │ Node 0  │ ... │
//! └──────────────┴────────────┴───────────────┴───────────────┴─────────┴─────┘
//! ```
//!
//! ## Other Pages
//! ```text
//! ┌──────────────┬────────────┬─────────┬─────────┬─────┐
//! │ Page Hdr (16)│ Bitmap (4) │ Node 0  │ Node 1  │ ... │
//! └──────────────┴────────────┴─────────┴─────────┴─────┘
//! ```
//!
//! ## Node (2051 bytes)
//! ```text
//! ┌───────────────┬────────────────┬─────────────┬──────────────────────┐
//! │ Max Left (1)  │ Max Right (1)  │ Local (1)   │ 256 x Pointer (i64)  │
//! └───────────────┴────────────────┴─────────────┴──────────────────────┘
//! ```
//! Bit `i` of the bitmap is set while the page's `i`-th node is allocated.

use std::ops::{Deref, DerefMut};

use crate::page::{DurablePage, PAGE_HEADER_SIZE};

use super::MAX_LEVEL_SIZE;

// =============================================================================
// Layout Constants
// =============================================================================

const BITMAP_OFFSET: usize = PAGE_HEADER_SIZE;
const TREE_SIZE_OFFSET: usize = BITMAP_OFFSET + 4;
const TOMBSTONE_OFFSET: usize = TREE_SIZE_OFFSET + 4;
const FIRST_PAGE_NODES_OFFSET: usize = TOMBSTONE_OFFSET + 4;
const NODES_OFFSET: usize = BITMAP_OFFSET + 4;

const MAX_LEFT_DEPTH_OFFSET: usize = 0;
const MAX_RIGHT_DEPTH_OFFSET: usize = 1;
const LOCAL_DEPTH_OFFSET: usize = 2;
const POINTERS_OFFSET: usize = 3;

/// Bytes of one directory node
pub(crate) const NODE_SIZE: usize = POINTERS_OFFSET + MAX_LEVEL_SIZE * 8;

/// The bitmap has one bit per node
const MAX_NODES_PER_PAGE: usize = 32;

/// Tombstone value of an empty free list
pub(crate) const NO_TOMBSTONE: i32 = -1;

pub(crate) fn nodes_per_first_page(page_size: usize) -> usize {
    ((page_size - FIRST_PAGE_NODES_OFFSET) / NODE_SIZE).min(MAX_NODES_PER_PAGE)
}

pub(crate) fn nodes_per_page(page_size: usize) -> usize {
    ((page_size - NODES_OFFSET) / NODE_SIZE).min(MAX_NODES_PER_PAGE)
}

// =============================================================================
// Directory Page View
// =============================================================================

/// Typed view over one directory page
pub(crate) struct DirectoryPage<P> {
    page: P,
    first: bool,
}

impl<P: Deref<Target = DurablePage>> DirectoryPage<P> {
    pub(crate) fn new(page: P) -> Self {
        let first = page.index() == 0;
        Self { page, first }
    }

    fn node_offset(&self, local: usize) -> usize {
        let base = if self.first {
            FIRST_PAGE_NODES_OFFSET
        } else {
            NODES_OFFSET
        };
        base + local * NODE_SIZE
    }

    fn pointer_offset(&self, local: usize, slot: usize) -> usize {
        self.node_offset(local) + POINTERS_OFFSET + slot * 8
    }

    pub(crate) fn tree_size(&self) -> i32 {
        debug_assert!(self.first);
        self.page.get_i32(TREE_SIZE_OFFSET)
    }

    pub(crate) fn tombstone(&self) -> i32 {
        debug_assert!(self.first);
        self.page.get_i32(TOMBSTONE_OFFSET)
    }

    pub(crate) fn is_allocated(&self, local: usize) -> bool {
        self.page.get_u32(BITMAP_OFFSET) & (1 << local) != 0
    }

    pub(crate) fn max_left_child_depth(&self, local: usize) -> u8 {
        self.page
            .get_u8(self.node_offset(local) + MAX_LEFT_DEPTH_OFFSET)
    }

    pub(crate) fn max_right_child_depth(&self, local: usize) -> u8 {
        self.page
            .get_u8(self.node_offset(local) + MAX_RIGHT_DEPTH_OFFSET)
    }

    pub(crate) fn local_depth(&self, local: usize) -> u8 {
        self.page.get_u8(self.node_offset(local) + LOCAL_DEPTH_OFFSET)
    }

    pub(crate) fn pointer(&self, local: usize, slot: usize) -> i64 {
        self.page.get_i64(self.pointer_offset(local, slot))
    }

    pub(crate) fn pointers(&self, local: usize) -> Vec<i64> {
        (0..MAX_LEVEL_SIZE).map(|slot| self.pointer(local, slot)).collect()
    }
}

impl<P: DerefMut<Target = DurablePage>> DirectoryPage<P> {
    pub(crate) fn set_tree_size(&mut self, size: i32) {
        debug_assert!(self.first);
        self.page.set_i32(TREE_SIZE_OFFSET, size);
    }

    pub(crate) fn set_tombstone(&mut self, tombstone: i32) {
        debug_assert!(self.first);
        self.page.set_i32(TOMBSTONE_OFFSET, tombstone);
    }

    pub(crate) fn set_allocated(&mut self, local: usize, allocated: bool) {
        let bitmap = self.page.get_u32(BITMAP_OFFSET);
        let bitmap = if allocated {
            bitmap | (1 << local)
        } else {
            bitmap & !(1 << local)
        };
        self.page.set_u32(BITMAP_OFFSET, bitmap);
    }

    pub(crate) fn set_max_left_child_depth(&mut self, local: usize, depth: u8) {
        let offset = self.node_offset(local) + MAX_LEFT_DEPTH_OFFSET;
        self.page.set_u8(offset, depth);
    }

    pub(crate) fn set_max_right_child_depth(&mut self, local: usize, depth: u8) {
        let offset = self.node_offset(local) + MAX_RIGHT_DEPTH_OFFSET;
        self.page.set_u8(offset, depth);
    }

    pub(crate) fn set_local_depth(&mut self, local: usize, depth: u8) {
        let offset = self.node_offset(local) + LOCAL_DEPTH_OFFSET;
        self.page.set_u8(offset, depth);
    }

    pub(crate) fn set_pointer(&mut self, local: usize, slot: usize, word: i64) {
        let offset = self.pointer_offset(local, slot);
        self.page.set_i64(offset, word);
    }

    pub(crate) fn set_pointers(&mut self, local: usize, words: &[i64]) {
        debug_assert_eq!(words.len(), MAX_LEVEL_SIZE);
        for (slot, word) in words.iter().enumerate() {
            self.set_pointer(local, slot, *word);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
