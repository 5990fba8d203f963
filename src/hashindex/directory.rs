//! Hash Table Directory
//!
//! Page-backed array of directory nodes with a tombstone free list.
//!
//! ## Responsibilities
//! - Translate a node index to its (page, local slot) position
//! - Allocate nodes from the free list before growing the tree
//! - Read and write node pointers and depth bytes
//!
//! ## Node Addressing
//! ```text
//! node < F          -> page 0, local = node
//! node >= F         -> page 1 + (node - F) / P, local = (node - F) % P
//!
//! F = nodes on the first page, P = nodes on every other page
//! ```
//!
//! Every directory page stays pinned in the page cache while the directory
//! is open, so walks from the root never go to disk.
//!
//! ## Concurrency:
//! The directory holds no lock of its own. Each accessor takes the page
//! guard it needs for the duration of the call; structural changes are
//! serialized by the owning table.

use std::sync::Arc;

use crate::error::{PageHashError, Result};
use crate::page::{DurablePage, FileId, PageCache};

use super::directory_page::{self, DirectoryPage, NO_TOMBSTONE};
use super::{NodePointer, MAX_LEVEL_SIZE};

/// Persistent tree of 256-slot directory nodes
pub struct HashTableDirectory<C: PageCache> {
    cache: Arc<C>,
    name: String,
    file_id: FileId,
    first_page_nodes: usize,
    page_nodes: usize,
}

impl<C: PageCache> HashTableDirectory<C> {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the directory file with an empty first page
    pub fn create(cache: Arc<C>, name: &str) -> Result<Self> {
        let file_id = cache.add_file(name)?;
        let directory = Self::with_file(cache, name, file_id);
        directory.init()?;

        tracing::debug!(name, file_id, "directory created");
        Ok(directory)
    }

    /// Open an existing directory file and pin its pages
    pub fn open(cache: Arc<C>, name: &str) -> Result<Self> {
        let file_id = cache.open_file(name)?;
        let directory = Self::with_file(cache, name, file_id);

        let pages = directory.cache.filled_up_to(file_id)?;
        if pages == 0 {
            return Err(PageHashError::corrupted(format!(
                "directory file {name} has no first page"
            )));
        }
        for page in 0..pages {
            directory.cache.pin(file_id, page)?;
        }

        tracing::debug!(name, file_id, pages, "directory opened");
        Ok(directory)
    }

    fn with_file(cache: Arc<C>, name: &str, file_id: FileId) -> Self {
        let page_size = cache.page_size();
        Self {
            first_page_nodes: directory_page::nodes_per_first_page(page_size),
            page_nodes: directory_page::nodes_per_page(page_size),
            cache,
            name: name.to_string(),
            file_id,
        }
    }

    fn init(&self) -> Result<()> {
        let mut first = self.cache.add_page(self.file_id)?;
        if first.index() != 0 {
            return Err(PageHashError::corrupted(format!(
                "directory {} was not empty on init",
                self.name
            )));
        }

        let mut view = DirectoryPage::new(&mut *first);
        view.set_tree_size(0);
        view.set_tombstone(NO_TOMBSTONE);
        drop(first);

        self.cache.pin(self.file_id, 0)
    }

    /// Drop every node and start over with an empty first page
    pub fn clear(&self) -> Result<()> {
        self.cache.truncate(self.file_id)?;
        self.init()?;

        tracing::debug!(name = %self.name, "directory cleared");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush(self.file_id)
    }

    pub fn close(self, flush: bool) -> Result<()> {
        self.unpin_all()?;
        self.cache.close_file(self.file_id, flush)
    }

    pub fn delete(self) -> Result<()> {
        self.unpin_all()?;
        self.cache.delete_file(self.file_id)
    }

    fn unpin_all(&self) -> Result<()> {
        for page in 0..self.cache.filled_up_to(self.file_id)? {
            self.cache.unpin(self.file_id, page);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub fn tree_size(&self) -> Result<u32> {
        let first = self.cache.load_for_read(self.file_id, 0)?;
        Ok(DirectoryPage::new(&*first).tree_size() as u32)
    }

    /// Head of the free list, if any node was deleted
    pub fn tombstone(&self) -> Result<Option<u32>> {
        let first = self.cache.load_for_read(self.file_id, 0)?;
        let tombstone = DirectoryPage::new(&*first).tombstone();
        Ok((tombstone >= 0).then_some(tombstone as u32))
    }

    /// Allocate a node and fill it. Reuses the free-list head when there
    /// is one, otherwise appends to the tree.
    pub fn add_new_node(
        &self,
        max_left_child_depth: u8,
        max_right_child_depth: u8,
        local_depth: u8,
        pointers: &[i64],
    ) -> Result<u32> {
        if pointers.len() != MAX_LEVEL_SIZE {
            return Err(PageHashError::corrupted(format!(
                "directory node needs {MAX_LEVEL_SIZE} pointers, got {}",
                pointers.len()
            )));
        }

        let (tree_size, tombstone) = {
            let first = self.cache.load_for_read(self.file_id, 0)?;
            let view = DirectoryPage::new(&*first);
            (view.tree_size(), view.tombstone())
        };

        let node = if tombstone >= 0 {
            // Step 1: pop the free list, its link sits in slot 0 of the node
            let node = tombstone as u32;
            let (page, local) = self.locate(node);
            let next = {
                let guard = self.cache.load_for_read(self.file_id, page)?;
                DirectoryPage::new(&*guard).pointer(local, 0)
            };
            let mut first = self.cache.load_for_write(self.file_id, 0)?;
            DirectoryPage::new(&mut *first).set_tombstone(next as i32);
            node
        } else {
            // Step 1: grow the tree, adding a page when the node starts one
            let node = tree_size as u32;
            let (page, _) = self.locate(node);
            let filled = self.cache.filled_up_to(self.file_id)?;
            if page >= filled {
                let added = self.cache.add_page(self.file_id)?;
                if added.index() != page {
                    return Err(PageHashError::corrupted(format!(
                        "directory page {} added where {} was expected",
                        added.index(),
                        page
                    )));
                }
                drop(added);
                self.cache.pin(self.file_id, page)?;
            }

            let mut first = self.cache.load_for_write(self.file_id, 0)?;
            DirectoryPage::new(&mut *first).set_tree_size(tree_size + 1);
            node
        };

        // Step 2: write the node and mark it allocated
        let (page, local) = self.locate(node);
        let mut guard = self.cache.load_for_write(self.file_id, page)?;
        let mut view = DirectoryPage::new(&mut *guard);
        view.set_max_left_child_depth(local, max_left_child_depth);
        view.set_max_right_child_depth(local, max_right_child_depth);
        view.set_local_depth(local, local_depth);
        view.set_pointers(local, pointers);
        view.set_allocated(local, true);

        tracing::trace!(directory = %self.name, node, local_depth, "directory node added");
        Ok(node)
    }

    /// Push a node onto the free list
    pub fn delete_node(&self, node: u32) -> Result<()> {
        if node == 0 {
            return Err(PageHashError::corrupted("root directory node cannot be deleted"));
        }
        self.check_allocated(node)?;

        let tombstone = {
            let mut first = self.cache.load_for_write(self.file_id, 0)?;
            let mut view = DirectoryPage::new(&mut *first);
            let tombstone = view.tombstone();
            view.set_tombstone(node as i32);
            tombstone
        };

        let (page, local) = self.locate(node);
        let mut guard = self.cache.load_for_write(self.file_id, page)?;
        let mut view = DirectoryPage::new(&mut *guard);
        view.set_pointer(local, 0, tombstone as i64);
        view.set_allocated(local, false);

        tracing::trace!(directory = %self.name, node, "directory node deleted");
        Ok(())
    }

    fn locate(&self, node: u32) -> (u64, usize) {
        let node = node as usize;
        if node < self.first_page_nodes {
            return (0, node);
        }
        let rest = node - self.first_page_nodes;
        ((1 + rest / self.page_nodes) as u64, rest % self.page_nodes)
    }

    pub fn is_allocated(&self, node: u32) -> Result<bool> {
        let (page, local) = self.locate(node);
        if page >= self.cache.filled_up_to(self.file_id)? {
            return Ok(false);
        }
        let guard = self.cache.load_for_read(self.file_id, page)?;
        Ok(DirectoryPage::new(&*guard).is_allocated(local))
    }

    fn check_allocated(&self, node: u32) -> Result<()> {
        if !self.is_allocated(node)? {
            return Err(PageHashError::corrupted(format!(
                "directory {} node {} is not allocated",
                self.name, node
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Node Access
    // =========================================================================

    fn read_node<R>(
        &self,
        node: u32,
        f: impl FnOnce(&DirectoryPage<&DurablePage>, usize) -> R,
    ) -> Result<R> {
        let (page, local) = self.locate(node);
        let guard = self.cache.load_for_read(self.file_id, page)?;
        let view = DirectoryPage::new(&*guard);
        if !view.is_allocated(local) {
            return Err(PageHashError::corrupted(format!(
                "directory {} node {} is not allocated",
                self.name, node
            )));
        }
        Ok(f(&view, local))
    }

    fn write_node<R>(
        &self,
        node: u32,
        f: impl FnOnce(&mut DirectoryPage<&mut DurablePage>, usize) -> R,
    ) -> Result<R> {
        let (page, local) = self.locate(node);
        let mut guard = self.cache.load_for_write(self.file_id, page)?;
        let mut view = DirectoryPage::new(&mut *guard);
        if !view.is_allocated(local) {
            return Err(PageHashError::corrupted(format!(
                "directory {} node {} is not allocated",
                self.name, node
            )));
        }
        Ok(f(&mut view, local))
    }

    /// Raw pointer words of a node
    pub fn get_node(&self, node: u32) -> Result<Vec<i64>> {
        self.read_node(node, |view, local| view.pointers(local))
    }

    pub fn set_node(&self, node: u32, pointers: &[i64]) -> Result<()> {
        if pointers.len() != MAX_LEVEL_SIZE {
            return Err(PageHashError::corrupted(format!(
                "directory node needs {MAX_LEVEL_SIZE} pointers, got {}",
                pointers.len()
            )));
        }
        self.write_node(node, |view, local| view.set_pointers(local, pointers))
    }

    /// Raw pointer word of one slot
    pub fn get_node_pointer(&self, node: u32, slot: usize) -> Result<i64> {
        self.read_node(node, |view, local| view.pointer(local, slot))
    }

    pub fn set_node_pointer(&self, node: u32, slot: usize, word: i64) -> Result<()> {
        self.write_node(node, |view, local| view.set_pointer(local, slot, word))
    }

    /// Decoded pointer of one slot
    pub fn get_pointer(&self, node: u32, slot: usize) -> Result<NodePointer> {
        NodePointer::decode(self.get_node_pointer(node, slot)?)
    }

    pub fn set_pointer(&self, node: u32, slot: usize, pointer: NodePointer) -> Result<()> {
        self.set_node_pointer(node, slot, pointer.encode())
    }

    pub fn get_node_local_depth(&self, node: u32) -> Result<u8> {
        self.read_node(node, |view, local| view.local_depth(local))
    }

    pub fn set_node_local_depth(&self, node: u32, depth: u8) -> Result<()> {
        self.write_node(node, |view, local| view.set_local_depth(local, depth))
    }

    pub fn get_max_left_child_depth(&self, node: u32) -> Result<u8> {
        self.read_node(node, |view, local| view.max_left_child_depth(local))
    }

    pub fn set_max_left_child_depth(&self, node: u32, depth: u8) -> Result<()> {
        self.write_node(node, |view, local| {
            view.set_max_left_child_depth(local, depth)
        })
    }

    pub fn get_max_right_child_depth(&self, node: u32) -> Result<u8> {
        self.read_node(node, |view, local| view.max_right_child_depth(local))
    }

    pub fn set_max_right_child_depth(&self, node: u32, depth: u8) -> Result<()> {
        self.write_node(node, |view, local| {
            view.set_max_right_child_depth(local, depth)
        })
    }
}
