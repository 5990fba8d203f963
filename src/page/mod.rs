//! Page Module
//!
//! Fixed-size durable pages and the cache that loads, pins and writes them
//! back through byte-range files.
//!
//! ## Responsibilities
//! - Mirror one on-disk page in memory, with typed little-endian accessors
//! - Flag the page dirty on every mutable access (no way around it)
//! - Checksum the page on write-back and verify it on load
//!
//! ## Page Format
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────────────────────────┐
//! │ CRC32 (4)│ LSN (8)  │ Reserved (4) │ Body (page_size - 16)        │
//! └──────────┴──────────┴──────────────┴──────────────────────────────┘
//! ```
//! The CRC covers every byte after itself. A page of zeros was never
//! written back and is accepted as empty.

mod cache;

use bytes::{Buf, BufMut};

use crate::error::{PageHashError, Result};

pub use cache::{FilePageCache, PageCache, PageReadGuard, PageWriteGuard};

// =============================================================================
// Constants
// =============================================================================

/// Bytes at the start of every page reserved for the durable header
pub const PAGE_HEADER_SIZE: usize = 16;

const CRC_OFFSET: usize = 0;
const LSN_OFFSET: usize = 4;

/// Identifier of a file registered with a page cache
pub type FileId = u32;

// =============================================================================
// Durable Page
// =============================================================================

/// In-memory copy of one page of a cache file.
///
/// Every mutating accessor goes through [`DurablePage::bytes_mut`], which
/// flags the page dirty; only the owning cache clears the flag after a
/// successful write-back.
pub struct DurablePage {
    file_id: FileId,
    index: u64,
    data: Box<[u8]>,
    dirty: bool,
}

impl DurablePage {
    /// A zeroed page that has never been written
    pub fn new(file_id: FileId, index: u64, page_size: usize) -> Self {
        Self {
            file_id,
            index,
            data: vec![0u8; page_size].into_boxed_slice(),
            dirty: false,
        }
    }

    /// Wrap bytes read from disk, verifying the checksum
    pub fn from_disk(file_id: FileId, index: u64, data: Vec<u8>) -> Result<Self> {
        let page = Self {
            file_id,
            index,
            data: data.into_boxed_slice(),
            dirty: false,
        };
        page.verify()?;
        Ok(page)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the page; flags the page dirty
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    // =========================================================================
    // Durable Header
    // =========================================================================

    pub fn lsn(&self) -> u64 {
        self.get_u64(LSN_OFFSET)
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.set_u64(LSN_OFFSET, lsn);
    }

    fn stored_crc(&self) -> u32 {
        (&self.data[CRC_OFFSET..]).get_u32_le()
    }

    fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.data[LSN_OFFSET..])
    }

    /// Store the checksum of the body; called right before write-back
    pub(crate) fn seal(&mut self) {
        let crc = self.compute_crc();
        (&mut self.data[CRC_OFFSET..]).put_u32_le(crc);
    }

    /// Check the stored checksum. A page of zeros passes.
    pub fn verify(&self) -> Result<()> {
        if self.data.iter().all(|b| *b == 0) {
            return Ok(());
        }

        let stored = self.stored_crc();
        let computed = self.compute_crc();
        if stored != computed {
            return Err(PageHashError::corrupted(format!(
                "page {} of file {} failed checksum: stored {:#010x}, computed {:#010x}",
                self.index, self.file_id, stored, computed
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Typed Accessors
    // =========================================================================

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.bytes_mut()[offset] = value;
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        (&self.data[offset..]).get_i32_le()
    }

    pub fn set_i32(&mut self, offset: usize, value: i32) {
        (&mut self.bytes_mut()[offset..]).put_i32_le(value);
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        (&self.data[offset..]).get_u32_le()
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        (&mut self.bytes_mut()[offset..]).put_u32_le(value);
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        (&self.data[offset..]).get_i64_le()
    }

    pub fn set_i64(&mut self, offset: usize, value: i64) {
        (&mut self.bytes_mut()[offset..]).put_i64_le(value);
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        (&self.data[offset..]).get_u64_le()
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        (&mut self.bytes_mut()[offset..]).put_u64_le(value);
    }

    pub fn get_bytes(&self, offset: usize, length: usize) -> &[u8] {
        &self.data[offset..offset + length]
    }

    pub fn set_bytes(&mut self, offset: usize, value: &[u8]) {
        self.bytes_mut()[offset..offset + value.len()].copy_from_slice(value);
    }

    /// Copy `length` bytes from `from` to `to`; the ranges may overlap
    pub fn move_bytes(&mut self, from: usize, to: usize, length: usize) {
        self.bytes_mut().copy_within(from..from + length, to);
    }

    /// Zero the page body, keeping the durable header
    pub fn clear_body(&mut self) {
        self.bytes_mut()[PAGE_HEADER_SIZE..].fill(0);
    }
}

impl std::fmt::Debug for DurablePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurablePage")
            .field("file_id", &self.file_id)
            .field("index", &self.index)
            .field("page_size", &self.data.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
