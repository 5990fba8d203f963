//! Hash Bucket Page
//!
//! Sorted (hash code, key, value) entries packed into one durable page.
//!
//! ## Layout
//! ```text
//! ┌──────────────┬──────────┬───────┬──────────┬────────────────┬──────────────┐
//! │ Page Hdr (16)│ Free (4) │ D (1) │ Size (4) │ History (64x8) │ Next Free (8)│
//! ├──────────────┴──────────┴───────┴──────────┴────────────────┴──────────────┤
//! │ Positions: Size x i32, ascending (hash, key) order        ──►              │
//! │                                                                             │
//! │                         ◄── entries, appended from the end of the page      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Entry Format
//! ```text
//! ┌────────────────┬───────────────┬─────────────────┐
//! │ Hash Code (8)  │ Key (var)     │ Value (var)     │
//! └────────────────┴───────────────┴─────────────────┘
//! ```
//!
//! `Free` is the lowest byte used by entries. Deleting an entry compacts the
//! entry area so it always spans `[Free, page_size)`.

use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

use crate::codec::BinarySerializer;
use crate::error::{PageHashError, Result};
use crate::page::{DurablePage, PAGE_HEADER_SIZE};

use super::{HashEntry, HASH_CODE_SIZE};

// =============================================================================
// Layout Constants
// =============================================================================

const FREE_POINTER_OFFSET: usize = PAGE_HEADER_SIZE;
const DEPTH_OFFSET: usize = FREE_POINTER_OFFSET + 4;
const SIZE_OFFSET: usize = DEPTH_OFFSET + 1;
const HISTORY_OFFSET: usize = SIZE_OFFSET + 4;
const NEXT_REMOVED_BUCKET_OFFSET: usize = HISTORY_OFFSET + HASH_CODE_SIZE as usize * 8;
const POSITIONS_ARRAY_OFFSET: usize = NEXT_REMOVED_BUCKET_OFFSET + 8;

/// Offset where bucket content starts; a bucket can hold
/// `page_size - BUCKET_CAPACITY_OFFSET` bytes of entries and positions
pub const BUCKET_CAPACITY_OFFSET: usize = POSITIONS_ARRAY_OFFSET;

const HASH_SIZE: usize = 8;
const POSITION_SIZE: usize = 4;

/// Content bytes an empty bucket offers on a page of `page_size`
pub(crate) fn bucket_capacity(page_size: usize) -> usize {
    page_size - BUCKET_CAPACITY_OFFSET
}

/// Bytes one entry takes in a bucket, position slot included
pub(crate) fn entry_footprint(key_size: usize, value_size: usize) -> usize {
    HASH_SIZE + key_size + value_size + POSITION_SIZE
}

/// Outcome of replacing the value of an existing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Stored bytes already equal the new value
    Unchanged,

    /// Value overwritten in place
    Updated,

    /// Encoded size differs; the entry must be deleted and re-added
    SizeMismatch,
}

// =============================================================================
// Bucket View
// =============================================================================

/// Typed view over one bucket page
pub struct HashBucket<'a, P, K, V> {
    page: P,
    keys: &'a dyn BinarySerializer<K>,
    values: &'a dyn BinarySerializer<V>,
}

impl<'a, P, K, V> HashBucket<'a, P, K, V>
where
    P: Deref<Target = DurablePage>,
    K: Ord,
{
    pub fn new(
        page: P,
        keys: &'a dyn BinarySerializer<K>,
        values: &'a dyn BinarySerializer<V>,
    ) -> Self {
        Self { page, keys, values }
    }

    pub fn capacity(&self) -> usize {
        bucket_capacity(self.page.page_size())
    }

    pub fn page_index(&self) -> u64 {
        self.page.index()
    }

    pub fn size(&self) -> usize {
        self.page.get_i32(SIZE_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn depth(&self) -> u8 {
        self.page.get_u8(DEPTH_OFFSET)
    }

    fn free_pointer(&self) -> usize {
        self.page.get_i32(FREE_POINTER_OFFSET) as usize
    }

    /// Bytes taken by entries and their positions
    pub fn content_size(&self) -> usize {
        self.page.page_size() - self.free_pointer() + self.size() * POSITION_SIZE
    }

    /// Pointer of the bucket this one was split from at `depth`
    pub fn split_history(&self, depth: u8) -> i64 {
        self.page.get_i64(HISTORY_OFFSET + depth as usize * 8)
    }

    /// Next page on the free-bucket list (bucket pointer word, 0 = none)
    pub fn next_removed_bucket(&self) -> i64 {
        self.page.get_i64(NEXT_REMOVED_BUCKET_OFFSET)
    }

    fn position(&self, index: usize) -> usize {
        self.page
            .get_i32(POSITIONS_ARRAY_OFFSET + index * POSITION_SIZE) as usize
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.size() {
            return Err(PageHashError::corrupted(format!(
                "entry {} requested from bucket {} of size {}",
                index,
                self.page.index(),
                self.size()
            )));
        }
        Ok(())
    }

    /// Position, key length and value length of an entry
    fn entry_layout(&self, index: usize) -> Result<(usize, usize, usize)> {
        self.check_index(index)?;
        let position = self.position(index);
        let page_size = self.page.page_size();
        if position < self.free_pointer() || position + HASH_SIZE > page_size {
            return Err(PageHashError::corrupted(format!(
                "entry {} of bucket {} at invalid position {}",
                index,
                self.page.index(),
                position
            )));
        }

        let bytes = self.page.bytes();
        let key_len = self.keys.size_in_buffer(&bytes[position + HASH_SIZE..])?;
        let value_start = position + HASH_SIZE + key_len;
        if value_start > page_size {
            return Err(PageHashError::corrupted(format!(
                "key of entry {} overruns bucket {}",
                index,
                self.page.index()
            )));
        }
        let value_len = self.values.size_in_buffer(&bytes[value_start..])?;
        if value_start + value_len > page_size {
            return Err(PageHashError::corrupted(format!(
                "value of entry {} overruns bucket {}",
                index,
                self.page.index()
            )));
        }
        Ok((position, key_len, value_len))
    }

    pub fn hash_code(&self, index: usize) -> Result<u64> {
        self.check_index(index)?;
        Ok(self.page.get_u64(self.position(index)))
    }

    pub fn key(&self, index: usize) -> Result<K> {
        let (position, key_len, _) = self.entry_layout(index)?;
        let start = position + HASH_SIZE;
        self.keys.deserialize(&self.page.bytes()[start..start + key_len])
    }

    pub fn value(&self, index: usize) -> Result<V> {
        let (position, key_len, value_len) = self.entry_layout(index)?;
        let start = position + HASH_SIZE + key_len;
        self.values
            .deserialize(&self.page.bytes()[start..start + value_len])
    }

    /// Serialized bytes of an entry's value
    fn value_bytes(&self, index: usize) -> Result<&[u8]> {
        let (position, key_len, value_len) = self.entry_layout(index)?;
        let start = position + HASH_SIZE + key_len;
        Ok(self.page.get_bytes(start, value_len))
    }

    pub fn entry(&self, index: usize) -> Result<HashEntry<K, V>> {
        Ok(HashEntry {
            hash_code: self.hash_code(index)?,
            key: self.key(index)?,
            value: self.value(index)?,
        })
    }

    /// Entries in `[start, end)`
    pub fn entries(&self, start: usize, end: usize) -> Result<Vec<HashEntry<K, V>>> {
        (start..end.min(self.size()))
            .map(|index| self.entry(index))
            .collect()
    }

    pub fn all_entries(&self) -> Result<Vec<HashEntry<K, V>>> {
        self.entries(0, self.size())
    }

    /// Compare the entry at `index` against `(hash_code, key)`
    pub fn compare_at(&self, index: usize, hash_code: u64, key: &K) -> Result<Ordering> {
        let stored_hash = self.hash_code(index)?;
        Ok(match stored_hash.cmp(&hash_code) {
            Ordering::Equal => self.key(index)?.cmp(key),
            other => other,
        })
    }

    /// `Ok(index)` of the matching entry, or `Err(insertion point)`
    pub fn binary_search(
        &self,
        hash_code: u64,
        key: &K,
    ) -> Result<std::result::Result<usize, usize>> {
        let mut low = 0usize;
        let mut high = self.size();

        while low < high {
            let mid = low + (high - low) / 2;
            match self.compare_at(mid, hash_code, key)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    pub fn find(&self, hash_code: u64, key: &K) -> Result<Option<V>> {
        match self.binary_search(hash_code, key)? {
            Ok(index) => Ok(Some(self.value(index)?)),
            Err(_) => Ok(None),
        }
    }
}

impl<'a, P, K, V> HashBucket<'a, P, K, V>
where
    P: DerefMut<Target = DurablePage>,
    K: Ord,
{
    /// Reset to an empty bucket of `depth`, dropping history and free link
    pub fn init(&mut self, depth: u8) {
        self.page.clear_body();
        self.reset_entries(depth);
    }

    /// Drop all entries and set `depth`, keeping the split history
    pub fn reset_entries(&mut self, depth: u8) {
        let page_size = self.page.page_size() as i32;
        self.page.set_i32(FREE_POINTER_OFFSET, page_size);
        self.page.set_u8(DEPTH_OFFSET, depth);
        self.page.set_i32(SIZE_OFFSET, 0);
    }

    pub fn set_depth(&mut self, depth: u8) {
        self.page.set_u8(DEPTH_OFFSET, depth);
    }

    pub fn set_split_history(&mut self, depth: u8, pointer: i64) {
        self.page.set_i64(HISTORY_OFFSET + depth as usize * 8, pointer);
    }

    pub fn set_next_removed_bucket(&mut self, pointer: i64) {
        self.page.set_i64(NEXT_REMOVED_BUCKET_OFFSET, pointer);
    }

    fn set_size(&mut self, size: usize) {
        self.page.set_i32(SIZE_OFFSET, size as i32);
    }

    fn set_position(&mut self, index: usize, position: usize) {
        self.page
            .set_i32(POSITIONS_ARRAY_OFFSET + index * POSITION_SIZE, position as i32);
    }

    /// Serialize an entry at the low end of the free area. Returns the
    /// entry position, or `None` if the entry and one more position slot
    /// do not fit.
    fn write_entry(&mut self, hash_code: u64, key: &K, value: &V) -> Result<Option<usize>> {
        let key_len = self.keys.object_size(key);
        let value_len = self.values.object_size(value);
        let entry_size = HASH_SIZE + key_len + value_len;

        let positions_end = POSITIONS_ARRAY_OFFSET + (self.size() + 1) * POSITION_SIZE;
        let free_pointer = self.free_pointer();
        if free_pointer < positions_end + entry_size {
            return Ok(None);
        }

        let position = free_pointer - entry_size;
        let key_start = position + HASH_SIZE;
        let value_start = key_start + key_len;
        self.page.set_u64(position, hash_code);
        {
            let bytes = self.page.bytes_mut();
            self.keys
                .serialize(key, &mut bytes[key_start..value_start])?;
            self.values
                .serialize(value, &mut bytes[value_start..value_start + value_len])?;
        }
        self.page.set_i32(FREE_POINTER_OFFSET, position as i32);
        Ok(Some(position))
    }

    /// Insert keeping (hash, key) order. `Ok(false)` when the bucket is
    /// full; `DuplicateKey` when the key is already present.
    pub fn add_entry(&mut self, hash_code: u64, key: &K, value: &V) -> Result<bool> {
        let index = match self.binary_search(hash_code, key)? {
            Ok(_) => return Err(PageHashError::DuplicateKey),
            Err(index) => index,
        };

        let Some(position) = self.write_entry(hash_code, key, value)? else {
            return Ok(false);
        };

        let size = self.size();
        let from = POSITIONS_ARRAY_OFFSET + index * POSITION_SIZE;
        self.page
            .move_bytes(from, from + POSITION_SIZE, (size - index) * POSITION_SIZE);
        self.set_position(index, position);
        self.set_size(size + 1);
        Ok(true)
    }

    /// Append an entry that sorts after every stored entry
    pub fn append_entry(&mut self, hash_code: u64, key: &K, value: &V) -> Result<bool> {
        let Some(position) = self.write_entry(hash_code, key, value)? else {
            return Ok(false);
        };

        let size = self.size();
        self.set_position(size, position);
        self.set_size(size + 1);
        Ok(true)
    }

    /// Overwrite the value of an entry when the encoded size is unchanged
    pub fn update_entry(&mut self, index: usize, value: &V) -> Result<UpdateResult> {
        let encoded = self.values.to_vec(value)?;
        let stored = self.value_bytes(index)?;
        if stored.len() != encoded.len() {
            return Ok(UpdateResult::SizeMismatch);
        }
        if stored == encoded.as_slice() {
            return Ok(UpdateResult::Unchanged);
        }

        let (position, key_len, _) = self.entry_layout(index)?;
        self.page.set_bytes(position + HASH_SIZE + key_len, &encoded);
        Ok(UpdateResult::Updated)
    }

    /// Remove an entry and compact the entry area
    pub fn delete_entry(&mut self, index: usize) -> Result<HashEntry<K, V>> {
        let entry = self.entry(index)?;
        let (position, key_len, value_len) = self.entry_layout(index)?;
        let entry_size = HASH_SIZE + key_len + value_len;
        let free_pointer = self.free_pointer();
        let size = self.size();

        // Step 1: slide entries stored below the removed one up by its size
        self.page
            .move_bytes(free_pointer, free_pointer + entry_size, position - free_pointer);

        // Step 2: drop the position slot and fix positions of moved entries
        let from = POSITIONS_ARRAY_OFFSET + (index + 1) * POSITION_SIZE;
        self.page
            .move_bytes(from, from - POSITION_SIZE, (size - index - 1) * POSITION_SIZE);
        for i in 0..size - 1 {
            let current = self.position(i);
            if current < position {
                self.set_position(i, current + entry_size);
            }
        }

        self.set_size(size - 1);
        self.page
            .set_i32(FREE_POINTER_OFFSET, (free_pointer + entry_size) as i32);
        Ok(entry)
    }
}

// =============================================================================
// Tests
// =============================================================================
