//! Mapped Buffer Entry
//!
//! One OS mapping window `[begin, begin + size)` over a file.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::error::Result;

/// A mapped window, owned by the manager's per-file list.
///
/// ## Concurrency:
/// - `map`: RwLock, readers copy out concurrently, writers copy in exclusively
/// - `pins`: number of live [`super::MappedRegion`] guards; pinned entries
///   are never evicted or remapped
/// - `dirty`, `last_used`, `flush_failures`: atomics, lock-free bookkeeping
pub struct MmapEntry {
    /// Physical offset of the first mapped byte
    begin: u64,

    size: usize,

    map: RwLock<MmapMut>,

    dirty: AtomicBool,

    /// Logical clock value of the last acquire
    last_used: AtomicU64,

    pins: AtomicUsize,

    flush_failures: AtomicUsize,

    #[cfg(test)]
    fail_flush: AtomicBool,
}

impl MmapEntry {
    /// Map `size` bytes of `handle` starting at physical offset `begin`.
    /// `begin` must be aligned to the OS page size.
    pub(crate) fn map(handle: &fs::File, begin: u64, size: usize, now: u64) -> Result<Self> {
        // SAFETY: the owning file keeps its physical length at or beyond
        // `begin + size` while the window exists, and unmaps every window
        // through the manager before it shrinks, closes or replaces the file.
        let map = unsafe { MmapOptions::new().offset(begin).len(size).map_mut(handle)? };

        Ok(Self {
            begin,
            size,
            map: RwLock::new(map),
            dirty: AtomicBool::new(false),
            last_used: AtomicU64::new(now),
            pins: AtomicUsize::new(0),
            flush_failures: AtomicUsize::new(0),
            #[cfg(test)]
            fail_flush: AtomicBool::new(false),
        })
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.begin + self.size as u64
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub(crate) fn touch(&self, now: u64) {
        self.last_used.store(now, Ordering::Release);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn flush_failures(&self) -> usize {
        self.flush_failures.load(Ordering::Acquire)
    }

    /// Write dirty pages of the window back to the file
    pub(crate) fn flush(&self) -> std::io::Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        // Clear first so a write racing with the flush re-marks the entry
        self.dirty.store(false, Ordering::Release);
        let result = self.flush_map();

        match &result {
            Ok(()) => self.flush_failures.store(0, Ordering::Release),
            Err(_) => {
                self.dirty.store(true, Ordering::Release);
                self.flush_failures.fetch_add(1, Ordering::AcqRel);
            }
        }
        result
    }

    #[cfg(not(test))]
    fn flush_map(&self) -> std::io::Result<()> {
        self.map.read().flush()
    }

    #[cfg(test)]
    fn flush_map(&self) -> std::io::Result<()> {
        if self.fail_flush.load(Ordering::Acquire) {
            return Err(std::io::Error::other("flush failure injected by test"));
        }
        self.map.read().flush()
    }

    /// Make every following flush fail until reset
    #[cfg(test)]
    pub(crate) fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Release);
    }

    /// Copy the overlap of `[physical, physical + buf.len())` into `buf`
    pub(crate) fn copy_out(&self, physical: u64, buf: &mut [u8]) {
        if let Some((window, local)) = self.overlap(physical, buf.len()) {
            let map = self.map.read();
            buf[local.clone()].copy_from_slice(&map[window.start..window.start + local.len()]);
        }
    }

    /// Copy the overlap of `[physical, physical + data.len())` from `data`
    pub(crate) fn copy_in(&self, physical: u64, data: &[u8]) {
        if let Some((window, local)) = self.overlap(physical, data.len()) {
            let mut map = self.map.write();
            map[window.start..window.start + local.len()].copy_from_slice(&data[local]);
            self.mark_dirty();
        }
    }

    /// Overlap of a request with this window, as (window range, request range)
    fn overlap(
        &self,
        physical: u64,
        length: usize,
    ) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>)> {
        let start = physical.max(self.begin);
        let end = (physical + length as u64).min(self.end());
        if start >= end {
            return None;
        }

        let window = (start - self.begin) as usize..(end - self.begin) as usize;
        let local = (start - physical) as usize..(end - physical) as usize;
        Some((window, local))
    }
}

impl std::fmt::Debug for MmapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapEntry")
            .field("begin", &self.begin)
            .field("size", &self.size)
            .field("dirty", &self.is_dirty())
            .field("last_used", &self.last_used())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}
