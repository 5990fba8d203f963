//! Memory-Map Manager
//!
//! Pools memory-mapped windows over files under one process-wide budget.
//!
//! ## Responsibilities
//! - Hand out windows covering a requested physical range of a file
//! - Map new windows on demand, remap windows the file has outgrown
//! - Evict least-recently-used windows when the budget would be exceeded
//! - Flush dirty windows (best effort) on request, eviction and removal
//!
//! ## Window Layout
//! ```text
//!   physical file:  [ header | data ...............................| tail ]
//!   windows:        [ block 0      ][ block 1      ][ block 2 (short) ]
//!                   ^0             ^block_size     ^2*block_size
//! ```
//! Windows are aligned to `mmap_block_size`, never overlap, and the last one
//! ends at the physical end of the file.
//!
//! ## Concurrency
//! Each file's window list sits behind its own mutex. The eviction scan over
//! all files runs in a single global section and only `try_lock`s file lists,
//! so a caller holding its own list while evicting cannot deadlock.

mod entry;

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, MMAP_ALIGNMENT};
use crate::error::Result;

pub use entry::MmapEntry;

// =============================================================================
// Constants
// =============================================================================

/// Failed flushes of one entry before the budget is cut by its size
pub(crate) const MAX_FLUSH_RETRIES: usize = 3;

/// Eviction lowers usage to this share of the budget (percent)
pub(crate) const LOW_WATER_PERCENT: u64 = 75;

/// Budget share kept after a failed OS mapping (percent)
pub(crate) const MAP_FAILURE_PERCENT: u64 = 90;

// =============================================================================
// Public Types
// =============================================================================

/// How eagerly a request may be served from mapped memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Always map, evicting other windows if needed
    MmapAlways,

    /// Writes map (evicting if needed); reads map only within free budget
    MmapWriteAlwaysReadIfAvailable,

    /// Writes map (evicting if needed); reads use existing windows only
    MmapWriteAlwaysReadIfInMemory,

    /// Map only within free budget, never evict
    MmapOnlyAvailablePool,

    /// Never map; callers always use direct I/O
    MmapNever,
}

impl AllocationStrategy {
    /// (may map a new window, may evict to make room)
    fn permissions(self, op: OperationType) -> (bool, bool) {
        use AllocationStrategy::*;

        match (self, op) {
            (MmapAlways, _) => (true, true),
            (MmapWriteAlwaysReadIfAvailable, OperationType::Write) => (true, true),
            (MmapWriteAlwaysReadIfAvailable, OperationType::Read) => (true, false),
            (MmapWriteAlwaysReadIfInMemory, OperationType::Write) => (true, true),
            (MmapWriteAlwaysReadIfInMemory, OperationType::Read) => (false, false),
            (MmapOnlyAvailablePool, _) => (true, false),
            (MmapNever, _) => (false, false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Read,
    Write,
}

/// Identifier a file receives when it registers with the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappedFileId(u64);

/// The OS file a request maps into, with its current physical length
pub struct MapTarget<'a> {
    pub id: MappedFileId,
    pub handle: &'a fs::File,
    pub physical_len: u64,
}

/// Windows covering one acquired range.
///
/// Holding the region pins its windows; [`MappedRegion::release`] or
/// dropping the region unpins them.
pub struct MappedRegion {
    entries: Vec<Arc<MmapEntry>>,
    op: OperationType,
}

impl MappedRegion {
    pub fn entries(&self) -> &[Arc<MmapEntry>] {
        &self.entries
    }

    pub fn operation(&self) -> OperationType {
        self.op
    }

    /// Copy the mapped bytes at `physical` into `buf`
    pub fn read(&self, physical: u64, buf: &mut [u8]) {
        for entry in &self.entries {
            entry.copy_out(physical, buf);
        }
    }

    /// Copy `data` into the mapped bytes at `physical`
    pub fn write(&self, physical: u64, data: &[u8]) {
        for entry in &self.entries {
            entry.copy_in(physical, data);
        }
    }

    /// Unpin the windows
    pub fn release(self) {}
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        for entry in &self.entries {
            entry.unpin();
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Window list of one registered file
#[derive(Default)]
struct FileMappings {
    /// Sorted by `begin`
    entries: Mutex<Vec<Arc<MmapEntry>>>,
}

/// Process-wide pool of mapped windows.
///
/// Construct one and share it through `Arc` with every memory-mapped file.
///
/// ## Concurrency:
/// - `files`: RwLock over the registry; per-file lists have their own mutex
/// - `evict_lock`: global section for eviction scans
/// - `total_mapped`, `effective_budget`, `clock`: atomics
pub struct MmapManager {
    block_size: u64,

    files: RwLock<HashMap<MappedFileId, Arc<FileMappings>>>,

    evict_lock: Mutex<()>,

    total_mapped: AtomicU64,

    effective_budget: AtomicU64,

    next_file_id: AtomicU64,

    /// Logical clock used as the LRU timestamp
    clock: AtomicU64,
}

impl MmapManager {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(config.mmap_block_size, config.mmap_max_memory)
    }

    pub fn with_limits(block_size: usize, max_memory: u64) -> Self {
        let aligned = block_size.max(MMAP_ALIGNMENT) / MMAP_ALIGNMENT * MMAP_ALIGNMENT;
        Self {
            block_size: aligned as u64,
            files: RwLock::new(HashMap::new()),
            evict_lock: Mutex::new(()),
            total_mapped: AtomicU64::new(0),
            effective_budget: AtomicU64::new(max_memory),
            next_file_id: AtomicU64::new(1),
            clock: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Bytes currently mapped across all files
    pub fn total_mapped(&self) -> u64 {
        self.total_mapped.load(Ordering::Acquire)
    }

    /// Budget after any reductions caused by flush or mapping failures
    pub fn effective_budget(&self) -> u64 {
        self.effective_budget.load(Ordering::Acquire)
    }

    /// Number of windows tracked for `file`
    pub fn entry_count(&self, file: MappedFileId) -> usize {
        self.files
            .read()
            .get(&file)
            .map(|mappings| mappings.entries.lock().len())
            .unwrap_or(0)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_file(&self) -> MappedFileId {
        let id = MappedFileId(self.next_file_id.fetch_add(1, Ordering::AcqRel));
        self.files.write().insert(id, Arc::new(FileMappings::default()));
        id
    }

    fn mappings(&self, file: MappedFileId) -> Arc<FileMappings> {
        if let Some(mappings) = self.files.read().get(&file) {
            return Arc::clone(mappings);
        }
        Arc::clone(self.files.write().entry(file).or_default())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    // =========================================================================
    // Acquire / Release
    // =========================================================================

    /// Find or map windows covering `[offset, offset + size)` (physical).
    ///
    /// Returns `Ok(None)` when the caller must fall back to direct I/O: the
    /// strategy forbids mapping, the budget is exhausted under a conservative
    /// strategy, the range reaches past the physical end of the file, or a
    /// window that needs remapping is pinned by another caller.
    pub fn acquire(
        &self,
        target: &MapTarget<'_>,
        offset: u64,
        size: usize,
        op: OperationType,
        strategy: AllocationStrategy,
    ) -> Result<Option<MappedRegion>> {
        if strategy == AllocationStrategy::MmapNever || size == 0 {
            return Ok(None);
        }

        let end = offset + size as u64;
        if end > target.physical_len {
            return Ok(None);
        }

        let (may_map, may_evict) = strategy.permissions(op);
        let mappings = self.mappings(target.id);
        let mut list = mappings.entries.lock();

        let first_block = offset / self.block_size;
        let last_block = (end - 1) / self.block_size;
        let mut region = MappedRegion {
            entries: Vec::with_capacity((last_block - first_block + 1) as usize),
            op,
        };

        for block in first_block..=last_block {
            let begin = block * self.block_size;
            let block_end = (begin + self.block_size).min(target.physical_len);
            let needed_end = end.min(block_end);
            let now = self.tick();

            let position = list.binary_search_by_key(&begin, |e| e.begin());

            // Step 1: reuse a window that already reaches far enough
            if let Ok(index) = position {
                let entry = &list[index];
                if entry.end() >= needed_end {
                    entry.touch(now);
                    entry.pin();
                    region.entries.push(Arc::clone(entry));
                    continue;
                }
            }

            if !may_map {
                return Ok(None);
            }

            // Step 2: drop a window the file has outgrown
            if let Ok(index) = position {
                if list[index].is_pinned() {
                    return Ok(None);
                }
                let stale = list.remove(index);
                self.retire(&stale, "remap");
            }

            // Step 3: reserve budget and map the full block
            let window = (block_end - begin) as usize;
            if !self.reserve(window as u64, may_evict, (&mappings, &mut *list)) {
                tracing::trace!(begin, window, "mmap budget exhausted, using direct I/O");
                return Ok(None);
            }

            let entry = match MmapEntry::map(target.handle, begin, window, now) {
                Ok(entry) => Arc::new(entry),
                Err(e) => {
                    self.total_mapped.fetch_sub(window as u64, Ordering::AcqRel);
                    self.reduce_budget_percent(MAP_FAILURE_PERCENT);
                    tracing::warn!(
                        begin,
                        window,
                        error = %e,
                        budget = self.effective_budget(),
                        "memory mapping failed, reduced mmap budget"
                    );
                    return Ok(None);
                }
            };

            tracing::debug!(begin, window, total = self.total_mapped(), "mapped new window");

            let insert_at = list
                .binary_search_by_key(&begin, |e| e.begin())
                .unwrap_or_else(|at| at);
            entry.pin();
            list.insert(insert_at, Arc::clone(&entry));
            region.entries.push(entry);
        }

        if op == OperationType::Write {
            for entry in &region.entries {
                entry.mark_dirty();
            }
        }

        Ok(Some(region))
    }

    /// Unpin the windows of a region acquired for `op`
    pub fn release(&self, region: MappedRegion, op: OperationType) {
        debug_assert_eq!(region.op, op);
        drop(region);
    }

    // =========================================================================
    // Budget & Eviction
    // =========================================================================

    /// Account `bytes` against the budget, evicting first if allowed.
    ///
    /// `own` is the caller's already locked window list; it takes part in
    /// eviction without being locked a second time.
    fn reserve(
        &self,
        bytes: u64,
        may_evict: bool,
        own: (&Arc<FileMappings>, &mut Vec<Arc<MmapEntry>>),
    ) -> bool {
        let (own_file, own_list) = own;

        loop {
            let total = self.total_mapped();
            let budget = self.effective_budget();

            if total + bytes <= budget {
                if self
                    .total_mapped
                    .compare_exchange(total, total + bytes, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            if !may_evict || self.evict(bytes, own_file, own_list) == 0 {
                return false;
            }
        }
    }

    /// Evict unpinned windows, oldest first, until `incoming` bytes fit
    /// under the low-water mark. Returns the number of bytes released.
    fn evict(
        &self,
        incoming: u64,
        own_file: &Arc<FileMappings>,
        own_list: &mut Vec<Arc<MmapEntry>>,
    ) -> u64 {
        let _section = self.evict_lock.lock();

        let budget = self.effective_budget();
        let target = (budget * LOW_WATER_PERCENT / 100).min(budget.saturating_sub(incoming));

        // Step 1: collect candidates from our own list and every other list
        // we can lock right now
        let others: Vec<Arc<FileMappings>> = self
            .files
            .read()
            .values()
            .filter(|mappings| !Arc::ptr_eq(mappings, own_file))
            .cloned()
            .collect();

        let mut candidates: Vec<(u64, Option<usize>, Arc<MmapEntry>)> = own_list
            .iter()
            .filter(|e| !e.is_pinned())
            .map(|e| (e.last_used(), None, Arc::clone(e)))
            .collect();
        for (index, mappings) in others.iter().enumerate() {
            if let Some(list) = mappings.entries.try_lock() {
                for entry in list.iter().filter(|e| !e.is_pinned()) {
                    candidates.push((entry.last_used(), Some(index), Arc::clone(entry)));
                }
            }
        }
        candidates.sort_by_key(|(last_used, _, _)| *last_used);

        // Step 2: flush and drop least recently used windows
        let mut freed = 0;
        for (_, owner, entry) in candidates {
            if self.total_mapped() <= target {
                break;
            }

            let mut other_guard = None;
            let list: &mut Vec<Arc<MmapEntry>> = match owner {
                None => &mut *own_list,
                Some(index) => match others[index].entries.try_lock() {
                    Some(guard) => &mut **other_guard.insert(guard),
                    None => continue,
                },
            };
            if entry.is_pinned() {
                continue;
            }

            if let Err(e) = entry.flush() {
                let failures = entry.flush_failures();
                tracing::warn!(
                    begin = entry.begin(),
                    failures,
                    error = %e,
                    "failed to flush window during eviction, keeping it"
                );
                if failures >= MAX_FLUSH_RETRIES {
                    self.reduce_budget_by(entry.size() as u64);
                }
                continue;
            }

            if let Ok(index) = list.binary_search_by_key(&entry.begin(), |e| e.begin()) {
                if Arc::ptr_eq(&list[index], &entry) {
                    list.remove(index);
                    self.total_mapped
                        .fetch_sub(entry.size() as u64, Ordering::AcqRel);
                    freed += entry.size() as u64;
                }
            }
        }

        if freed > 0 {
            tracing::debug!(freed, total = self.total_mapped(), "evicted mapped windows");
        }
        freed
    }

    /// Flush (best effort) and forget a window that left its list
    fn retire(&self, entry: &MmapEntry, reason: &str) {
        if let Err(e) = entry.flush() {
            tracing::warn!(
                begin = entry.begin(),
                reason,
                error = %e,
                "failed to flush window before unmapping, data may be lost"
            );
        }
        self.total_mapped
            .fetch_sub(entry.size() as u64, Ordering::AcqRel);
    }

    fn reduce_budget_by(&self, bytes: u64) {
        let floor = self.block_size;
        let _ = self
            .effective_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| {
                Some(budget.saturating_sub(bytes).max(floor))
            });
        tracing::warn!(budget = self.effective_budget(), "reduced mmap budget");
    }

    fn reduce_budget_percent(&self, percent: u64) {
        let floor = self.block_size;
        let _ = self
            .effective_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| {
                Some((budget * percent / 100).max(floor))
            });
    }

    // =========================================================================
    // Flush / Removal
    // =========================================================================

    /// Flush dirty windows of every file. Failures are logged.
    pub fn flush(&self) {
        let ids: Vec<MappedFileId> = self.files.read().keys().copied().collect();
        for id in ids {
            self.flush_file(id);
        }
    }

    /// Flush dirty windows of one file. Failures are logged.
    pub fn flush_file(&self, file: MappedFileId) {
        let Some(mappings) = self.files.read().get(&file).cloned() else {
            return;
        };

        let list = mappings.entries.lock();
        for entry in list.iter() {
            if let Err(e) = entry.flush() {
                tracing::warn!(
                    begin = entry.begin(),
                    error = %e,
                    "failed to flush mapped window"
                );
            }
        }
    }

    /// Flush and unmap every window of `file` and forget the file.
    ///
    /// Windows that fail to flush are unmapped anyway.
    pub fn remove_file(&self, file: MappedFileId) {
        let Some(mappings) = self.files.write().remove(&file) else {
            return;
        };

        let mut list = mappings.entries.lock();
        for entry in list.drain(..) {
            self.retire(&entry, "remove file");
        }
    }

    /// Unmap the windows of `file` but keep it registered
    pub fn unmap_file(&self, file: MappedFileId) {
        let Some(mappings) = self.files.read().get(&file).cloned() else {
            return;
        };

        let mut list = mappings.entries.lock();
        for entry in list.drain(..) {
            self.retire(&entry, "unmap file");
        }
    }

    /// Flush and unmap everything
    pub fn shutdown(&self) {
        let ids: Vec<MappedFileId> = self.files.read().keys().copied().collect();
        for id in ids {
            self.remove_file(id);
        }
        tracing::debug!("mmap manager shut down");
    }
}

impl Drop for MmapManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
