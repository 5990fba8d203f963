//! Page Cache
//!
//! Loads pages of named files into memory, hands out scoped read/write
//! guards, and writes dirty pages back on eviction and flush.
//!
//! ## Concurrency:
//! - `pages`: Mutex around the LRU map; held while a page is loaded or
//!   chosen for eviction so one page never has two in-memory copies
//! - `evicting`: dirty victims out of the map whose write-back runs without
//!   `pages`; a fetch of such a page takes the in-memory copy back
//! - each page: its own RwLock; guards own an `Arc` of it, so a page with a
//!   live guard is never evicted
//! - `pins`: explicit pins keep pages resident without holding a guard
//!
//! Flushing takes each page's write lock. Callers must drop their own guards
//! before flushing or closing a file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::config::{Config, FileKind};
use crate::error::{PageHashError, Result};
use crate::file::{self, File, IoWorkerPool};
use crate::mmap::MmapManager;

use super::{DurablePage, FileId};

/// Shared access to a cached page, released on drop
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, DurablePage>;

/// Exclusive access to a cached page, released on drop
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, DurablePage>;

type SharedPage = Arc<RwLock<DurablePage>>;

/// Dirty page removed from the map, write-locked until it is on disk
struct Victim {
    key: PageKey,
    page: SharedPage,
    guard: PageWriteGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PageKey {
    file_id: FileId,
    page: u64,
}

// =============================================================================
// Page Cache Contract
// =============================================================================

/// Pinned-page provider consumed by the hash index.
///
/// Files are addressed by name when opened and by [`FileId`] afterwards.
pub trait PageCache: Send + Sync {
    fn page_size(&self) -> usize;

    /// Create a new, empty file. Fails with `FileExists` if it is on disk.
    fn add_file(&self, name: &str) -> Result<FileId>;

    /// Open an existing file, or return the id it is already open under
    fn open_file(&self, name: &str) -> Result<FileId>;

    fn exists(&self, name: &str) -> bool;

    fn load_for_read(&self, file_id: FileId, page: u64) -> Result<PageReadGuard>;

    fn load_for_write(&self, file_id: FileId, page: u64) -> Result<PageWriteGuard>;

    /// Append a zeroed page to the file and return it write-locked
    fn add_page(&self, file_id: FileId) -> Result<PageWriteGuard>;

    /// Number of pages the file holds
    fn filled_up_to(&self, file_id: FileId) -> Result<u64>;

    /// Keep the page resident until a matching `unpin`
    fn pin(&self, file_id: FileId, page: u64) -> Result<()>;

    fn unpin(&self, file_id: FileId, page: u64);

    /// Drop every page of the file
    fn truncate(&self, file_id: FileId) -> Result<()>;

    /// Write dirty pages of the file back and force them to disk
    fn flush(&self, file_id: FileId) -> Result<()>;

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()>;

    fn delete_file(&self, file_id: FileId) -> Result<()>;
}

// =============================================================================
// File-Backed Page Cache
// =============================================================================

struct CachedFile {
    name: String,
    file: Box<dyn File>,
}

/// Page cache over [`File`]s living in `Config::data_dir`.
///
/// The file variant is chosen by `Config::file_kind`. Memory-mapped files
/// share one [`MmapManager`]; asynchronous files share one worker pool.
pub struct FilePageCache {
    config: Config,

    capacity: usize,

    files: RwLock<HashMap<FileId, Arc<CachedFile>>>,

    next_file_id: AtomicU32,

    pages: Mutex<LruCache<PageKey, SharedPage>>,

    evicting: Mutex<HashMap<PageKey, SharedPage>>,

    pins: Mutex<HashMap<PageKey, usize>>,

    mmap: Option<Arc<MmapManager>>,

    pool: Option<Arc<IoWorkerPool>>,
}

impl FilePageCache {
    pub fn new(config: Config) -> Result<Self> {
        let mmap = match config.file_kind {
            FileKind::Mmap => Some(Arc::new(MmapManager::new(&config))),
            _ => None,
        };
        let pool = match config.file_kind {
            FileKind::Async => Some(Arc::new(IoWorkerPool::new(config.async_workers)?)),
            _ => None,
        };
        Self::with_resources(config, mmap, pool)
    }

    /// Build a cache that shares an existing mmap manager or worker pool
    pub fn with_resources(
        config: Config,
        mmap: Option<Arc<MmapManager>>,
        pool: Option<Arc<IoWorkerPool>>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        tracing::debug!(
            data_dir = %config.data_dir.display(),
            file_kind = ?config.file_kind,
            page_size = config.page_size,
            capacity = config.page_cache_capacity,
            "page cache ready"
        );

        Ok(Self {
            capacity: config.page_cache_capacity,
            config,
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
            pages: Mutex::new(LruCache::unbounded()),
            evicting: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            mmap,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mmap_manager(&self) -> Option<&Arc<MmapManager>> {
        self.mmap.as_ref()
    }

    /// Pages currently held in memory
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn file_name(&self, file_id: FileId) -> Result<String> {
        Ok(self.file(file_id)?.name.clone())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }

    fn file(&self, file_id: FileId) -> Result<Arc<CachedFile>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(PageHashError::UnknownFile(file_id))
    }

    fn find_open(&self, name: &str) -> Option<FileId> {
        self.files
            .read()
            .iter()
            .find(|(_, cached)| cached.name == name)
            .map(|(id, _)| *id)
    }

    fn register(&self, name: &str, file: Box<dyn File>) -> FileId {
        let id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
        self.files.write().insert(
            id,
            Arc::new(CachedFile {
                name: name.to_string(),
                file,
            }),
        );
        id
    }

    fn build_file(&self, name: &str) -> Result<Box<dyn File>> {
        file::open_file(
            self.path_of(name),
            &self.config,
            self.mmap.clone(),
            self.pool.clone(),
        )
    }

    // =========================================================================
    // Page Residency
    // =========================================================================

    /// Return the cached page, loading it from disk when absent
    fn fetch(&self, file_id: FileId, page: u64) -> Result<SharedPage> {
        let key = PageKey { file_id, page };

        let (shared, victims) = {
            let mut pages = self.pages.lock();
            if let Some(cached) = pages.get(&key) {
                return Ok(Arc::clone(cached));
            }

            let evicting = self.evicting.lock().get(&key).cloned();
            let shared = match evicting {
                Some(evicting) => evicting,
                None => self.load(key)?,
            };
            pages.put(key, Arc::clone(&shared));
            (shared, self.select_victims(&mut pages))
        };

        self.write_back_victims(victims)?;
        Ok(shared)
    }

    fn load(&self, key: PageKey) -> Result<SharedPage> {
        let PageKey { file_id, page } = key;
        let cached_file = self.file(file_id)?;
        let page_size = self.config.page_size;
        let filled = cached_file.file.size() / page_size as u64;
        if page >= filled {
            return Err(PageHashError::PageNotFound { file_id, page });
        }

        // Never written pages read short and stay zero
        let mut data = vec![0u8; page_size];
        cached_file
            .file
            .read(page * page_size as u64, &mut data, false)?;

        tracing::trace!(file_id, page, "page loaded");
        Ok(Arc::new(RwLock::new(DurablePage::from_disk(file_id, page, data)?)))
    }

    /// Take least recently used pages above capacity out of the map. Pages
    /// with live guards or pins stay. Clean victims are dropped here; dirty
    /// ones are returned write-locked for [`Self::write_back_victims`].
    fn select_victims(&self, pages: &mut LruCache<PageKey, SharedPage>) -> Vec<Victim> {
        if pages.len() <= self.capacity {
            return Vec::new();
        }

        let excess = pages.len() - self.capacity;
        let keys: Vec<PageKey> = {
            let pins = self.pins.lock();
            pages
                .iter()
                .rev()
                .filter(|(key, page)| Arc::strong_count(page) == 1 && !pins.contains_key(*key))
                .map(|(key, _)| *key)
                .take(excess)
                .collect()
        };

        let mut victims = Vec::new();
        let mut evicting = self.evicting.lock();
        for key in keys {
            let Some(page) = pages.pop(&key) else {
                continue;
            };

            // Nobody else holds the page, so the lock is free
            let guard = page.write_arc();
            if !guard.is_dirty() {
                tracing::trace!(file_id = key.file_id, page = key.page, "page evicted");
                continue;
            }

            evicting.insert(key, Arc::clone(&page));
            victims.push(Victim { key, page, guard });
        }
        victims
    }

    /// Write dirty victims back without holding `pages`. Every victim is
    /// attempted; one that fails goes back into the map and the first
    /// failure is returned.
    fn write_back_victims(&self, victims: Vec<Victim>) -> Result<()> {
        let mut first_error = None;

        for Victim {
            key,
            page,
            mut guard,
        } in victims
        {
            let result = self.write_back(&mut guard);
            drop(guard);

            let mut pages = self.pages.lock();
            let mut evicting = self.evicting.lock();
            let still_ours = evicting
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &page));
            if still_ours {
                evicting.remove(&key);
            }

            match result {
                Ok(()) => {
                    tracing::trace!(file_id = key.file_id, page = key.page, "page evicted");
                }
                Err(e) => {
                    // Keep the changes unless the file forgot the page meanwhile
                    if still_ours && !pages.contains(&key) {
                        pages.put(key, page);
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        tracing::warn!(
                            file_id = key.file_id,
                            page = key.page,
                            error = %e,
                            "failed to write back evicted page"
                        );
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn write_back(&self, page: &mut DurablePage) -> Result<()> {
        let cached_file = self.file(page.file_id())?;
        let offset = page.index() * self.config.page_size as u64;

        page.seal();
        cached_file.file.write(offset, page.bytes())?;
        page.clear_dirty();
        Ok(())
    }

    /// Snapshot the cached pages of one file, including pages whose
    /// eviction is still writing them back
    fn pages_of(&self, file_id: FileId) -> Vec<(PageKey, SharedPage)> {
        let pages = self.pages.lock();
        let evicting = self.evicting.lock();
        pages
            .iter()
            .chain(evicting.iter())
            .filter(|(key, _)| key.file_id == file_id)
            .map(|(key, page)| (*key, Arc::clone(page)))
            .collect()
    }

    fn forget_pages(&self, file_id: FileId) {
        let in_flight: Vec<SharedPage> = {
            let mut pages = self.pages.lock();
            let keys: Vec<PageKey> = pages
                .iter()
                .filter(|(key, _)| key.file_id == file_id)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                pages.pop(&key);
            }

            let mut evicting = self.evicting.lock();
            let keys: Vec<PageKey> = evicting
                .keys()
                .filter(|key| key.file_id == file_id)
                .copied()
                .collect();
            keys.iter().filter_map(|key| evicting.remove(key)).collect()
        };

        // Let running write-backs land before the file is shrunk or closed
        for page in in_flight {
            drop(page.write());
        }

        self.pins.lock().retain(|key, _| key.file_id != file_id);
    }

    fn write_back_file(&self, file_id: FileId) -> Result<()> {
        let mut written = 0usize;
        for (_, page) in self.pages_of(file_id) {
            let mut page = page.write();
            if page.is_dirty() {
                self.write_back(&mut page)?;
                written += 1;
            }
        }

        tracing::trace!(file_id, written, "dirty pages written back");
        Ok(())
    }
}

impl PageCache for FilePageCache {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn add_file(&self, name: &str) -> Result<FileId> {
        let path = self.path_of(name);
        if self.find_open(name).is_some() || path.exists() {
            return Err(PageHashError::FileExists(path));
        }

        let file = self.build_file(name)?;
        file.create()?;

        let id = self.register(name, file);
        tracing::debug!(name, file_id = id, "cache file added");
        Ok(id)
    }

    fn open_file(&self, name: &str) -> Result<FileId> {
        if let Some(id) = self.find_open(name) {
            return Ok(id);
        }

        let file = self.build_file(name)?;
        file.open()?;

        let id = self.register(name, file);
        tracing::debug!(name, file_id = id, "cache file opened");
        Ok(id)
    }

    fn exists(&self, name: &str) -> bool {
        self.find_open(name).is_some() || self.path_of(name).exists()
    }

    fn load_for_read(&self, file_id: FileId, page: u64) -> Result<PageReadGuard> {
        Ok(self.fetch(file_id, page)?.read_arc())
    }

    fn load_for_write(&self, file_id: FileId, page: u64) -> Result<PageWriteGuard> {
        Ok(self.fetch(file_id, page)?.write_arc())
    }

    fn add_page(&self, file_id: FileId) -> Result<PageWriteGuard> {
        let cached_file = self.file(file_id)?;
        let page_size = self.config.page_size;

        let (guard, index, victims) = {
            let mut pages = self.pages.lock();
            let offset = cached_file.file.allocate_space(page_size as u64)?;
            let index = offset / page_size as u64;

            let mut fresh = DurablePage::new(file_id, index, page_size);
            fresh.mark_dirty();
            let fresh = Arc::new(RwLock::new(fresh));

            pages.put(
                PageKey {
                    file_id,
                    page: index,
                },
                Arc::clone(&fresh),
            );
            (fresh.write_arc(), index, self.select_victims(&mut pages))
        };
        self.write_back_victims(victims)?;

        tracing::trace!(file_id, page = index, "page added");
        Ok(guard)
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        let cached_file = self.file(file_id)?;
        Ok(cached_file.file.size() / self.config.page_size as u64)
    }

    fn pin(&self, file_id: FileId, page: u64) -> Result<()> {
        // Load first so the pin refers to a resident page
        self.fetch(file_id, page)?;
        *self.pins.lock().entry(PageKey { file_id, page }).or_insert(0) += 1;
        Ok(())
    }

    fn unpin(&self, file_id: FileId, page: u64) {
        let key = PageKey { file_id, page };
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&key);
            }
        }
    }

    fn truncate(&self, file_id: FileId) -> Result<()> {
        let cached_file = self.file(file_id)?;
        self.forget_pages(file_id);
        cached_file.file.shrink(0)?;

        tracing::debug!(file_id, name = %cached_file.name, "cache file truncated");
        Ok(())
    }

    fn flush(&self, file_id: FileId) -> Result<()> {
        let cached_file = self.file(file_id)?;
        self.write_back_file(file_id)?;
        cached_file.file.synch();
        Ok(())
    }

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()> {
        let cached_file = self.file(file_id)?;
        if flush {
            self.write_back_file(file_id)?;
        }

        self.forget_pages(file_id);
        self.files.write().remove(&file_id);
        cached_file.file.close()?;

        tracing::debug!(file_id, name = %cached_file.name, "cache file closed");
        Ok(())
    }

    fn delete_file(&self, file_id: FileId) -> Result<()> {
        let cached_file = self.file(file_id)?;

        self.forget_pages(file_id);
        self.files.write().remove(&file_id);
        cached_file.file.delete()?;

        tracing::debug!(file_id, name = %cached_file.name, "cache file deleted");
        Ok(())
    }
}

impl Drop for FilePageCache {
    fn drop(&mut self) {
        let ids: Vec<FileId> = self.files.read().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.close_file(id, true) {
                tracing::warn!(file_id = id, error = %e, "failed to close cache file on drop");
            }
        }
    }
}
