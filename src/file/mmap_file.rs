//! Memory-Mapped File
//!
//! Serves reads and writes from windows handed out by a shared
//! [`MmapManager`], falling back to positioned I/O whenever the manager
//! declines a request. The OS file grows eagerly in `allocate_space` so every
//! allocated byte is mappable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::FileKind;
use crate::error::{PageHashError, Result};
use crate::mmap::{AllocationStrategy, MapTarget, MappedFileId, MmapManager, OperationType};

use super::base::{FileBase, FileState};
use super::{File, HEADER_SIZE};

/// Byte-range file backed by pooled memory mappings
///
/// ## Concurrency:
/// - `base.state`: windows are only used under the shared lock; every
///   structural operation unmaps the file's windows under the exclusive lock
/// - `physical_len`: Atomic, raised under `growth` once `set_len` succeeded
pub struct MmapFile {
    base: FileBase,

    manager: Arc<MmapManager>,

    mapping_id: MappedFileId,

    strategy: AllocationStrategy,

    physical_len: AtomicU64,

    growth: Mutex<()>,
}

impl MmapFile {
    pub fn new(
        path: impl Into<PathBuf>,
        page_size: u64,
        manager: Arc<MmapManager>,
        strategy: AllocationStrategy,
    ) -> Self {
        let mapping_id = manager.register_file();
        Self {
            base: FileBase::new(path.into(), FileKind::Mmap, page_size),
            manager,
            mapping_id,
            strategy,
            physical_len: AtomicU64::new(0),
            growth: Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    fn refresh_physical_len(&self, state: &FileState) -> Result<()> {
        let len = match state.handle.as_ref() {
            Some(handle) => handle.metadata()?.len(),
            None => 0,
        };
        self.physical_len.store(len, Ordering::Release);
        Ok(())
    }
}

impl File for MmapFile {
    fn path(&self) -> PathBuf {
        self.base.path()
    }

    fn create(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.manager.unmap_file(self.mapping_id);
        self.base.create_locked(&mut state)?;
        self.refresh_physical_len(&state)
    }

    fn open(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.open_locked(&mut state)?;
        self.refresh_physical_len(&state)
    }

    fn is_open(&self) -> bool {
        self.base.is_open()
    }

    fn size(&self) -> u64 {
        self.base.size()
    }

    fn read(&self, offset: u64, buf: &mut [u8], throw_on_eof: bool) -> Result<usize> {
        let physical = self.base.check_region(offset, buf.len())?;
        let state = self.base.shared();
        let handle = state.handle()?;

        let target = MapTarget {
            id: self.mapping_id,
            handle,
            physical_len: self.physical_len.load(Ordering::Acquire),
        };

        match self
            .manager
            .acquire(&target, physical, buf.len(), OperationType::Read, self.strategy)?
        {
            Some(region) => {
                region.read(physical, buf);
                region.release();
                Ok(buf.len())
            }
            None => FileBase::read_physical(handle, physical, buf, throw_on_eof),
        }
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let physical = self.base.check_region(offset, data.len())?;
        let state = self.base.shared();
        let handle = state.handle()?;

        let target = MapTarget {
            id: self.mapping_id,
            handle,
            physical_len: self.physical_len.load(Ordering::Acquire),
        };

        match self
            .manager
            .acquire(&target, physical, data.len(), OperationType::Write, self.strategy)?
        {
            Some(region) => {
                region.write(physical, data);
                region.release();
            }
            None => FileBase::write_physical(handle, physical, data)?,
        }

        self.base.mark_dirty();
        Ok(())
    }

    fn allocate_space(&self, size: u64) -> Result<u64> {
        let state = self.base.shared();
        let handle = state.handle()?;

        // The logical size only moves under `growth`, and only after the OS
        // file is long enough to back it
        let _growth = self.growth.lock();
        let old = self.base.size();
        let wanted = old
            .checked_add(size)
            .and_then(|end| end.checked_add(HEADER_SIZE))
            .ok_or(PageHashError::OutOfRange {
                offset: old,
                length: usize::try_from(size).unwrap_or(usize::MAX),
                size: old,
            })?;

        if self.physical_len.load(Ordering::Acquire) < wanted {
            handle.set_len(wanted)?;
            self.physical_len.store(wanted, Ordering::Release);
        }
        Ok(self.base.allocate_space(size))
    }

    fn shrink(&self, size: u64) -> Result<()> {
        let mut state = self.base.exclusive();
        self.manager.unmap_file(self.mapping_id);
        self.base.shrink_locked(&mut state, size)?;
        self.refresh_physical_len(&state)
    }

    fn synch(&self) {
        self.manager.flush_file(self.mapping_id);
        self.base.synch();
    }

    fn close(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.manager.unmap_file(self.mapping_id);
        self.base.close_locked(&mut state)?;
        self.physical_len.store(0, Ordering::Release);
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.manager.unmap_file(self.mapping_id);
        self.base.delete_locked(&mut state)?;
        self.physical_len.store(0, Ordering::Release);
        Ok(())
    }

    fn rename_to(&self, new_path: &Path) -> Result<()> {
        let mut state = self.base.exclusive();
        self.manager.unmap_file(self.mapping_id);
        self.base.rename_locked(&mut state, new_path)?;
        self.refresh_physical_len(&state)
    }

    fn replace_content_with(&self, source: &Path) -> Result<()> {
        let mut state = self.base.exclusive();
        self.manager.unmap_file(self.mapping_id);
        self.base.replace_content_locked(&mut state, source)?;
        self.refresh_physical_len(&state)
    }
}

impl Drop for MmapFile {
    fn drop(&mut self) {
        self.manager.remove_file(self.mapping_id);
    }
}
