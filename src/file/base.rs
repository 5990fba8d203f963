//! Shared File State
//!
//! Lifecycle, bounds checking, size accounting and positioned I/O used by
//! all three file variants. Variants add their own I/O routing on top.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::FileKind;
use crate::error::{PageHashError, Result};

use super::header::FileHeader;
use super::HEADER_SIZE;

/// Mutable lifecycle state, guarded by the shared/exclusive lock
pub(crate) struct FileState {
    pub path: PathBuf,
    pub handle: Option<fs::File>,
}

impl FileState {
    pub fn handle(&self) -> Result<&fs::File> {
        self.handle
            .as_ref()
            .ok_or_else(|| PageHashError::NotOpen(self.path.clone()))
    }
}

/// State shared by every file variant
///
/// ## Concurrency:
/// - `state`: RwLock (reads/writes shared, structural operations exclusive)
/// - `size`: Atomic, grown lock-free by `allocate_space`
/// - `dirty`: Atomic counter of writes not yet forced to disk
/// - `flush_lock`: serializes `synch` calls
pub(crate) struct FileBase {
    kind: FileKind,

    /// Alignment used when truncating a partially written tail on recovery
    page_size: u64,

    state: RwLock<FileState>,

    size: AtomicU64,

    dirty: AtomicU64,

    flush_lock: Mutex<()>,
}

impl FileBase {
    pub fn new(path: PathBuf, kind: FileKind, page_size: u64) -> Self {
        Self {
            kind,
            page_size: page_size.max(1),
            state: RwLock::new(FileState { path, handle: None }),
            size: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> PathBuf {
        self.state.read().path.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.read().handle.is_some()
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, FileState> {
        self.state.read()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, FileState> {
        self.state.write()
    }

    pub fn mark_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::AcqRel);
    }

    /// Validate `[offset, offset+length)` against the logical size and
    /// return the physical offset of its first byte
    pub fn check_region(&self, offset: u64, length: usize) -> Result<u64> {
        let size = self.size();
        let end = offset.checked_add(length as u64);

        match end {
            Some(end) if offset < size && end <= size => Ok(offset + HEADER_SIZE),
            _ => Err(PageHashError::OutOfRange {
                offset,
                length,
                size,
            }),
        }
    }

    pub fn allocate_space(&self, size: u64) -> u64 {
        self.size.fetch_add(size, Ordering::AcqRel)
    }

    // =========================================================================
    // Positioned I/O
    // =========================================================================

    /// Read loop at a physical offset; stops early only at physical EOF
    pub fn read_physical(
        handle: &fs::File,
        physical: u64,
        buf: &mut [u8],
        throw_on_eof: bool,
    ) -> Result<usize> {
        let mut done = 0;

        while done < buf.len() {
            match handle.read_at(&mut buf[done..], physical + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if done < buf.len() && throw_on_eof {
            return Err(PageHashError::EndOfFile {
                offset: physical - HEADER_SIZE,
                read: done,
                expected: buf.len(),
            });
        }

        tracing::trace!(physical, length = buf.len(), read = done, "direct read");
        Ok(done)
    }

    /// Write loop at a physical offset
    pub fn write_physical(handle: &fs::File, physical: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;

        while done < data.len() {
            match handle.write_at(&data[done..], physical + done as u64) {
                Ok(0) => {
                    return Err(PageHashError::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )))
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::trace!(physical, length = data.len(), "direct write");
        Ok(())
    }

    /// Bounds-checked logical read under the shared lock
    pub fn read(&self, offset: u64, buf: &mut [u8], throw_on_eof: bool) -> Result<usize> {
        let physical = self.check_region(offset, buf.len())?;
        let state = self.state.read();
        Self::read_physical(state.handle()?, physical, buf, throw_on_eof)
    }

    /// Bounds-checked logical write under the shared lock
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let physical = self.check_region(offset, data.len())?;
        let state = self.state.read();
        Self::write_physical(state.handle()?, physical, data)?;
        self.mark_dirty();
        Ok(())
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Persist the size and force the file when writes are pending.
    ///
    /// Failures are logged; the caller never sees them.
    pub fn synch(&self) {
        let _flush = self.flush_lock.lock();
        let state = self.state.read();

        let Some(handle) = state.handle.as_ref() else {
            return;
        };

        // A concurrent synch may already have drained the counter
        let pending = self.dirty.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }

        let header = FileHeader::new(self.kind, self.size(), false);
        if let Err(e) = header.write_to(handle) {
            tracing::warn!(path = %state.path.display(), error = %e, "failed to persist file size");
        }

        if let Err(e) = handle.sync_data() {
            tracing::warn!(
                path = %state.path.display(),
                error = %e,
                "file flush failed, data written since the last flush may be lost on power failure"
            );
            return;
        }

        self.dirty.fetch_sub(pending, Ordering::AcqRel);
    }

    // =========================================================================
    // Structural Operations (caller holds the exclusive lock)
    // =========================================================================

    pub fn create_locked(&self, state: &mut FileState) -> Result<()> {
        if state.handle.is_some() {
            return Err(PageHashError::AlreadyOpen(state.path.clone()));
        }

        if let Some(parent) = state.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&state.path)?;

        FileHeader::new(self.kind, 0, false).write_to(&handle)?;
        handle.set_len(HEADER_SIZE)?;

        self.size.store(0, Ordering::Release);
        self.dirty.store(1, Ordering::Release);
        state.handle = Some(handle);

        tracing::debug!(path = %state.path.display(), "file created");
        Ok(())
    }

    pub fn open_locked(&self, state: &mut FileState) -> Result<()> {
        if state.handle.is_some() {
            return Err(PageHashError::AlreadyOpen(state.path.clone()));
        }
        if !state.path.exists() {
            return Err(PageHashError::FileNotFound(state.path.clone()));
        }

        let handle = OpenOptions::new().read(true).write(true).open(&state.path)?;

        let physical_len = handle.metadata()?.len();
        if physical_len < HEADER_SIZE {
            return Err(PageHashError::InvalidHeader(format!(
                "{} is shorter than its header",
                state.path.display()
            )));
        }

        let header = FileHeader::read_from(&handle)?;
        let data_len = physical_len - HEADER_SIZE;
        let mut size = header.size;

        // Step 1: reconcile the stored size after an unclean shutdown
        if !header.softly_closed || header.size > data_len {
            let recovered = (data_len / self.page_size) * self.page_size;
            tracing::warn!(
                path = %state.path.display(),
                stored_size = header.size,
                physical_size = data_len,
                recovered_size = recovered,
                softly_closed = header.softly_closed,
                "file was not closed cleanly, reconciling size"
            );
            size = recovered;
        }

        // Step 2: drop a partially written trailing page
        if data_len > size {
            handle.set_len(HEADER_SIZE + size)?;
        }

        // Step 3: mark the file as in use until the next clean close
        FileHeader::new(self.kind, size, false).write_to(&handle)?;
        handle.sync_data()?;

        self.size.store(size, Ordering::Release);
        self.dirty.store(0, Ordering::Release);
        state.handle = Some(handle);

        tracing::debug!(path = %state.path.display(), size, "file opened");
        Ok(())
    }

    pub fn close_locked(&self, state: &mut FileState) -> Result<()> {
        let Some(handle) = state.handle.take() else {
            return Ok(());
        };

        let size = self.size();

        // Keep clean files physically as long as their logical size says
        if handle.metadata()?.len() < HEADER_SIZE + size {
            handle.set_len(HEADER_SIZE + size)?;
        }

        FileHeader::new(self.kind, size, true).write_to(&handle)?;
        if let Err(e) = handle.sync_all() {
            tracing::warn!(path = %state.path.display(), error = %e, "flush on close failed");
        }
        self.dirty.store(0, Ordering::Release);

        tracing::debug!(path = %state.path.display(), size, "file closed");
        Ok(())
    }

    pub fn shrink_locked(&self, state: &mut FileState, size: u64) -> Result<()> {
        let handle = state.handle()?;
        if size >= self.size() {
            return Ok(());
        }

        handle.set_len(HEADER_SIZE + size)?;
        self.size.store(size, Ordering::Release);
        self.mark_dirty();

        tracing::debug!(path = %state.path.display(), size, "file shrunk");
        Ok(())
    }

    pub fn delete_locked(&self, state: &mut FileState) -> Result<()> {
        self.close_locked(state)?;

        match fs::remove_file(&state.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.size.store(0, Ordering::Release);

        tracing::debug!(path = %state.path.display(), "file deleted");
        Ok(())
    }

    pub fn rename_locked(&self, state: &mut FileState, new_path: &Path) -> Result<()> {
        let was_open = state.handle.is_some();
        self.close_locked(state)?;

        fs::rename(&state.path, new_path)?;
        tracing::debug!(from = %state.path.display(), to = %new_path.display(), "file renamed");
        state.path = new_path.to_path_buf();

        if was_open {
            self.open_locked(state)?;
        }
        Ok(())
    }

    pub fn replace_content_locked(&self, state: &mut FileState, source: &Path) -> Result<()> {
        self.close_locked(state)?;

        fs::copy(source, &state.path)?;
        tracing::debug!(
            path = %state.path.display(),
            source = %source.display(),
            "file content replaced"
        );

        self.open_locked(state)
    }
}
