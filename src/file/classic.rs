//! Classic File
//!
//! Synchronous positioned I/O on the calling thread.

use std::path::{Path, PathBuf};

use crate::config::FileKind;
use crate::error::Result;

use super::base::FileBase;
use super::File;

/// Synchronous byte-range file
///
/// ## Concurrency:
/// Positioned reads/writes (`pread`/`pwrite`) let any number of callers
/// share the open handle under the shared lock.
pub struct ClassicFile {
    base: FileBase,
}

impl ClassicFile {
    pub fn new(path: impl Into<PathBuf>, page_size: u64) -> Self {
        Self {
            base: FileBase::new(path.into(), FileKind::Sync, page_size),
        }
    }
}

impl File for ClassicFile {
    fn path(&self) -> PathBuf {
        self.base.path()
    }

    fn create(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.create_locked(&mut state)
    }

    fn open(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.open_locked(&mut state)
    }

    fn is_open(&self) -> bool {
        self.base.is_open()
    }

    fn size(&self) -> u64 {
        self.base.size()
    }

    fn read(&self, offset: u64, buf: &mut [u8], throw_on_eof: bool) -> Result<usize> {
        self.base.read(offset, buf, throw_on_eof)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.base.write(offset, data)
    }

    fn allocate_space(&self, size: u64) -> Result<u64> {
        Ok(self.base.allocate_space(size))
    }

    fn shrink(&self, size: u64) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.shrink_locked(&mut state, size)
    }

    fn synch(&self) {
        self.base.synch();
    }

    fn close(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.close_locked(&mut state)
    }

    fn delete(&self) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.delete_locked(&mut state)
    }

    fn rename_to(&self, new_path: &Path) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.rename_locked(&mut state, new_path)
    }

    fn replace_content_with(&self, source: &Path) -> Result<()> {
        let mut state = self.base.exclusive();
        self.base.replace_content_locked(&mut state, source)
    }
}
