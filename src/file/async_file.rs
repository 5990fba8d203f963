//! Asynchronous File
//!
//! Reads and writes are executed by a pool of I/O worker threads. Single
//! calls block until their job finishes; batched writes return a
//! [`WriteHandle`] right away so the caller decides when to wait.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::FileKind;
use crate::error::{PageHashError, Result};

use super::base::FileBase;
use super::{File, WriteHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Worker Pool
// =============================================================================

/// Fixed set of threads draining a shared job channel.
///
/// Dropping the pool closes the channel and joins every worker after the
/// queued jobs have run.
pub struct IoWorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl IoWorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = channel::unbounded();
        let mut workers = Vec::with_capacity(threads);

        for id in 0..threads.max(1) {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("pagehash-io-{id}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                })?;
            workers.push(worker);
        }

        tracing::debug!(threads = workers.len(), "I/O worker pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| PageHashError::AsyncWrite("worker pool is shut down".to_string()))?;

        sender
            .send(job)
            .map_err(|_| PageHashError::AsyncWrite("worker pool is shut down".to_string()))
    }
}

impl Drop for IoWorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("I/O worker panicked");
            }
        }
    }
}

// =============================================================================
// Async File
// =============================================================================

/// Byte-range file whose I/O runs on an [`IoWorkerPool`]
pub struct AsyncFile {
    base: Arc<FileBase>,
    pool: Arc<IoWorkerPool>,
}

impl AsyncFile {
    pub fn new(path: impl Into<PathBuf>, page_size: u64, pool: Arc<IoWorkerPool>) -> Self {
        Self {
            base: Arc::new(FileBase::new(path.into(), FileKind::Async, page_size)),
            pool,
        }
    }

    /// Run `job` on the pool and wait for its result
    fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileBase) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let base = Arc::clone(&self.base);

        self.pool.submit(Box::new(move || {
            let _ = tx.send(job(&base));
        }))?;

        rx.recv()
            .map_err(|_| PageHashError::AsyncWrite("I/O worker dropped the request".to_string()))?
    }
}

impl File for AsyncFile {
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
        // Validate before queueing so callers get OutOfRange synchronously
        self.base.check_region(offset, buf.len())?;

        let length = buf.len();
        let (read, data) = self.run(move |base| {
            let mut data = vec![0u8; length];
            let read = base.read(offset, &mut data, throw_on_eof)?;
            Ok((read, data))
        })?;

        buf[..read].copy_from_slice(&data[..read]);
        Ok(read)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.base.check_region(offset, data.len())?;

        let data = data.to_vec();
        self.run(move |base| base.write(offset, &data))
    }

    fn write_batch(&self, writes: Vec<(u64, Vec<u8>)>) -> Result<WriteHandle> {
        // Reject the whole batch before any write is queued
        for (offset, data) in &writes {
            self.base.check_region(*offset, data.len())?;
        }

        let handle = WriteHandle::new(writes.len());
        for (offset, data) in writes {
            let base = Arc::clone(&self.base);
            let completion = handle.clone_for_worker();
            self.pool.submit(Box::new(move || {
                completion.complete_one(base.write(offset, &data));
            }))?;
        }

        Ok(handle)
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
