//! Buffered File Writer for the Aid downloader
//!
//! This module decouples the threads that discover content from disk latency:
//! 1. `add` queues a write request and returns immediately
//! 2. A single background worker resolves requests in the order they were queued
//! 3. Requests whose key the [`DuplicateFilter`] already knows are discarded unwritten
//! 4. Names the filesystem would reject are sanitized before writing
//! 5. `shutdown` blocks until every accepted request has been resolved

use std::any::Any;
use std::fs;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::filter::DuplicateFilter;
use super::sanitize::sanitize_path;

/// Buffered writer errors
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Writer has been shut down, rejected write to {0}")]
    InvalidState(PathBuf),

    #[error("Write request has an empty destination path")]
    EmptyPath,

    #[error("Failed to start writer worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("Shutdown timed out after {timeout:?} with {pending} writes pending")]
    ShutdownTimeout { timeout: Duration, pending: usize },

    #[error("Writer worker panicked")]
    WorkerPanicked,
}

pub type WriterResult<T> = Result<T, WriterError>;

/// One unit of work: a destination and the bytes to put there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    path: PathBuf,
    data: Vec<u8>,
}

impl WriteRequest {
    pub fn new(path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Key handed to the duplicate filter, derived from the requested path before sanitizing.
    pub fn duplicate_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Counters for the writer, always read and updated as one block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub pending_writes: usize,
    pub bytes_saved: u64,
    pub bytes_discarded: u64,
    pub bytes_failed: u64,
    pub files_saved: u64,
    pub files_discarded: u64,
    pub files_failed: u64,
}

impl WriterStats {
    /// Bytes of every request that has been resolved so far.
    pub fn bytes_resolved(&self) -> u64 {
        self.bytes_saved + self.bytes_discarded + self.bytes_failed
    }
}

/// How the worker resolved a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Saved,
    Discarded,
    Failed,
}

/// Writes files on a background thread, skipping duplicates.
pub struct BufferedWriter {
    sender: Mutex<Option<Sender<WriteRequest>>>,
    stats: Arc<Mutex<WriterStats>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    drained: Receiver<()>,
}

impl BufferedWriter {
    /// Create a writer and start its worker thread.
    pub fn new(filter: Arc<dyn DuplicateFilter>) -> WriterResult<Self> {
        let (sender, receiver) = flume::unbounded();
        let (drained_tx, drained) = flume::bounded(1);
        let stats = Arc::new(Mutex::new(WriterStats::default()));

        let worker_stats = stats.clone();
        let worker = thread::Builder::new()
            .name("buffered-writer".to_string())
            .spawn(move || Self::run_worker(receiver, filter, worker_stats, drained_tx))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            stats,
            worker: Mutex::new(Some(worker)),
            drained,
        })
    }

    /// Queue `data` to be written to `path`. Never waits for the disk.
    pub fn add(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> WriterResult<()> {
        let request = WriteRequest::new(path, data);
        if request.path.as_os_str().is_empty() {
            return Err(WriterError::EmptyPath);
        }

        // Holding the sender lock keeps shutdown from closing the queue mid-add.
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            warn!("Rejected write to {} after shutdown", request.path.display());
            return Err(WriterError::InvalidState(request.path));
        };

        self.stats.lock().pending_writes += 1;
        if let Err(flume::SendError(request)) = sender.send(request) {
            self.stats.lock().pending_writes -= 1;
            error!("Writer worker is gone, rejected write to {}", request.path.display());
            return Err(WriterError::InvalidState(request.path));
        }

        Ok(())
    }

    /// Requests accepted but not yet written, discarded or failed.
    pub fn pending_writes(&self) -> usize {
        self.stats.lock().pending_writes
    }

    pub fn bytes_saved(&self) -> u64 {
        self.stats.lock().bytes_saved
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.stats.lock().bytes_discarded
    }

    /// Bytes of requests whose write failed. Counted in neither saved nor discarded.
    pub fn bytes_failed(&self) -> u64 {
        self.stats.lock().bytes_failed
    }

    /// Consistent snapshot of all counters.
    pub fn stats(&self) -> WriterStats {
        *self.stats.lock()
    }

    /// Whether the writer still accepts requests.
    pub fn is_accepting(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting requests and block until everything queued has been resolved.
    pub fn shutdown(&self) -> WriterResult<()> {
        self.close();

        // Concurrent callers wait here until the drain has finished.
        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return Ok(());
        };

        info!("Draining {} pending writes", self.pending_writes());
        handle.join().map_err(|_| WriterError::WorkerPanicked)?;

        info!("Buffered writer shutdown complete");
        Ok(())
    }

    /// Like [`shutdown`](Self::shutdown), but gives up waiting after `timeout`.
    ///
    /// The worker keeps draining after a timeout; a later `shutdown` waits for it.
    pub fn shutdown_timeout(&self, timeout: Duration) -> WriterResult<()> {
        self.close();

        let mut worker = self.worker.lock();
        if worker.is_none() {
            return Ok(());
        }

        match self.drained.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                let pending = self.pending_writes();
                warn!("Shutdown timed out after {:?} with {} writes pending", timeout, pending);
                return Err(WriterError::ShutdownTimeout { timeout, pending });
            }
        }

        if let Some(handle) = worker.take() {
            handle.join().map_err(|_| WriterError::WorkerPanicked)?;
        }

        info!("Buffered writer shutdown complete");
        Ok(())
    }

    /// Drop the queue's sending side so the worker exits once it runs dry.
    fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Buffered writer stopped accepting requests");
        }
    }

    fn run_worker(
        receiver: Receiver<WriteRequest>,
        filter: Arc<dyn DuplicateFilter>,
        stats: Arc<Mutex<WriterStats>>,
        drained: Sender<()>,
    ) {
        info!("Buffered writer started");

        // Ends once the queue is empty and every sender has been dropped.
        for request in receiver.iter() {
            // A panicking filter fails only the request it was handling.
            let resolution = panic::catch_unwind(AssertUnwindSafe(|| {
                Self::resolve(&request, filter.as_ref())
            }))
            .unwrap_or_else(|payload| {
                error!(
                    "Writing {} panicked: {}",
                    request.path.display(),
                    panic_message(payload.as_ref())
                );
                Resolution::Failed
            });
            let len = request.data.len() as u64;

            let mut stats = stats.lock();
            match resolution {
                Resolution::Saved => {
                    stats.bytes_saved += len;
                    stats.files_saved += 1;
                }
                Resolution::Discarded => {
                    stats.bytes_discarded += len;
                    stats.files_discarded += 1;
                }
                Resolution::Failed => {
                    stats.bytes_failed += len;
                    stats.files_failed += 1;
                }
            }
            stats.pending_writes -= 1;
        }

        info!("Buffered writer stopped");
        let _ = drained.send(());
    }

    fn resolve(request: &WriteRequest, filter: &dyn DuplicateFilter) -> Resolution {
        let key = request.duplicate_key();
        if filter.exists(&key) {
            debug!("Discarding duplicate {}", request.path.display());
            return Resolution::Discarded;
        }

        let target = sanitize_path(&request.path);
        if target != request.path {
            info!("Renamed {} to {}", request.path.display(), target.display());
        }

        match Self::write_file(&target, &request.data) {
            Ok(()) => {
                debug!("Saved {} ({} bytes)", target.display(), request.data.len());
                filter.mark_persisted(&key, &request.data);
                Resolution::Saved
            }
            Err(e) => {
                error!("Failed to write {}: {}", target.display(), e);
                Resolution::Failed
            }
        }
    }

    /// Write the whole payload to a sibling temp file, then rename it over `target`.
    fn write_file(target: &Path, data: &[u8]) -> io::Result<()> {
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        // Dropped on any error below, which removes the partial file.
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(data)?;
        temp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

// A writer dropped without shutdown would lose whatever is still queued.
impl Drop for BufferedWriter {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            warn!("Buffered writer dropped without shutdown, draining pending writes");
            if let Err(e) = self.shutdown() {
                error!("Failed to drain buffered writer: {}", e);
            }
        }
    }
}
