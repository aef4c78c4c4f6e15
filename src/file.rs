//! Per-file state
//!
//! An `AsyncFile` is owned by the block and loaned to workers through
//! requests. The loan protocol guarantees at most one worker touches a
//! file at a time; the mutexes here are uncontended and exist to make that
//! protocol expressible in safe code.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::filename::Filename;
use crate::pages::Page;
use crate::request::Request;

/// Open-file state maintained by the worker executing the file's requests.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub fd: Option<OwnedFd>,
    /// The platform honored the sync flag at open; explicit syncs are
    /// no-ops.
    pub opened_with_sync: bool,
    /// Sync automatically once this many unsynced bytes accumulate; zero
    /// disables.
    pub auto_sync_freq: u64,
    /// Bytes written since the last sync.
    pub unsynced: u64,
}

/// Block-side dispatch bookkeeping for files executing on the shared
/// worker pool. Keeps at most one request per file in flight so the pool
/// cannot reorder a file's requests.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub queue: VecDeque<Box<Request>>,
    pub in_flight: bool,
}

#[derive(Debug)]
pub(crate) struct AsyncFile {
    /// Stable index in the block's file vector, for diagnostics.
    pub idx: usize,
    name: Mutex<Filename>,
    pub state: Mutex<FileState>,
    /// Worker index + 1 of the thread bound to this file; zero when
    /// unbound. Written by the worker on attach/detach, read by the block
    /// after the corresponding reply.
    bound_thread: AtomicUsize,
    /// Scratch page buffer for file pre-allocation and index builds.
    /// Allocated by the block, used by the worker, released on reply.
    pub page_buf: Mutex<Option<Page>>,
    pub pending: Mutex<Pending>,
}

impl AsyncFile {
    pub fn new(idx: usize) -> AsyncFile {
        AsyncFile {
            idx,
            name: Mutex::new(Filename::default()),
            state: Mutex::new(FileState::default()),
            bound_thread: AtomicUsize::new(0),
            page_buf: Mutex::new(None),
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn set_name(&self, name: Filename) {
        *self.name.lock() = name;
    }

    pub fn filename(&self) -> Filename {
        self.name.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().fd.is_some()
    }

    pub fn bound_thread(&self) -> Option<usize> {
        match self.bound_thread.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn attach(&self, worker_idx: usize) {
        let prev = self.bound_thread.swap(worker_idx + 1, Ordering::Release);
        assert_eq!(prev, 0, "file already bound to a worker");
    }

    pub fn detach(&self) {
        self.bound_thread.store(0, Ordering::Release);
    }
}
