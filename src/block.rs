//! The asynchronous file system block
//!
//! Runs on the node's single cooperatively scheduled signal thread and
//! never blocks on I/O itself. Each request signal is decoded into a
//! pooled request record and handed to a worker over a memory channel;
//! completions come back on a shared reply channel that the block drains
//! from a periodic continuation signal, tightening to an immediate
//! continuation while replies keep arriving.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, info, warn};
use smallvec::SmallVec;

use crate::error::{ErrorKind, RequestError, LOCAL_ERROR};
use crate::file::AsyncFile;
use crate::filename::{BasePathSpec, BasePaths, FileSpec, Filename};
use crate::open_files::OpenFiles;
use crate::pages::{Page, PagePool, PAGE_SIZE};
use crate::pool::RequestPool;
use crate::request::{Action, IoPage, Params, Request, MAX_PAGES};
use crate::signal::{
    AllocMemReq, BlockRef, BuildIndexReq, ContinueB, FsAppendReq, FsCloseReq, FsOpenReq,
    FsReadWriteReq, FsRef, FsRemoveReq, FsSuspendOrd, FsSyncReq, OpenFlags, PageList, Reply,
    SignalBus,
};
use crate::sys;
use crate::worker::{AsyncIoThread, GlobalFlags, RequestChannel};
use crate::channel::MemoryChannel;

/// Reply scan cadence in milliseconds.
const SCAN_DELAY_MS: u32 = 10;

/// Pages pre-allocated for an open that zero-fills the file (512 KiB).
const INIT_PAGES: u32 = 16;

/// Block configuration, read once at construction.
#[derive(Debug, Clone)]
pub struct AfsConfig {
    /// Node id, part of the on-disk directory name.
    pub node_id: u32,
    /// This block's own reference, used as the sender of replies.
    pub block_ref: BlockRef,
    /// Hard cap on concurrently existing files; zero means unlimited.
    pub max_files: u32,
    /// Files (and their bound workers) created up front.
    pub initial_files: u32,
    /// Size of the shared worker pool.
    pub pooled_threads: u32,
    /// Root of the node file system.
    pub file_system_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    /// Fallback root for both data-file and undo-file storage.
    pub dd_path: Option<PathBuf>,
    pub data_file_path: Option<PathBuf>,
    pub undo_file_path: Option<PathBuf>,
}

impl AfsConfig {
    pub fn new(node_id: u32, file_system_path: impl Into<PathBuf>) -> AfsConfig {
        AfsConfig {
            node_id,
            block_ref: 253 << 16 | node_id,
            max_files: 40,
            initial_files: 27,
            pooled_threads: 2,
            file_system_path: file_system_path.into(),
            backup_path: None,
            dd_path: None,
            data_file_path: None,
            undo_file_path: None,
        }
    }
}

/// Diagnostic dump commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOrd {
    FileStat,
    OpenFiles,
    AllFiles,
    IdleFiles,
    ToggleOSync,
    ToggleODirect,
    ToggleUnlinkOnCreate,
    SetSyncFreq(u64),
    InspectFile(u16),
}

/// The block. All methods are called from the signal thread only.
pub struct Afs {
    own_ref: BlockRef,
    base_paths: BasePaths,
    max_files: u32,
    files: Vec<Arc<AsyncFile>>,
    idle_files: Vec<Arc<AsyncFile>>,
    open_files: OpenFiles,
    threads: Vec<AsyncIoThread>,
    to_bound: RequestChannel,
    to_unbound: RequestChannel,
    from_threads: RequestChannel,
    request_pool: RequestPool,
    flags: Arc<GlobalFlags>,
    page_pool: Arc<dyn PagePool>,
    last_id: u16,
    scanning: bool,
    max_opened: usize,
    shut_down: bool,
}

impl std::fmt::Debug for Afs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Afs")
            .field("files", &self.files.len())
            .field("open", &self.open_files.size())
            .field("idle", &self.idle_files.len())
            .finish()
    }
}

impl Afs {
    /// Build the block: validate and register the configured roots, then
    /// create the initial idle files and the shared worker pool.
    ///
    /// A data-file or undo-file root that cannot be created or written is
    /// a fatal configuration error.
    pub fn new(cfg: AfsConfig, page_pool: Arc<dyn PagePool>) -> Afs {
        let node_dir = format!("ndb_{}_fs", cfg.node_id);

        let mut base_paths = BasePaths::default();
        let fs_root = cfg.file_system_path.join(&node_dir);
        let _ = sys::mkdir_path(&cfg.file_system_path);
        let _ = sys::mkdir_path(&fs_root);
        base_paths.set(BasePathSpec::FileSystem, &fs_root);

        if let Some(backup) = &cfg.backup_path {
            base_paths.set(BasePathSpec::Backup, backup);
        }
        for (spec, configured, label) in [
            (
                BasePathSpec::DataFiles,
                cfg.data_file_path.as_ref().or(cfg.dd_path.as_ref()),
                "data-file path",
            ),
            (
                BasePathSpec::UndoFiles,
                cfg.undo_file_path.as_ref().or(cfg.dd_path.as_ref()),
                "undo-file path",
            ),
        ] {
            if let Some(root) = configured {
                let _ = sys::mkdir_path(root);
                let path = root.join(&node_dir);
                let _ = sys::mkdir_path(&path);
                let real = std::fs::canonicalize(&path)
                    .ok()
                    .filter(|p| {
                        nix::unistd::access(p.as_path(), nix::unistd::AccessFlags::W_OK).is_ok()
                    })
                    .unwrap_or_else(|| {
                        panic!("{} {} is not a writable directory", label, path.display())
                    });
                base_paths.set(spec, &real);
            }
        }

        let mut max_files = cfg.max_files;
        let initial_files = cfg.initial_files;
        // The initial files must fit under the cap.
        if max_files != 0 && initial_files > max_files {
            max_files = initial_files;
        }

        let mut afs = Afs {
            own_ref: cfg.block_ref,
            base_paths,
            max_files,
            files: Vec::new(),
            idle_files: Vec::new(),
            open_files: OpenFiles::new(),
            threads: Vec::new(),
            to_bound: Arc::new(MemoryChannel::new()),
            to_unbound: Arc::new(MemoryChannel::new()),
            from_threads: Arc::new(MemoryChannel::new()),
            request_pool: RequestPool::new(),
            flags: Arc::new(GlobalFlags::default()),
            page_pool,
            last_id: 0,
            scanning: false,
            max_opened: 0,
            shut_down: false,
        };

        for _ in 0..initial_files {
            let file = afs.create_file();
            afs.idle_files.push(file);
        }
        for _ in 0..cfg.pooled_threads.max(1) {
            let idx = afs.threads.len();
            afs.threads.push(AsyncIoThread::spawn(
                idx,
                false,
                Arc::clone(&afs.to_unbound),
                Arc::clone(&afs.from_threads),
                Arc::clone(&afs.flags),
                Arc::clone(&afs.page_pool),
            ));
        }
        afs
    }

    /// Arm the periodic reply scan. Call once after construction.
    pub fn start(&mut self, bus: &mut dyn SignalBus) {
        bus.send_continueb(SCAN_DELAY_MS, ContinueB::ScanMemoryChannel);
    }

    /// This block's reference on the bus.
    pub fn block_ref(&self) -> BlockRef {
        self.own_ref
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.size()
    }

    pub fn idle_file_count(&self) -> usize {
        self.idle_files.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// High-water mark of concurrently open files.
    pub fn max_opened_files(&self) -> usize {
        self.max_opened
    }

    /// Rendered name of an open file, empty for unknown handles.
    pub fn get_filename(&self, handle: u16) -> String {
        self.open_files
            .find(handle)
            .map(|f| f.filename().as_str().to_string())
            .unwrap_or_default()
    }

    fn create_file(&mut self) -> Arc<AsyncFile> {
        if self.max_files != 0 && self.files.len() as u32 == self.max_files {
            for (i, file) in self.files.iter().enumerate() {
                info!(
                    "{:2}: {}",
                    i,
                    if file.is_open() { "OPEN" } else { "CLOSED" }
                );
            }
            panic!("maximum number of files exceeded ({})", self.max_files);
        }
        let file = Arc::new(AsyncFile::new(self.files.len()));
        let idx = self.threads.len();
        self.threads.push(AsyncIoThread::spawn(
            idx,
            true,
            Arc::clone(&self.to_bound),
            Arc::clone(&self.from_threads),
            Arc::clone(&self.flags),
            Arc::clone(&self.page_pool),
        ));
        self.files.push(Arc::clone(&file));
        debug!("created file slot {} with worker {}", file.idx, idx);
        file
    }

    fn get_idle_file(&mut self) -> Arc<AsyncFile> {
        match self.idle_files.pop() {
            Some(file) => file,
            None => self.create_file(),
        }
    }

    /// Issue a fresh file handle: linear probe from the last issued one,
    /// skipping live handles, wrapping at the top of the handle space.
    fn new_id(&mut self) -> u16 {
        for _ in 0..u16::MAX {
            self.last_id = if self.last_id == u16::MAX {
                1
            } else {
                self.last_id + 1
            };
            if self.open_files.find(self.last_id).is_none() {
                return self.last_id;
            }
        }
        panic!("file handle space exhausted");
    }

    fn forward(&mut self, file: &Arc<AsyncFile>, request: Box<Request>) {
        if let Some(worker) = file.bound_thread() {
            self.threads[worker].channel.write_channel(request);
            return;
        }
        if request.action == Action::Suspend {
            // Not an I/O operation on the file; needs no serialization
            // and produces no reply to clear one.
            self.route_shared(request);
            return;
        }
        // Unattached files keep one request in flight at a time so the
        // pool cannot reorder them.
        let mut pending = file.pending.lock();
        if pending.in_flight {
            pending.queue.push_back(request);
            return;
        }
        pending.in_flight = true;
        drop(pending);
        self.route_shared(request);
    }

    fn route_shared(&self, request: Box<Request>) {
        let wants_bound = match (&request.action, &request.params) {
            (Action::Open, Params::Open { flags, .. }) => {
                !flags.contains(OpenFlags::THREAD_POOL)
            }
            _ => false,
        };
        if wants_bound {
            self.to_bound.write_channel(request);
        } else {
            self.to_unbound.write_channel(request);
        }
    }

    /// FSOPENREQ
    pub fn handle_open(&mut self, req: FsOpenReq, bus: &mut dyn SignalBus) {
        let spec = FileSpec::decode(req.file_number)
            .unwrap_or_else(|err| panic!("open: {err}"));
        let name = Filename::set(
            &self.base_paths,
            req.user_ref,
            &spec,
            false,
            req.name.as_deref(),
        )
        .unwrap_or_else(|err| panic!("open: {err}"));

        let file = self.get_idle_file();

        if req.file_flags.contains(OpenFlags::INIT) {
            match self.page_pool.alloc_pages(INIT_PAGES) {
                Some(pages) => *file.page_buf.lock() = Some(pages),
                None => {
                    warn!("open {}: no pages for pre-allocation", name.as_str());
                    self.idle_files.push(file);
                    bus.send(
                        req.user_ref,
                        Reply::OpenRef(FsRef {
                            user_pointer: req.user_pointer,
                            error: ErrorKind::OutOfMemory,
                            os_error: LOCAL_ERROR,
                        }),
                    );
                    return;
                }
            }
        }

        debug!("open {}", name.as_str());
        file.set_name(name);

        let id = self.new_id();
        let mut request = self.request_pool.get();
        request.action = Action::Open;
        request.error = None;
        request.set(req.user_ref, req.user_pointer, id);
        request.trace = req.trace;
        request.params = Params::Open {
            flags: req.file_flags,
            file_size: req.file_size,
            auto_sync_size: req.auto_sync_size,
        };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// FSCLOSEREQ
    pub fn handle_close(&mut self, req: FsCloseReq, bus: &mut dyn SignalBus) {
        let Some(file) = self.open_files.find(req.file_pointer) else {
            bus.send(
                req.user_ref,
                Reply::CloseRef(FsRef {
                    user_pointer: req.user_pointer,
                    error: ErrorKind::FileDoesNotExist,
                    os_error: LOCAL_ERROR,
                }),
            );
            return;
        };
        let mut request = self.request_pool.get();
        request.action = if req.remove {
            Action::CloseRemove
        } else {
            Action::Close
        };
        request.error = None;
        request.set(req.user_ref, req.user_pointer, req.file_pointer);
        request.trace = req.trace;
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// FSREADREQ
    pub fn handle_read(&mut self, req: FsReadWriteReq, bus: &mut dyn SignalBus) {
        let vectored = matches!(req.pages, PageList::ListOfMemPages { .. });
        let action = if req.partial {
            Action::ReadPartial
        } else if vectored {
            Action::Readv
        } else {
            Action::Read
        };
        self.read_write(action, req, bus);
    }

    /// FSWRITEREQ
    pub fn handle_write(&mut self, req: FsReadWriteReq, bus: &mut dyn SignalBus) {
        let vectored = matches!(req.pages, PageList::ListOfMemPages { .. });
        let action = match (req.sync, vectored) {
            (true, true) => Action::WritevSync,
            (true, false) => Action::WriteSync,
            (false, true) => Action::Writev,
            (false, false) => Action::Write,
        };
        self.read_write(action, req, bus);
    }

    fn read_write(&mut self, action: Action, req: FsReadWriteReq, bus: &mut dyn SignalBus) {
        let is_read = matches!(action, Action::Read | Action::ReadPartial | Action::Readv);
        let user_ref = req.user_ref;
        let user_pointer = req.user_pointer;
        let refuse = move |bus: &mut dyn SignalBus, kind: ErrorKind, pages: Vec<Page>| {
            let fs_ref = FsRef {
                user_pointer,
                error: kind,
                os_error: LOCAL_ERROR,
            };
            let reply = if is_read {
                Reply::ReadRef(fs_ref, pages)
            } else {
                Reply::WriteRef(fs_ref, pages)
            };
            bus.send(user_ref, reply);
        };

        let pages = decode_pages(req.pages);
        if pages.is_empty() || pages.len() > MAX_PAGES {
            refuse(
                bus,
                ErrorKind::InvalidParameters,
                pages.into_iter().map(|p| p.buf).collect(),
            );
            return;
        }
        let Some(file) = self.open_files.find(req.file_pointer) else {
            refuse(
                bus,
                ErrorKind::FileDoesNotExist,
                pages.into_iter().map(|p| p.buf).collect(),
            );
            return;
        };

        let mut request = self.request_pool.get();
        request.action = action;
        request.error = None;
        request.set(req.user_ref, req.user_pointer, req.file_pointer);
        request.trace = req.trace;
        request.params = Params::ReadWrite {
            pages,
            bytes_read: 0,
        };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// FSSYNCREQ
    pub fn handle_sync(&mut self, req: FsSyncReq, bus: &mut dyn SignalBus) {
        let Some(file) = self.open_files.find(req.file_pointer) else {
            bus.send(
                req.user_ref,
                Reply::SyncRef(FsRef {
                    user_pointer: req.user_pointer,
                    error: ErrorKind::FileDoesNotExist,
                    os_error: LOCAL_ERROR,
                }),
            );
            return;
        };
        let mut request = self.request_pool.get();
        request.action = Action::Sync;
        request.error = None;
        request.set(req.user_ref, req.user_pointer, req.file_pointer);
        request.trace = req.trace;
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// FSAPPENDREQ
    pub fn handle_append(&mut self, req: FsAppendReq, bus: &mut dyn SignalBus) {
        let Some(file) = self.open_files.find(req.file_pointer) else {
            bus.send(
                req.user_ref,
                Reply::AppendRef(FsRef {
                    user_pointer: req.user_pointer,
                    error: ErrorKind::FileDoesNotExist,
                    os_error: LOCAL_ERROR,
                }),
            );
            return;
        };
        let mut request = self.request_pool.get();
        request.action = if req.sync {
            Action::AppendSync
        } else {
            Action::Append
        };
        request.error = None;
        request.set(req.user_ref, req.user_pointer, req.file_pointer);
        request.trace = req.trace;
        request.params = Params::Append { data: req.data };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// FSREMOVEREQ
    pub fn handle_remove(&mut self, req: FsRemoveReq, bus: &mut dyn SignalBus) {
        let spec = FileSpec::decode(req.file_number)
            .unwrap_or_else(|err| panic!("remove: {err}"));
        let name = Filename::set(
            &self.base_paths,
            req.user_ref,
            &spec,
            req.directory,
            req.name.as_deref(),
        )
        .unwrap_or_else(|err| panic!("remove: {err}"));

        // Removing under an unset root is acknowledged without touching
        // the disk.
        if let FileSpec::V6 { base } = spec {
            if base != BasePathSpec::FileSystem && !self.base_paths.is_set(base) {
                bus.send(
                    req.user_ref,
                    Reply::RemoveConf {
                        user_pointer: req.user_pointer,
                    },
                );
                return;
            }
        }

        let file = self.get_idle_file();
        debug!("rmrf {}", name.as_str());
        file.set_name(name);

        let mut request = self.request_pool.get();
        request.action = Action::Rmrf;
        request.error = None;
        request.set(req.user_ref, req.user_pointer, self.new_id());
        request.trace = req.trace;
        request.params = Params::Rmrf {
            directory: req.directory,
            own_directory: req.own_directory,
        };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// FSSUSPENDORD. Never answered.
    pub fn handle_suspend(&mut self, req: FsSuspendOrd) {
        let Some(file) = self.open_files.find(req.file_pointer) else {
            return;
        };
        let mut request = self.request_pool.get();
        request.action = Action::Suspend;
        request.error = None;
        request.set(0, 0, req.file_pointer);
        request.trace = req.trace;
        request.params = Params::Suspend {
            milliseconds: req.milliseconds,
        };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// ALLOC_MEM_REQ
    pub fn handle_alloc_mem(&mut self, req: AllocMemReq, _bus: &mut dyn SignalBus) {
        let file = self.get_idle_file();
        let mut request = self.request_pool.get();
        request.action = Action::AllocMem;
        request.error = None;
        request.set(req.sender_ref, req.sender_data, 0);
        request.trace = req.trace;
        request.params = Params::Alloc {
            memlock: req.memlock,
            bytes: 0,
        };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// BUILDINDXREQ
    pub fn handle_build_index(&mut self, req: BuildIndexReq, bus: &mut dyn SignalBus) {
        let file = self.get_idle_file();
        let pages = req.buffer_size.div_ceil(PAGE_SIZE as u32);
        match self.page_pool.alloc_pages(pages) {
            Some(buf) => *file.page_buf.lock() = Some(buf),
            None => {
                warn!("index build: no pages for a {} byte buffer", req.buffer_size);
                self.idle_files.push(file);
                bus.send(
                    req.sender_ref,
                    Reply::BuildIndexRef {
                        sender_data: req.sender_data,
                        error: ErrorKind::OutOfMemory.into(),
                    },
                );
                return;
            }
        }
        let mut request = self.request_pool.get();
        request.action = Action::BuildIndex;
        request.error = None;
        request.set(req.sender_ref, req.sender_data, 0);
        request.trace = req.trace;
        request.params = Params::BuildIndex {
            func: Some(req.func),
            buffer_size: req.buffer_size,
        };
        request.file = Some(Arc::clone(&file));
        self.forward(&file, request);
    }

    /// Drain one completed request off the reply channel.
    fn scan_ipc(&mut self, bus: &mut dyn SignalBus) -> bool {
        match self.from_threads.try_read_channel() {
            Some(request) => {
                self.report(request, bus);
                true
            }
            None => false,
        }
    }

    /// Continuation handler driving the reply scan. The periodic tick
    /// re-arms itself; while the channel keeps yielding, an immediate
    /// continuation keeps the scan running without waiting for the tick.
    pub fn handle_continueb(&mut self, sig: ContinueB, bus: &mut dyn SignalBus) {
        if sig == ContinueB::ScanMemoryChannel {
            bus.send_continueb(SCAN_DELAY_MS, ContinueB::ScanMemoryChannel);
            if self.scanning {
                return;
            }
        }
        if self.scan_ipc(bus) {
            self.scanning = true;
            bus.send_continueb(0, ContinueB::ScanMemoryChannelNoDelay);
        } else {
            self.scanning = false;
        }
    }

    /// Extra drain attempt from the send-packed callback, shortening
    /// reply latency while the block is already active.
    pub fn send_packed(&mut self, bus: &mut dyn SignalBus) {
        if !self.scanning && self.scan_ipc(bus) {
            self.scanning = true;
            bus.send_continueb(0, ContinueB::ScanMemoryChannelNoDelay);
        }
    }

    fn report(&mut self, mut request: Box<Request>, bus: &mut dyn SignalBus) {
        let file = request.file.take();
        let user_ref = request.user_ref;
        let user_pointer = request.user_pointer;

        // Scratch pages held for the request go back to the pool first.
        if let Some(file) = &file {
            if let Some(pages) = file.page_buf.lock().take() {
                self.page_pool.release_pages(pages);
            }
        }

        if let Some(err) = request.error {
            let (kind, os_error) = err.classify();
            warn!(
                "{} failed: {:?} (os {}) trace {}",
                request.action.name(),
                kind,
                os_error as i32,
                request.trace
            );
            let fs_ref = FsRef {
                user_pointer,
                error: kind,
                os_error,
            };
            let aux_error = match err {
                RequestError::Code(code) => code,
                _ => kind.into(),
            };
            match request.action {
                Action::Open => {
                    let file = file.clone().expect("open reply without a file");
                    self.idle_files.push(file);
                    bus.send(user_ref, Reply::OpenRef(fs_ref));
                }
                Action::Close | Action::CloseRemove => {
                    bus.send(user_ref, Reply::CloseRef(fs_ref));
                }
                Action::Write | Action::Writev | Action::WriteSync | Action::WritevSync => {
                    bus.send(user_ref, Reply::WriteRef(fs_ref, request.take_pages()));
                }
                Action::Read | Action::ReadPartial | Action::Readv => {
                    bus.send(user_ref, Reply::ReadRef(fs_ref, request.take_pages()));
                }
                Action::Sync => bus.send(user_ref, Reply::SyncRef(fs_ref)),
                Action::Append | Action::AppendSync => {
                    bus.send(user_ref, Reply::AppendRef(fs_ref));
                }
                Action::Rmrf => {
                    let file = file.clone().expect("rmrf reply without a file");
                    self.idle_files.push(file);
                    bus.send(user_ref, Reply::RemoveRef(fs_ref));
                }
                Action::AllocMem => {
                    let file = file.clone().expect("alloc reply without a file");
                    self.idle_files.push(file);
                    bus.send(
                        user_ref,
                        Reply::AllocMemRef {
                            sender_data: user_pointer,
                            error: aux_error,
                        },
                    );
                }
                Action::BuildIndex => {
                    let file = file.clone().expect("index reply without a file");
                    self.idle_files.push(file);
                    bus.send(
                        user_ref,
                        Reply::BuildIndexRef {
                            sender_data: user_pointer,
                            error: aux_error,
                        },
                    );
                }
                Action::Suspend | Action::End => {}
            }
        } else {
            match request.action {
                Action::Open => {
                    let file = file.clone().expect("open reply without a file");
                    self.open_files.insert(Arc::clone(&file), request.file_pointer);
                    if self.open_files.size() > self.max_opened {
                        self.max_opened = self.open_files.size();
                    }
                    bus.send(
                        user_ref,
                        Reply::OpenConf {
                            user_pointer,
                            file_pointer: request.file_pointer,
                        },
                    );
                }
                Action::Close | Action::CloseRemove => {
                    let file = file.clone().expect("close reply without a file");
                    self.open_files.erase(request.file_pointer);
                    self.idle_files.push(file);
                    bus.send(user_ref, Reply::CloseConf { user_pointer });
                }
                Action::Write | Action::Writev | Action::WriteSync | Action::WritevSync => {
                    bus.send(
                        user_ref,
                        Reply::WriteConf {
                            user_pointer,
                            pages: request.take_pages(),
                        },
                    );
                }
                Action::Read | Action::Readv => {
                    bus.send(
                        user_ref,
                        Reply::ReadConf {
                            user_pointer,
                            bytes_read: None,
                            pages: request.take_pages(),
                        },
                    );
                }
                Action::ReadPartial => {
                    let bytes_read = match &request.params {
                        Params::ReadWrite { bytes_read, .. } => *bytes_read as u32,
                        _ => 0,
                    };
                    bus.send(
                        user_ref,
                        Reply::ReadConf {
                            user_pointer,
                            bytes_read: Some(bytes_read),
                            pages: request.take_pages(),
                        },
                    );
                }
                Action::Sync => bus.send(user_ref, Reply::SyncConf { user_pointer }),
                Action::Append | Action::AppendSync => {
                    let bytes = match &request.params {
                        Params::Append { data } => data.len() as u32,
                        _ => 0,
                    };
                    bus.send(user_ref, Reply::AppendConf {
                        user_pointer,
                        bytes,
                    });
                }
                Action::Rmrf => {
                    let file = file.clone().expect("rmrf reply without a file");
                    self.idle_files.push(file);
                    bus.send(user_ref, Reply::RemoveConf { user_pointer });
                }
                Action::AllocMem => {
                    let file = file.clone().expect("alloc reply without a file");
                    self.idle_files.push(file);
                    let bytes = match request.params {
                        Params::Alloc { bytes, .. } => bytes,
                        _ => 0,
                    };
                    bus.send(
                        user_ref,
                        Reply::AllocMemConf {
                            sender_data: user_pointer,
                            bytes,
                        },
                    );
                }
                Action::BuildIndex => {
                    let file = file.clone().expect("index reply without a file");
                    self.idle_files.push(file);
                    bus.send(
                        user_ref,
                        Reply::BuildIndexConf {
                            sender_data: user_pointer,
                        },
                    );
                }
                Action::Suspend | Action::End => {}
            }
        }

        // A file executing on the pool may dispatch its next request now
        // that this one has completed.
        if let Some(file) = file {
            let next = {
                let mut pending = file.pending.lock();
                pending.in_flight = false;
                if file.bound_thread().is_some() {
                    None
                } else {
                    let next = pending.queue.pop_front();
                    if next.is_some() {
                        pending.in_flight = true;
                    }
                    next
                }
            };
            if let Some(next) = next {
                self.route_shared(next);
            }
        }

        self.request_pool.put(request);
    }

    /// Diagnostic dump commands. Output goes to the log.
    pub fn handle_dump(&mut self, ord: DumpOrd) {
        match ord {
            DumpOrd::FileStat => {
                info!(
                    "files: {} open: {} idle: {} max opened: {} max files: {} pooled requests: {}",
                    self.files.len(),
                    self.open_files.size(),
                    self.idle_files.len(),
                    self.max_opened,
                    self.max_files,
                    self.request_pool.size()
                );
            }
            DumpOrd::OpenFiles => {
                info!("open files: {}", self.open_files.size());
                for (id, file) in self.open_files.iter() {
                    info!("{id:5}: {}", file.filename().as_str());
                }
            }
            DumpOrd::AllFiles => {
                info!("all files: {}", self.files.len());
                for file in &self.files {
                    info!(
                        "{:2}: {}",
                        file.idx,
                        if file.is_open() { "OPEN" } else { "CLOSED" }
                    );
                }
            }
            DumpOrd::IdleFiles => {
                info!("idle files: {}", self.idle_files.len());
                for file in &self.idle_files {
                    info!(
                        "{:2}: {}",
                        file.idx,
                        if file.is_open() { "OPEN" } else { "CLOSED" }
                    );
                }
            }
            DumpOrd::ToggleOSync => {
                let value = !self.flags.use_o_sync.load(Ordering::Relaxed);
                self.flags.use_o_sync.store(value, Ordering::Relaxed);
                info!("o_sync on open: {value}");
            }
            DumpOrd::ToggleODirect => {
                let value = !self.flags.use_o_direct.load(Ordering::Relaxed);
                self.flags.use_o_direct.store(value, Ordering::Relaxed);
                info!("o_direct on open: {value}");
            }
            DumpOrd::ToggleUnlinkOnCreate => {
                let value = !self.flags.unlink_on_create.load(Ordering::Relaxed);
                self.flags.unlink_on_create.store(value, Ordering::Relaxed);
                info!("unlink before create: {value}");
            }
            DumpOrd::SetSyncFreq(bytes) => {
                self.flags.sync_freq.store(bytes, Ordering::Relaxed);
                info!("sync frequency: {bytes} bytes");
            }
            DumpOrd::InspectFile(handle) => match self.open_files.find(handle) {
                Some(file) => info!(
                    "file {handle}: {} worker {:?}",
                    file.filename().as_str(),
                    file.bound_thread()
                ),
                None => warn!("file {handle}: not open"),
            },
        }
    }

    /// Post end requests to every worker and join them. Pending work is
    /// drained, not cancelled.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let attached: HashSet<usize> =
            self.files.iter().filter_map(|f| f.bound_thread()).collect();
        let mut idle_bound = 0;
        let mut idle_pooled = 0;
        for thread in &self.threads {
            if attached.contains(&thread.idx) {
                thread.channel.write_channel(Box::new(Request::default()));
            } else if thread.bound {
                idle_bound += 1;
            } else {
                idle_pooled += 1;
            }
        }
        for _ in 0..idle_bound {
            self.to_bound.write_channel(Box::new(Request::default()));
        }
        for _ in 0..idle_pooled {
            self.to_unbound.write_channel(Box::new(Request::default()));
        }
        for thread in &mut self.threads {
            thread.join();
        }
        while let Some(request) = self.from_threads.try_read_channel() {
            self.request_pool.put(request);
        }
        debug!("block shut down, {} files", self.files.len());
    }
}

impl Drop for Afs {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decode the caller's page format into the uniform per-page vector.
fn decode_pages(pages: PageList) -> SmallVec<[IoPage; 8]> {
    match pages {
        PageList::ListOfPairs(pairs) => pairs
            .into_iter()
            .map(|(buf, offset)| IoPage { buf, offset })
            .collect(),
        PageList::ArrayOfPages { buf, offset } => {
            let mut pages = SmallVec::new();
            pages.push(IoPage { buf, offset });
            pages
        }
        PageList::ListOfMemPages { pages, offset } => {
            let mut out = SmallVec::with_capacity(pages.len());
            let mut next = offset;
            for buf in pages {
                let len = buf.len() as u64;
                out.push(IoPage { buf, offset: next });
                next += len;
            }
            out
        }
    }
}
