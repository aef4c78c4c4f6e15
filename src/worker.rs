//! I/O worker threads
//!
//! Every blocking syscall in the block happens on one of these threads,
//! never on the signal thread. A bound worker attaches to its file on the
//! first successful open and from then on drains the file's private
//! channel, giving the file strict FIFO execution. Pool workers stay on
//! the shared channel and serve whatever the block hands them.
//!
//! The start handshake guarantees the block cannot dispatch to a worker
//! before the worker has installed its inbound channel.

use std::mem;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};

use crate::channel::MemoryChannel;
use crate::error::RequestError;
use crate::file::AsyncFile;
use crate::filename::Filename;
use crate::pages::PagePool;
use crate::request::{Action, IoPage, Params, Request};
use crate::signal::OpenFlags;
use crate::sys;

/// Staging buffer each worker owns for gathering multi-page writes.
pub(crate) const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Bound workers only run the I/O loop and need very little stack.
const BOUND_STACK_SIZE: usize = 32 * 1024;
/// Pool workers additionally run caller-supplied index builds.
const POOLED_STACK_SIZE: usize = 128 * 1024;

/// Node-wide I/O toggles, owned by the block and visible to workers
/// read-only. Mutated only by the diagnostics dump handler.
#[derive(Debug, Default)]
pub(crate) struct GlobalFlags {
    pub use_o_sync: AtomicBool,
    pub use_o_direct: AtomicBool,
    pub unlink_on_create: AtomicBool,
    pub sync_freq: AtomicU64,
}

pub(crate) type RequestChannel = Arc<MemoryChannel<Box<Request>>>;

pub(crate) struct AsyncIoThread {
    pub idx: usize,
    pub bound: bool,
    /// The worker's private channel, used once it is attached to a file.
    pub channel: RequestChannel,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AsyncIoThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncIoThread")
            .field("idx", &self.idx)
            .field("bound", &self.bound)
            .finish()
    }
}

struct StartGate {
    slot: Mutex<Option<RequestChannel>>,
    cond: Condvar,
}

struct WorkerCtx {
    idx: usize,
    bound: bool,
    shared_in: RequestChannel,
    report_to: RequestChannel,
    flags: Arc<GlobalFlags>,
    pool: Arc<dyn PagePool>,
}

impl AsyncIoThread {
    /// Spawn a worker and wait until it has installed its inbound channel.
    pub fn spawn(
        idx: usize,
        bound: bool,
        shared_in: RequestChannel,
        report_to: RequestChannel,
        flags: Arc<GlobalFlags>,
        pool: Arc<dyn PagePool>,
    ) -> AsyncIoThread {
        let gate = Arc::new(StartGate {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        let ctx = WorkerCtx {
            idx,
            bound,
            shared_in,
            report_to,
            flags,
            pool,
        };
        let stack = if bound {
            BOUND_STACK_SIZE
        } else {
            POOLED_STACK_SIZE
        };
        let worker_gate = Arc::clone(&gate);
        let handle = thread::Builder::new()
            .name(format!("afs-io-{idx}"))
            .stack_size(stack)
            .spawn(move || run(ctx, worker_gate))
            .unwrap_or_else(|err| panic!("could not allocate file system thread: {err}"));

        let mut slot = gate.slot.lock();
        while slot.is_none() {
            gate.cond.wait(&mut slot);
        }
        let channel = slot.take().unwrap();
        drop(slot);

        AsyncIoThread {
            idx,
            bound,
            channel,
            handle: Some(handle),
        }
    }

    /// Wait for the worker to exit. The caller posts the end request.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker {} terminated abnormally", self.idx);
            }
        }
    }
}

fn run(ctx: WorkerCtx, gate: Arc<StartGate>) {
    // The private channel is created in the thread that reads it; the
    // block is parked on the gate until it is in place.
    let own: RequestChannel = Arc::new(MemoryChannel::new());
    *gate.slot.lock() = Some(Arc::clone(&own));
    gate.cond.notify_one();
    drop(gate);

    let mut write_buffer = vec![0u8; WRITE_BUFFER_SIZE];
    let mut attached: Option<Arc<AsyncFile>> = None;

    loop {
        let mut request = if attached.is_some() {
            own.read_channel()
        } else {
            ctx.shared_in.read_channel()
        };

        match request.action {
            Action::End => {
                if let Some(file) = attached.take() {
                    if file.is_open() {
                        close_req(&file, &mut request);
                    }
                    file.detach();
                }
                debug!("worker {} exiting", ctx.idx);
                return;
            }
            Action::Suspend => {
                let ms = match request.params {
                    Params::Suspend { milliseconds } => milliseconds,
                    _ => 0,
                };
                if ms > 0 {
                    debug!("worker {} suspended for {} ms", ctx.idx, ms);
                    thread::sleep(Duration::from_millis(u64::from(ms)));
                    continue;
                }
                debug!("worker {} stopping on suspend", ctx.idx);
                return;
            }
            _ => {}
        }

        let Some(file) = request.file.clone() else {
            warn!("request {} without a file, dropping", request.action.name());
            continue;
        };

        match request.action {
            Action::Open => {
                open_req(&ctx, &file, &mut request);
                if request.error.is_none() && ctx.bound {
                    file.attach(ctx.idx);
                    attached = Some(Arc::clone(&file));
                }
            }
            Action::Close => {
                close_req(&file, &mut request);
                detach_file(&mut attached, &file);
            }
            Action::CloseRemove => {
                close_req(&file, &mut request);
                remove_req(&file, &mut request);
                detach_file(&mut attached, &file);
            }
            Action::Read | Action::ReadPartial => read_req(&file, &mut request),
            Action::Readv => readv_req(&file, &mut request),
            Action::Write | Action::Writev => write_req(&file, &mut request, &mut write_buffer),
            Action::WriteSync | Action::WritevSync => {
                write_req(&file, &mut request, &mut write_buffer);
                if request.error.is_none() {
                    sync_req(&file, &mut request);
                }
            }
            Action::Sync => sync_req(&file, &mut request),
            Action::Append => append_req(&file, &mut request),
            Action::AppendSync => {
                append_req(&file, &mut request);
                if request.error.is_none() {
                    sync_req(&file, &mut request);
                }
            }
            Action::Rmrf => rmrf_req(&file, &mut request),
            Action::AllocMem => alloc_mem_req(&ctx, &mut request),
            Action::BuildIndex => build_indx_req(&file, &mut request),
            Action::Suspend | Action::End => unreachable!(),
        }

        // The block polls the reply channel, no wakeup needed.
        ctx.report_to.write_channel_no_signal(request);
    }
}

fn detach_file(attached: &mut Option<Arc<AsyncFile>>, file: &Arc<AsyncFile>) {
    if let Some(bound) = attached.take() {
        debug_assert!(Arc::ptr_eq(&bound, file));
        bound.detach();
    }
}

fn open_req(ctx: &WorkerCtx, file: &Arc<AsyncFile>, request: &mut Request) {
    let (flags, file_size, auto_sync_size) = match &request.params {
        Params::Open {
            flags,
            file_size,
            auto_sync_size,
            ..
        } => (*flags, *file_size, *auto_sync_size),
        _ => {
            request.error = Some(RequestError::Parameter);
            return;
        }
    };
    let Some(access) = flags.access_mode() else {
        request.error = Some(RequestError::Parameter);
        return;
    };

    let o_sync = ctx.flags.use_o_sync.load(Ordering::Relaxed);
    let o_direct = ctx.flags.use_o_direct.load(Ordering::Relaxed);
    let name = file.filename();
    let oflag = sys::open_flags(flags, access, o_sync, o_direct);

    if ctx.flags.unlink_on_create.load(Ordering::Relaxed)
        && flags.contains(OpenFlags::CREATE | OpenFlags::TRUNCATE)
    {
        let _ = sys::unlink_file(name.path());
    }

    let fd = match sys::open_file(name.path(), oflag) {
        Ok(fd) => fd,
        Err(Errno::ENOENT)
            if flags.intersects(OpenFlags::CREATE | OpenFlags::CREATE_IF_NONE) =>
        {
            create_directories(&name);
            match sys::open_file(name.path(), oflag) {
                Ok(fd) => fd,
                Err(err) => {
                    request.error = Some(err.into());
                    return;
                }
            }
        }
        Err(err) => {
            request.error = Some(err.into());
            return;
        }
    };

    {
        let mut state = file.state.lock();
        state.opened_with_sync = o_sync && flags.contains(OpenFlags::SYNC);
        state.unsynced = 0;
        state.auto_sync_freq = if auto_sync_size > 0 {
            u64::from(auto_sync_size)
        } else if flags.contains(OpenFlags::SYNC) && !state.opened_with_sync {
            ctx.flags.sync_freq.load(Ordering::Relaxed)
        } else {
            0
        };
        state.fd = Some(fd);
    }

    if flags.contains(OpenFlags::INIT) {
        if let Err(err) = init_file(file, file_size) {
            request.error = Some(err);
            if let Some(fd) = file.state.lock().fd.take() {
                let _ = sys::close_file(fd);
            }
        }
    }
}

/// Zero-fill a freshly opened file to its declared size using the page
/// buffer the block allocated for the open.
fn init_file(file: &AsyncFile, file_size: u64) -> Result<(), RequestError> {
    if file_size == 0 {
        return Ok(());
    }
    let state = file.state.lock();
    let fd = state.fd.as_ref().ok_or(RequestError::Parameter)?;
    let page_buf = file.page_buf.lock();
    match page_buf.as_ref() {
        Some(zeros) => sys::extend_zeroed(fd.as_fd(), file_size, zeros)?,
        None => {
            let zeros = vec![0u8; 32 * 1024];
            sys::extend_zeroed(fd.as_fd(), file_size, &zeros)?;
        }
    }
    Ok(())
}

fn close_req(file: &Arc<AsyncFile>, request: &mut Request) {
    sync_req(file, request);
    let fd = file.state.lock().fd.take();
    match fd {
        Some(fd) => {
            if let Err(err) = sys::close_file(fd) {
                request.error = Some(err.into());
            }
        }
        None => {
            warn!("close of {} which is not open", file.filename().as_str());
            request.error = Some(RequestError::Parameter);
        }
    }
}

fn sync_req(file: &Arc<AsyncFile>, request: &mut Request) {
    let mut state = file.state.lock();
    if state.opened_with_sync || state.unsynced == 0 {
        return;
    }
    let Some(fd) = state.fd.as_ref() else {
        request.error = Some(RequestError::Parameter);
        return;
    };
    if let Err(err) = sys::fsync(fd.as_fd()) {
        request.error = Some(err.into());
        return;
    }
    state.unsynced = 0;
}

fn remove_req(file: &Arc<AsyncFile>, request: &mut Request) {
    if let Err(err) = sys::unlink_file(file.filename().path()) {
        request.error = Some(err.into());
    }
}

fn read_req(file: &Arc<AsyncFile>, request: &mut Request) {
    let partial = request.action == Action::ReadPartial;
    let Params::ReadWrite { mut pages, .. } =
        mem::replace(&mut request.params, Params::None)
    else {
        request.error = Some(RequestError::Parameter);
        return;
    };

    let mut bytes_read = 0u64;
    let mut error = None;
    {
        let state = file.state.lock();
        match state.fd.as_ref() {
            None => error = Some(RequestError::Parameter),
            Some(fd) => {
                let fd = fd.as_fd();
                'pages: for page in pages.iter_mut() {
                    let len = page.buf.len();
                    let mut done = 0;
                    while done < len {
                        match sys::pread_retry(fd, &mut page.buf[done..], page.offset + done as u64)
                        {
                            Ok(0) => {
                                if !partial {
                                    error = Some(RequestError::ReadUnderflow);
                                }
                                break 'pages;
                            }
                            Ok(n) => {
                                done += n;
                                bytes_read += n as u64;
                            }
                            Err(err) => {
                                error = Some(err.into());
                                break 'pages;
                            }
                        }
                    }
                }
            }
        }
    }

    request.error = error;
    request.params = Params::ReadWrite { pages, bytes_read };
}

fn readv_req(file: &Arc<AsyncFile>, request: &mut Request) {
    let Params::ReadWrite { mut pages, .. } =
        mem::replace(&mut request.params, Params::None)
    else {
        request.error = Some(RequestError::Parameter);
        return;
    };

    let mut bytes_read = 0u64;
    let mut error = None;
    {
        let state = file.state.lock();
        match state.fd.as_ref() {
            None => error = Some(RequestError::Parameter),
            Some(fd) => match readv_pages(fd.as_fd(), &mut pages) {
                Ok(n) => bytes_read = n,
                Err(err) => error = Some(err),
            },
        }
    }

    request.error = error;
    request.params = Params::ReadWrite { pages, bytes_read };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn readv_pages(
    fd: std::os::fd::BorrowedFd<'_>,
    pages: &mut [IoPage],
) -> Result<u64, RequestError> {
    let offset = match pages.first() {
        Some(page) => page.offset,
        None => return Err(RequestError::Parameter),
    };
    let total: usize = pages.iter().map(|p| p.buf.len()).sum();
    let mut iov: Vec<std::io::IoSliceMut<'_>> = pages
        .iter_mut()
        .map(|p| std::io::IoSliceMut::new(&mut p.buf))
        .collect();
    let n = sys::preadv_retry(fd, &mut iov, offset)?;
    if n != total {
        return Err(RequestError::ReadUnderflow);
    }
    Ok(n as u64)
}

/// Per-page fallback where the platform has no vectored positional read.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn readv_pages(
    fd: std::os::fd::BorrowedFd<'_>,
    pages: &mut [IoPage],
) -> Result<u64, RequestError> {
    let mut bytes_read = 0u64;
    for page in pages.iter_mut() {
        let len = page.buf.len();
        let mut done = 0;
        while done < len {
            match sys::pread_retry(fd, &mut page.buf[done..], page.offset + done as u64)? {
                0 => return Err(RequestError::ReadUnderflow),
                n => {
                    done += n;
                    bytes_read += n as u64;
                }
            }
        }
    }
    Ok(bytes_read)
}

fn write_req(file: &Arc<AsyncFile>, request: &mut Request, staging: &mut [u8]) {
    let Params::ReadWrite { pages, .. } = mem::replace(&mut request.params, Params::None)
    else {
        request.error = Some(RequestError::Parameter);
        return;
    };

    if let Err(err) = do_write(file, &pages, staging) {
        request.error = Some(err);
    }
    request.params = Params::ReadWrite {
        pages,
        bytes_read: 0,
    };
    if request.error.is_none() {
        let (freq, unsynced) = {
            let state = file.state.lock();
            (state.auto_sync_freq, state.unsynced)
        };
        if freq != 0 && unsynced > freq {
            sync_req(file, request);
        }
    }
}

fn do_write(file: &AsyncFile, pages: &[IoPage], staging: &mut [u8]) -> Result<(), RequestError> {
    if pages.is_empty() {
        return Err(RequestError::Parameter);
    }
    // A multi-page write must describe one contiguous file range.
    for pair in pages.windows(2) {
        if pair[0].offset + pair[0].buf.len() as u64 != pair[1].offset {
            debug!("page offsets are not contiguous");
            return Err(RequestError::Os(libc::EINVAL));
        }
    }

    let mut state = file.state.lock();
    let mut total = 0u64;
    {
        let fd = state
            .fd
            .as_ref()
            .ok_or(RequestError::Parameter)?
            .as_fd();
        if pages.len() == 1 {
            total += write_chunks(fd, &pages[0].buf, pages[0].offset)?;
        } else {
            // Gather pages into the staging buffer to issue large writes,
            // splitting when the staging buffer runs out.
            let mut page_num = 0;
            while page_num < pages.len() {
                if pages[page_num].buf.len() >= staging.len() {
                    total += write_chunks(fd, &pages[page_num].buf, pages[page_num].offset)?;
                    page_num += 1;
                    continue;
                }
                let offset = pages[page_num].offset;
                let mut totsize = 0;
                let mut next = pages.len();
                for (i, page) in pages.iter().enumerate().skip(page_num) {
                    let size = page.buf.len();
                    if totsize + size > staging.len() {
                        next = i;
                        break;
                    }
                    staging[totsize..totsize + size].copy_from_slice(&page.buf);
                    totsize += size;
                }
                total += write_chunks(fd, &staging[..totsize], offset)?;
                page_num = next;
            }
        }
    }
    state.unsynced += total;
    Ok(())
}

fn write_chunks(
    fd: std::os::fd::BorrowedFd<'_>,
    buf: &[u8],
    offset: u64,
) -> Result<u64, RequestError> {
    let mut done = 0;
    while done < buf.len() {
        let chunk = std::cmp::min(sys::WRITE_CHUNK, buf.len() - done);
        let n = sys::pwrite_retry(fd, &buf[done..done + chunk], offset + done as u64)?;
        assert!(n != 0, "zero length write");
        done += n;
    }
    Ok(done as u64)
}

fn append_req(file: &Arc<AsyncFile>, request: &mut Request) {
    let Params::Append { data } = mem::replace(&mut request.params, Params::None) else {
        request.error = Some(RequestError::Parameter);
        return;
    };

    let mut error = None;
    {
        let mut state = file.state.lock();
        let mut written = 0usize;
        match state.fd.as_ref() {
            None => error = Some(RequestError::Parameter),
            Some(fd) => {
                let fd = fd.as_fd();
                let mut buf = &data[..];
                while !buf.is_empty() {
                    match sys::write_retry(fd, buf) {
                        Ok(n) => {
                            assert!(n != 0, "zero length write");
                            written += n;
                            buf = &buf[n..];
                        }
                        Err(err) => {
                            error = Some(err.into());
                            break;
                        }
                    }
                }
            }
        }
        state.unsynced += written as u64;
    }

    request.error = error;
    request.params = Params::Append { data };
    if request.error.is_none() {
        let (freq, unsynced) = {
            let state = file.state.lock();
            (state.auto_sync_freq, state.unsynced)
        };
        if freq != 0 && unsynced > freq {
            sync_req(file, request);
        }
    }
}

fn rmrf_req(file: &Arc<AsyncFile>, request: &mut Request) {
    let (directory, own_directory) = match request.params {
        Params::Rmrf {
            directory,
            own_directory,
        } => (directory, own_directory),
        _ => {
            request.error = Some(RequestError::Parameter);
            return;
        }
    };
    let name = file.filename();
    if !directory {
        match sys::unlink_file(name.path()) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(err) => request.error = Some(err.into()),
        }
        return;
    }
    if let Err(err) = sys::rmrf(name.path(), own_directory) {
        request.error = Some(RequestError::from_io(&err));
    }
}

fn alloc_mem_req(ctx: &WorkerCtx, request: &mut Request) {
    let memlock = match request.params {
        Params::Alloc { memlock, .. } => memlock,
        _ => {
            request.error = Some(RequestError::Parameter);
            return;
        }
    };
    match ctx.pool.map(memlock) {
        Ok(bytes) => request.params = Params::Alloc { memlock, bytes },
        Err(code) => request.error = Some(RequestError::Code(code)),
    }
}

fn build_indx_req(file: &Arc<AsyncFile>, request: &mut Request) {
    let Params::BuildIndex { func, buffer_size } =
        mem::replace(&mut request.params, Params::None)
    else {
        request.error = Some(RequestError::Parameter);
        return;
    };
    request.params = Params::BuildIndex {
        func: None,
        buffer_size,
    };
    let Some(func) = func else {
        request.error = Some(RequestError::Parameter);
        return;
    };
    let mut page_buf = file.page_buf.lock();
    match page_buf.as_mut() {
        None => request.error = Some(RequestError::OutOfMemory),
        Some(buf) => {
            if let Err(code) = func(buf.as_mut_slice()) {
                request.error = Some(RequestError::Code(code));
            }
        }
    }
}

fn create_directories(name: &Filename) {
    for level in name.directory_levels() {
        let _ = sys::mkdir_path(level);
    }
}
