//! Platform I/O primitives
//!
//! The capability set the worker loop is written against: open with flag
//! conversion, positional transfers with interrupt retry, vectored reads,
//! sync, link management and the recursive directory removal. The worker
//! loop itself is platform agnostic; a port supplies these functions for
//! its own syscall surface.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::signal::{AccessMode, OpenFlags};

/// Chunk size for large write transfers.
pub(crate) const WRITE_CHUNK: usize = 256 * 1024;

fn file_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP
}

fn dir_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IXUSR | Mode::S_IXGRP | Mode::S_IRGRP
}

/// Convert the request flag word into the platform open flags.
///
/// `o_sync`/`o_direct` apply the node-wide toggles; the caller decides
/// whether the sync flag was honored here or needs periodic auto-sync.
pub(crate) fn open_flags(
    flags: OpenFlags,
    access: AccessMode,
    o_sync: bool,
    o_direct: bool,
) -> OFlag {
    let mut oflag = match access {
        AccessMode::ReadOnly => OFlag::O_RDONLY,
        AccessMode::WriteOnly => OFlag::O_WRONLY,
        AccessMode::ReadWrite => OFlag::O_RDWR,
    };
    if flags.intersects(OpenFlags::CREATE | OpenFlags::CREATE_IF_NONE) {
        oflag |= OFlag::O_CREAT;
    }
    // CREATE opens an existing file; CREATE_IF_NONE insists the file is new.
    if flags.contains(OpenFlags::CREATE_IF_NONE) {
        oflag |= OFlag::O_EXCL;
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        oflag |= OFlag::O_TRUNC;
    }
    if flags.contains(OpenFlags::APPEND) {
        oflag |= OFlag::O_APPEND;
    }
    if o_sync && flags.contains(OpenFlags::SYNC) {
        oflag |= OFlag::O_SYNC;
    }
    #[cfg(target_os = "linux")]
    if o_direct {
        oflag |= OFlag::O_DIRECT;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = o_direct;
    oflag
}

pub(crate) fn open_file(path: &Path, oflag: OFlag) -> Result<OwnedFd, Errno> {
    loop {
        match nix::fcntl::open(path, oflag, file_mode()) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

pub(crate) fn close_file(fd: OwnedFd) -> Result<(), Errno> {
    nix::unistd::close(fd)
}

/// Positional read of one chunk; retries interrupts, returns the short
/// count the platform gave us.
pub(crate) fn pread_retry(fd: BorrowedFd<'_>, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
    loop {
        match nix::sys::uio::pread(fd, buf, offset as libc::off_t) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

pub(crate) fn pwrite_retry(fd: BorrowedFd<'_>, buf: &[u8], offset: u64) -> Result<usize, Errno> {
    loop {
        match nix::sys::uio::pwrite(fd, buf, offset as libc::off_t) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Sequential write at the current position, used by append.
pub(crate) fn write_retry(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize, Errno> {
    loop {
        match nix::unistd::write(fd, buf) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Vectored positional read where the platform has one; the caller falls
/// back to per-page reads elsewhere.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn preadv_retry(
    fd: BorrowedFd<'_>,
    iov: &mut [io::IoSliceMut<'_>],
    offset: u64,
) -> Result<usize, Errno> {
    loop {
        match nix::sys::uio::preadv(fd, iov, offset as libc::off_t) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

pub(crate) fn fsync(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    nix::unistd::fsync(fd.as_fd())
}

pub(crate) fn unlink_file(path: &Path) -> Result<(), Errno> {
    nix::unistd::unlink(path)
}

/// mkdir that treats an existing directory as success.
pub(crate) fn mkdir_path(path: &Path) -> Result<(), Errno> {
    match nix::unistd::mkdir(path, dir_mode()) {
        Err(Errno::EEXIST) => Ok(()),
        other => other,
    }
}

/// Recursive directory removal. A missing directory is not an error; the
/// walk descends into subdirectories and finally removes `path` itself
/// when `remove_self` is set.
pub(crate) fn rmrf(path: &Path, remove_self: bool) -> io::Result<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        let child = entry.path();
        if entry.file_type()?.is_dir() {
            rmrf(&child, true)?;
        } else {
            match std::fs::remove_file(&child) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
    }
    if remove_self {
        match std::fs::remove_dir(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    } else {
        Ok(())
    }
}

/// Zero-fill `[0, len)` of the file with chunked writes from `zeros`.
pub(crate) fn extend_zeroed(fd: BorrowedFd<'_>, len: u64, zeros: &[u8]) -> Result<(), Errno> {
    debug_assert!(!zeros.is_empty());
    let mut offset = 0u64;
    while offset < len {
        let chunk = std::cmp::min(zeros.len() as u64, len - offset) as usize;
        let mut written = 0;
        while written < chunk {
            written += pwrite_retry(fd, &zeros[written..chunk], offset + written as u64)?;
        }
        offset += chunk as u64;
    }
    Ok(())
}
